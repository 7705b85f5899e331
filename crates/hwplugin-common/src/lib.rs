//! Common types for the hardware plugin: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

use std::time::Duration;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group shared by all hardware plugin CRDs
pub const API_GROUP: &str = "hwplugin.dev";

/// Default plugin identity used when none is configured
pub const DEFAULT_PLUGIN_ID: &str = "metal3-hwplugin";

/// Field manager name for server-side apply and status patches
pub const FIELD_MANAGER: &str = "hwplugin-controller";

// =============================================================================
// Finalizers
// =============================================================================

/// Finalizer holding an AllocationRequest until every AllocatedNode is released
pub const REQUEST_FINALIZER: &str = "hwplugin.dev/allocation-request-finalizer";

/// Finalizer holding an AllocatedNode until its PhysicalHost is released
pub const NODE_FINALIZER: &str = "hwplugin.dev/allocated-node-finalizer";

// =============================================================================
// Labels
// =============================================================================

/// Plugin identity label carried by requests and allocated nodes
pub const PLUGIN_LABEL: &str = "hwplugin.dev/plugin";

/// Reverse index label on AllocatedNodes pointing at the owning request
pub const REQUEST_LABEL: &str = "hwplugin.dev/allocation-request";

/// Host label marking the host as claimed
pub const HOST_ALLOCATED_LABEL: &str = "hwplugin.dev/allocated";

/// Host label naming the AllocatedNode bound to the host
pub const HOST_ALLOCATED_NODE_LABEL: &str = "hwplugin.dev/allocated-node";

/// Host label naming the request that owns the host
pub const HOST_OWNED_BY_LABEL: &str = "hwplugin.dev/owned-by";

/// Host label naming the node group the host was allocated to
pub const HOST_NODE_GROUP_LABEL: &str = "hwplugin.dev/node-group";

/// Host label restricting the profiles a host may be allocated for
pub const HOST_PROFILE_LABEL: &str = "hwplugin.dev/hardware-profile";

/// Infra-env label attached to hosts and preprovisioning images by the installer
pub const INFRA_ENV_LABEL: &str = "infraenvs.agent-install.openshift.io";

/// Inventory label holding the host's site
pub const SITE_LABEL: &str = "resources.hwplugin.dev/siteId";

/// Inventory label holding the host's resource pool
pub const RESOURCE_POOL_LABEL: &str = "resources.hwplugin.dev/resourcePoolId";

/// Prefix applied to resource selector keys that are not already qualified
pub const RESOURCE_SELECTOR_PREFIX: &str = "resourceselector.hwplugin.dev/";

// =============================================================================
// Annotations
// =============================================================================

/// Host annotation requesting a BIOS settings update
pub const BIOS_UPDATE_NEEDED_ANNOTATION: &str = "hwplugin.dev/bios-update-needed";

/// Host annotation requesting a firmware update
pub const FIRMWARE_UPDATE_NEEDED_ANNOTATION: &str = "hwplugin.dev/firmware-update-needed";

/// Host annotation recording that the first release phase has run
pub const DEALLOCATION_COMPLETE_ANNOTATION: &str = "hwplugin.dev/deallocation-complete";

/// Host annotation recording when the host was first seen in an error state
pub const ERROR_TIMESTAMP_ANNOTATION: &str = "hwplugin.dev/error-timestamp";

/// Host annotation that skips the power-off step on release
pub const SKIP_CLEANUP_ANNOTATION: &str = "hwplugin.dev/skip-cleanup";

/// AllocatedNode annotation marking a profile update in flight
pub const CONFIG_IN_PROGRESS_ANNOTATION: &str = "hwplugin.dev/config-in-progress";

// =============================================================================
// Requeue intervals
// =============================================================================

/// Requeue right away
pub const REQUEUE_IMMEDIATE: Duration = Duration::ZERO;

/// Requeue while active work is in progress
pub const REQUEUE_SHORT: Duration = Duration::from_secs(15);

/// Requeue after a status update or transient failure
pub const REQUEUE_MEDIUM: Duration = Duration::from_secs(30);

/// Requeue while waiting on a slow external precondition
pub const REQUEUE_LONG: Duration = Duration::from_secs(60);

/// Requeue after a reconcile lost an optimistic concurrency race
pub const REQUEUE_CONFLICT: Duration = Duration::from_secs(5);

/// How long a host may report an error before the failure is treated as real
pub const HOST_ERROR_TOLERANCE: Duration = Duration::from_secs(5 * 60);

/// Default deadline for provisioning or configuring hardware
pub const DEFAULT_HARDWARE_TIMEOUT: Duration = Duration::from_secs(90 * 60);
