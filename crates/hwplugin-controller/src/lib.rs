//! Hardware allocation controllers
//!
//! This crate provides the Kubernetes controllers for AllocationRequest and
//! AllocatedNode CRDs: host allocation, provisioning progress, hardware
//! profile rollouts and host release on deletion.

pub mod allocator;
pub mod callback;
pub mod classifier;
pub mod configuring;
pub mod controller;
pub mod index;
pub mod naming;
pub mod node_controller;
pub mod phases;
pub mod progress;
pub mod readiness;
pub mod release;
pub mod store;
pub mod timeout;

#[cfg(test)]
mod testing;

// Re-export controller types
pub use callback::{CallbackNotifier, StatusNotifier};
pub use controller::{error_policy, reconcile, Context, ContextBuilder, ControllerConfig};
pub use index::NodeIndex;
pub use node_controller::{node_error_policy, reconcile_node};
pub use store::{HardwareReader, HardwareWriter, KubeHardwareStore};

// Re-export common error types
pub use hwplugin_common::{Error, Result};
