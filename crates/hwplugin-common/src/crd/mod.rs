//! Custom Resource Definitions for the hardware plugin

mod allocated_node;
mod allocation_request;
pub mod conditions;
mod physical_host;
mod types;

pub use allocated_node::{AllocatedNode, AllocatedNodeSpec, AllocatedNodeStatus};
pub use allocation_request::{
    AllocationRequest, AllocationRequestSpec, AllocationRequestStatus, Callback, NodeGroup,
    Properties,
};
pub use physical_host::{
    CustomDeploy, HostImage, PhysicalHost, PhysicalHostSpec, PhysicalHostStatus,
    ProvisioningState, ProvisioningStatus,
};
pub use types::{Condition, ConditionReason, ConditionStatus, ConditionType, ObjectRef};
