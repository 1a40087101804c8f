//! # drover Common Crate
//!
//! Shared data model between the drover agent and the control-plane
//! servers: the node structure, the allocation structure, and the wire
//! types for the RPCs the agent consumes.
//!
//! ## Modules
//! - `node`: node identity, attributes, resource inventory, status
//! - `alloc`: allocations, client status, per-task state, status updates
//! - `rpc`: request/response structs for the consumed server RPCs

pub mod alloc;
pub mod node;
pub mod rpc;

pub use alloc::{AllocClientStatus, AllocStatusUpdate, Allocation, TaskState};
pub use node::{NetworkResource, Node, NodeStatus, Port, Resources};
pub use rpc::{
    AllocUpdateRequest, AllocsGetRequest, AllocsGetResponse, GenericResponse,
    NodeClientAllocsResponse, NodeRegisterRequest, NodeSpecificRequest, NodeUpdateResponse,
    NodeUpdateStatusRequest, QueryOptions, WriteRequest,
};
