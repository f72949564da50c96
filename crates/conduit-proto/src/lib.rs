// Wire messages shared by the control plane, workspace agents and provisioner daemons.
//
// Messages are declared with prost derives in Rust directly, so building this crate does not
// need protoc. Tags are part of the wire contract: never renumber a field.

pub mod agent_v2;
pub mod provisionerd_v1;
pub mod rpc;
pub mod tailnet_v2;
