//! Resource models shared by the shim controller: the `Shim` custom resource, the client used to
//! read and conditionally write it, and the node inventory the rollout is planned against.

pub mod constants;
pub mod node;
pub mod shim;
pub mod telemetry;
