//! gRPC transport to the remote decision service.
//!
//! Messages are declared directly with `prost` derives; the service exposes a
//! single unary `Decide` method.

mod client;
pub mod proto;

pub use client::GrpcRemote;
pub use proto::{DecideRequest, DecideResponse, RuleResultMessage};
