//! OCPP 2.1 message plumbing for charging stations, networking nodes and CSMS:
//! envelope codec, request correlation, message signatures, handler dispatch
//! and the forwarding decisions of networking nodes.

pub mod api;
pub mod binary;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod envelope;
pub mod forwarding;
pub mod node;
pub mod ocpp;
pub mod signatures;
pub mod telemetry;
