pub mod mux;
pub mod rpc;
pub mod transport;

use std::time::Duration;

pub use mux::{MuxStream, Role, Session};
pub use rpc::{CallReceiver, CallSender, ClientCall, RpcClient, ServerCall, Service};
pub use transport::{CloseCode, CloseFrame, Frame, Transport, memory_pair};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
    #[error("no frames received for {0:?}")]
    IdleTimeout(Duration),
}
