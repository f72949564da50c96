//! Server side of the overlay network: the coordinator peers register with, the server's own
//! overlay node, and the dialing/proxying surface the rest of the control plane uses to reach
//! agents.

pub mod addr;
pub mod controller;
pub mod coordinatee;
pub mod coordinator;
pub mod proxy;
pub mod server;

use uuid::Uuid;

pub use controller::{ControllerOptions, MultiAgentController, Ticket};
pub use coordinatee::{Coordinatee, DirectCoordinatee, NodeSubscription, PeerStatus, TunnelPeerInfo};
pub use coordinator::{
    Coordinator, CoordinatorDialer, CoordinatorHandle, InMemoryCoordinator, MultiAgentConn,
    MultiAgentDialer, PeerKind,
};
pub use proxy::ReverseProxy;
pub use server::{AgentConn, ServerTailnet};

#[derive(Debug, thiserror::Error)]
pub enum TailnetError {
    #[error("coordinator closed")]
    CoordinatorClosed,
    #[error("agent {0} is unreachable")]
    Unreachable(Uuid),
    #[error("no route to {0}")]
    NoRoute(std::net::IpAddr),
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid peer update: {0}")]
    InvalidUpdate(String),
    #[error("invalid proxy target: {0}")]
    InvalidTarget(String),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("server tailnet is closed")]
    Closed,
}
