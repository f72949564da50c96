use std::{net::IpAddr, sync::Arc};

use axum::http::Uri;
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    TailnetError, addr,
    controller::{ControllerOptions, MultiAgentController, Ticket},
    coordinatee::{Coordinatee, DirectCoordinatee},
    coordinator::{CoordinatorDialer, CoordinatorHandle, MultiAgentDialer},
    proxy::{self, ConnPool, ReverseProxy},
};

/// The control plane's own overlay node. Every outbound connection to an agent goes through it.
pub struct ServerTailnet {
    id: Uuid,
    coordinatee: Arc<dyn Coordinatee>,
    controller: MultiAgentController,
    pub(super) pool: ConnPool,
    pub(super) tls: TlsConnector,
    closed: CancellationToken,
}

/// A dial-ready route to one agent. Dropping it (or calling [`AgentConn::release`]) only releases
/// this caller's hold on the cached subscription.
pub struct AgentConn {
    agent_id: Uuid,
    ip: IpAddr,
    coordinatee: Arc<dyn Coordinatee>,
    _ticket: Ticket,
}

impl AgentConn {
    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    /// The overlay address the agent is dialed on.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub async fn dial_tcp(&self, port: u16) -> Result<TcpStream, TailnetError> {
        self.coordinatee.dial_tcp(self.agent_id, self.ip, port).await
    }

    pub async fn dial_udp(&self, port: u16) -> Result<UdpSocket, TailnetError> {
        self.coordinatee.dial_udp(self.agent_id, self.ip, port).await
    }

    pub fn release(self) {}
}

impl ServerTailnet {
    pub fn new(
        id: Uuid,
        coordinatee: Arc<dyn Coordinatee>,
        dialer: Arc<dyn MultiAgentDialer>,
        opts: ControllerOptions,
    ) -> Result<Arc<Self>, TailnetError> {
        let tls = TlsConnector::from(Arc::new(proxy::insecure_tls_config()?));
        let controller = MultiAgentController::start(coordinatee.clone(), dialer, opts);
        tracing::info!(node_id = %id, "server tailnet started");
        Ok(Arc::new(Self {
            id,
            coordinatee,
            controller,
            pool: ConnPool::default(),
            tls,
            closed: CancellationToken::new(),
        }))
    }

    /// A server node on a random overlay address, coordinating through `handle`.
    pub fn with_coordinator(
        handle: CoordinatorHandle,
        opts: ControllerOptions,
    ) -> Result<Arc<Self>, TailnetError> {
        let id = Uuid::new_v4();
        let coordinatee = Arc::new(DirectCoordinatee::new(
            id,
            IpAddr::V6(addr::random_ip()),
            Vec::new(),
        ));
        let dialer = Arc::new(CoordinatorDialer::new(handle, id, "servertailnet"));
        Self::new(id, coordinatee, dialer, opts)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn coordinatee(&self) -> &Arc<dyn Coordinatee> {
        &self.coordinatee
    }

    /// Subscribes to `agent_id` if needed and waits until it is reachable.
    pub async fn agent_conn(
        &self,
        agent_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<AgentConn, TailnetError> {
        if self.closed.is_cancelled() {
            return Err(TailnetError::Closed);
        }
        let ticket = self.controller.ensure_agent(agent_id).await;

        let info = tokio::select! {
            info = self.coordinatee.await_reachable(agent_id, cancel) => info,
            _ = self.closed.cancelled() => return Err(TailnetError::Closed),
        };
        let info = info.ok_or(TailnetError::Unreachable(agent_id))?;
        let ip = addr::dial_ip(agent_id, &info.addresses);
        tracing::debug!(%agent_id, %ip, "agent reachable");

        Ok(AgentConn {
            agent_id,
            ip,
            coordinatee: self.coordinatee.clone(),
            _ticket: ticket,
        })
    }

    /// An HTTP reverse proxy to `target` on the agent. Only the target's scheme, host and port are
    /// used; request paths pass through unchanged.
    pub fn reverse_proxy(
        self: &Arc<Self>,
        target: &Uri,
        dashboard_url: &str,
        agent_id: Uuid,
    ) -> Result<ReverseProxy, TailnetError> {
        ReverseProxy::new(self.clone(), target, dashboard_url, agent_id)
    }

    pub fn is_cached(&self, agent_id: Uuid) -> bool {
        self.controller.is_cached(agent_id)
    }

    pub async fn close(&self) {
        self.closed.cancel();
        self.pool.clear();
        self.controller.close().await;
        tracing::info!(node_id = %self.id, "server tailnet closed");
    }
}

#[cfg(test)]
pub(super) mod harness {
    use conduit_proto::tailnet_v2::{CoordinateRequest, Node, coordinate_request::UpdateSelf};

    use super::*;
    use crate::tailnet::{
        InMemoryCoordinator, PeerKind,
        coordinator::{Coordinator, PeerStream},
    };

    pub struct Harness {
        pub coordinator: Arc<InMemoryCoordinator>,
        pub tailnet: Arc<ServerTailnet>,
    }

    impl Harness {
        pub fn new() -> Self {
            let coordinator = Arc::new(InMemoryCoordinator::new());
            let handle = CoordinatorHandle::new(coordinator.clone());
            let tailnet = ServerTailnet::with_coordinator(handle, ControllerOptions::default())
                .expect("server tailnet");
            Self {
                coordinator,
                tailnet,
            }
        }

        /// Registers an agent reachable on the loopback interface.
        pub async fn agent(&self, id: Uuid, addresses: Vec<IpAddr>) -> PeerStream {
            let stream = self.coordinator.coordinate(id, "agent", PeerKind::Agent);
            stream
                .requests
                .send(CoordinateRequest {
                    update_self: Some(UpdateSelf {
                        node: Some(Node {
                            id: id.to_string(),
                            addresses: addresses.into_iter().map(addr::host_prefix).collect(),
                            endpoints: vec!["127.0.0.1:0".to_string()],
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                })
                .await
                .unwrap();
            stream
        }
    }
}
