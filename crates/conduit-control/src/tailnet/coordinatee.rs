use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_proto::tailnet_v2::{
    Node,
    coordinate_response::{PeerUpdate, peer_update::Kind},
};
use parking_lot::Mutex;
use tokio::{
    net::{TcpStream, UdpSocket},
    sync::{Notify, watch},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{TailnetError, addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Active,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPeerInfo {
    pub id: Uuid,
    pub addresses: Vec<IpAddr>,
    pub status: PeerStatus,
    /// When `status` was entered.
    pub since: DateTime<Utc>,
}

/// Observes changes to the local node. Dropping it unsubscribes.
pub struct NodeSubscription {
    rx: watch::Receiver<Node>,
}

impl NodeSubscription {
    pub fn new(rx: watch::Receiver<Node>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> Node {
        self.rx.borrow().clone()
    }

    /// Waits for the node to change. Errors once the overlay interface is gone.
    pub async fn changed(&mut self) -> Result<(), TailnetError> {
        self.rx.changed().await.map_err(|_| TailnetError::Closed)
    }
}

/// The local overlay interface: the routing table of peers the server can reach, and the
/// server's own node.
#[async_trait]
pub trait Coordinatee: Send + Sync + 'static {
    fn node(&self) -> Node;
    fn update_peers(&self, updates: &[PeerUpdate]) -> Result<(), TailnetError>;
    /// Marks every known peer lost until a fresh update proves otherwise.
    fn set_all_peers_lost(&self);
    fn subscribe_node(&self) -> NodeSubscription;
    fn peers(&self) -> Vec<TunnelPeerInfo>;
    /// Waits until `peer` is active, returning its current info. `None` on cancellation.
    async fn await_reachable(&self, peer: Uuid, cancel: &CancellationToken)
    -> Option<TunnelPeerInfo>;
    /// Dials `ip:port` on `peer`. Several legacy agents may share one address, so the peer is
    /// named explicitly.
    async fn dial_tcp(&self, peer: Uuid, ip: IpAddr, port: u16) -> Result<TcpStream, TailnetError>;
    async fn dial_udp(&self, peer: Uuid, ip: IpAddr, port: u16) -> Result<UdpSocket, TailnetError>;
}

struct PeerEntry {
    info: TunnelPeerInfo,
    endpoints: Vec<String>,
}

/// Routes overlay dials to the underlay endpoints peers advertise. Overlay ports map 1:1 onto
/// the endpoint host.
pub struct DirectCoordinatee {
    node_tx: watch::Sender<Node>,
    peers: Mutex<HashMap<Uuid, PeerEntry>>,
    changed: Notify,
}

impl DirectCoordinatee {
    pub fn new(id: Uuid, ip: IpAddr, endpoints: Vec<String>) -> Self {
        let node = Node {
            id: id.to_string(),
            as_of_unix_ms: Utc::now().timestamp_millis(),
            addresses: vec![addr::host_prefix(ip)],
            endpoints,
            ..Default::default()
        };
        let (node_tx, _) = watch::channel(node);
        Self {
            node_tx,
            peers: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    pub fn set_endpoints(&self, endpoints: Vec<String>) {
        self.node_tx.send_modify(|node| {
            node.endpoints = endpoints;
            node.as_of_unix_ms = Utc::now().timestamp_millis();
        });
    }

    fn route(&self, peer: Uuid, ip: IpAddr) -> Result<Vec<String>, TailnetError> {
        self.peers
            .lock()
            .get(&peer)
            .filter(|p| p.info.status == PeerStatus::Active && p.info.addresses.contains(&ip))
            .map(|p| p.endpoints.clone())
            .filter(|endpoints| !endpoints.is_empty())
            .ok_or(TailnetError::NoRoute(ip))
    }

    async fn resolve(
        &self,
        peer: Uuid,
        ip: IpAddr,
        port: u16,
    ) -> Result<Vec<SocketAddr>, TailnetError> {
        let mut resolved = Vec::new();
        let mut last_err = None;
        for endpoint in self.route(peer, ip)? {
            let host = endpoint_host(&endpoint);
            match tokio::net::lookup_host((host, port)).await {
                Ok(addrs) => resolved.extend(addrs),
                Err(source) => {
                    last_err = Some(TailnetError::Dial {
                        addr: format!("{host}:{port}"),
                        source,
                    })
                }
            }
        }
        if resolved.is_empty() {
            return Err(last_err.unwrap_or(TailnetError::NoRoute(ip)));
        }
        Ok(resolved)
    }
}

/// The host part of a `host:port` endpoint, accepting bracketed IPv6.
fn endpoint_host(endpoint: &str) -> &str {
    if let Some(rest) = endpoint.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => endpoint,
    }
}

fn peer_id(update: &PeerUpdate) -> Result<Uuid, TailnetError> {
    Uuid::parse_str(&update.id)
        .map_err(|e| TailnetError::InvalidUpdate(format!("peer id {:?}: {e}", update.id)))
}

#[async_trait]
impl Coordinatee for DirectCoordinatee {
    fn node(&self) -> Node {
        self.node_tx.borrow().clone()
    }

    fn update_peers(&self, updates: &[PeerUpdate]) -> Result<(), TailnetError> {
        let now = Utc::now();
        let mut first_err = None;
        {
            let mut peers = self.peers.lock();
            for update in updates {
                let id = match peer_id(update) {
                    Ok(id) => id,
                    Err(e) => {
                        first_err.get_or_insert(e);
                        continue;
                    }
                };
                match Kind::try_from(update.kind) {
                    Ok(Kind::Node) => {
                        let Some(node) = &update.node else {
                            first_err.get_or_insert(TailnetError::InvalidUpdate(format!(
                                "node update for {id} without a node"
                            )));
                            continue;
                        };
                        let addresses = node
                            .addresses
                            .iter()
                            .filter_map(|a| addr::parse_advertised(a))
                            .collect();
                        let since = match peers.get(&id) {
                            Some(p) if p.info.status == PeerStatus::Active => p.info.since,
                            _ => now,
                        };
                        peers.insert(
                            id,
                            PeerEntry {
                                info: TunnelPeerInfo {
                                    id,
                                    addresses,
                                    status: PeerStatus::Active,
                                    since,
                                },
                                endpoints: node.endpoints.clone(),
                            },
                        );
                    }
                    Ok(Kind::Disconnected) => {
                        peers.remove(&id);
                    }
                    Ok(Kind::Lost) => {
                        if let Some(p) = peers.get_mut(&id) {
                            if p.info.status != PeerStatus::Lost {
                                p.info.status = PeerStatus::Lost;
                                p.info.since = now;
                            }
                        }
                    }
                    Ok(Kind::Unspecified) | Err(_) => {
                        first_err.get_or_insert(TailnetError::InvalidUpdate(format!(
                            "peer {id}: unknown kind {}",
                            update.kind
                        )));
                    }
                }
            }
        }
        self.changed.notify_waiters();
        first_err.map_or(Ok(()), Err)
    }

    fn set_all_peers_lost(&self) {
        let now = Utc::now();
        for p in self.peers.lock().values_mut() {
            if p.info.status != PeerStatus::Lost {
                p.info.status = PeerStatus::Lost;
                p.info.since = now;
            }
        }
        self.changed.notify_waiters();
    }

    fn subscribe_node(&self) -> NodeSubscription {
        NodeSubscription::new(self.node_tx.subscribe())
    }

    fn peers(&self) -> Vec<TunnelPeerInfo> {
        self.peers.lock().values().map(|p| p.info.clone()).collect()
    }

    async fn await_reachable(
        &self,
        peer: Uuid,
        cancel: &CancellationToken,
    ) -> Option<TunnelPeerInfo> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let active = self
                .peers
                .lock()
                .get(&peer)
                .filter(|p| p.info.status == PeerStatus::Active)
                .map(|p| p.info.clone());
            if active.is_some() {
                return active;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    async fn dial_tcp(&self, peer: Uuid, ip: IpAddr, port: u16) -> Result<TcpStream, TailnetError> {
        let mut last_err = None;
        for target in self.resolve(peer, ip, port).await? {
            match TcpStream::connect(target).await {
                Ok(stream) => return Ok(stream),
                Err(source) => {
                    last_err = Some(TailnetError::Dial {
                        addr: target.to_string(),
                        source,
                    })
                }
            }
        }
        Err(last_err.unwrap_or(TailnetError::NoRoute(ip)))
    }

    async fn dial_udp(&self, peer: Uuid, ip: IpAddr, port: u16) -> Result<UdpSocket, TailnetError> {
        let target = self
            .resolve(peer, ip, port)
            .await?
            .into_iter()
            .next()
            .ok_or(TailnetError::NoRoute(ip))?;
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let dial_err = |source| TailnetError::Dial {
            addr: target.to_string(),
            source,
        };
        let socket = UdpSocket::bind(local).await.map_err(dial_err)?;
        socket.connect(target).await.map_err(dial_err)?;
        Ok(socket)
    }
}
