use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use conduit_proto::tailnet_v2::{
    CoordinateRequest, CoordinateResponse, Node,
    coordinate_request::{Disconnect, Tunnel, UpdateSelf},
    coordinate_response::{PeerUpdate, peer_update::Kind},
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

use super::TailnetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Agent,
    Client,
}

/// One peer's connection to a coordinator.
pub struct PeerStream {
    pub requests: mpsc::Sender<CoordinateRequest>,
    pub responses: mpsc::UnboundedReceiver<CoordinateResponse>,
}

/// Relays node updates between peers that share a tunnel.
pub trait Coordinator: Send + Sync + 'static {
    /// Registers `id`, replacing any earlier connection under the same id. The peer leaves when
    /// it sends a disconnect (graceful) or drops its request sender (lost).
    fn coordinate(&self, id: Uuid, name: &str, kind: PeerKind) -> PeerStream;
    fn node(&self, id: Uuid) -> Option<Node>;
    fn close(&self);
}

/// The process-wide coordinator reference. Loads take a `parking_lot` read lock only for the
/// pointer clone, and `swap` is a single write; it is not a lock-free atomic pointer.
#[derive(Clone)]
pub struct CoordinatorHandle {
    inner: Arc<RwLock<Arc<dyn Coordinator>>>,
}

impl CoordinatorHandle {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(coordinator)),
        }
    }

    pub fn load(&self) -> Arc<dyn Coordinator> {
        self.inner.read().clone()
    }

    /// Installs `next` and returns the coordinator it replaced. Peers of the old one keep their
    /// streams until it is closed.
    pub fn swap(&self, next: Arc<dyn Coordinator>) -> Arc<dyn Coordinator> {
        std::mem::replace(&mut *self.inner.write(), next)
    }
}

struct Peer {
    conn: u64,
    name: String,
    kind: PeerKind,
    node: Option<Node>,
    tx: mpsc::UnboundedSender<CoordinateResponse>,
}

#[derive(Default)]
struct Core {
    peers: HashMap<Uuid, Peer>,
    /// `(src, dst)`: `src` wants to reach `dst`.
    tunnels: HashSet<(Uuid, Uuid)>,
    next_conn: u64,
}

fn peer_update(id: Uuid, node: Option<Node>, kind: Kind, reason: &str) -> PeerUpdate {
    PeerUpdate {
        id: id.to_string(),
        node,
        kind: kind as i32,
        reason: reason.to_string(),
    }
}

impl Core {
    fn send(&self, to: Uuid, update: PeerUpdate) {
        if let Some(peer) = self.peers.get(&to) {
            let _ = peer.tx.send(CoordinateResponse {
                peer_updates: vec![update],
                error: String::new(),
            });
        }
    }

    fn send_error(&self, to: Uuid, error: String) {
        if let Some(peer) = self.peers.get(&to) {
            let _ = peer.tx.send(CoordinateResponse {
                peer_updates: Vec::new(),
                error,
            });
        }
    }

    fn tunnel_peers(&self, id: Uuid) -> Vec<Uuid> {
        self.tunnels
            .iter()
            .filter_map(|&(src, dst)| match (src == id, dst == id) {
                (true, false) => Some(dst),
                (false, true) => Some(src),
                _ => None,
            })
            .collect()
    }

    fn is_current(&self, id: Uuid, conn: u64) -> bool {
        self.peers.get(&id).is_some_and(|p| p.conn == conn)
    }

    fn update_self(&mut self, id: Uuid, node: Node) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.node = Some(node.clone());
        for other in self.tunnel_peers(id) {
            self.send(other, peer_update(id, Some(node.clone()), Kind::Node, ""));
        }
    }

    fn add_tunnel(&mut self, src: Uuid, dst: Uuid) {
        if src == dst || !self.tunnels.insert((src, dst)) {
            return;
        }
        if let Some(node) = self.peers.get(&dst).and_then(|p| p.node.clone()) {
            self.send(src, peer_update(dst, Some(node), Kind::Node, ""));
        }
        if let Some(node) = self.peers.get(&src).and_then(|p| p.node.clone()) {
            self.send(dst, peer_update(src, Some(node), Kind::Node, ""));
        }
    }

    fn remove_tunnel(&mut self, src: Uuid, dst: Uuid) {
        if !self.tunnels.remove(&(src, dst)) {
            return;
        }
        self.send(dst, peer_update(src, None, Kind::Disconnected, "tunnel removed"));
        self.send(src, peer_update(dst, None, Kind::Disconnected, "tunnel removed"));
    }

    fn remove_peer(&mut self, id: Uuid, conn: u64, graceful: bool) {
        if !self.is_current(id, conn) {
            return;
        }
        let (kind, reason) = if graceful {
            (Kind::Disconnected, "disconnected")
        } else {
            (Kind::Lost, "lost")
        };
        for other in self.tunnel_peers(id) {
            self.send(other, peer_update(id, None, kind, reason));
        }
        self.peers.remove(&id);
        // Tunnels towards the peer stay so its node is relayed again when it comes back.
        self.tunnels.retain(|&(src, _)| src != id);
    }

    fn handle(&mut self, id: Uuid, conn: u64, req: CoordinateRequest) -> bool {
        if !self.is_current(id, conn) {
            return false;
        }
        if let Some(UpdateSelf { node: Some(node) }) = req.update_self {
            self.update_self(id, node);
        }
        if let Some(Tunnel { id: dst }) = req.add_tunnel {
            match Uuid::parse_str(&dst) {
                Ok(dst) => self.add_tunnel(id, dst),
                Err(e) => self.send_error(id, format!("add tunnel {dst:?}: {e}")),
            }
        }
        if let Some(Tunnel { id: dst }) = req.remove_tunnel {
            match Uuid::parse_str(&dst) {
                Ok(dst) => self.remove_tunnel(id, dst),
                Err(e) => self.send_error(id, format!("remove tunnel {dst:?}: {e}")),
            }
        }
        if req.disconnect.is_some() {
            self.remove_peer(id, conn, true);
            return false;
        }
        true
    }
}

/// Coordinator for a single control-plane replica.
pub struct InMemoryCoordinator {
    core: Arc<Mutex<Core>>,
    closed: CancellationToken,
    tasks: TaskTracker,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Mutex::new(Core::default())),
            closed: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Ids and names of the connected peers of `kind`.
    pub fn peers(&self, kind: PeerKind) -> Vec<(Uuid, String)> {
        self.core
            .lock()
            .peers
            .iter()
            .filter(|(_, p)| p.kind == kind)
            .map(|(id, p)| (*id, p.name.clone()))
            .collect()
    }

    pub async fn wait_closed(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator for InMemoryCoordinator {
    fn coordinate(&self, id: Uuid, name: &str, kind: PeerKind) -> PeerStream {
        let (req_tx, mut req_rx) = mpsc::channel::<CoordinateRequest>(64);
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        if self.closed.is_cancelled() {
            // Dropping resp_tx ends the stream right away.
            return PeerStream {
                requests: req_tx,
                responses: resp_rx,
            };
        }

        let conn = {
            let mut core = self.core.lock();
            core.next_conn += 1;
            let conn = core.next_conn;
            if core.peers.contains_key(&id) {
                tracing::debug!(peer_id = %id, "replacing coordinator peer");
            }
            core.peers.insert(
                id,
                Peer {
                    conn,
                    name: name.to_string(),
                    kind,
                    node: None,
                    tx: resp_tx,
                },
            );
            conn
        };
        tracing::debug!(peer_id = %id, name, ?kind, "peer joined coordinator");

        let core = self.core.clone();
        let closed = self.closed.clone();
        self.tasks.spawn(async move {
            loop {
                let req = tokio::select! {
                    req = req_rx.recv() => req,
                    _ = closed.cancelled() => return,
                };
                let Some(req) = req else {
                    core.lock().remove_peer(id, conn, false);
                    tracing::debug!(peer_id = %id, "peer lost");
                    return;
                };
                if !core.lock().handle(id, conn, req) {
                    tracing::debug!(peer_id = %id, "peer left coordinator");
                    return;
                }
            }
        });

        PeerStream {
            requests: req_tx,
            responses: resp_rx,
        }
    }

    fn node(&self, id: Uuid) -> Option<Node> {
        self.core.lock().peers.get(&id).and_then(|p| p.node.clone())
    }

    fn close(&self) {
        self.closed.cancel();
        let mut core = self.core.lock();
        core.peers.clear();
        core.tunnels.clear();
    }
}

/// A client's view of a coordinator carrying tunnels to many agents.
#[async_trait]
pub trait MultiAgentConn: Send + Sync + 'static {
    async fn update_self(&self, node: Node) -> Result<(), TailnetError>;
    async fn subscribe_agent(&self, agent_id: Uuid) -> Result<(), TailnetError>;
    async fn unsubscribe_agent(&self, agent_id: Uuid) -> Result<(), TailnetError>;
    /// The next response. `None` when `cancel` fires or the connection ended; the two are told
    /// apart with [`MultiAgentConn::is_closed`].
    async fn next_update(&self, cancel: &CancellationToken) -> Option<CoordinateResponse>;
    fn is_closed(&self) -> bool;
    /// Leaves gracefully; peers see the client as disconnected rather than lost.
    async fn disconnect(&self);
    fn close(&self);
}

#[async_trait]
pub trait MultiAgentDialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<Arc<dyn MultiAgentConn>, TailnetError>;
}

pub struct PeerConn {
    requests: Mutex<Option<mpsc::Sender<CoordinateRequest>>>,
    responses: tokio::sync::Mutex<mpsc::UnboundedReceiver<CoordinateResponse>>,
    closed: CancellationToken,
}

impl PeerConn {
    pub fn new(stream: PeerStream) -> Self {
        Self {
            requests: Mutex::new(Some(stream.requests)),
            responses: tokio::sync::Mutex::new(stream.responses),
            closed: CancellationToken::new(),
        }
    }

    async fn send(&self, req: CoordinateRequest) -> Result<(), TailnetError> {
        let Some(tx) = self.requests.lock().clone() else {
            return Err(TailnetError::CoordinatorClosed);
        };
        if tx.send(req).await.is_err() {
            self.close();
            return Err(TailnetError::CoordinatorClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl MultiAgentConn for PeerConn {
    async fn update_self(&self, node: Node) -> Result<(), TailnetError> {
        self.send(CoordinateRequest {
            update_self: Some(UpdateSelf { node: Some(node) }),
            ..Default::default()
        })
        .await
    }

    async fn subscribe_agent(&self, agent_id: Uuid) -> Result<(), TailnetError> {
        self.send(CoordinateRequest {
            add_tunnel: Some(Tunnel {
                id: agent_id.to_string(),
            }),
            ..Default::default()
        })
        .await
    }

    async fn unsubscribe_agent(&self, agent_id: Uuid) -> Result<(), TailnetError> {
        self.send(CoordinateRequest {
            remove_tunnel: Some(Tunnel {
                id: agent_id.to_string(),
            }),
            ..Default::default()
        })
        .await
    }

    async fn next_update(&self, cancel: &CancellationToken) -> Option<CoordinateResponse> {
        let mut rx = self.responses.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = self.closed.cancelled() => None,
            resp = rx.recv() => {
                if resp.is_none() {
                    self.close();
                }
                resp
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn disconnect(&self) {
        let _ = self
            .send(CoordinateRequest {
                disconnect: Some(Disconnect {}),
                ..Default::default()
            })
            .await;
        self.close();
    }

    fn close(&self) {
        self.requests.lock().take();
        self.closed.cancel();
    }
}

/// Dials the coordinator currently installed in a [`CoordinatorHandle`].
pub struct CoordinatorDialer {
    handle: CoordinatorHandle,
    id: Uuid,
    name: String,
}

impl CoordinatorDialer {
    pub fn new(handle: CoordinatorHandle, id: Uuid, name: impl Into<String>) -> Self {
        Self {
            handle,
            id,
            name: name.into(),
        }
    }
}

#[async_trait]
impl MultiAgentDialer for CoordinatorDialer {
    async fn dial(&self) -> Result<Arc<dyn MultiAgentConn>, TailnetError> {
        let stream = self
            .handle
            .load()
            .coordinate(self.id, &self.name, PeerKind::Client);
        Ok(Arc::new(PeerConn::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn node(id: Uuid, addr: &str) -> Node {
        Node {
            id: id.to_string(),
            addresses: vec![addr.to_string()],
            ..Default::default()
        }
    }

    async fn next(conn: &PeerConn) -> PeerUpdate {
        let resp = tokio::time::timeout(
            Duration::from_secs(5),
            conn.next_update(&CancellationToken::new()),
        )
        .await
        .expect("update in time")
        .expect("stream open");
        assert!(resp.error.is_empty(), "{}", resp.error);
        resp.peer_updates.into_iter().next().expect("one update")
    }

    fn join(coord: &InMemoryCoordinator, id: Uuid, kind: PeerKind) -> PeerConn {
        PeerConn::new(coord.coordinate(id, "peer", kind))
    }

    #[tokio::test]
    async fn agent_node_reaches_subscribed_client() {
        let coord = InMemoryCoordinator::new();
        let agent_id = Uuid::new_v4();
        let agent = join(&coord, agent_id, PeerKind::Agent);
        let client = join(&coord, Uuid::new_v4(), PeerKind::Client);

        agent.update_self(node(agent_id, "fd7a:115c:a1e0::1/128")).await.unwrap();
        client.subscribe_agent(agent_id).await.unwrap();

        let update = next(&client).await;
        assert_eq!(update.id, agent_id.to_string());
        assert_eq!(update.kind, Kind::Node as i32);
        assert_eq!(update.node.unwrap().addresses, vec!["fd7a:115c:a1e0::1/128"]);

        agent.update_self(node(agent_id, "fd7a:115c:a1e0::2/128")).await.unwrap();
        let update = next(&client).await;
        assert_eq!(update.node.unwrap().addresses, vec!["fd7a:115c:a1e0::2/128"]);
    }

    #[tokio::test]
    async fn graceful_and_abrupt_departures_are_distinguished() {
        let coord = InMemoryCoordinator::new();
        let client = join(&coord, Uuid::new_v4(), PeerKind::Client);

        let a_id = Uuid::new_v4();
        let a = join(&coord, a_id, PeerKind::Agent);
        a.update_self(node(a_id, "fd7a:115c:a1e0::a/128")).await.unwrap();
        client.subscribe_agent(a_id).await.unwrap();
        assert_eq!(next(&client).await.kind, Kind::Node as i32);
        a.disconnect().await;
        assert_eq!(next(&client).await.kind, Kind::Disconnected as i32);

        let b_id = Uuid::new_v4();
        let b = join(&coord, b_id, PeerKind::Agent);
        // The tunnel towards a departed agent is kept, so a returning agent is relayed again.
        client.subscribe_agent(b_id).await.unwrap();
        b.update_self(node(b_id, "fd7a:115c:a1e0::b/128")).await.unwrap();
        assert_eq!(next(&client).await.kind, Kind::Node as i32);
        b.close();
        let update = next(&client).await;
        assert_eq!(update.id, b_id.to_string());
        assert_eq!(update.kind, Kind::Lost as i32);
    }

    #[tokio::test]
    async fn closing_the_coordinator_ends_peer_streams() {
        let coord = InMemoryCoordinator::new();
        let client = join(&coord, Uuid::new_v4(), PeerKind::Client);
        coord.close();
        assert!(client.next_update(&CancellationToken::new()).await.is_none());
        assert!(client.is_closed());

        let late = join(&coord, Uuid::new_v4(), PeerKind::Client);
        assert!(late.next_update(&CancellationToken::new()).await.is_none());
        coord.wait_closed().await;
    }

    #[tokio::test]
    async fn cancelled_wait_is_not_a_close() {
        let coord = InMemoryCoordinator::new();
        let client = join(&coord, Uuid::new_v4(), PeerKind::Client);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(client.next_update(&cancel).await.is_none());
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn handle_swap_routes_new_dials_to_the_new_coordinator() {
        let first = Arc::new(InMemoryCoordinator::new());
        let second = Arc::new(InMemoryCoordinator::new());
        let handle = CoordinatorHandle::new(first.clone());
        let dialer = CoordinatorDialer::new(handle.clone(), Uuid::new_v4(), "servertailnet");

        let _a = dialer.dial().await.unwrap();
        assert_eq!(first.peers(PeerKind::Client).len(), 1);

        let old = handle.swap(second.clone());
        old.close();
        let _b = dialer.dial().await.unwrap();
        assert_eq!(second.peers(PeerKind::Client).len(), 1);
        assert!(first.peers(PeerKind::Client).is_empty());
    }
}
