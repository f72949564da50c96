use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use conduit_proto::tailnet_v2::{
    CoordinateResponse, Node,
    coordinate_response::peer_update::Kind,
};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;
use uuid::Uuid;

use super::{
    TailnetError,
    coordinatee::{Coordinatee, NodeSubscription},
    coordinator::{MultiAgentConn, MultiAgentDialer},
};

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Cached agents unused for this long with no live tickets are unsubscribed.
    pub idle_cutoff: Duration,
    pub sweep_interval: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            idle_cutoff: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(10),
        }
    }
}

struct CachedAgent {
    node: Option<Node>,
    last_used: Instant,
    tickets: HashSet<u64>,
}

impl CachedAgent {
    fn new() -> Self {
        Self {
            node: None,
            last_used: Instant::now(),
            tickets: HashSet::new(),
        }
    }
}

struct Inner {
    coordinatee: Arc<dyn Coordinatee>,
    dialer: Arc<dyn MultiAgentDialer>,
    opts: ControllerOptions,
    agents: Mutex<HashMap<Uuid, CachedAgent>>,
    conn: Mutex<Option<Arc<dyn MultiAgentConn>>>,
    /// Held across subscribe/unsubscribe sends so they reach the coordinator in cache order.
    subs: tokio::sync::Mutex<()>,
    next_ticket: AtomicU64,
}

/// Keeps the local overlay interface subscribed to every agent the server is talking to, across
/// coordinator reconnects.
pub struct MultiAgentController {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Keeps an agent in the cache while held.
pub struct Ticket {
    inner: Arc<Inner>,
    agent_id: Uuid,
    id: u64,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(agent) = self.inner.agents.lock().get_mut(&self.agent_id) {
            agent.tickets.remove(&self.id);
            agent.last_used = Instant::now();
        }
    }
}

impl MultiAgentController {
    pub fn start(
        coordinatee: Arc<dyn Coordinatee>,
        dialer: Arc<dyn MultiAgentDialer>,
        opts: ControllerOptions,
    ) -> Self {
        let inner = Arc::new(Inner {
            coordinatee,
            dialer,
            opts,
            agents: Mutex::new(HashMap::new()),
            conn: Mutex::new(None),
            subs: tokio::sync::Mutex::new(()),
            next_ticket: AtomicU64::new(1),
        });
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(
            inner
                .clone()
                .watch(cancel.clone())
                .instrument(tracing::info_span!("servertailnet")),
        );
        tasks.spawn(
            inner
                .clone()
                .sweep(cancel.clone())
                .instrument(tracing::info_span!("servertailnet_sweep")),
        );
        Self {
            inner,
            cancel,
            tasks,
        }
    }

    /// Caches `agent_id`, subscribing to it on the live connection if it was not cached yet, and
    /// returns a ticket that keeps it cached.
    pub async fn ensure_agent(&self, agent_id: Uuid) -> Ticket {
        let id = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let inserted = {
            let mut agents = self.inner.agents.lock();
            let mut inserted = false;
            let agent = agents.entry(agent_id).or_insert_with(|| {
                inserted = true;
                CachedAgent::new()
            });
            agent.tickets.insert(id);
            agent.last_used = Instant::now();
            inserted
        };
        let ticket = Ticket {
            inner: self.inner.clone(),
            agent_id,
            id,
        };
        if !inserted {
            return ticket;
        }

        let _subs = self.inner.subs.lock().await;
        let Some(conn) = self.inner.conn.lock().clone() else {
            // Subscribed when the watch loop connects.
            return ticket;
        };
        match conn.subscribe_agent(agent_id).await {
            Ok(()) => tracing::debug!(%agent_id, "subscribed to agent"),
            Err(e) => tracing::debug!(%agent_id, error = %e, "subscribe deferred to reconnect"),
        }
        ticket
    }

    /// The last node the coordinator reported for a cached agent.
    pub fn agent_node(&self, agent_id: Uuid) -> Option<Node> {
        self.inner
            .agents
            .lock()
            .get(&agent_id)
            .and_then(|a| a.node.clone())
    }

    pub fn is_cached(&self, agent_id: Uuid) -> bool {
        self.inner.agents.lock().contains_key(&agent_id)
    }

    /// Stops the watch loop, unsubscribing every cached agent.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl Inner {
    async fn watch(self: Arc<Self>, cancel: CancellationToken) {
        let mut node_sub = self.coordinatee.subscribe_node();
        let mut backoff = self.opts.retry_initial;
        loop {
            let dialed = tokio::select! {
                _ = cancel.cancelled() => break,
                dialed = self.dialer.dial() => dialed,
            };
            let conn = match dialed {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "dial coordinator");
                    if !sleep_or_cancel(backoff, &cancel).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.opts.retry_max);
                    continue;
                }
            };
            *self.conn.lock() = Some(conn.clone());

            if let Err(e) = self.resync(&conn, node_sub.current()).await {
                tracing::warn!(error = %e, "resync coordinator subscriptions");
                conn.close();
            }

            let (reconnect, got_updates) = self.drain(&conn, &mut node_sub, &cancel).await;
            if !reconnect {
                break;
            }
            tracing::info!("coordinator connection closed, reconnecting");
            self.coordinatee.set_all_peers_lost();
            self.conn.lock().take();
            if got_updates {
                backoff = self.opts.retry_initial;
            }
            if !sleep_or_cancel(backoff, &cancel).await {
                break;
            }
            backoff = (backoff * 2).min(self.opts.retry_max);
        }
        self.shutdown().await;
    }

    async fn resync(&self, conn: &Arc<dyn MultiAgentConn>, node: Node) -> Result<(), TailnetError> {
        conn.update_self(node).await?;
        let _subs = self.subs.lock().await;
        let agents: Vec<Uuid> = self.agents.lock().keys().copied().collect();
        for agent_id in agents {
            conn.subscribe_agent(agent_id).await?;
        }
        Ok(())
    }

    /// Applies updates until the connection ends. Returns whether to reconnect and whether any
    /// update arrived.
    async fn drain(
        &self,
        conn: &Arc<dyn MultiAgentConn>,
        node_sub: &mut NodeSubscription,
        cancel: &CancellationToken,
    ) -> (bool, bool) {
        let mut node_open = true;
        let mut got_updates = false;
        loop {
            tokio::select! {
                update = conn.next_update(cancel) => match update {
                    Some(resp) => {
                        got_updates = true;
                        self.apply(resp);
                    }
                    None => return (conn.is_closed() && !cancel.is_cancelled(), got_updates),
                },
                changed = node_sub.changed(), if node_open => match changed {
                    Ok(()) => {
                        if let Err(e) = conn.update_self(node_sub.current()).await {
                            tracing::debug!(error = %e, "send node update");
                        }
                    }
                    Err(_) => node_open = false,
                },
            }
        }
    }

    fn apply(&self, resp: CoordinateResponse) {
        if !resp.error.is_empty() {
            tracing::warn!(error = %resp.error, "coordinator reported an error");
        }
        if resp.peer_updates.is_empty() {
            return;
        }
        if let Err(e) = self.coordinatee.update_peers(&resp.peer_updates) {
            tracing::warn!(error = %e, "apply peer updates");
        }
        let mut agents = self.agents.lock();
        for update in &resp.peer_updates {
            let Ok(id) = Uuid::parse_str(&update.id) else {
                continue;
            };
            let Some(agent) = agents.get_mut(&id) else {
                continue;
            };
            match Kind::try_from(update.kind) {
                Ok(Kind::Node) => agent.node = update.node.clone(),
                Ok(Kind::Disconnected) => agent.node = None,
                _ => {}
            }
        }
    }

    async fn sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.opts.sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => self.expire(Instant::now()).await,
            }
        }
    }

    async fn expire(&self, now: Instant) {
        let expired: Vec<Uuid> = {
            let mut agents = self.agents.lock();
            let expired: Vec<Uuid> = agents
                .iter()
                .filter(|(_, a)| {
                    a.tickets.is_empty()
                        && now.saturating_duration_since(a.last_used) >= self.opts.idle_cutoff
                })
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                agents.remove(id);
            }
            expired
        };
        if expired.is_empty() {
            return;
        }
        let _subs = self.subs.lock().await;
        let Some(conn) = self.conn.lock().clone() else {
            return;
        };
        for agent_id in expired {
            // Re-added since removal: its subscribe is ordered after this point.
            if self.agents.lock().contains_key(&agent_id) {
                continue;
            }
            tracing::debug!(%agent_id, "unsubscribing idle agent");
            if let Err(e) = conn.unsubscribe_agent(agent_id).await {
                tracing::debug!(%agent_id, error = %e, "unsubscribe idle agent");
            }
        }
    }

    async fn shutdown(&self) {
        let _subs = self.subs.lock().await;
        let agents: Vec<Uuid> = self.agents.lock().drain().map(|(id, _)| id).collect();
        let Some(conn) = self.conn.lock().take() else {
            return;
        };
        if !conn.is_closed() {
            for agent_id in agents {
                if let Err(e) = conn.unsubscribe_agent(agent_id).await {
                    tracing::debug!(%agent_id, error = %e, "unsubscribe on shutdown");
                    break;
                }
            }
            conn.disconnect().await;
        }
        conn.close();
    }
}

async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        net::IpAddr,
        sync::atomic::AtomicBool,
    };

    use async_trait::async_trait;
    use conduit_proto::tailnet_v2::coordinate_response::PeerUpdate;
    use tokio::{
        net::{TcpStream, UdpSocket},
        sync::{mpsc, watch},
    };

    use super::*;
    use crate::tailnet::TunnelPeerInfo;

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeConn {
        log: Log,
        tx: Mutex<Option<mpsc::UnboundedSender<CoordinateResponse>>>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CoordinateResponse>>,
        closed: AtomicBool,
        clean_end: bool,
        slow_unsubscribe: AtomicBool,
    }

    impl FakeConn {
        fn build(log: &Log, updates: Vec<CoordinateResponse>, open: bool, clean_end: bool) -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            for u in updates {
                tx.send(u).unwrap();
            }
            Arc::new(Self {
                log: log.clone(),
                tx: Mutex::new(open.then_some(tx)),
                rx: tokio::sync::Mutex::new(rx),
                closed: AtomicBool::new(false),
                clean_end,
                slow_unsubscribe: AtomicBool::new(false),
            })
        }

        fn new(log: &Log, updates: Vec<CoordinateResponse>) -> Arc<Self> {
            Self::build(log, updates, true, false)
        }

        /// Stream ends once the queued updates are drained.
        fn ending(log: &Log, updates: Vec<CoordinateResponse>, clean_end: bool) -> Arc<Self> {
            Self::build(log, updates, false, clean_end)
        }

        fn push(&self, resp: CoordinateResponse) {
            if let Some(tx) = &*self.tx.lock() {
                tx.send(resp).unwrap();
            }
        }
    }

    #[async_trait]
    impl MultiAgentConn for FakeConn {
        async fn update_self(&self, _node: Node) -> Result<(), TailnetError> {
            self.log.lock().push("update_self".into());
            Ok(())
        }

        async fn subscribe_agent(&self, agent_id: Uuid) -> Result<(), TailnetError> {
            self.log.lock().push(format!("subscribe:{agent_id}"));
            Ok(())
        }

        async fn unsubscribe_agent(&self, agent_id: Uuid) -> Result<(), TailnetError> {
            if self.slow_unsubscribe.load(Ordering::SeqCst) {
                self.log.lock().push(format!("unsubscribing:{agent_id}"));
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            self.log.lock().push(format!("unsubscribe:{agent_id}"));
            Ok(())
        }

        async fn next_update(&self, cancel: &CancellationToken) -> Option<CoordinateResponse> {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                resp = rx.recv() => {
                    if resp.is_none() && !self.clean_end {
                        self.closed.store(true, Ordering::SeqCst);
                    }
                    resp
                }
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn disconnect(&self) {
            self.log.lock().push("disconnect".into());
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeDialer {
        log: Log,
        conns: Mutex<VecDeque<Arc<FakeConn>>>,
    }

    #[async_trait]
    impl MultiAgentDialer for FakeDialer {
        async fn dial(&self) -> Result<Arc<dyn MultiAgentConn>, TailnetError> {
            self.log.lock().push("dial".into());
            match self.conns.lock().pop_front() {
                Some(conn) => Ok(conn),
                None => Err(TailnetError::CoordinatorClosed),
            }
        }
    }

    struct FakeCoordinatee {
        log: Log,
        node_tx: watch::Sender<Node>,
    }

    #[async_trait]
    impl Coordinatee for FakeCoordinatee {
        fn node(&self) -> Node {
            self.node_tx.borrow().clone()
        }

        fn update_peers(&self, updates: &[PeerUpdate]) -> Result<(), TailnetError> {
            let mut log = self.log.lock();
            for u in updates {
                log.push(format!("peer:{}", u.id));
            }
            Ok(())
        }

        fn set_all_peers_lost(&self) {
            self.log.lock().push("all_lost".into());
        }

        fn subscribe_node(&self) -> NodeSubscription {
            NodeSubscription::new(self.node_tx.subscribe())
        }

        fn peers(&self) -> Vec<TunnelPeerInfo> {
            Vec::new()
        }

        async fn await_reachable(
            &self,
            _peer: Uuid,
            _cancel: &CancellationToken,
        ) -> Option<TunnelPeerInfo> {
            None
        }

        async fn dial_tcp(&self, _peer: Uuid, ip: IpAddr, _port: u16) -> Result<TcpStream, TailnetError> {
            Err(TailnetError::NoRoute(ip))
        }

        async fn dial_udp(&self, _peer: Uuid, ip: IpAddr, _port: u16) -> Result<UdpSocket, TailnetError> {
            Err(TailnetError::NoRoute(ip))
        }
    }

    fn node_resp(id: Uuid) -> CoordinateResponse {
        CoordinateResponse {
            peer_updates: vec![PeerUpdate {
                id: id.to_string(),
                node: Some(Node {
                    id: id.to_string(),
                    ..Default::default()
                }),
                kind: Kind::Node as i32,
                reason: String::new(),
            }],
            error: String::new(),
        }
    }

    fn setup(conns: Vec<Arc<FakeConn>>, log: &Log) -> MultiAgentController {
        let coordinatee = Arc::new(FakeCoordinatee {
            log: log.clone(),
            node_tx: watch::channel(Node::default()).0,
        });
        let dialer = Arc::new(FakeDialer {
            log: log.clone(),
            conns: Mutex::new(conns.into()),
        });
        MultiAgentController::start(coordinatee, dialer, ControllerOptions::default())
    }

    async fn wait_for(log: &Log, entry: &str) {
        for _ in 0..1000 {
            if log.lock().iter().any(|e| e == entry) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{entry} never logged: {:?}", log.lock());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_marks_peers_lost_once_before_new_updates() {
        let log: Log = Default::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let first = FakeConn::ending(&log, vec![node_resp(a)], false);
        let second = FakeConn::new(&log, vec![node_resp(b)]);
        let controller = setup(vec![first, second], &log);

        wait_for(&log, &format!("peer:{b}")).await;
        let seq: Vec<String> = log
            .lock()
            .iter()
            .filter(|e| e.starts_with("peer:") || *e == "all_lost" || *e == "dial")
            .cloned()
            .collect();
        assert_eq!(
            seq,
            vec![
                "dial".to_string(),
                format!("peer:{a}"),
                "all_lost".to_string(),
                "dial".to_string(),
                format!("peer:{b}"),
            ]
        );
        controller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn clean_end_stops_without_reconnecting() {
        let log: Log = Default::default();
        let conn = FakeConn::ending(&log, Vec::new(), true);
        let controller = setup(vec![conn], &log);

        wait_for(&log, "disconnect").await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        let log = log.lock();
        assert_eq!(log.iter().filter(|e| *e == "dial").count(), 1);
        assert!(!log.iter().any(|e| e == "all_lost"));
        drop(log);
        controller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resubscribes_cached_agents() {
        let log: Log = Default::default();
        let agent = Uuid::new_v4();
        let first = FakeConn::new(&log, Vec::new());
        let second = FakeConn::new(&log, Vec::new());
        let controller = setup(vec![first.clone(), second], &log);

        wait_for(&log, "update_self").await;
        controller.ensure_agent(agent).await;
        assert_eq!(
            log.lock().iter().filter(|e| **e == format!("subscribe:{agent}")).count(),
            1
        );

        // Dropping the sender ends the first stream as a closed connection.
        first.tx.lock().take();
        wait_for(&log, "all_lost").await;
        for _ in 0..100 {
            if log.lock().iter().filter(|e| **e == format!("subscribe:{agent}")).count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            log.lock().iter().filter(|e| **e == format!("subscribe:{agent}")).count(),
            2
        );
        controller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tickets_hold_agents_until_idle_cutoff() {
        let log: Log = Default::default();
        let conn = FakeConn::new(&log, Vec::new());
        let controller = setup(vec![conn], &log);
        wait_for(&log, "update_self").await;

        let held = Uuid::new_v4();
        let idle = Uuid::new_v4();
        let ticket = controller.ensure_agent(held).await;
        drop(controller.ensure_agent(idle).await);

        let cutoff = ControllerOptions::default().idle_cutoff;
        controller.inner.expire(Instant::now() + cutoff).await;
        assert!(controller.is_cached(held));
        assert!(!controller.is_cached(idle));
        assert!(log.lock().contains(&format!("unsubscribe:{idle}")));

        drop(ticket);
        controller.inner.expire(Instant::now() + cutoff / 2).await;
        assert!(controller.is_cached(held));
        controller.inner.expire(Instant::now() + cutoff).await;
        assert!(!controller.is_cached(held));
        controller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_cached_agents() {
        let log: Log = Default::default();
        let conn = FakeConn::new(&log, Vec::new());
        let controller = setup(vec![conn], &log);
        wait_for(&log, "update_self").await;

        let agent = Uuid::new_v4();
        controller.ensure_agent(agent).await;
        controller.close().await;

        let log = log.lock();
        assert!(log.contains(&format!("unsubscribe:{agent}")));
        assert_eq!(log.last().map(String::as_str), Some("disconnect"));
        drop(log);
        assert!(!controller.is_cached(agent));
    }

    #[tokio::test(start_paused = true)]
    async fn node_info_is_cached_for_subscribed_agents() {
        let log: Log = Default::default();
        let conn = FakeConn::new(&log, Vec::new());
        let controller = setup(vec![conn.clone()], &log);
        wait_for(&log, "update_self").await;

        let agent = Uuid::new_v4();
        controller.ensure_agent(agent).await;
        conn.push(node_resp(agent));
        wait_for(&log, &format!("peer:{agent}")).await;
        assert_eq!(
            controller.agent_node(agent).map(|n| n.id),
            Some(agent.to_string())
        );
        controller.close().await;
    }

    fn sub_ops(log: &Log, agent: Uuid) -> Vec<String> {
        log.lock()
            .iter()
            .filter(|e| **e == format!("subscribe:{agent}") || **e == format!("unsubscribe:{agent}"))
            .cloned()
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_lands_after_a_pending_idle_unsubscribe() {
        let log: Log = Default::default();
        let conn = FakeConn::new(&log, Vec::new());
        conn.slow_unsubscribe.store(true, Ordering::SeqCst);
        let controller = setup(vec![conn], &log);
        wait_for(&log, "update_self").await;

        let agent = Uuid::new_v4();
        drop(controller.ensure_agent(agent).await);
        let cutoff = ControllerOptions::default().idle_cutoff;
        let inner = controller.inner.clone();
        let expire = tokio::spawn(async move { inner.expire(Instant::now() + cutoff).await });
        wait_for(&log, &format!("unsubscribing:{agent}")).await;
        assert!(!controller.is_cached(agent));

        let _ticket = controller.ensure_agent(agent).await;
        expire.await.unwrap();
        assert!(controller.is_cached(agent));
        assert_eq!(
            sub_ops(&log, agent),
            vec![
                format!("subscribe:{agent}"),
                format!("unsubscribe:{agent}"),
                format!("subscribe:{agent}"),
            ]
        );
        controller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn agents_readded_before_expiry_unsubscribes_are_kept() {
        let log: Log = Default::default();
        let conn = FakeConn::new(&log, Vec::new());
        let controller = Arc::new(setup(vec![conn], &log));
        wait_for(&log, "update_self").await;

        let agent = Uuid::new_v4();
        drop(controller.ensure_agent(agent).await);
        let cutoff = ControllerOptions::default().idle_cutoff;

        // Both the sweep and the new caller queue behind an in-flight subscription change.
        let subs = controller.inner.subs.lock().await;
        let inner = controller.inner.clone();
        let expire = tokio::spawn(async move { inner.expire(Instant::now() + cutoff).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        let readd = tokio::spawn({
            let controller = controller.clone();
            async move { controller.ensure_agent(agent).await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        drop(subs);

        expire.await.unwrap();
        let _ticket = readd.await.unwrap();
        assert!(controller.is_cached(agent));
        assert_eq!(
            sub_ops(&log, agent),
            vec![format!("subscribe:{agent}"), format!("subscribe:{agent}")]
        );
        controller.close().await;
    }
}
