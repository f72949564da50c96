//! Liveness tracking for one agent RPC session.
//!
//! Two tasks share a single last-ping timestamp: one pings the agent every period, the other
//! checks the timestamp on the same period, refreshes the persisted connection times and evicts
//! agents whose build is no longer the workspace's latest. Whatever ends the monitor, it writes
//! one final update carrying `disconnected_at`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use conduit_core::{
    Store, StoreError,
    events::{Publisher, WorkspaceEvent, WorkspaceEventKind},
    models::{Timestamp, UpdateAgentConnection, WorkspaceAgent, WorkspaceBuild},
    now,
};
use conduit_wire::{CloseCode, Session, WireError};
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;
use uuid::Uuid;

pub const REASON_PING_TIMEOUT: &str = "ping timeout";
pub const REASON_BUILD_OUTDATED: &str = "build is outdated";

#[async_trait]
pub trait Pinger: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), WireError>;
}

pub trait Closer: Send + Sync + 'static {
    /// Must be idempotent.
    fn close(&self, code: CloseCode, reason: &str);
}

pub trait PingerCloser: Pinger + Closer {}

impl<T: Pinger + Closer> PingerCloser for T {}

#[async_trait]
impl Pinger for Session {
    async fn ping(&self) -> Result<(), WireError> {
        Session::ping(self).await
    }
}

impl Closer for Session {
    fn close(&self, code: CloseCode, reason: &str) {
        Session::close(self, code, reason)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub ping_period: Duration,
    pub disconnect_timeout: Duration,
    pub replica_id: Uuid,
}

#[derive(Debug, Clone, Copy, Default)]
struct ConnectionTimes {
    first_connected_at: Option<Timestamp>,
    last_connected_at: Option<Timestamp>,
    disconnected_at: Option<Timestamp>,
}

struct Inner {
    agent: WorkspaceAgent,
    build: WorkspaceBuild,
    conn: Arc<dyn PingerCloser>,
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    opts: MonitorOptions,
    origin: Instant,
    /// Milliseconds after `origin` of the last answered ping.
    last_ping: AtomicU64,
    // Only written by the monitor task.
    times: Mutex<ConnectionTimes>,
}

pub struct ConnectionMonitor {
    inner: Arc<Inner>,
    cancel: Mutex<CancellationToken>,
    tasks: TaskTracker,
}

impl ConnectionMonitor {
    pub fn new(
        agent: WorkspaceAgent,
        build: WorkspaceBuild,
        conn: Arc<dyn PingerCloser>,
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        opts: MonitorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                agent,
                build,
                conn,
                store,
                publisher,
                opts,
                origin: Instant::now(),
                last_ping: AtomicU64::new(0),
                times: Mutex::new(ConnectionTimes::default()),
            }),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: TaskTracker::new(),
        }
    }

    /// Seeds the connection times. The inbound connection counts as the first ping.
    pub fn init(&self) {
        let now = now();
        *self.inner.times.lock() = ConnectionTimes {
            first_connected_at: self.inner.agent.first_connected_at.or(Some(now)),
            last_connected_at: Some(now),
            disconnected_at: self.inner.agent.disconnected_at,
        };
        self.inner.touch_ping();
    }

    /// Spawns the ping and monitor tasks. They stop when `parent` is cancelled or on
    /// [`ConnectionMonitor::close`].
    pub fn start(&self, parent: &CancellationToken) {
        let cancel = parent.child_token();
        *self.cancel.lock() = cancel.clone();

        let span = tracing::info_span!(
            "connection_monitor",
            agent_id = %self.inner.agent.id,
            workspace_id = %self.inner.build.workspace_id,
        );
        let inner = self.inner.clone();
        let token = cancel.clone();
        self.tasks
            .spawn(async move { inner.send_pings(token).await }.instrument(span.clone()));
        let inner = self.inner.clone();
        self.tasks
            .spawn(async move { inner.monitor(cancel).await }.instrument(span));
        self.tasks.close();
    }

    /// Runs the check loop on the calling task until `cancel` fires or the agent is evicted.
    pub async fn monitor(&self, cancel: CancellationToken) {
        self.inner.monitor(cancel).await
    }

    pub async fn send_pings(&self, cancel: CancellationToken) {
        self.inner.send_pings(cancel).await
    }

    /// Stops both tasks and waits for the final disconnect update. Safe to call repeatedly and
    /// concurrently.
    pub async fn close(&self) {
        self.cancel.lock().cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl Inner {
    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn touch_ping(&self) {
        self.last_ping.store(self.elapsed_ms(), Ordering::Release);
    }

    fn since_last_ping(&self) -> Duration {
        let last = self.last_ping.load(Ordering::Acquire);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    fn ticker(&self) -> tokio::time::Interval {
        let period = self.opts.ping_period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn send_pings(&self, cancel: CancellationToken) {
        let mut ticker = self.ticker();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let res = tokio::select! {
                res = self.conn.ping() => res,
                _ = cancel.cancelled() => return,
            };
            if let Err(err) = res {
                // Liveness loss is judged by the monitor once pings stop landing.
                tracing::debug!(error = %err, "agent ping failed");
                return;
            }
            self.touch_ping();
        }
    }

    async fn monitor(&self, cancel: CancellationToken) {
        let reason = self.watch(&cancel).await;
        tracing::debug!(reason, "agent connection monitor is closing connection");
        self.conn.close(CloseCode::GOING_AWAY, reason);
        self.finish().await;
    }

    async fn watch(&self, cancel: &CancellationToken) -> &'static str {
        match self.update_connection_times().await {
            Ok(()) => self.publish_connection_update(),
            Err(err) => tracing::warn!(error = %err, "failed to update agent connection times"),
        }

        let mut ticker = self.ticker();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return "canceled",
                _ = ticker.tick() => {}
            }

            if self.since_last_ping() > self.opts.disconnect_timeout {
                tracing::warn!(
                    since_last_ping_ms = self.since_last_ping().as_millis() as u64,
                    "connection to agent timed out"
                );
                return REASON_PING_TIMEOUT;
            }

            let reconnected = {
                let mut times = self.times.lock();
                times.last_connected_at = Some(now());
                times.disconnected_at.take().is_some()
            };
            let updated = tokio::select! {
                res = self.update_connection_times() => res,
                _ = cancel.cancelled() => return "canceled",
            };
            match updated {
                Ok(()) if reconnected => self.publish_connection_update(),
                Ok(()) => {}
                Err(err) => tracing::warn!(error = %err, "failed to update agent connection times"),
            }

            let latest = tokio::select! {
                res = self.build_is_latest() => res,
                _ = cancel.cancelled() => return "canceled",
            };
            match latest {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(build_id = %self.build.id, "disconnected outdated agent");
                    return REASON_BUILD_OUTDATED;
                }
                Err(err) => tracing::warn!(error = %err, "failed to check latest build"),
            }
        }
    }

    /// Final update on a fresh deadline; the triggering cancellation must not skip it.
    async fn finish(&self) {
        self.times.lock().disconnected_at = Some(now());
        match tokio::time::timeout(self.opts.disconnect_timeout, self.update_connection_times())
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(error = %err, "failed to update agent disconnect time")
            }
            Err(_) => tracing::error!(
                timeout_ms = self.opts.disconnect_timeout.as_millis() as u64,
                "timed out updating agent disconnect time"
            ),
        }
        self.publish_connection_update();
    }

    async fn update_connection_times(&self) -> Result<(), StoreError> {
        let times = *self.times.lock();
        self.store
            .update_workspace_agent_connection(UpdateAgentConnection {
                id: self.agent.id,
                first_connected_at: times.first_connected_at,
                last_connected_at: times.last_connected_at,
                last_connected_replica_id: Some(self.opts.replica_id),
                disconnected_at: times.disconnected_at,
                updated_at: now(),
            })
            .await
    }

    async fn build_is_latest(&self) -> Result<bool, StoreError> {
        let latest = self
            .store
            .latest_workspace_build_by_workspace_id(self.build.workspace_id)
            .await?;
        Ok(latest.id == self.build.id)
    }

    fn publish_connection_update(&self) {
        self.publisher.publish(WorkspaceEvent::agent(
            WorkspaceEventKind::AgentConnectionUpdate,
            self.build.workspace_id,
            self.agent.id,
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use conduit_core::MemStore;

    use super::*;
    use crate::testutil::{Fixture, RecordingPublisher};

    #[derive(Default)]
    struct FakeConn {
        fail_pings: AtomicBool,
        pings: AtomicU64,
        closes: Mutex<Vec<(CloseCode, String)>>,
        closed: CancellationToken,
    }

    #[async_trait]
    impl Pinger for FakeConn {
        async fn ping(&self) -> Result<(), WireError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.fail_pings.load(Ordering::SeqCst) {
                return Err(WireError::Closed);
            }
            Ok(())
        }
    }

    impl Closer for FakeConn {
        fn close(&self, code: CloseCode, reason: &str) {
            self.closes.lock().push((code, reason.to_string()));
            self.closed.cancel();
        }
    }

    const PERIOD: Duration = Duration::from_secs(1);

    fn monitor_for(
        fx: &Fixture,
        conn: Arc<FakeConn>,
        publisher: Arc<RecordingPublisher>,
    ) -> ConnectionMonitor {
        ConnectionMonitor::new(
            fx.agent.clone(),
            fx.build.clone(),
            conn,
            fx.store.clone() as Arc<dyn Store>,
            publisher,
            MonitorOptions {
                ping_period: PERIOD,
                disconnect_timeout: PERIOD * 2,
                replica_id: Uuid::new_v4(),
            },
        )
    }

    fn updates(store: &MemStore, agent: Uuid) -> Vec<UpdateAgentConnection> {
        store.connection_updates(agent)
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_marks_connected_and_cancel_records_disconnect() {
        let fx = Fixture::new();
        let conn = Arc::new(FakeConn::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let monitor = monitor_for(&fx, conn.clone(), publisher.clone());
        monitor.init();

        let cancel = CancellationToken::new();
        monitor.start(&cancel);
        tokio::time::sleep(PERIOD + Duration::from_millis(10)).await;

        let got = updates(&fx.store, fx.agent.id);
        assert_eq!(got.len(), 2, "initial update plus one tick");
        let last = got.last().unwrap();
        assert!(last.first_connected_at.is_some());
        assert!(last.last_connected_at.is_some());
        assert!(last.disconnected_at.is_none());

        let cancelled_at = now();
        cancel.cancel();
        monitor.close().await;

        let got = updates(&fx.store, fx.agent.id);
        assert_eq!(got.len(), 3, "exactly one update after cancel");
        let last = got.last().unwrap();
        assert!(last.disconnected_at.unwrap() >= cancelled_at);
        assert_eq!(conn.closes.lock().len(), 1);
        assert_eq!(
            publisher.count(WorkspaceEventKind::AgentConnectionUpdate),
            2,
            "connect and disconnect"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pings_close_with_ping_timeout() {
        let fx = Fixture::new();
        let conn = Arc::new(FakeConn::default());
        conn.fail_pings.store(true, Ordering::SeqCst);
        let monitor = monitor_for(&fx, conn.clone(), Arc::new(RecordingPublisher::default()));
        monitor.init();
        monitor.start(&CancellationToken::new());

        tokio::time::timeout(PERIOD * 10, conn.closed.cancelled())
            .await
            .expect("monitor closes the connection");
        monitor.close().await;

        let closes = conn.closes.lock().clone();
        assert_eq!(
            closes,
            vec![(CloseCode::GOING_AWAY, REASON_PING_TIMEOUT.to_string())]
        );
        let last = updates(&fx.store, fx.agent.id).pop().unwrap();
        assert!(last.disconnected_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn outdated_build_is_evicted_despite_fresh_pings() {
        let fx = Fixture::new();
        let conn = Arc::new(FakeConn::default());
        let monitor = monitor_for(&fx, conn.clone(), Arc::new(RecordingPublisher::default()));
        monitor.init();
        monitor.start(&CancellationToken::new());

        tokio::time::sleep(PERIOD * 3).await;
        assert!(conn.closes.lock().is_empty());
        assert!(conn.pings.load(Ordering::SeqCst) >= 2);

        fx.supersede_build();
        tokio::time::timeout(PERIOD * 3, conn.closed.cancelled())
            .await
            .expect("outdated agent is evicted within one check");
        monitor.close().await;

        assert_eq!(
            conn.closes.lock().clone(),
            vec![(CloseCode::GOING_AWAY, REASON_BUILD_OUTDATED.to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_errors_do_not_end_the_session() {
        let fx = Fixture::new();
        let conn = Arc::new(FakeConn::default());
        let monitor = monitor_for(&fx, conn.clone(), Arc::new(RecordingPublisher::default()));
        monitor.init();
        monitor.start(&CancellationToken::new());

        // The initial write succeeds; fail the first periodic one.
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.store.fail_next("update_workspace_agent_connection");
        tokio::time::sleep(PERIOD * 2 + Duration::from_millis(10)).await;

        assert!(conn.closes.lock().is_empty());
        let got = updates(&fx.store, fx.agent.id);
        assert_eq!(got.len(), 2, "initial update plus the tick after the failure");
        monitor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_concurrent() {
        let fx = Fixture::new();
        let conn = Arc::new(FakeConn::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let monitor = Arc::new(monitor_for(&fx, conn.clone(), publisher.clone()));
        monitor.init();
        monitor.start(&CancellationToken::new());
        tokio::time::sleep(PERIOD / 2).await;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let monitor = monitor.clone();
                tokio::spawn(async move { monitor.close().await })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        monitor.close().await;

        let disconnects = updates(&fx.store, fx.agent.id)
            .iter()
            .filter(|u| u.disconnected_at.is_some())
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(conn.closes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prior_disconnect_is_cleared_on_first_tick() {
        let mut fx = Fixture::new();
        let earlier = now() - chrono::Duration::minutes(5);
        fx.agent.first_connected_at = Some(earlier);
        fx.agent.disconnected_at = Some(earlier);
        let conn = Arc::new(FakeConn::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let monitor = monitor_for(&fx, conn.clone(), publisher.clone());
        monitor.init();
        monitor.start(&CancellationToken::new());
        tokio::time::sleep(PERIOD + Duration::from_millis(10)).await;

        let got = updates(&fx.store, fx.agent.id);
        assert_eq!(got[0].first_connected_at, Some(earlier));
        assert_eq!(got[0].disconnected_at, Some(earlier));
        assert!(got[1].disconnected_at.is_none());
        // Initial publish plus the reconnect transition.
        assert_eq!(publisher.count(WorkspaceEventKind::AgentConnectionUpdate), 2);
        monitor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_first_tick_overwrites_prior_disconnect() {
        let mut fx = Fixture::new();
        let earlier = now() - chrono::Duration::minutes(5);
        fx.agent.first_connected_at = Some(earlier);
        fx.agent.disconnected_at = Some(earlier);
        let conn = Arc::new(FakeConn::default());
        let monitor = monitor_for(&fx, conn.clone(), Arc::new(RecordingPublisher::default()));
        let parent = CancellationToken::new();
        monitor.init();
        monitor.start(&parent);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cancelled_at = now();
        parent.cancel();
        monitor.close().await;

        let got = updates(&fx.store, fx.agent.id);
        assert_eq!(got.len(), 2);
        let last = got.last().unwrap();
        assert!(last.disconnected_at.unwrap() >= cancelled_at);
        assert_eq!(last.first_connected_at, Some(earlier));
    }
}
