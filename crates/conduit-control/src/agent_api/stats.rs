use std::{sync::Arc, time::Duration};

use conduit_core::{Store, models::WorkspaceAgentStats, now};
use conduit_proto::agent_v2::{UpdateStatsRequest, UpdateStatsResponse};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tonic::Status;
use tracing::Instrument;

use super::AgentApi;

#[derive(Debug, Clone)]
pub struct BatcherOptions {
    /// Flush once this many reports are queued.
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BatcherOptions {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Buffers agent stats and writes them in batches. Shared by every agent session of a server.
pub struct StatsBatcher {
    tx: mpsc::Sender<WorkspaceAgentStats>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl StatsBatcher {
    pub fn start(store: Arc<dyn Store>, opts: BatcherOptions) -> Self {
        let (tx, rx) = mpsc::channel(opts.batch_size.max(1) * 2);
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(
            run(store, opts, rx, cancel.clone()).instrument(tracing::info_span!("stats_batcher")),
        );
        Self { tx, cancel, tasks }
    }

    pub async fn add(&self, stats: WorkspaceAgentStats) {
        if self.tx.send(stats).await.is_err() {
            tracing::debug!("stats batcher closed, dropping report");
        }
    }

    /// Flushes what is buffered and stops.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn run(
    store: Arc<dyn Store>,
    opts: BatcherOptions,
    mut rx: mpsc::Receiver<WorkspaceAgentStats>,
    cancel: CancellationToken,
) {
    let mut buf = Vec::with_capacity(opts.batch_size);
    let mut tick = tokio::time::interval(opts.flush_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            stats = rx.recv() => match stats {
                Some(stats) => {
                    buf.push(stats);
                    if buf.len() >= opts.batch_size {
                        flush(&*store, &mut buf).await;
                    }
                }
                None => break,
            },
            _ = tick.tick() => flush(&*store, &mut buf).await,
        }
    }
    rx.close();
    while let Ok(stats) = rx.try_recv() {
        buf.push(stats);
    }
    flush(&*store, &mut buf).await;
}

async fn flush(store: &dyn Store, buf: &mut Vec<WorkspaceAgentStats>) {
    if buf.is_empty() {
        return;
    }
    let batch = std::mem::take(buf);
    let n = batch.len();
    match store.insert_workspace_agent_stats(batch).await {
        Ok(()) => tracing::trace!(count = n, "flushed agent stats"),
        Err(e) => tracing::warn!(error = %e, count = n, "insert agent stats"),
    }
}

/// Runtime setting that overrides the configured report interval for one organization.
pub const REPORT_INTERVAL_KEY: &str = "agent_stats_report_interval_ms";

impl AgentApi {
    pub(super) async fn update_stats(
        &self,
        req: UpdateStatsRequest,
    ) -> Result<UpdateStatsResponse, Status> {
        let interval = self.report_interval().await;
        let resp = UpdateStatsResponse {
            report_interval_ms: i64::try_from(interval.as_millis()).unwrap_or(i64::MAX),
        };
        let Some(stats) = req.stats else {
            return Ok(resp);
        };

        self.stats
            .add(WorkspaceAgentStats {
                agent_id: self.agent.id,
                workspace_id: self.workspace.id,
                user_id: self.owner.id,
                template_id: self.workspace.template_id,
                created_at: Some(now()),
                connections_by_proto: stats.connections_by_proto.into_iter().collect(),
                connection_count: stats.connection_count,
                rx_packets: stats.rx_packets,
                rx_bytes: stats.rx_bytes,
                tx_packets: stats.tx_packets,
                tx_bytes: stats.tx_bytes,
                session_count_ssh: stats.session_count_ssh,
                session_count_vscode: stats.session_count_vscode,
            })
            .await;
        Ok(resp)
    }

    async fn report_interval(&self) -> Duration {
        let entry = conduit_core::runtimeconfig::Entry::<u64>::new(REPORT_INTERVAL_KEY);
        let scoped = self.runtime_config.scoped(self.workspace.organization_id);
        let default = u64::try_from(self.opts.stats_interval.as_millis()).unwrap_or(u64::MAX);
        match entry.resolve_or(&scoped, default).await {
            Ok(ms) if ms > 0 => Duration::from_millis(ms),
            Ok(_) => self.opts.stats_interval,
            Err(e) => {
                tracing::warn!(error = %e, "resolve stats report interval");
                self.opts.stats_interval
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::MemStore;

    use super::*;

    fn report(agent_id: uuid::Uuid) -> WorkspaceAgentStats {
        WorkspaceAgentStats {
            agent_id,
            rx_bytes: 10,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_size_timer_and_close() {
        let store = Arc::new(MemStore::new());
        let batcher = StatsBatcher::start(
            store.clone(),
            BatcherOptions {
                batch_size: 2,
                flush_interval: Duration::from_secs(10),
            },
        );
        let agent = uuid::Uuid::new_v4();

        batcher.add(report(agent)).await;
        batcher.add(report(agent)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(store.workspace_agent_stats().len(), 2);

        batcher.add(report(agent)).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(store.workspace_agent_stats().len(), 3);

        batcher.add(report(agent)).await;
        batcher.close().await;
        assert_eq!(store.workspace_agent_stats().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn insert_failures_drop_the_batch_and_keep_running() {
        let store = Arc::new(MemStore::new());
        let batcher = StatsBatcher::start(
            store.clone(),
            BatcherOptions {
                batch_size: 1,
                flush_interval: Duration::from_secs(10),
            },
        );
        let agent = uuid::Uuid::new_v4();

        store.fail_next("insert_workspace_agent_stats");
        batcher.add(report(agent)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(store.workspace_agent_stats().is_empty());

        batcher.add(report(agent)).await;
        batcher.close().await;
        assert_eq!(store.workspace_agent_stats().len(), 1);
    }
}
