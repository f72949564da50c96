use chrono::{TimeZone, Utc};
use conduit_core::{
    StoreError,
    events::{WorkspaceEvent, WorkspaceEventKind},
    models::{LogLevel, WorkspaceAgentLog},
    now,
};
use conduit_proto::agent_v2::{BatchCreateLogsRequest, BatchCreateLogsResponse};
use tonic::Status;

use super::{AgentApi, internal};

impl AgentApi {
    pub(super) async fn batch_create_logs(
        &self,
        req: BatchCreateLogsRequest,
    ) -> Result<BatchCreateLogsResponse, Status> {
        if req.logs.is_empty() {
            return Ok(BatchCreateLogsResponse::default());
        }
        let agent = self
            .store
            .workspace_agent_by_id(self.agent.id)
            .await
            .map_err(|e| internal("get workspace agent", e))?;
        if agent.logs_overflowed {
            return Ok(BatchCreateLogsResponse {
                log_limit_exceeded: true,
            });
        }

        let logs = req
            .logs
            .into_iter()
            .map(|l| WorkspaceAgentLog {
                agent_id: agent.id,
                created_at: Utc
                    .timestamp_millis_opt(l.created_at_unix_ms)
                    .single()
                    .unwrap_or_else(now),
                level: LogLevel::from_i32(l.level),
                output: l.output,
            })
            .collect();

        match self.store.insert_workspace_agent_logs(agent.id, logs).await {
            Ok(()) => {}
            Err(StoreError::LogsOverflow) => {
                tracing::info!(agent_id = %agent.id, "agent logs overflowed");
                self.store
                    .mark_workspace_agent_logs_overflowed(agent.id)
                    .await
                    .map_err(|e| internal("mark workspace agent logs overflowed", e))?;
                self.publish(WorkspaceEventKind::AgentLogsOverflow);
                return Ok(BatchCreateLogsResponse {
                    log_limit_exceeded: true,
                });
            }
            Err(e) => return Err(internal("insert workspace agent logs", e)),
        }

        if agent.logs_length == 0 {
            // First logs change how the workspace renders.
            self.publish(WorkspaceEventKind::StatusUpdate);
        }
        self.publish(WorkspaceEventKind::AgentLogsUpdate);
        Ok(BatchCreateLogsResponse::default())
    }

    fn publish(&self, kind: WorkspaceEventKind) {
        self.publisher
            .publish(WorkspaceEvent::agent(kind, self.workspace.id, self.agent.id));
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::models::MAX_AGENT_LOGS_BYTES;
    use conduit_proto::agent_v2::{BATCH_CREATE_LOGS, Log};

    use super::*;
    use crate::agent_api::testing::ApiHarness;

    fn batch(outputs: &[String]) -> BatchCreateLogsRequest {
        BatchCreateLogsRequest {
            logs: outputs
                .iter()
                .map(|o| Log {
                    created_at_unix_ms: 1_700_000_000_000,
                    output: o.clone(),
                    level: 2,
                })
                .collect(),
        }
    }

    async fn send(h: &ApiHarness, req: &BatchCreateLogsRequest) -> BatchCreateLogsResponse {
        h.client.unary(BATCH_CREATE_LOGS, req).await.unwrap()
    }

    #[tokio::test]
    async fn logs_are_stored_and_announced() {
        let h = ApiHarness::new();
        let resp = send(&h, &batch(&["one".into(), "two".into()])).await;
        assert!(!resp.log_limit_exceeded);
        let stored = h.fx.store.workspace_agent_logs(h.fx.agent.id);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].level, LogLevel::Info);
        assert_eq!(h.publisher.count(WorkspaceEventKind::AgentLogsUpdate), 1);
        assert_eq!(h.publisher.count(WorkspaceEventKind::StatusUpdate), 1);

        send(&h, &batch(&["three".into()])).await;
        assert_eq!(h.publisher.count(WorkspaceEventKind::StatusUpdate), 1);
        assert_eq!(h.publisher.count(WorkspaceEventKind::AgentLogsUpdate), 2);
    }

    #[tokio::test]
    async fn overflow_marks_the_agent_and_stops_writes() {
        let h = ApiHarness::new();
        let huge = "x".repeat(usize::try_from(MAX_AGENT_LOGS_BYTES).unwrap() + 1);
        let resp = send(&h, &batch(&[huge])).await;
        assert!(resp.log_limit_exceeded);
        assert_eq!(h.publisher.count(WorkspaceEventKind::AgentLogsOverflow), 1);
        assert!(
            h.fx.store
                .workspace_agent_logs(h.fx.agent.id)
                .is_empty()
        );

        let resp = send(&h, &batch(&["small".into()])).await;
        assert!(resp.log_limit_exceeded);
        assert!(h.fx.store.workspace_agent_logs(h.fx.agent.id).is_empty());
        assert_eq!(h.publisher.count(WorkspaceEventKind::AgentLogsOverflow), 1);
    }

    #[tokio::test]
    async fn empty_batches_are_a_no_op() {
        let h = ApiHarness::new();
        let resp = send(&h, &BatchCreateLogsRequest::default()).await;
        assert!(!resp.log_limit_exceeded);
        assert_eq!(h.publisher.count(WorkspaceEventKind::AgentLogsUpdate), 0);
    }
}
