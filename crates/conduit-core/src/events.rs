use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceEventKind {
    StatusUpdate,
    AgentConnectionUpdate,
    AgentLogsOverflow,
    AgentLogsUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceEvent {
    pub kind: WorkspaceEventKind,
    pub workspace_id: Uuid,
    pub agent_id: Option<Uuid>,
}

impl WorkspaceEvent {
    pub fn workspace(kind: WorkspaceEventKind, workspace_id: Uuid) -> Self {
        Self {
            kind,
            workspace_id,
            agent_id: None,
        }
    }

    pub fn agent(kind: WorkspaceEventKind, workspace_id: Uuid, agent_id: Uuid) -> Self {
        Self {
            kind,
            workspace_id,
            agent_id: Some(agent_id),
        }
    }
}

/// Sink for workspace change notifications. Publishing never blocks and never fails the caller.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, event: WorkspaceEvent);
}
