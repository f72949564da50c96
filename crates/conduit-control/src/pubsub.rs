use conduit_core::events::{Publisher, WorkspaceEvent};
use tokio::sync::broadcast;

/// In-process fan-out of workspace events. Slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct WorkspacePubsub {
    tx: broadcast::Sender<WorkspaceEvent>,
}

impl WorkspacePubsub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.tx.subscribe()
    }
}

impl Default for WorkspacePubsub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Publisher for WorkspacePubsub {
    fn publish(&self, event: WorkspaceEvent) {
        tracing::trace!(kind = ?event.kind, workspace_id = %event.workspace_id, "publish workspace event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
