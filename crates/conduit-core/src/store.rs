use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    AcquireJob, CompleteJob, CompleteTemplateImport, CompleteWorkspaceBuild, ExternalAuthLink,
    Organization, ParameterSchema, ParameterScope, ParameterValue, ProvisionerDaemon,
    ProvisionerJob, ProvisionerJobLog, Template, TemplateVersion, Timestamp, UpdateAgentConnection,
    User, Workspace, WorkspaceAgent, WorkspaceAgentLog, WorkspaceAgentScript, WorkspaceAgentStats,
    WorkspaceBuild, WorkspaceResource,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("agent logs overflowed")]
    LogsOverflow,
    #[error("database: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence boundary of the control plane.
///
/// Every method is a single logical operation. Implementations must make
/// [`Store::acquire_provisioner_job`] atomic: two concurrent callers can never both claim the same
/// pending job.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn workspace_agent_by_id(&self, id: Uuid) -> StoreResult<WorkspaceAgent>;
    async fn workspace_agent_by_auth_token(&self, token: Uuid) -> StoreResult<WorkspaceAgent>;
    async fn workspace_resource_by_id(&self, id: Uuid) -> StoreResult<WorkspaceResource>;
    async fn workspace_build_by_id(&self, id: Uuid) -> StoreResult<WorkspaceBuild>;
    async fn workspace_build_by_job_id(&self, job_id: Uuid) -> StoreResult<WorkspaceBuild>;
    async fn workspace_build_by_number(
        &self,
        workspace_id: Uuid,
        build_number: i32,
    ) -> StoreResult<WorkspaceBuild>;
    async fn latest_workspace_build_by_workspace_id(
        &self,
        workspace_id: Uuid,
    ) -> StoreResult<WorkspaceBuild>;
    async fn workspace_by_id(&self, id: Uuid) -> StoreResult<Workspace>;
    async fn user_by_id(&self, id: Uuid) -> StoreResult<User>;

    async fn update_workspace_agent_connection(&self, arg: UpdateAgentConnection)
    -> StoreResult<()>;
    async fn workspace_agent_scripts(&self, agent_id: Uuid)
    -> StoreResult<Vec<WorkspaceAgentScript>>;
    async fn insert_workspace_agent_stats(&self, stats: Vec<WorkspaceAgentStats>)
    -> StoreResult<()>;
    /// Appends logs. Fails with [`StoreError::LogsOverflow`] (writing nothing) when the agent's
    /// total output would exceed [`crate::models::MAX_AGENT_LOGS_BYTES`].
    async fn insert_workspace_agent_logs(
        &self,
        agent_id: Uuid,
        logs: Vec<WorkspaceAgentLog>,
    ) -> StoreResult<()>;
    async fn mark_workspace_agent_logs_overflowed(&self, agent_id: Uuid) -> StoreResult<()>;
    async fn external_auth_link(
        &self,
        provider_id: &str,
        user_id: Uuid,
    ) -> StoreResult<ExternalAuthLink>;

    async fn insert_provisioner_daemon(&self, daemon: ProvisionerDaemon) -> StoreResult<()>;
    /// Claims the oldest pending job whose provisioner is in `arg.provisioners`.
    /// `Ok(None)` means nothing is pending.
    async fn acquire_provisioner_job(&self, arg: AcquireJob) -> StoreResult<Option<ProvisionerJob>>;
    async fn provisioner_job_by_id(&self, id: Uuid) -> StoreResult<ProvisionerJob>;
    async fn update_provisioner_job_by_id(&self, id: Uuid, updated_at: Timestamp)
    -> StoreResult<()>;
    async fn update_provisioner_job_with_cancel(
        &self,
        id: Uuid,
        canceled_at: Timestamp,
        error: Option<String>,
    ) -> StoreResult<()>;
    /// Marks the job terminal. Returns `false` when it already was.
    async fn update_provisioner_job_with_complete(&self, arg: CompleteJob) -> StoreResult<bool>;
    async fn insert_provisioner_job_logs(&self, logs: Vec<ProvisionerJobLog>) -> StoreResult<()>;
    async fn template_by_id(&self, id: Uuid) -> StoreResult<Template>;
    async fn template_version_by_id(&self, id: Uuid) -> StoreResult<TemplateVersion>;
    async fn organization_by_id(&self, id: Uuid) -> StoreResult<Organization>;
    async fn parameter_values(
        &self,
        scope: ParameterScope,
        scope_id: Uuid,
    ) -> StoreResult<Vec<ParameterValue>>;
    async fn parameter_schemas_by_job_id(&self, job_id: Uuid) -> StoreResult<Vec<ParameterSchema>>;
    /// Finishes a workspace build job in one transaction. Returns `false` without writing when the
    /// job was already complete.
    async fn complete_workspace_build(&self, arg: CompleteWorkspaceBuild) -> StoreResult<bool>;
    async fn complete_template_version_import(
        &self,
        arg: CompleteTemplateImport,
    ) -> StoreResult<bool>;

    async fn runtime_config(&self, key: &str) -> StoreResult<String>;
    async fn upsert_runtime_config(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn delete_runtime_config(&self, key: &str) -> StoreResult<()>;
}
