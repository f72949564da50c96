use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Timestamp = DateTime<Utc>;

/// Maximum combined byte length of agent startup logs kept per agent.
pub const MAX_AGENT_LOGS_BYTES: i64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Connecting,
    Connected,
    Disconnected,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceAgent {
    pub id: Uuid,
    pub name: String,
    pub resource_id: Uuid,
    pub auth_token: Uuid,
    pub directory: String,
    pub env: BTreeMap<String, String>,
    pub os: String,
    pub architecture: String,
    pub first_connected_at: Option<Timestamp>,
    pub last_connected_at: Option<Timestamp>,
    pub disconnected_at: Option<Timestamp>,
    pub last_connected_replica_id: Option<Uuid>,
    /// Seconds the agent may stay in `Connecting` before it is reported as timed out. Zero disables.
    pub connection_timeout_seconds: i32,
    pub logs_length: i64,
    pub logs_overflowed: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WorkspaceAgent {
    /// Derives the lifecycle from persisted timestamps. An agent that stopped refreshing
    /// `last_connected_at` for longer than `inactive_timeout` counts as disconnected even if the
    /// owning session never got to write `disconnected_at`.
    pub fn status(&self, now: Timestamp, inactive_timeout: Duration) -> AgentStatus {
        let Some(_) = self.first_connected_at else {
            if self.connection_timeout_seconds > 0
                && now - self.created_at
                    > chrono::Duration::seconds(i64::from(self.connection_timeout_seconds))
            {
                return AgentStatus::Timeout;
            }
            return AgentStatus::Connecting;
        };
        if self.disconnected_at.is_some() {
            return AgentStatus::Disconnected;
        }
        let inactive = chrono::Duration::from_std(inactive_timeout).unwrap_or(chrono::Duration::MAX);
        match self.last_connected_at {
            Some(last) if now - last <= inactive => AgentStatus::Connected,
            _ => AgentStatus::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildTransition {
    Start,
    Stop,
    Delete,
}

impl BuildTransition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceResource {
    pub id: Uuid,
    pub job_id: Uuid,
    pub transition: BuildTransition,
    pub resource_type: String,
    pub name: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceBuild {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub template_version_id: Uuid,
    pub build_number: i32,
    pub transition: BuildTransition,
    pub initiator_id: Uuid,
    pub job_id: Uuid,
    pub provisioner_state: Vec<u8>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub organization_id: Uuid,
    pub template_id: Uuid,
    pub name: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub provisioner: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub id: Uuid,
    pub template_id: Option<Uuid>,
    pub organization_id: Uuid,
    pub name: String,
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    WorkspaceBuild,
    TemplateVersionImport,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkspaceBuild => "workspace_build",
            Self::TemplateVersionImport => "template_version_import",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "workspace_build" => Some(Self::WorkspaceBuild),
            "template_version_import" => Some(Self::TemplateVersionImport),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Acquired,
    Canceling,
    Canceled,
    Succeeded,
    Failed,
}

/// Storage method whose source bytes are the archive itself.
pub const STORAGE_METHOD_INLINE_ARCHIVE: &str = "inline_archive";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerJob {
    pub id: Uuid,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub canceled_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub error: Option<String>,
    pub organization_id: Uuid,
    pub initiator_id: Uuid,
    pub provisioner: String,
    pub storage_method: String,
    pub storage_source: Vec<u8>,
    pub job_type: JobType,
    /// JSON payload, decoded according to `job_type`.
    pub input: Vec<u8>,
    pub worker_id: Option<Uuid>,
}

impl ProvisionerJob {
    pub fn status(&self) -> JobStatus {
        match (self.started_at, self.canceled_at, self.completed_at) {
            (_, Some(_), Some(_)) => JobStatus::Canceled,
            (_, Some(_), None) => JobStatus::Canceling,
            (_, None, Some(_)) if self.error.as_deref().is_some_and(|e| !e.is_empty()) => {
                JobStatus::Failed
            }
            (_, None, Some(_)) => JobStatus::Succeeded,
            (Some(_), None, None) => JobStatus::Acquired,
            (None, None, None) => JobStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceProvisionJob {
    pub workspace_build_id: Uuid,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVersionImportJob {
    pub template_version_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerDaemon {
    pub id: Uuid,
    pub name: String,
    pub provisioners: Vec<String>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => Self::Trace,
            1 => Self::Debug,
            3 => Self::Warn,
            4 => Self::Error,
            _ => Self::Info,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerJobLog {
    pub job_id: Uuid,
    pub created_at: Timestamp,
    pub source: String,
    pub level: LogLevel,
    pub stage: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceAgentLog {
    pub agent_id: Uuid,
    pub created_at: Timestamp,
    pub level: LogLevel,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceAgentScript {
    pub agent_id: Uuid,
    pub display_name: String,
    pub script: String,
    pub run_on_start: bool,
    pub run_on_stop: bool,
    pub timeout_seconds: i32,
    pub log_path: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkspaceAgentStats {
    pub agent_id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub template_id: Uuid,
    pub created_at: Option<Timestamp>,
    pub connections_by_proto: BTreeMap<String, i64>,
    pub connection_count: i64,
    pub rx_packets: i64,
    pub rx_bytes: i64,
    pub tx_packets: i64,
    pub tx_bytes: i64,
    pub session_count_ssh: i64,
    pub session_count_vscode: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalAuthLink {
    pub provider_id: String,
    pub user_id: Uuid,
    pub access_token: String,
    pub expiry: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterScope {
    Organization,
    Template,
    Workspace,
}

impl ParameterScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::Template => "template",
            Self::Workspace => "workspace",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "organization" => Some(Self::Organization),
            "template" => Some(Self::Template),
            "workspace" => Some(Self::Workspace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterDestination {
    EnvironmentVariable,
    ProvisionerVariable,
}

impl ParameterDestination {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnvironmentVariable => "environment_variable",
            Self::ProvisionerVariable => "provisioner_variable",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "environment_variable" => Some(Self::EnvironmentVariable),
            "provisioner_variable" => Some(Self::ProvisionerVariable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub job_id: Uuid,
    pub name: String,
    pub description: String,
    pub default_source_value: Option<String>,
    pub allow_override_source: bool,
    pub destination: ParameterDestination,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub scope: ParameterScope,
    pub scope_id: Uuid,
    pub name: String,
    pub source_value: String,
    pub destination: ParameterDestination,
}

// Inputs to store mutations.

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateAgentConnection {
    pub id: Uuid,
    pub first_connected_at: Option<Timestamp>,
    pub last_connected_at: Option<Timestamp>,
    pub last_connected_replica_id: Option<Uuid>,
    pub disconnected_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquireJob {
    pub worker_id: Uuid,
    pub provisioners: Vec<String>,
    pub started_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteJob {
    pub id: Uuid,
    pub completed_at: Timestamp,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAgent {
    pub id: Uuid,
    pub name: String,
    pub auth_token: Uuid,
    pub directory: String,
    pub env: BTreeMap<String, String>,
    pub os: String,
    pub architecture: String,
    pub connection_timeout_seconds: i32,
    pub startup_script: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewResource {
    pub id: Uuid,
    pub resource_type: String,
    pub name: String,
    pub agents: Vec<NewAgent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteWorkspaceBuild {
    pub job_id: Uuid,
    pub build_id: Uuid,
    pub completed_at: Timestamp,
    pub provisioner_state: Vec<u8>,
    pub transition: BuildTransition,
    pub resources: Vec<NewResource>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteTemplateImport {
    pub job_id: Uuid,
    pub completed_at: Timestamp,
    pub parameter_schemas: Vec<ParameterSchema>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(now: Timestamp) -> WorkspaceAgent {
        WorkspaceAgent {
            id: Uuid::new_v4(),
            name: "main".to_string(),
            resource_id: Uuid::new_v4(),
            auth_token: Uuid::new_v4(),
            directory: String::new(),
            env: BTreeMap::new(),
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            first_connected_at: None,
            last_connected_at: None,
            disconnected_at: None,
            last_connected_replica_id: None,
            connection_timeout_seconds: 60,
            logs_length: 0,
            logs_overflowed: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn agent_status_follows_timestamps() {
        let now = Utc::now();
        let inactive = Duration::from_secs(30);
        let mut a = agent(now);
        assert_eq!(a.status(now, inactive), AgentStatus::Connecting);
        assert_eq!(
            a.status(now + chrono::Duration::seconds(61), inactive),
            AgentStatus::Timeout
        );

        a.first_connected_at = Some(now);
        a.last_connected_at = Some(now);
        assert_eq!(a.status(now, inactive), AgentStatus::Connected);
        assert_eq!(
            a.status(now + chrono::Duration::seconds(31), inactive),
            AgentStatus::Disconnected
        );

        a.disconnected_at = Some(now);
        assert_eq!(a.status(now, inactive), AgentStatus::Disconnected);
    }

    #[test]
    fn job_status_distinguishes_failure_from_success() {
        let now = Utc::now();
        let mut job = ProvisionerJob {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            started_at: None,
            canceled_at: None,
            completed_at: None,
            error: None,
            organization_id: Uuid::new_v4(),
            initiator_id: Uuid::new_v4(),
            provisioner: "echo".to_string(),
            storage_method: STORAGE_METHOD_INLINE_ARCHIVE.to_string(),
            storage_source: Vec::new(),
            job_type: JobType::WorkspaceBuild,
            input: Vec::new(),
            worker_id: None,
        };
        assert_eq!(job.status(), JobStatus::Pending);
        job.started_at = Some(now);
        assert_eq!(job.status(), JobStatus::Acquired);
        job.completed_at = Some(now);
        assert_eq!(job.status(), JobStatus::Succeeded);
        job.error = Some("boom".to_string());
        assert_eq!(job.status(), JobStatus::Failed);
        job.canceled_at = Some(now);
        assert_eq!(job.status(), JobStatus::Canceled);
    }
}
