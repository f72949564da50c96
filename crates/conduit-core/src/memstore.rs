use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::{
    AcquireJob, CompleteJob, CompleteTemplateImport, CompleteWorkspaceBuild, ExternalAuthLink,
    MAX_AGENT_LOGS_BYTES, Organization, ParameterSchema, ParameterScope, ParameterValue,
    ProvisionerDaemon, ProvisionerJob, ProvisionerJobLog, Template, TemplateVersion, Timestamp,
    UpdateAgentConnection, User, Workspace, WorkspaceAgent, WorkspaceAgentLog,
    WorkspaceAgentScript, WorkspaceAgentStats, WorkspaceBuild, WorkspaceResource,
};
use crate::store::{Store, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    organizations: HashMap<Uuid, Organization>,
    templates: HashMap<Uuid, Template>,
    template_versions: HashMap<Uuid, TemplateVersion>,
    workspaces: HashMap<Uuid, Workspace>,
    builds: HashMap<Uuid, WorkspaceBuild>,
    resources: HashMap<Uuid, WorkspaceResource>,
    agents: HashMap<Uuid, WorkspaceAgent>,
    agent_scripts: Vec<WorkspaceAgentScript>,
    agent_stats: Vec<WorkspaceAgentStats>,
    agent_logs: Vec<WorkspaceAgentLog>,
    connection_updates: Vec<UpdateAgentConnection>,
    external_auth_links: Vec<ExternalAuthLink>,
    daemons: Vec<ProvisionerDaemon>,
    jobs: HashMap<Uuid, ProvisionerJob>,
    job_logs: Vec<ProvisionerJobLog>,
    parameter_values: Vec<ParameterValue>,
    parameter_schemas: Vec<ParameterSchema>,
    runtime_config: BTreeMap<String, String>,
    faults: HashSet<&'static str>,
}

impl Inner {
    fn fault(&mut self, method: &'static str) -> StoreResult<()> {
        if self.faults.remove(method) {
            return Err(StoreError::Database(format!("{method}: injected fault")));
        }
        Ok(())
    }
}

fn found<T: Clone>(v: Option<&T>) -> StoreResult<T> {
    v.cloned().ok_or(StoreError::NotFound)
}

/// In-process [`Store`] used by tests and single-node development runs.
///
/// All state sits behind one lock, so every method (including job acquisition) is atomic.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `method` (the [`Store`] method name) fail with a database error.
    pub fn fail_next(&self, method: &'static str) {
        self.inner.lock().faults.insert(method);
    }

    pub fn insert_user(&self, user: User) {
        self.inner.lock().users.insert(user.id, user);
    }

    pub fn insert_organization(&self, org: Organization) {
        self.inner.lock().organizations.insert(org.id, org);
    }

    pub fn insert_template(&self, template: Template) {
        self.inner.lock().templates.insert(template.id, template);
    }

    pub fn insert_template_version(&self, version: TemplateVersion) {
        self.inner.lock().template_versions.insert(version.id, version);
    }

    pub fn insert_workspace(&self, workspace: Workspace) {
        self.inner.lock().workspaces.insert(workspace.id, workspace);
    }

    pub fn insert_workspace_build(&self, build: WorkspaceBuild) {
        self.inner.lock().builds.insert(build.id, build);
    }

    pub fn insert_workspace_resource(&self, resource: WorkspaceResource) {
        self.inner.lock().resources.insert(resource.id, resource);
    }

    pub fn insert_workspace_agent(&self, agent: WorkspaceAgent) {
        self.inner.lock().agents.insert(agent.id, agent);
    }

    pub fn insert_workspace_agent_script(&self, script: WorkspaceAgentScript) {
        self.inner.lock().agent_scripts.push(script);
    }

    pub fn insert_external_auth_link(&self, link: ExternalAuthLink) {
        self.inner.lock().external_auth_links.push(link);
    }

    pub fn insert_provisioner_job(&self, job: ProvisionerJob) {
        self.inner.lock().jobs.insert(job.id, job);
    }

    pub fn insert_parameter_value(&self, value: ParameterValue) {
        self.inner.lock().parameter_values.push(value);
    }

    pub fn insert_parameter_schema(&self, schema: ParameterSchema) {
        self.inner.lock().parameter_schemas.push(schema);
    }

    /// Every connection update written for `agent_id`, oldest first.
    pub fn connection_updates(&self, agent_id: Uuid) -> Vec<UpdateAgentConnection> {
        self.inner
            .lock()
            .connection_updates
            .iter()
            .filter(|u| u.id == agent_id)
            .cloned()
            .collect()
    }

    pub fn workspace_agent_logs(&self, agent_id: Uuid) -> Vec<WorkspaceAgentLog> {
        self.inner
            .lock()
            .agent_logs
            .iter()
            .filter(|l| l.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn workspace_agent_stats(&self) -> Vec<WorkspaceAgentStats> {
        self.inner.lock().agent_stats.clone()
    }

    pub fn provisioner_job_logs(&self, job_id: Uuid) -> Vec<ProvisionerJobLog> {
        self.inner
            .lock()
            .job_logs
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn provisioner_daemons(&self) -> Vec<ProvisionerDaemon> {
        self.inner.lock().daemons.clone()
    }

    pub fn workspace_resources_by_job_id(&self, job_id: Uuid) -> Vec<WorkspaceResource> {
        self.inner
            .lock()
            .resources
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn workspace_agents_by_resource_id(&self, resource_id: Uuid) -> Vec<WorkspaceAgent> {
        self.inner
            .lock()
            .agents
            .values()
            .filter(|a| a.resource_id == resource_id)
            .cloned()
            .collect()
    }
}

fn complete_job_locked(inner: &mut Inner, arg: &CompleteJob) -> StoreResult<bool> {
    let job = inner.jobs.get_mut(&arg.id).ok_or(StoreError::NotFound)?;
    if job.completed_at.is_some() {
        return Ok(false);
    }
    job.completed_at = Some(arg.completed_at);
    job.updated_at = arg.completed_at;
    job.error = arg.error.clone();
    Ok(true)
}

#[async_trait]
impl Store for MemStore {
    async fn workspace_agent_by_id(&self, id: Uuid) -> StoreResult<WorkspaceAgent> {
        let mut inner = self.inner.lock();
        inner.fault("workspace_agent_by_id")?;
        found(inner.agents.get(&id))
    }

    async fn workspace_agent_by_auth_token(&self, token: Uuid) -> StoreResult<WorkspaceAgent> {
        let mut inner = self.inner.lock();
        inner.fault("workspace_agent_by_auth_token")?;
        found(inner.agents.values().find(|a| a.auth_token == token))
    }

    async fn workspace_resource_by_id(&self, id: Uuid) -> StoreResult<WorkspaceResource> {
        let mut inner = self.inner.lock();
        inner.fault("workspace_resource_by_id")?;
        found(inner.resources.get(&id))
    }

    async fn workspace_build_by_id(&self, id: Uuid) -> StoreResult<WorkspaceBuild> {
        let mut inner = self.inner.lock();
        inner.fault("workspace_build_by_id")?;
        found(inner.builds.get(&id))
    }

    async fn workspace_build_by_job_id(&self, job_id: Uuid) -> StoreResult<WorkspaceBuild> {
        let mut inner = self.inner.lock();
        inner.fault("workspace_build_by_job_id")?;
        found(inner.builds.values().find(|b| b.job_id == job_id))
    }

    async fn workspace_build_by_number(
        &self,
        workspace_id: Uuid,
        build_number: i32,
    ) -> StoreResult<WorkspaceBuild> {
        let mut inner = self.inner.lock();
        inner.fault("workspace_build_by_number")?;
        found(
            inner
                .builds
                .values()
                .find(|b| b.workspace_id == workspace_id && b.build_number == build_number),
        )
    }

    async fn latest_workspace_build_by_workspace_id(
        &self,
        workspace_id: Uuid,
    ) -> StoreResult<WorkspaceBuild> {
        let mut inner = self.inner.lock();
        inner.fault("latest_workspace_build_by_workspace_id")?;
        found(
            inner
                .builds
                .values()
                .filter(|b| b.workspace_id == workspace_id)
                .max_by_key(|b| b.build_number),
        )
    }

    async fn workspace_by_id(&self, id: Uuid) -> StoreResult<Workspace> {
        let mut inner = self.inner.lock();
        inner.fault("workspace_by_id")?;
        found(inner.workspaces.get(&id))
    }

    async fn user_by_id(&self, id: Uuid) -> StoreResult<User> {
        let mut inner = self.inner.lock();
        inner.fault("user_by_id")?;
        found(inner.users.get(&id))
    }

    async fn update_workspace_agent_connection(
        &self,
        arg: UpdateAgentConnection,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.fault("update_workspace_agent_connection")?;
        let agent = inner.agents.get_mut(&arg.id).ok_or(StoreError::NotFound)?;
        agent.first_connected_at = arg.first_connected_at;
        agent.last_connected_at = arg.last_connected_at;
        agent.last_connected_replica_id = arg.last_connected_replica_id;
        agent.disconnected_at = arg.disconnected_at;
        agent.updated_at = arg.updated_at;
        inner.connection_updates.push(arg);
        Ok(())
    }

    async fn workspace_agent_scripts(
        &self,
        agent_id: Uuid,
    ) -> StoreResult<Vec<WorkspaceAgentScript>> {
        let mut inner = self.inner.lock();
        inner.fault("workspace_agent_scripts")?;
        Ok(inner
            .agent_scripts
            .iter()
            .filter(|s| s.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn insert_workspace_agent_stats(
        &self,
        stats: Vec<WorkspaceAgentStats>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.fault("insert_workspace_agent_stats")?;
        inner.agent_stats.extend(stats);
        Ok(())
    }

    async fn insert_workspace_agent_logs(
        &self,
        agent_id: Uuid,
        logs: Vec<WorkspaceAgentLog>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.fault("insert_workspace_agent_logs")?;
        let added: i64 = logs.iter().map(|l| l.output.len() as i64).sum();
        let agent = inner.agents.get_mut(&agent_id).ok_or(StoreError::NotFound)?;
        if agent.logs_length + added > MAX_AGENT_LOGS_BYTES {
            return Err(StoreError::LogsOverflow);
        }
        agent.logs_length += added;
        inner.agent_logs.extend(logs);
        Ok(())
    }

    async fn mark_workspace_agent_logs_overflowed(&self, agent_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.fault("mark_workspace_agent_logs_overflowed")?;
        let agent = inner.agents.get_mut(&agent_id).ok_or(StoreError::NotFound)?;
        agent.logs_overflowed = true;
        Ok(())
    }

    async fn external_auth_link(
        &self,
        provider_id: &str,
        user_id: Uuid,
    ) -> StoreResult<ExternalAuthLink> {
        let mut inner = self.inner.lock();
        inner.fault("external_auth_link")?;
        found(
            inner
                .external_auth_links
                .iter()
                .find(|l| l.provider_id == provider_id && l.user_id == user_id),
        )
    }

    async fn insert_provisioner_daemon(&self, daemon: ProvisionerDaemon) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.fault("insert_provisioner_daemon")?;
        inner.daemons.push(daemon);
        Ok(())
    }

    async fn acquire_provisioner_job(
        &self,
        arg: AcquireJob,
    ) -> StoreResult<Option<ProvisionerJob>> {
        let mut inner = self.inner.lock();
        inner.fault("acquire_provisioner_job")?;
        let next = inner
            .jobs
            .values()
            .filter(|j| {
                j.started_at.is_none()
                    && j.canceled_at.is_none()
                    && j.completed_at.is_none()
                    && arg.provisioners.iter().any(|p| *p == j.provisioner)
            })
            .min_by_key(|j| j.created_at)
            .map(|j| j.id);
        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.started_at = Some(arg.started_at);
        job.updated_at = arg.started_at;
        job.worker_id = Some(arg.worker_id);
        Ok(Some(job.clone()))
    }

    async fn provisioner_job_by_id(&self, id: Uuid) -> StoreResult<ProvisionerJob> {
        let mut inner = self.inner.lock();
        inner.fault("provisioner_job_by_id")?;
        found(inner.jobs.get(&id))
    }

    async fn update_provisioner_job_by_id(
        &self,
        id: Uuid,
        updated_at: Timestamp,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.fault("update_provisioner_job_by_id")?;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        job.updated_at = updated_at;
        Ok(())
    }

    async fn update_provisioner_job_with_cancel(
        &self,
        id: Uuid,
        canceled_at: Timestamp,
        error: Option<String>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.fault("update_provisioner_job_with_cancel")?;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        job.canceled_at = Some(canceled_at);
        job.updated_at = canceled_at;
        if error.is_some() {
            job.error = error;
        }
        Ok(())
    }

    async fn update_provisioner_job_with_complete(&self, arg: CompleteJob) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.fault("update_provisioner_job_with_complete")?;
        complete_job_locked(&mut inner, &arg)
    }

    async fn insert_provisioner_job_logs(&self, logs: Vec<ProvisionerJobLog>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.fault("insert_provisioner_job_logs")?;
        inner.job_logs.extend(logs);
        Ok(())
    }

    async fn template_by_id(&self, id: Uuid) -> StoreResult<Template> {
        let mut inner = self.inner.lock();
        inner.fault("template_by_id")?;
        found(inner.templates.get(&id))
    }

    async fn template_version_by_id(&self, id: Uuid) -> StoreResult<TemplateVersion> {
        let mut inner = self.inner.lock();
        inner.fault("template_version_by_id")?;
        found(inner.template_versions.get(&id))
    }

    async fn organization_by_id(&self, id: Uuid) -> StoreResult<Organization> {
        let mut inner = self.inner.lock();
        inner.fault("organization_by_id")?;
        found(inner.organizations.get(&id))
    }

    async fn parameter_values(
        &self,
        scope: ParameterScope,
        scope_id: Uuid,
    ) -> StoreResult<Vec<ParameterValue>> {
        let mut inner = self.inner.lock();
        inner.fault("parameter_values")?;
        Ok(inner
            .parameter_values
            .iter()
            .filter(|v| v.scope == scope && v.scope_id == scope_id)
            .cloned()
            .collect())
    }

    async fn parameter_schemas_by_job_id(&self, job_id: Uuid) -> StoreResult<Vec<ParameterSchema>> {
        let mut inner = self.inner.lock();
        inner.fault("parameter_schemas_by_job_id")?;
        Ok(inner
            .parameter_schemas
            .iter()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn complete_workspace_build(&self, arg: CompleteWorkspaceBuild) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.fault("complete_workspace_build")?;
        if !inner.builds.contains_key(&arg.build_id) {
            return Err(StoreError::NotFound);
        }
        let transitioned = complete_job_locked(
            &mut inner,
            &CompleteJob {
                id: arg.job_id,
                completed_at: arg.completed_at,
                error: None,
            },
        )?;
        if !transitioned {
            return Ok(false);
        }
        if let Some(build) = inner.builds.get_mut(&arg.build_id) {
            build.provisioner_state = arg.provisioner_state.clone();
            build.updated_at = arg.completed_at;
        }
        for resource in arg.resources {
            inner.resources.insert(
                resource.id,
                WorkspaceResource {
                    id: resource.id,
                    job_id: arg.job_id,
                    transition: arg.transition,
                    resource_type: resource.resource_type,
                    name: resource.name,
                    created_at: arg.completed_at,
                },
            );
            for agent in resource.agents {
                if let Some(script) = agent.startup_script.filter(|s| !s.is_empty()) {
                    inner.agent_scripts.push(WorkspaceAgentScript {
                        agent_id: agent.id,
                        display_name: "Startup Script".to_string(),
                        script,
                        run_on_start: true,
                        run_on_stop: false,
                        timeout_seconds: 0,
                        log_path: String::new(),
                    });
                }
                inner.agents.insert(
                    agent.id,
                    WorkspaceAgent {
                        id: agent.id,
                        name: agent.name,
                        resource_id: resource.id,
                        auth_token: agent.auth_token,
                        directory: agent.directory,
                        env: agent.env,
                        os: agent.os,
                        architecture: agent.architecture,
                        first_connected_at: None,
                        last_connected_at: None,
                        disconnected_at: None,
                        last_connected_replica_id: None,
                        connection_timeout_seconds: agent.connection_timeout_seconds,
                        logs_length: 0,
                        logs_overflowed: false,
                        created_at: arg.completed_at,
                        updated_at: arg.completed_at,
                    },
                );
            }
        }
        Ok(true)
    }

    async fn complete_template_version_import(
        &self,
        arg: CompleteTemplateImport,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.fault("complete_template_version_import")?;
        let transitioned = complete_job_locked(
            &mut inner,
            &CompleteJob {
                id: arg.job_id,
                completed_at: arg.completed_at,
                error: None,
            },
        )?;
        if transitioned {
            inner.parameter_schemas.extend(arg.parameter_schemas);
        }
        Ok(transitioned)
    }

    async fn runtime_config(&self, key: &str) -> StoreResult<String> {
        let mut inner = self.inner.lock();
        inner.fault("runtime_config")?;
        found(inner.runtime_config.get(key))
    }

    async fn upsert_runtime_config(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.fault("upsert_runtime_config")?;
        inner
            .runtime_config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_runtime_config(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.fault("delete_runtime_config")?;
        inner.runtime_config.remove(key);
        Ok(())
    }
}

/// Current wall-clock time, truncated to microseconds like a PostgreSQL `timestamptz`.
pub fn now() -> Timestamp {
    let now = Utc::now();
    let micros = now.timestamp_micros();
    chrono::DateTime::from_timestamp_micros(micros).unwrap_or(now)
}
