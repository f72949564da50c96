use std::sync::Arc;

use chrono::{TimeZone, Utc};
use conduit_core::{
    Store, StoreError,
    events::{Publisher, WorkspaceEvent, WorkspaceEventKind},
    models::{
        AcquireJob, CompleteJob, CompleteTemplateImport, CompleteWorkspaceBuild, JobType, LogLevel,
        NewAgent, NewResource, ParameterDestination, ParameterSchema, ProvisionerJob,
        ProvisionerJobLog, STORAGE_METHOD_INLINE_ARCHIVE, TemplateVersionImportJob,
        WorkspaceProvisionJob,
    },
    now,
    params::{self, ParameterScopes},
};
use conduit_proto::provisionerd_v1::{
    self as proto, AcquiredJob, CancelJobRequest, CompletedJob, FailJobRequest, Metadata,
    UpdateJobRequest, UpdateJobResponse, acquired_job, completed_job,
};
use conduit_wire::rpc::MAX_MESSAGE_BYTES;
use prost::Message;
use tonic::Status;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub access_url: String,
    /// Provisioner types a daemon connected to this server may run.
    pub provisioners: Vec<String>,
}

/// Hands pending provisioner jobs to daemons and records what they report back.
///
/// Every method takes the id of the calling daemon; a daemon may only report on jobs it acquired.
pub struct ProvisionerBroker {
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    opts: BrokerOptions,
}

fn internal(op: &str, err: StoreError) -> Status {
    Status::internal(format!("{op}: {err}"))
}

fn parse_job_id(raw: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw).map_err(|e| Status::invalid_argument(format!("parse job id: {e}")))
}

fn timestamp(unix_ms: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(unix_ms).single().unwrap_or_else(now)
}

fn destination_to_proto(d: ParameterDestination) -> proto::ParameterDestination {
    match d {
        ParameterDestination::EnvironmentVariable => proto::ParameterDestination::EnvironmentVariable,
        ParameterDestination::ProvisionerVariable => proto::ParameterDestination::ProvisionerVariable,
    }
}

fn destination_from_proto(raw: i32) -> Result<ParameterDestination, Status> {
    match proto::ParameterDestination::try_from(raw) {
        Ok(proto::ParameterDestination::EnvironmentVariable) => {
            Ok(ParameterDestination::EnvironmentVariable)
        }
        Ok(proto::ParameterDestination::ProvisionerVariable) => {
            Ok(ParameterDestination::ProvisionerVariable)
        }
        Err(_) => Err(Status::invalid_argument(format!(
            "unknown parameter destination {raw}"
        ))),
    }
}

impl ProvisionerBroker {
    pub fn new(store: Arc<dyn Store>, publisher: Arc<dyn Publisher>, opts: BrokerOptions) -> Self {
        Self {
            store,
            publisher,
            opts,
        }
    }

    pub fn provisioners(&self) -> &[String] {
        &self.opts.provisioners
    }

    /// Claims the oldest pending job this server can run. An empty `job_id` in the response means
    /// nothing was pending.
    pub async fn acquire_job(&self, worker_id: Uuid) -> Result<AcquiredJob, Status> {
        let job = self
            .store
            .acquire_provisioner_job(AcquireJob {
                worker_id,
                provisioners: self.opts.provisioners.clone(),
                started_at: now(),
            })
            .await
            .map_err(|e| internal("acquire job", e))?;
        let Some(job) = job else {
            return Ok(AcquiredJob::default());
        };
        tracing::debug!(job_id = %job.id, job_type = job.job_type.as_str(), "acquired job");

        match self.resolve(&job).await {
            Ok(acquired) => Ok(acquired),
            Err(reason) => Err(self.fail_acquired(&job, reason).await),
        }
    }

    /// Terminates a claimed job that cannot be handed out. The job is never retried.
    async fn fail_acquired(&self, job: &ProvisionerJob, reason: String) -> Status {
        tracing::warn!(job_id = %job.id, error = %reason, "failing acquired job");
        let res = self
            .store
            .update_provisioner_job_with_complete(CompleteJob {
                id: job.id,
                completed_at: now(),
                error: Some(reason.clone()),
            })
            .await;
        if let Err(err) = res {
            return internal("update provisioner job", err);
        }
        Status::failed_precondition(format!("request job was invalidated: {reason}"))
    }

    async fn resolve(&self, job: &ProvisionerJob) -> Result<AcquiredJob, String> {
        let user = self
            .store
            .user_by_id(job.initiator_id)
            .await
            .map_err(|e| format!("get user: {e}"))?;
        let organization = self
            .store
            .organization_by_id(job.organization_id)
            .await
            .map_err(|e| format!("get organization: {e}"))?;

        let kind = match job.job_type {
            JobType::WorkspaceBuild => {
                let input: WorkspaceProvisionJob = serde_json::from_slice(&job.input)
                    .map_err(|e| format!("unmarshal job input: {e}"))?;
                let build = self
                    .store
                    .workspace_build_by_id(input.workspace_build_id)
                    .await
                    .map_err(|e| format!("get workspace build: {e}"))?;
                let workspace = self
                    .store
                    .workspace_by_id(build.workspace_id)
                    .await
                    .map_err(|e| format!("get workspace: {e}"))?;
                let version = self
                    .store
                    .template_version_by_id(build.template_version_id)
                    .await
                    .map_err(|e| format!("get template version: {e}"))?;
                let template = self
                    .store
                    .template_by_id(workspace.template_id)
                    .await
                    .map_err(|e| format!("get template: {e}"))?;
                let owner = self
                    .store
                    .user_by_id(workspace.owner_id)
                    .await
                    .map_err(|e| format!("get owner: {e}"))?;
                let parameters = params::compute(
                    self.store.as_ref(),
                    ParameterScopes {
                        template_import_job_id: version.job_id,
                        organization_id: organization.id,
                        template_id: Some(template.id),
                        workspace_id: Some(workspace.id),
                    },
                )
                .await
                .map_err(|e| format!("compute parameters: {e}"))?;

                // State carries over from the build this one replaces.
                let state = if build.build_number > 1 {
                    match self
                        .store
                        .workspace_build_by_number(workspace.id, build.build_number - 1)
                        .await
                    {
                        Ok(prior) => prior.provisioner_state,
                        Err(StoreError::NotFound) => Vec::new(),
                        Err(e) => return Err(format!("get previous workspace build: {e}")),
                    }
                } else {
                    Vec::new()
                };

                acquired_job::Type::WorkspaceBuild(acquired_job::WorkspaceBuild {
                    workspace_build_id: build.id.to_string(),
                    workspace_name: workspace.name.clone(),
                    parameter_values: parameters
                        .into_iter()
                        .map(|p| proto::ParameterValue {
                            destination: destination_to_proto(p.destination) as i32,
                            name: p.name,
                            value: p.value,
                        })
                        .collect(),
                    state,
                    metadata: Some(Metadata {
                        access_url: self.opts.access_url.clone(),
                        workspace_transition: build.transition.as_str().to_string(),
                        workspace_name: workspace.name,
                        workspace_owner: owner.username,
                        workspace_id: workspace.id.to_string(),
                        workspace_owner_id: owner.id.to_string(),
                        template_name: template.name,
                        template_version: version.name,
                        organization_name: organization.name,
                    }),
                    dry_run: input.dry_run,
                })
            }
            JobType::TemplateVersionImport => {
                let input: TemplateVersionImportJob = serde_json::from_slice(&job.input)
                    .map_err(|e| format!("unmarshal job input: {e}"))?;
                let version = self
                    .store
                    .template_version_by_id(input.template_version_id)
                    .await
                    .map_err(|e| format!("get template version: {e}"))?;
                let template_name = match version.template_id {
                    Some(id) => {
                        self.store
                            .template_by_id(id)
                            .await
                            .map_err(|e| format!("get template: {e}"))?
                            .name
                    }
                    None => String::new(),
                };
                acquired_job::Type::TemplateImport(acquired_job::TemplateImport {
                    template_version_id: version.id.to_string(),
                    metadata: Some(Metadata {
                        access_url: self.opts.access_url.clone(),
                        template_name,
                        template_version: version.name,
                        organization_name: organization.name,
                        ..Default::default()
                    }),
                })
            }
        };

        if job.storage_method != STORAGE_METHOD_INLINE_ARCHIVE {
            return Err(format!("unsupported storage method: {}", job.storage_method));
        }

        let acquired = AcquiredJob {
            job_id: job.id.to_string(),
            created_at_unix_ms: job.created_at.timestamp_millis(),
            provisioner: job.provisioner.clone(),
            user_name: user.username,
            template_source_archive: job.storage_source.clone(),
            r#type: Some(kind),
        };
        let size = acquired.encoded_len();
        if size > MAX_MESSAGE_BYTES {
            return Err(format!("payload was too big: {size} > {MAX_MESSAGE_BYTES}"));
        }
        Ok(acquired)
    }

    /// Loads a job the calling daemon is reporting on.
    async fn owned_job(&self, worker_id: Uuid, raw_id: &str) -> Result<ProvisionerJob, Status> {
        let id = parse_job_id(raw_id)?;
        let job = match self.store.provisioner_job_by_id(id).await {
            Ok(job) => job,
            Err(StoreError::NotFound) => {
                return Err(Status::not_found(format!("job {id} not found")));
            }
            Err(e) => return Err(internal("get job", e)),
        };
        if job.started_at.is_none() {
            return Err(Status::failed_precondition("job isn't running yet"));
        }
        if job.worker_id != Some(worker_id) {
            return Err(Status::permission_denied("you don't own this job"));
        }
        Ok(job)
    }

    /// Heartbeat from the daemon running the job, optionally carrying log lines.
    pub async fn update_job(
        &self,
        worker_id: Uuid,
        req: UpdateJobRequest,
    ) -> Result<UpdateJobResponse, Status> {
        let job = self.owned_job(worker_id, &req.job_id).await?;
        self.store
            .update_provisioner_job_by_id(job.id, now())
            .await
            .map_err(|e| internal("update job", e))?;

        if !req.logs.is_empty() {
            let logs = req
                .logs
                .into_iter()
                .map(|l| ProvisionerJobLog {
                    job_id: job.id,
                    created_at: timestamp(l.created_at_unix_ms),
                    source: l.source,
                    level: LogLevel::from_i32(l.level),
                    stage: l.stage,
                    output: l.output,
                })
                .collect();
            self.store
                .insert_provisioner_job_logs(logs)
                .await
                .map_err(|e| internal("insert job logs", e))?;
        }

        Ok(UpdateJobResponse {
            canceled: job.canceled_at.is_some(),
        })
    }

    pub async fn cancel_job(&self, worker_id: Uuid, req: CancelJobRequest) -> Result<(), Status> {
        let job = self.owned_job(worker_id, &req.job_id).await?;
        if job.completed_at.is_some() {
            return Err(Status::failed_precondition("job already completed"));
        }
        if job.canceled_at.is_some() {
            return Ok(());
        }
        let error = Some(req.error).filter(|e| !e.is_empty());
        self.store
            .update_provisioner_job_with_cancel(job.id, now(), error)
            .await
            .map_err(|e| internal("update provisioner job", e))
    }

    pub async fn fail_job(&self, worker_id: Uuid, req: FailJobRequest) -> Result<(), Status> {
        let job = self.owned_job(worker_id, &req.job_id).await?;
        let error = if req.error.is_empty() {
            "provisioner daemon reported an unspecified failure".to_string()
        } else {
            req.error
        };
        let transitioned = self
            .store
            .update_provisioner_job_with_complete(CompleteJob {
                id: job.id,
                completed_at: now(),
                error: Some(error),
            })
            .await
            .map_err(|e| internal("update provisioner job", e))?;
        if !transitioned {
            return Err(Status::failed_precondition("job already completed"));
        }
        self.publish_build_update(&job).await;
        Ok(())
    }

    /// Records a successful job. Reporting the same completion twice is a no-op.
    pub async fn complete_job(&self, worker_id: Uuid, req: CompletedJob) -> Result<(), Status> {
        let job = self.owned_job(worker_id, &req.job_id).await?;
        if job.completed_at.is_some() {
            tracing::debug!(job_id = %job.id, "ignoring duplicate job completion");
            return Ok(());
        }

        let transitioned = match (job.job_type, req.r#type) {
            (JobType::WorkspaceBuild, Some(completed_job::Type::WorkspaceBuild(done))) => {
                let input: WorkspaceProvisionJob = serde_json::from_slice(&job.input)
                    .map_err(|e| Status::internal(format!("unmarshal job input: {e}")))?;
                let build = self
                    .store
                    .workspace_build_by_id(input.workspace_build_id)
                    .await
                    .map_err(|e| internal("get workspace build", e))?;
                let resources = done
                    .resources
                    .into_iter()
                    .map(new_resource)
                    .collect::<Result<Vec<_>, _>>()?;
                let transitioned = self
                    .store
                    .complete_workspace_build(CompleteWorkspaceBuild {
                        job_id: job.id,
                        build_id: build.id,
                        completed_at: now(),
                        provisioner_state: done.state,
                        transition: build.transition,
                        resources,
                    })
                    .await
                    .map_err(|e| internal("complete workspace build", e))?;
                if transitioned {
                    self.publisher.publish(WorkspaceEvent::workspace(
                        WorkspaceEventKind::StatusUpdate,
                        build.workspace_id,
                    ));
                }
                transitioned
            }
            (JobType::TemplateVersionImport, Some(completed_job::Type::TemplateImport(done))) => {
                let parameter_schemas = done
                    .parameter_schemas
                    .into_iter()
                    .map(|s| {
                        Ok(ParameterSchema {
                            job_id: job.id,
                            destination: destination_from_proto(s.destination)?,
                            name: s.name,
                            description: s.description,
                            default_source_value: s.default_source_value,
                            allow_override_source: s.allow_override_source,
                        })
                    })
                    .collect::<Result<Vec<_>, Status>>()?;
                self.store
                    .complete_template_version_import(CompleteTemplateImport {
                        job_id: job.id,
                        completed_at: now(),
                        parameter_schemas,
                    })
                    .await
                    .map_err(|e| internal("complete template version import", e))?
            }
            (_, None) => return Err(Status::invalid_argument("completed job type is required")),
            (expected, Some(_)) => {
                return Err(Status::invalid_argument(format!(
                    "completion does not match job type {}",
                    expected.as_str()
                )));
            }
        };

        if transitioned {
            tracing::info!(job_id = %job.id, job_type = job.job_type.as_str(), "job completed");
        } else {
            tracing::debug!(job_id = %job.id, "job was completed concurrently");
        }
        Ok(())
    }

    async fn publish_build_update(&self, job: &ProvisionerJob) {
        if job.job_type != JobType::WorkspaceBuild {
            return;
        }
        match self.store.workspace_build_by_job_id(job.id).await {
            Ok(build) => self.publisher.publish(WorkspaceEvent::workspace(
                WorkspaceEventKind::StatusUpdate,
                build.workspace_id,
            )),
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "get workspace build for failed job")
            }
        }
    }
}

fn new_resource(r: proto::Resource) -> Result<NewResource, Status> {
    let agents = r
        .agents
        .into_iter()
        .map(|a| {
            let auth_token = if a.auth_token.is_empty() {
                Uuid::new_v4()
            } else {
                Uuid::parse_str(&a.auth_token).map_err(|e| {
                    Status::invalid_argument(format!("agent {:?} auth token: {e}", a.name))
                })?
            };
            Ok(NewAgent {
                id: Uuid::new_v4(),
                name: a.name,
                auth_token,
                directory: a.directory,
                env: a.env.into_iter().collect(),
                os: a.operating_system,
                architecture: a.architecture,
                connection_timeout_seconds: a.connection_timeout_seconds,
                startup_script: Some(a.startup_script).filter(|s| !s.is_empty()),
            })
        })
        .collect::<Result<Vec<_>, Status>>()?;
    Ok(NewResource {
        id: Uuid::new_v4(),
        resource_type: r.r#type,
        name: r.name,
        agents,
    })
}

#[cfg(test)]
mod tests {
    use conduit_core::{
        MemStore,
        models::{ParameterScope, ParameterValue, ProvisionerJob, TemplateVersion},
    };
    use conduit_proto::provisionerd_v1::Log;

    use super::*;
    use crate::testutil::{Fixture, RecordingPublisher};

    struct Setup {
        fx: Fixture,
        publisher: Arc<RecordingPublisher>,
        broker: ProvisionerBroker,
        version: TemplateVersion,
    }

    fn setup() -> Setup {
        let fx = Fixture::new();
        let version = TemplateVersion {
            id: fx.build.template_version_id,
            template_id: Some(fx.template.id),
            organization_id: fx.org.id,
            name: "v1".to_string(),
            job_id: Uuid::new_v4(),
        };
        fx.store.insert_template_version(version.clone());
        let publisher = Arc::new(RecordingPublisher::default());
        let broker = ProvisionerBroker::new(
            fx.store.clone(),
            publisher.clone(),
            BrokerOptions {
                access_url: "https://dev.example.com".to_string(),
                provisioners: vec!["echo".to_string()],
            },
        );
        Setup {
            fx,
            publisher,
            broker,
            version,
        }
    }

    fn job(s: &Setup, job_type: JobType, input: Vec<u8>) -> ProvisionerJob {
        let job = ProvisionerJob {
            id: Uuid::new_v4(),
            created_at: now(),
            updated_at: now(),
            started_at: None,
            canceled_at: None,
            completed_at: None,
            error: None,
            organization_id: s.fx.org.id,
            initiator_id: s.fx.user.id,
            provisioner: "echo".to_string(),
            storage_method: STORAGE_METHOD_INLINE_ARCHIVE.to_string(),
            storage_source: b"archive".to_vec(),
            job_type,
            input,
            worker_id: None,
        };
        s.fx.store.insert_provisioner_job(job.clone());
        job
    }

    /// The fixture's build job, pending.
    fn build_job(s: &Setup) -> ProvisionerJob {
        let input = serde_json::to_vec(&WorkspaceProvisionJob {
            workspace_build_id: s.fx.build.id,
            dry_run: false,
        })
        .unwrap();
        let mut j = job(s, JobType::WorkspaceBuild, input);
        j.id = s.fx.build.job_id;
        s.fx.store.insert_provisioner_job(j.clone());
        j
    }

    async fn stored(store: &MemStore, id: Uuid) -> ProvisionerJob {
        store.provisioner_job_by_id(id).await.unwrap()
    }

    #[tokio::test]
    async fn nothing_pending_is_not_an_error() {
        let s = setup();
        let acquired = s.broker.acquire_job(Uuid::new_v4()).await.unwrap();
        assert!(acquired.job_id.is_empty());
    }

    #[tokio::test]
    async fn workspace_builds_are_resolved_with_parameters_and_prior_state() {
        let s = setup();
        s.fx.store.insert_parameter_schema(ParameterSchema {
            job_id: s.version.job_id,
            name: "region".to_string(),
            description: String::new(),
            default_source_value: Some("us".to_string()),
            allow_override_source: true,
            destination: ParameterDestination::ProvisionerVariable,
        });
        s.fx.store.insert_parameter_value(ParameterValue {
            scope: ParameterScope::Workspace,
            scope_id: s.fx.workspace.id,
            name: "region".to_string(),
            source_value: "eu".to_string(),
            destination: ParameterDestination::ProvisionerVariable,
        });
        // The fixture build becomes build 2 of the workspace.
        let mut prior = s.fx.build.clone();
        prior.id = Uuid::new_v4();
        prior.job_id = Uuid::new_v4();
        prior.provisioner_state = b"tfstate".to_vec();
        s.fx.store.insert_workspace_build(prior);
        let mut current = s.fx.build.clone();
        current.build_number = 2;
        s.fx.store.insert_workspace_build(current);
        let j = build_job(&s);

        let acquired = s.broker.acquire_job(Uuid::new_v4()).await.unwrap();
        assert_eq!(acquired.job_id, j.id.to_string());
        assert_eq!(acquired.user_name, "alice");
        assert_eq!(acquired.template_source_archive, b"archive");
        let Some(acquired_job::Type::WorkspaceBuild(build)) = acquired.r#type else {
            panic!("expected a workspace build");
        };
        assert_eq!(build.workspace_name, "dev");
        assert_eq!(build.state, b"tfstate");
        assert_eq!(build.parameter_values.len(), 1);
        assert_eq!(build.parameter_values[0].value, "eu");
        let metadata = build.metadata.unwrap();
        assert_eq!(metadata.workspace_owner, "alice");
        assert_eq!(metadata.template_version, "v1");
        assert_eq!(metadata.organization_name, "acme");
    }

    #[tokio::test]
    async fn template_imports_carry_version_metadata() {
        let s = setup();
        let input = serde_json::to_vec(&TemplateVersionImportJob {
            template_version_id: s.version.id,
        })
        .unwrap();
        job(&s, JobType::TemplateVersionImport, input);
        let acquired = s.broker.acquire_job(Uuid::new_v4()).await.unwrap();
        let Some(acquired_job::Type::TemplateImport(import)) = acquired.r#type else {
            panic!("expected a template import");
        };
        assert_eq!(import.template_version_id, s.version.id.to_string());
        assert_eq!(import.metadata.unwrap().template_name, "docker");
    }

    #[tokio::test]
    async fn concurrent_acquires_hand_a_job_out_once() {
        let s = setup();
        build_job(&s);
        let broker = Arc::new(s.broker);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move { broker.acquire_job(Uuid::new_v4()).await.unwrap() })
            })
            .collect();
        let mut claimed = 0;
        for t in tasks {
            if !t.await.unwrap().job_id.is_empty() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn resolution_failures_fail_the_job_durably() {
        let s = setup();
        let j = build_job(&s);
        s.fx.store.fail_next("organization_by_id");
        let err = s.broker.acquire_job(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
        assert!(err.message().contains("get organization"));

        let stored = stored(&s.fx.store, j.id).await;
        assert!(stored.completed_at.is_some());
        assert!(stored.error.as_deref().is_some_and(|e| e.starts_with("get organization")));
        // Terminal: not handed out again.
        let again = s.broker.acquire_job(Uuid::new_v4()).await.unwrap();
        assert!(again.job_id.is_empty());
    }

    #[tokio::test]
    async fn unsupported_storage_fails_the_job() {
        let s = setup();
        let mut j = build_job(&s);
        j.storage_method = "file".to_string();
        s.fx.store.insert_provisioner_job(j.clone());
        let err = s.broker.acquire_job(Uuid::new_v4()).await.unwrap_err();
        assert!(err.message().contains("unsupported storage method: file"));
        assert!(stored(&s.fx.store, j.id).await.error.is_some());
    }

    #[tokio::test]
    async fn updates_are_accepted_only_from_the_owner() {
        let s = setup();
        let j = build_job(&s);
        let worker = Uuid::new_v4();
        s.broker.acquire_job(worker).await.unwrap();

        let update = UpdateJobRequest {
            job_id: j.id.to_string(),
            logs: vec![Log {
                source: "provisioner".to_string(),
                level: 2,
                created_at_unix_ms: 1_700_000_000_000,
                stage: "plan".to_string(),
                output: "planning".to_string(),
            }],
        };
        let err = s
            .broker
            .update_job(Uuid::new_v4(), update.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
        assert!(s.fx.store.provisioner_job_logs(j.id).is_empty());

        let resp = s.broker.update_job(worker, update).await.unwrap();
        assert!(!resp.canceled);
        assert_eq!(s.fx.store.provisioner_job_logs(j.id).len(), 1);

        s.broker
            .cancel_job(
                worker,
                CancelJobRequest {
                    job_id: j.id.to_string(),
                    error: String::new(),
                },
            )
            .await
            .unwrap();
        let resp = s
            .broker
            .update_job(
                worker,
                UpdateJobRequest {
                    job_id: j.id.to_string(),
                    logs: Vec::new(),
                },
            )
            .await
            .unwrap();
        assert!(resp.canceled);
    }

    #[tokio::test]
    async fn pending_jobs_cannot_be_updated() {
        let s = setup();
        let j = build_job(&s);
        let err = s
            .broker
            .update_job(
                Uuid::new_v4(),
                UpdateJobRequest {
                    job_id: j.id.to_string(),
                    logs: Vec::new(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn completing_a_build_is_idempotent() {
        let s = setup();
        let j = build_job(&s);
        let worker = Uuid::new_v4();
        s.broker.acquire_job(worker).await.unwrap();

        let done = CompletedJob {
            job_id: j.id.to_string(),
            r#type: Some(completed_job::Type::WorkspaceBuild(
                completed_job::WorkspaceBuild {
                    state: b"new state".to_vec(),
                    resources: vec![proto::Resource {
                        name: "dev".to_string(),
                        r#type: "docker_container".to_string(),
                        agents: vec![proto::Agent {
                            name: "main".to_string(),
                            operating_system: "linux".to_string(),
                            architecture: "amd64".to_string(),
                            ..Default::default()
                        }],
                    }],
                },
            )),
        };
        s.broker.complete_job(worker, done.clone()).await.unwrap();
        s.broker.complete_job(worker, done).await.unwrap();

        let resources = s.fx.store.workspace_resources_by_job_id(j.id);
        // The fixture's own resource plus the one just reported.
        assert_eq!(resources.len(), 2);
        let build = s.fx.store.workspace_build_by_id(s.fx.build.id).await.unwrap();
        assert_eq!(build.provisioner_state, b"new state");
        assert_eq!(s.publisher.count(WorkspaceEventKind::StatusUpdate), 1);
        assert!(stored(&s.fx.store, j.id).await.error.is_none());
    }

    #[tokio::test]
    async fn failed_jobs_record_the_error_once() {
        let s = setup();
        let j = build_job(&s);
        let worker = Uuid::new_v4();
        s.broker.acquire_job(worker).await.unwrap();
        let req = FailJobRequest {
            job_id: j.id.to_string(),
            error: "terraform apply failed".to_string(),
        };
        s.broker.fail_job(worker, req.clone()).await.unwrap();
        let err = s.broker.fail_job(worker, req).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
        assert_eq!(
            stored(&s.fx.store, j.id).await.error.as_deref(),
            Some("terraform apply failed")
        );
        assert_eq!(s.publisher.count(WorkspaceEventKind::StatusUpdate), 1);
    }

    #[tokio::test]
    async fn template_import_completion_stores_schemas() {
        let s = setup();
        let input = serde_json::to_vec(&TemplateVersionImportJob {
            template_version_id: s.version.id,
        })
        .unwrap();
        let j = job(&s, JobType::TemplateVersionImport, input);
        let worker = Uuid::new_v4();
        s.broker.acquire_job(worker).await.unwrap();

        let mismatched = CompletedJob {
            job_id: j.id.to_string(),
            r#type: Some(completed_job::Type::WorkspaceBuild(Default::default())),
        };
        let err = s.broker.complete_job(worker, mismatched).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        s.broker
            .complete_job(
                worker,
                CompletedJob {
                    job_id: j.id.to_string(),
                    r#type: Some(completed_job::Type::TemplateImport(
                        completed_job::TemplateImport {
                            parameter_schemas: vec![proto::ParameterSchema {
                                name: "region".to_string(),
                                default_source_value: Some("us".to_string()),
                                destination: proto::ParameterDestination::EnvironmentVariable
                                    as i32,
                                ..Default::default()
                            }],
                        },
                    )),
                },
            )
            .await
            .unwrap();
        let schemas = s.fx.store.parameter_schemas_by_job_id(j.id).await.unwrap();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].destination, ParameterDestination::EnvironmentVariable);
    }
}
