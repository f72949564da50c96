use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use conduit_core::{
    models::{
        AcquireJob, BuildTransition, CompleteJob, CompleteTemplateImport, CompleteWorkspaceBuild,
        ExternalAuthLink, JobType, MAX_AGENT_LOGS_BYTES, Organization,
        ParameterDestination, ParameterSchema, ParameterScope, ParameterValue, ProvisionerDaemon,
        ProvisionerJob, ProvisionerJobLog, Template, TemplateVersion, Timestamp,
        UpdateAgentConnection, User, Workspace, WorkspaceAgent, WorkspaceAgentLog,
        WorkspaceAgentScript, WorkspaceAgentStats, WorkspaceBuild, WorkspaceResource,
    },
    store::{Store, StoreError, StoreResult},
};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend,
    DbErr, EntityTrait, QueryFilter, QueryOrder, Statement, TransactionTrait,
    prelude::DateTimeWithTimeZone,
    sea_query::{Expr, OnConflict},
};
use uuid::Uuid;

use crate::entities::{
    external_auth_links, organizations, parameter_schemas, parameter_values, provisioner_daemons,
    provisioner_job_logs, provisioner_jobs, runtime_config, template_versions, templates, users,
    workspace_agent_logs, workspace_agent_scripts, workspace_agent_stats, workspace_agents,
    workspace_builds, workspace_resources, workspaces,
};

const ACQUIRE_JOB_SQL: &str = r#"
UPDATE provisioner_jobs
SET started_at = $1, updated_at = $1, worker_id = $2
WHERE id = (
    SELECT nested.id
    FROM provisioner_jobs AS nested
    WHERE nested.started_at IS NULL
      AND nested.canceled_at IS NULL
      AND nested.completed_at IS NULL
      AND nested.provisioner = ANY(string_to_array($3, ','))
    ORDER BY nested.created_at
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
RETURNING *
"#;

const RESERVE_AGENT_LOGS_SQL: &str = r#"
UPDATE workspace_agents
SET logs_length = logs_length + $1
WHERE id = $2 AND logs_length + $1 <= $3
"#;

fn db_err(e: DbErr) -> StoreError {
    match e {
        DbErr::RecordNotFound(_) | DbErr::RecordNotUpdated => StoreError::NotFound,
        other => StoreError::Database(other.to_string()),
    }
}

fn tz(ts: Timestamp) -> DateTimeWithTimeZone {
    ts.into()
}

fn utc(ts: DateTimeWithTimeZone) -> Timestamp {
    ts.with_timezone(&Utc)
}

fn corrupt(table: &str, column: &str, raw: &str) -> StoreError {
    StoreError::Database(format!("{table}.{column}: unexpected value {raw:?}"))
}

fn json_err(table: &str, column: &str, err: serde_json::Error) -> StoreError {
    StoreError::Database(format!("{table}.{column}: {err}"))
}

fn found<T>(row: Option<T>) -> StoreResult<T> {
    row.ok_or(StoreError::NotFound)
}

fn agent_from_row(m: workspace_agents::Model) -> StoreResult<WorkspaceAgent> {
    let env: BTreeMap<String, String> =
        serde_json::from_value(m.env).map_err(|e| json_err("workspace_agents", "env", e))?;
    Ok(WorkspaceAgent {
        id: m.id,
        name: m.name,
        resource_id: m.resource_id,
        auth_token: m.auth_token,
        directory: m.directory,
        env,
        os: m.operating_system,
        architecture: m.architecture,
        first_connected_at: m.first_connected_at.map(utc),
        last_connected_at: m.last_connected_at.map(utc),
        disconnected_at: m.disconnected_at.map(utc),
        last_connected_replica_id: m.last_connected_replica_id,
        connection_timeout_seconds: m.connection_timeout_seconds,
        logs_length: m.logs_length,
        logs_overflowed: m.logs_overflowed,
        created_at: utc(m.created_at),
        updated_at: utc(m.updated_at),
    })
}

fn build_from_row(m: workspace_builds::Model) -> StoreResult<WorkspaceBuild> {
    let transition = BuildTransition::parse(&m.transition)
        .ok_or_else(|| corrupt("workspace_builds", "transition", &m.transition))?;
    Ok(WorkspaceBuild {
        id: m.id,
        workspace_id: m.workspace_id,
        template_version_id: m.template_version_id,
        build_number: m.build_number,
        transition,
        initiator_id: m.initiator_id,
        job_id: m.job_id,
        provisioner_state: m.provisioner_state,
        created_at: utc(m.created_at),
        updated_at: utc(m.updated_at),
    })
}

fn job_from_row(m: provisioner_jobs::Model) -> StoreResult<ProvisionerJob> {
    let job_type =
        JobType::parse(&m.job_type).ok_or_else(|| corrupt("provisioner_jobs", "type", &m.job_type))?;
    Ok(ProvisionerJob {
        id: m.id,
        created_at: utc(m.created_at),
        updated_at: utc(m.updated_at),
        started_at: m.started_at.map(utc),
        canceled_at: m.canceled_at.map(utc),
        completed_at: m.completed_at.map(utc),
        error: m.error,
        organization_id: m.organization_id,
        initiator_id: m.initiator_id,
        provisioner: m.provisioner,
        storage_method: m.storage_method,
        storage_source: m.storage_source,
        job_type,
        input: m.input,
        worker_id: m.worker_id,
    })
}

/// PostgreSQL-backed [`Store`].
#[derive(Clone)]
pub struct DbStore {
    db: DatabaseConnection,
}

impl DbStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

/// Marks a job complete inside `conn` only if it is not already. Returns whether it was.
async fn complete_job_on<C: ConnectionTrait>(conn: &C, arg: &CompleteJob) -> StoreResult<bool> {
    let res = provisioner_jobs::Entity::update_many()
        .col_expr(provisioner_jobs::Column::CompletedAt, Expr::value(tz(arg.completed_at)))
        .col_expr(provisioner_jobs::Column::UpdatedAt, Expr::value(tz(arg.completed_at)))
        .col_expr(provisioner_jobs::Column::Error, Expr::value(arg.error.clone()))
        .filter(provisioner_jobs::Column::Id.eq(arg.id))
        .filter(provisioner_jobs::Column::CompletedAt.is_null())
        .exec(conn)
        .await
        .map_err(db_err)?;
    if res.rows_affected == 1 {
        return Ok(true);
    }
    provisioner_jobs::Entity::find_by_id(arg.id)
        .one(conn)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NotFound)?;
    Ok(false)
}

#[async_trait]
impl Store for DbStore {
    async fn workspace_agent_by_id(&self, id: Uuid) -> StoreResult<WorkspaceAgent> {
        let row = workspace_agents::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(db_err)?;
        found(row).and_then(agent_from_row)
    }

    async fn workspace_agent_by_auth_token(&self, token: Uuid) -> StoreResult<WorkspaceAgent> {
        let row = workspace_agents::Entity::find()
            .filter(workspace_agents::Column::AuthToken.eq(token))
            .one(&self.db)
            .await
            .map_err(db_err)?;
        found(row).and_then(agent_from_row)
    }

    async fn workspace_resource_by_id(&self, id: Uuid) -> StoreResult<WorkspaceResource> {
        let m = found(
            workspace_resources::Entity::find_by_id(id)
                .one(&self.db)
                .await
                .map_err(db_err)?,
        )?;
        let transition = BuildTransition::parse(&m.transition)
            .ok_or_else(|| corrupt("workspace_resources", "transition", &m.transition))?;
        Ok(WorkspaceResource {
            id: m.id,
            job_id: m.job_id,
            transition,
            resource_type: m.resource_type,
            name: m.name,
            created_at: utc(m.created_at),
        })
    }

    async fn workspace_build_by_id(&self, id: Uuid) -> StoreResult<WorkspaceBuild> {
        let row = workspace_builds::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(db_err)?;
        build_from_row(found(row)?)
    }

    async fn workspace_build_by_job_id(&self, job_id: Uuid) -> StoreResult<WorkspaceBuild> {
        let row = workspace_builds::Entity::find()
            .filter(workspace_builds::Column::JobId.eq(job_id))
            .one(&self.db)
            .await
            .map_err(db_err)?;
        build_from_row(found(row)?)
    }

    async fn workspace_build_by_number(
        &self,
        workspace_id: Uuid,
        build_number: i32,
    ) -> StoreResult<WorkspaceBuild> {
        let row = workspace_builds::Entity::find()
            .filter(workspace_builds::Column::WorkspaceId.eq(workspace_id))
            .filter(workspace_builds::Column::BuildNumber.eq(build_number))
            .one(&self.db)
            .await
            .map_err(db_err)?;
        build_from_row(found(row)?)
    }

    async fn latest_workspace_build_by_workspace_id(
        &self,
        workspace_id: Uuid,
    ) -> StoreResult<WorkspaceBuild> {
        let row = workspace_builds::Entity::find()
            .filter(workspace_builds::Column::WorkspaceId.eq(workspace_id))
            .order_by_desc(workspace_builds::Column::BuildNumber)
            .one(&self.db)
            .await
            .map_err(db_err)?;
        build_from_row(found(row)?)
    }

    async fn workspace_by_id(&self, id: Uuid) -> StoreResult<Workspace> {
        let m = found(
            workspaces::Entity::find_by_id(id)
                .one(&self.db)
                .await
                .map_err(db_err)?,
        )?;
        Ok(Workspace {
            id: m.id,
            owner_id: m.owner_id,
            organization_id: m.organization_id,
            template_id: m.template_id,
            name: m.name,
            deleted: m.deleted,
        })
    }

    async fn user_by_id(&self, id: Uuid) -> StoreResult<User> {
        let m = found(users::Entity::find_by_id(id).one(&self.db).await.map_err(db_err)?)?;
        Ok(User {
            id: m.id,
            username: m.username,
            email: m.email,
        })
    }

    async fn update_workspace_agent_connection(
        &self,
        arg: UpdateAgentConnection,
    ) -> StoreResult<()> {
        let res = workspace_agents::Entity::update_many()
            .col_expr(
                workspace_agents::Column::FirstConnectedAt,
                Expr::value(arg.first_connected_at.map(tz)),
            )
            .col_expr(
                workspace_agents::Column::LastConnectedAt,
                Expr::value(arg.last_connected_at.map(tz)),
            )
            .col_expr(
                workspace_agents::Column::LastConnectedReplicaId,
                Expr::value(arg.last_connected_replica_id),
            )
            .col_expr(
                workspace_agents::Column::DisconnectedAt,
                Expr::value(arg.disconnected_at.map(tz)),
            )
            .col_expr(workspace_agents::Column::UpdatedAt, Expr::value(tz(arg.updated_at)))
            .filter(workspace_agents::Column::Id.eq(arg.id))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        if res.rows_affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn workspace_agent_scripts(
        &self,
        agent_id: Uuid,
    ) -> StoreResult<Vec<WorkspaceAgentScript>> {
        let rows = workspace_agent_scripts::Entity::find()
            .filter(workspace_agent_scripts::Column::AgentId.eq(agent_id))
            .order_by_asc(workspace_agent_scripts::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|m| WorkspaceAgentScript {
                agent_id: m.agent_id,
                display_name: m.display_name,
                script: m.script,
                run_on_start: m.run_on_start,
                run_on_stop: m.run_on_stop,
                timeout_seconds: m.timeout_seconds,
                log_path: m.log_path,
            })
            .collect())
    }

    async fn insert_workspace_agent_stats(
        &self,
        stats: Vec<WorkspaceAgentStats>,
    ) -> StoreResult<()> {
        if stats.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let rows = stats
            .into_iter()
            .map(|s| -> StoreResult<_> {
                let connections_by_proto = serde_json::to_value(&s.connections_by_proto)
                    .map_err(|e| json_err("workspace_agent_stats", "connections_by_proto", e))?;
                Ok(workspace_agent_stats::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    agent_id: Set(s.agent_id),
                    workspace_id: Set(s.workspace_id),
                    user_id: Set(s.user_id),
                    template_id: Set(s.template_id),
                    created_at: Set(tz(s.created_at.unwrap_or(now))),
                    connections_by_proto: Set(connections_by_proto),
                    connection_count: Set(s.connection_count),
                    rx_packets: Set(s.rx_packets),
                    rx_bytes: Set(s.rx_bytes),
                    tx_packets: Set(s.tx_packets),
                    tx_bytes: Set(s.tx_bytes),
                    session_count_ssh: Set(s.session_count_ssh),
                    session_count_vscode: Set(s.session_count_vscode),
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        workspace_agent_stats::Entity::insert_many(rows)
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_workspace_agent_logs(
        &self,
        agent_id: Uuid,
        logs: Vec<WorkspaceAgentLog>,
    ) -> StoreResult<()> {
        if logs.is_empty() {
            return Ok(());
        }
        let added: i64 = logs.iter().map(|l| l.output.len() as i64).sum();
        let txn = self.db.begin().await.map_err(db_err)?;
        let res = txn
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                RESERVE_AGENT_LOGS_SQL,
                [added.into(), agent_id.into(), MAX_AGENT_LOGS_BYTES.into()],
            ))
            .await
            .map_err(db_err)?;
        if res.rows_affected() == 0 {
            let exists = workspace_agents::Entity::find_by_id(agent_id)
                .one(&txn)
                .await
                .map_err(db_err)?
                .is_some();
            return Err(if exists {
                StoreError::LogsOverflow
            } else {
                StoreError::NotFound
            });
        }
        let rows = logs.into_iter().map(|l| workspace_agent_logs::ActiveModel {
            agent_id: Set(l.agent_id),
            created_at: Set(tz(l.created_at)),
            level: Set(l.level.as_str().to_string()),
            output: Set(l.output),
            ..Default::default()
        });
        workspace_agent_logs::Entity::insert_many(rows)
            .exec(&txn)
            .await
            .map_err(db_err)?;
        txn.commit().await.map_err(db_err)
    }

    async fn mark_workspace_agent_logs_overflowed(&self, agent_id: Uuid) -> StoreResult<()> {
        workspace_agents::Entity::update_many()
            .col_expr(workspace_agents::Column::LogsOverflowed, Expr::value(true))
            .filter(workspace_agents::Column::Id.eq(agent_id))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn external_auth_link(
        &self,
        provider_id: &str,
        user_id: Uuid,
    ) -> StoreResult<ExternalAuthLink> {
        let m = found(
            external_auth_links::Entity::find_by_id((provider_id.to_string(), user_id))
                .one(&self.db)
                .await
                .map_err(db_err)?,
        )?;
        Ok(ExternalAuthLink {
            provider_id: m.provider_id,
            user_id: m.user_id,
            access_token: m.access_token,
            expiry: m.expiry.map(utc),
        })
    }

    async fn insert_provisioner_daemon(&self, daemon: ProvisionerDaemon) -> StoreResult<()> {
        provisioner_daemons::ActiveModel {
            id: Set(daemon.id),
            name: Set(daemon.name),
            provisioners: Set(serde_json::Value::from(daemon.provisioners)),
            created_at: Set(tz(daemon.created_at)),
        }
        .insert(&self.db)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn acquire_provisioner_job(
        &self,
        arg: AcquireJob,
    ) -> StoreResult<Option<ProvisionerJob>> {
        let row = provisioner_jobs::Entity::find()
            .from_raw_sql(Statement::from_sql_and_values(
                DbBackend::Postgres,
                ACQUIRE_JOB_SQL,
                [
                    tz(arg.started_at).into(),
                    arg.worker_id.into(),
                    arg.provisioners.join(",").into(),
                ],
            ))
            .one(&self.db)
            .await
            .map_err(db_err)?;
        row.map(job_from_row).transpose()
    }

    async fn provisioner_job_by_id(&self, id: Uuid) -> StoreResult<ProvisionerJob> {
        let row = provisioner_jobs::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(db_err)?;
        job_from_row(found(row)?)
    }

    async fn update_provisioner_job_by_id(
        &self,
        id: Uuid,
        updated_at: Timestamp,
    ) -> StoreResult<()> {
        let res = provisioner_jobs::Entity::update_many()
            .col_expr(provisioner_jobs::Column::UpdatedAt, Expr::value(tz(updated_at)))
            .filter(provisioner_jobs::Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        if res.rows_affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_provisioner_job_with_cancel(
        &self,
        id: Uuid,
        canceled_at: Timestamp,
        error: Option<String>,
    ) -> StoreResult<()> {
        let mut update = provisioner_jobs::Entity::update_many()
            .col_expr(provisioner_jobs::Column::CanceledAt, Expr::value(tz(canceled_at)))
            .col_expr(provisioner_jobs::Column::UpdatedAt, Expr::value(tz(canceled_at)));
        if let Some(error) = error {
            update = update.col_expr(provisioner_jobs::Column::Error, Expr::value(error));
        }
        let res = update
            .filter(provisioner_jobs::Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        if res.rows_affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_provisioner_job_with_complete(&self, arg: CompleteJob) -> StoreResult<bool> {
        complete_job_on(&self.db, &arg).await
    }

    async fn insert_provisioner_job_logs(&self, logs: Vec<ProvisionerJobLog>) -> StoreResult<()> {
        if logs.is_empty() {
            return Ok(());
        }
        let rows = logs.into_iter().map(|l| provisioner_job_logs::ActiveModel {
            job_id: Set(l.job_id),
            created_at: Set(tz(l.created_at)),
            source: Set(l.source),
            level: Set(l.level.as_str().to_string()),
            stage: Set(l.stage),
            output: Set(l.output),
            ..Default::default()
        });
        provisioner_job_logs::Entity::insert_many(rows)
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn template_by_id(&self, id: Uuid) -> StoreResult<Template> {
        let m = found(
            templates::Entity::find_by_id(id)
                .one(&self.db)
                .await
                .map_err(db_err)?,
        )?;
        Ok(Template {
            id: m.id,
            organization_id: m.organization_id,
            name: m.name,
            provisioner: m.provisioner,
        })
    }

    async fn template_version_by_id(&self, id: Uuid) -> StoreResult<TemplateVersion> {
        let m = found(
            template_versions::Entity::find_by_id(id)
                .one(&self.db)
                .await
                .map_err(db_err)?,
        )?;
        Ok(TemplateVersion {
            id: m.id,
            template_id: m.template_id,
            organization_id: m.organization_id,
            name: m.name,
            job_id: m.job_id,
        })
    }

    async fn organization_by_id(&self, id: Uuid) -> StoreResult<Organization> {
        let m = found(
            organizations::Entity::find_by_id(id)
                .one(&self.db)
                .await
                .map_err(db_err)?,
        )?;
        Ok(Organization {
            id: m.id,
            name: m.name,
        })
    }

    async fn parameter_values(
        &self,
        scope: ParameterScope,
        scope_id: Uuid,
    ) -> StoreResult<Vec<ParameterValue>> {
        let rows = parameter_values::Entity::find()
            .filter(parameter_values::Column::Scope.eq(scope.as_str()))
            .filter(parameter_values::Column::ScopeId.eq(scope_id))
            .all(&self.db)
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|m| {
                let destination = ParameterDestination::parse(&m.destination)
                    .ok_or_else(|| corrupt("parameter_values", "destination", &m.destination))?;
                Ok(ParameterValue {
                    scope,
                    scope_id: m.scope_id,
                    name: m.name,
                    source_value: m.source_value,
                    destination,
                })
            })
            .collect()
    }

    async fn parameter_schemas_by_job_id(&self, job_id: Uuid) -> StoreResult<Vec<ParameterSchema>> {
        let rows = parameter_schemas::Entity::find()
            .filter(parameter_schemas::Column::JobId.eq(job_id))
            .order_by_asc(parameter_schemas::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|m| {
                let destination = ParameterDestination::parse(&m.destination)
                    .ok_or_else(|| corrupt("parameter_schemas", "destination", &m.destination))?;
                Ok(ParameterSchema {
                    job_id: m.job_id,
                    name: m.name,
                    description: m.description,
                    default_source_value: m.default_source_value,
                    allow_override_source: m.allow_override_source,
                    destination,
                })
            })
            .collect()
    }

    async fn complete_workspace_build(&self, arg: CompleteWorkspaceBuild) -> StoreResult<bool> {
        let txn = self.db.begin().await.map_err(db_err)?;
        let transitioned = complete_job_on(
            &txn,
            &CompleteJob {
                id: arg.job_id,
                completed_at: arg.completed_at,
                error: None,
            },
        )
        .await?;
        if !transitioned {
            return Ok(false);
        }

        let res = workspace_builds::Entity::update_many()
            .col_expr(
                workspace_builds::Column::ProvisionerState,
                Expr::value(arg.provisioner_state.clone()),
            )
            .col_expr(workspace_builds::Column::UpdatedAt, Expr::value(tz(arg.completed_at)))
            .filter(workspace_builds::Column::Id.eq(arg.build_id))
            .exec(&txn)
            .await
            .map_err(db_err)?;
        if res.rows_affected == 0 {
            return Err(StoreError::NotFound);
        }

        let created = tz(arg.completed_at);
        for resource in arg.resources {
            workspace_resources::ActiveModel {
                id: Set(resource.id),
                job_id: Set(arg.job_id),
                transition: Set(arg.transition.as_str().to_string()),
                resource_type: Set(resource.resource_type),
                name: Set(resource.name),
                created_at: Set(created),
            }
            .insert(&txn)
            .await
            .map_err(db_err)?;

            for agent in resource.agents {
                let env = serde_json::to_value(&agent.env)
                    .map_err(|e| json_err("workspace_agents", "env", e))?;
                workspace_agents::ActiveModel {
                    id: Set(agent.id),
                    name: Set(agent.name),
                    resource_id: Set(resource.id),
                    auth_token: Set(agent.auth_token),
                    directory: Set(agent.directory),
                    env: Set(env),
                    operating_system: Set(agent.os),
                    architecture: Set(agent.architecture),
                    first_connected_at: Set(None),
                    last_connected_at: Set(None),
                    disconnected_at: Set(None),
                    last_connected_replica_id: Set(None),
                    connection_timeout_seconds: Set(agent.connection_timeout_seconds),
                    logs_length: Set(0),
                    logs_overflowed: Set(false),
                    created_at: Set(created),
                    updated_at: Set(created),
                }
                .insert(&txn)
                .await
                .map_err(db_err)?;

                if let Some(script) = agent.startup_script.filter(|s| !s.is_empty()) {
                    workspace_agent_scripts::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        agent_id: Set(agent.id),
                        display_name: Set("Startup Script".to_string()),
                        script: Set(script),
                        run_on_start: Set(true),
                        run_on_stop: Set(false),
                        timeout_seconds: Set(0),
                        log_path: Set(String::new()),
                        created_at: Set(created),
                    }
                    .insert(&txn)
                    .await
                    .map_err(db_err)?;
                }
            }
        }
        txn.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn complete_template_version_import(
        &self,
        arg: CompleteTemplateImport,
    ) -> StoreResult<bool> {
        let txn = self.db.begin().await.map_err(db_err)?;
        let transitioned = complete_job_on(
            &txn,
            &CompleteJob {
                id: arg.job_id,
                completed_at: arg.completed_at,
                error: None,
            },
        )
        .await?;
        if !transitioned {
            return Ok(false);
        }
        let created = tz(arg.completed_at);
        let rows: Vec<_> = arg
            .parameter_schemas
            .into_iter()
            .map(|s| parameter_schemas::ActiveModel {
                id: Set(Uuid::new_v4()),
                job_id: Set(s.job_id),
                name: Set(s.name),
                description: Set(s.description),
                default_source_value: Set(s.default_source_value),
                allow_override_source: Set(s.allow_override_source),
                destination: Set(s.destination.as_str().to_string()),
                created_at: Set(created),
            })
            .collect();
        if !rows.is_empty() {
            parameter_schemas::Entity::insert_many(rows)
                .exec(&txn)
                .await
                .map_err(db_err)?;
        }
        txn.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn runtime_config(&self, key: &str) -> StoreResult<String> {
        let row = runtime_config::Entity::find_by_id(key.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?;
        found(row).map(|m| m.value)
    }

    async fn upsert_runtime_config(&self, key: &str, value: &str) -> StoreResult<()> {
        let row = runtime_config::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.to_string()),
            updated_at: Set(tz(Utc::now())),
        };
        runtime_config::Entity::insert(row)
            .on_conflict(
                OnConflict::column(runtime_config::Column::Key)
                    .update_columns([runtime_config::Column::Value, runtime_config::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_runtime_config(&self, key: &str) -> StoreResult<()> {
        runtime_config::Entity::delete_by_id(key.to_string())
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
