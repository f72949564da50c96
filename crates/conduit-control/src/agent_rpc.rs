//! `GET /api/v2/workspaceagents/me/rpc`: the single long-lived connection a workspace agent holds
//! to the control plane.

use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use conduit_core::{
    Store, StoreError,
    models::{User, Workspace, WorkspaceAgent, WorkspaceBuild},
};
use conduit_wire::{CloseCode, Role, Session, Transport, mux, rpc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    agent_api::{AgentApi, AgentApiDeps},
    error::HttpError,
    monitor::{ConnectionMonitor, MonitorOptions},
    state::AppState,
    ws,
};

pub const API_MAJOR_VERSION: u32 = 2;
const DEFAULT_API_VERSION: &str = "2.0";

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let raw = raw.trim();
    let rest = raw.strip_prefix("Bearer ")?;
    let token = rest.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Accepts `major` or `major.minor`; only the major version has to match.
fn check_version(raw: &str) -> Result<(), HttpError> {
    let unsupported = || {
        HttpError::new(StatusCode::BAD_REQUEST, "Unknown or unsupported API version")
            .with_detail(format!("server supports {API_MAJOR_VERSION}.x, agent asked for {raw:?}"))
    };
    let mut parts = raw.splitn(2, '.');
    let major = parts
        .next()
        .and_then(|m| m.parse::<u32>().ok())
        .ok_or_else(unsupported)?;
    if let Some(minor) = parts.next() {
        minor.parse::<u32>().map_err(|_| unsupported())?;
    }
    if major != API_MAJOR_VERSION {
        return Err(unsupported());
    }
    Ok(())
}

/// The agent behind a connection attempt and the workspace it belongs to.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent: WorkspaceAgent,
    pub build: WorkspaceBuild,
    pub workspace: Workspace,
    pub owner: User,
}

fn resolution_failed(what: &str, err: StoreError) -> HttpError {
    HttpError::new(
        StatusCode::BAD_REQUEST,
        format!("Internal error fetching workspace agent {what}."),
    )
    .with_detail(err)
}

/// Authenticates the agent and walks agent → resource → build → workspace → owner. Nothing is
/// upgraded unless this succeeds, including the check that the agent belongs to the latest build.
pub async fn resolve_agent(
    store: &dyn Store,
    headers: &HeaderMap,
    version: Option<&str>,
) -> Result<AgentContext, HttpError> {
    let Some(token) = bearer_token(headers) else {
        return Err(HttpError::new(
            StatusCode::UNAUTHORIZED,
            "Workspace agent token required",
        ));
    };
    let unauthorized = || HttpError::new(StatusCode::UNAUTHORIZED, "Workspace agent not authorized");
    let token = Uuid::parse_str(&token).map_err(|_| unauthorized())?;
    let agent = match store.workspace_agent_by_auth_token(token).await {
        Ok(agent) => agent,
        Err(StoreError::NotFound) => return Err(unauthorized()),
        Err(err) => {
            return Err(HttpError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error authenticating workspace agent.",
            )
            .with_detail(err));
        }
    };

    check_version(version.unwrap_or(DEFAULT_API_VERSION))?;

    let resource = store
        .workspace_resource_by_id(agent.resource_id)
        .await
        .map_err(|e| resolution_failed("resource", e))?;
    let build = store
        .workspace_build_by_job_id(resource.job_id)
        .await
        .map_err(|e| resolution_failed("build", e))?;
    let workspace = store
        .workspace_by_id(build.workspace_id)
        .await
        .map_err(|e| resolution_failed("workspace", e))?;
    let owner = store
        .user_by_id(workspace.owner_id)
        .await
        .map_err(|e| resolution_failed("owner", e))?;

    let latest = store
        .latest_workspace_build_by_workspace_id(workspace.id)
        .await
        .map_err(|e| resolution_failed("latest build", e))?;
    if latest.id != build.id {
        return Err(HttpError::new(
            StatusCode::FORBIDDEN,
            "Agent trying to connect from non-latest build.",
        )
        .with_detail(format!(
            "agent build {} is not the latest build {}",
            build.id, latest.id
        )));
    }

    Ok(AgentContext {
        agent,
        build,
        workspace,
        owner,
    })
}

/// Everything needed to run agent sessions once they are accepted.
#[derive(Clone)]
pub struct AgentRpc {
    pub api: AgentApiDeps,
    pub monitor: MonitorOptions,
    pub mux: mux::Config,
}

impl AgentRpc {
    /// Runs one agent session over `transport` until either side closes it or `shutdown` fires.
    pub async fn serve(&self, ctx: AgentContext, transport: Transport, shutdown: CancellationToken) {
        let span = tracing::info_span!(
            "agent_rpc",
            agent_id = %ctx.agent.id,
            workspace_id = %ctx.workspace.id,
        );
        self.serve_inner(ctx, transport, shutdown).instrument(span).await
    }

    async fn serve_inner(&self, ctx: AgentContext, transport: Transport, shutdown: CancellationToken) {
        tracing::info!(agent = %ctx.agent.name, "agent connected");
        let session = Session::new(transport, Role::Server, self.mux.clone());

        let closer = session.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => closer.close(CloseCode::GOING_AWAY, "server shutting down"),
                _ = closer.closed() => {}
            }
        });

        let monitor = ConnectionMonitor::new(
            ctx.agent.clone(),
            ctx.build.clone(),
            Arc::new(session.clone()),
            self.api.store.clone(),
            self.api.publisher.clone(),
            self.monitor.clone(),
        );
        monitor.init();
        monitor.start(&session.close_token());

        let api = Arc::new(AgentApi::new(
            self.api.clone(),
            ctx.agent,
            ctx.workspace,
            ctx.owner,
        ));
        if let Err(err) = rpc::serve(session.clone(), api).await {
            tracing::warn!(error = %err, "agent rpc session failed");
            session.close(CloseCode::INTERNAL_ERROR, format!("serve: {err}"));
        }

        // Streams are no longer accepted once serve returns.
        monitor.close().await;
        session.shutdown(CloseCode::NORMAL, "").await;
        let remote = session.remote_close();
        tracing::info!(
            close_code = remote.as_ref().map(|c| c.code.0),
            close_reason = remote.as_ref().map(|c| c.reason.as_str()),
            "agent disconnected"
        );
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RpcParams {
    pub version: Option<String>,
}

pub async fn agent_rpc(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(params): Query<RpcParams>,
    headers: HeaderMap,
) -> Response {
    let ctx = match resolve_agent(state.store.as_ref(), &headers, params.version.as_deref()).await {
        Ok(ctx) => ctx,
        Err(err) => {
            tracing::debug!(status = %err.status, message = %err.message, detail = %err.detail, "rejected agent");
            return err.into_response();
        }
    };

    let max = state.config.ws_max_message_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| async move {
            state
                .agent_rpc
                .serve(ctx, ws::transport(socket), state.shutdown.child_token())
                .await
        })
        .into_response()
}
