use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    agent_rpc::agent_rpc, error::HttpError, provisionerd::provisioner_daemon_serve, state::AppState,
};

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    replica_id: Uuid,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        replica_id: state.config.replica_id,
    })
}

#[derive(Debug, Deserialize)]
struct AppPath {
    agent_id: Uuid,
    /// `8080` for plain HTTP, `8443s` for HTTPS.
    port: String,
    #[serde(default)]
    path: String,
}

fn app_target(port: &str) -> Option<Uri> {
    let (scheme, port) = match port.strip_suffix('s') {
        Some(port) => ("https", port),
        None => ("http", port),
    };
    let port: u16 = port.parse().ok().filter(|p| *p != 0)?;
    format!("{scheme}://127.0.0.1:{port}").parse().ok()
}

/// Strips the route prefix so the app sees the path it serves from.
fn app_uri(path: &str, query: Option<&str>) -> Uri {
    let path = format!("/{}", path.trim_start_matches('/'));
    let pq = match query {
        Some(q) => format!("{path}?{q}"),
        None => path,
    };
    Uri::try_from(pq).unwrap_or_else(|_| Uri::from_static("/"))
}

async fn agent_app(State(state): State<AppState>, Path(params): Path<AppPath>, mut req: Request) -> Response {
    let Some(target) = app_target(&params.port) else {
        return HttpError::new(StatusCode::BAD_REQUEST, "Invalid app port.")
            .with_detail(&params.port)
            .into_response();
    };
    let proxy = match state
        .tailnet
        .reverse_proxy(&target, &state.config.access_url, params.agent_id)
    {
        Ok(proxy) => proxy,
        Err(err) => {
            return HttpError::new(StatusCode::BAD_REQUEST, "Invalid app target.")
                .with_detail(err)
                .into_response();
        }
    };
    *req.uri_mut() = app_uri(&params.path, req.uri().query());
    proxy.serve(req).await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v2/workspaceagents/me/rpc", get(agent_rpc))
        .route("/api/v2/provisionerdaemons/serve", get(provisioner_daemon_serve))
        .route("/api/v2/workspaceagents/:agent_id/apps/:port/", any(agent_app))
        .route("/api/v2/workspaceagents/:agent_id/apps/:port/*path", any(agent_app))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_ports_pick_the_scheme() {
        let plain = app_target("8080").unwrap();
        assert_eq!(plain.scheme_str(), Some("http"));
        assert_eq!(plain.port_u16(), Some(8080));
        let tls = app_target("8443s").unwrap();
        assert_eq!(tls.scheme_str(), Some("https"));
        assert_eq!(tls.port_u16(), Some(8443));
        assert!(app_target("0").is_none());
        assert!(app_target("web").is_none());
        assert!(app_target("70000").is_none());
    }

    #[test]
    fn app_uri_drops_the_route_prefix() {
        assert_eq!(app_uri("", None), "/");
        assert_eq!(app_uri("static/app.js", Some("v=2")), "/static/app.js?v=2");
        assert_eq!(app_uri("/api", None), "/api");
    }
}
