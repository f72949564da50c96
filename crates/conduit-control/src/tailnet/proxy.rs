use std::{
    collections::HashMap,
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Json,
    body::Body,
    http::{HeaderValue, Request, Response, StatusCode, Uri, header, uri::Scheme},
    response::IntoResponse,
};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::{
    ClientConfig, DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{TailnetError, server::ServerTailnet};

pub const MAX_IDLE_PER_HOST: usize = 6;
pub const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers that describe a single hop and are not forwarded.
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Agents commonly serve apps with self-signed certificates, so upstream certificates are not
/// verified. The overlay already authenticates the peer.
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

pub(super) fn insecure_tls_config() -> Result<ClientConfig, rustls::Error> {
    Ok(
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
            .with_no_client_auth(),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(super) struct PoolKey {
    agent_id: Uuid,
    https: bool,
    authority: String,
}

struct IdleConn {
    sender: SendRequest<Body>,
    since: Instant,
}

impl IdleConn {
    fn usable(&self) -> bool {
        self.since.elapsed() < IDLE_CONN_TIMEOUT
            && !self.sender.is_closed()
            && self.sender.is_ready()
    }
}

/// Idle upstream HTTP/1.1 connections, per agent and upstream host.
#[derive(Clone, Default)]
pub struct ConnPool {
    idle: Arc<Mutex<HashMap<PoolKey, Vec<IdleConn>>>>,
}

impl ConnPool {
    fn take(&self, key: &PoolKey) -> Option<SendRequest<Body>> {
        let mut idle = self.idle.lock();
        let conns = idle.get_mut(key)?;
        while let Some(conn) = conns.pop() {
            if conn.usable() {
                return Some(conn.sender);
            }
        }
        idle.remove(key);
        None
    }

    fn put(&self, key: PoolKey, sender: SendRequest<Body>) {
        let mut idle = self.idle.lock();
        let conns = idle.entry(key).or_default();
        conns.retain(IdleConn::usable);
        if conns.len() < MAX_IDLE_PER_HOST {
            conns.push(IdleConn {
                sender,
                since: Instant::now(),
            });
        }
    }

    pub fn idle_count(&self, agent_id: Uuid) -> usize {
        self.idle
            .lock()
            .iter()
            .filter(|(k, _)| k.agent_id == agent_id)
            .map(|(_, v)| v.len())
            .sum()
    }

    pub fn clear(&self) {
        self.idle.lock().clear();
    }
}

#[derive(Debug, thiserror::Error)]
enum ProxyError {
    #[error("dial agent: {0}")]
    Dial(#[from] TailnetError),
    #[error("tls handshake: {0}")]
    Tls(io::Error),
    #[error("{0}")]
    Http(#[from] hyper::Error),
    #[error("agent did not become reachable within {0:?}")]
    Timeout(Duration),
}

/// Reverse proxy to one HTTP(S) target reachable through an agent.
#[derive(Clone)]
pub struct ReverseProxy {
    tailnet: Arc<ServerTailnet>,
    agent_id: Uuid,
    https: bool,
    authority: String,
    host: String,
    port: u16,
    dashboard_url: String,
}

impl ReverseProxy {
    pub(super) fn new(
        tailnet: Arc<ServerTailnet>,
        target: &Uri,
        dashboard_url: &str,
        agent_id: Uuid,
    ) -> Result<Self, TailnetError> {
        let https = match target.scheme() {
            Some(s) if *s == Scheme::HTTPS => true,
            Some(s) if *s == Scheme::HTTP => false,
            _ => return Err(TailnetError::InvalidTarget(target.to_string())),
        };
        let authority = target
            .authority()
            .ok_or_else(|| TailnetError::InvalidTarget(target.to_string()))?;
        let port = authority.port_u16().unwrap_or(if https { 443 } else { 80 });
        Ok(Self {
            tailnet,
            agent_id,
            https,
            authority: authority.to_string(),
            host: authority
                .host()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string(),
            port,
            dashboard_url: dashboard_url.to_string(),
        })
    }

    pub async fn serve(&self, req: Request<Body>) -> Response<Body> {
        match self.forward(req).await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::warn!(agent_id = %self.agent_id, target = %self.authority, error = %err, "proxy request failed");
                self.error_response(&err)
            }
        }
    }

    async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let req = self.rewrite(req);
        let key = PoolKey {
            agent_id: self.agent_id,
            https: self.https,
            authority: self.authority.clone(),
        };
        let mut sender = match self.tailnet.pool.take(&key) {
            Some(sender) => sender,
            None => self.connect().await?,
        };
        let resp = sender.send_request(req).await?;

        // The connection is reusable once the response body has been read.
        let pool = self.tailnet.pool.clone();
        tokio::spawn(async move {
            if sender.ready().await.is_ok() {
                pool.put(key, sender);
            }
        });
        Ok(resp.map(Body::new))
    }

    fn rewrite(&self, req: Request<Body>) -> Request<Body> {
        let (mut parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_string();
        parts.uri = Uri::try_from(path).unwrap_or_else(|_| Uri::from_static("/"));
        for name in HOP_HEADERS {
            parts.headers.remove(name);
        }
        if let Ok(host) = HeaderValue::from_str(&self.authority) {
            parts.headers.insert(header::HOST, host);
        }
        Request::from_parts(parts, body)
    }

    async fn connect(&self) -> Result<SendRequest<Body>, ProxyError> {
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let conn = tokio::time::timeout(
            DIAL_TIMEOUT,
            self.tailnet.agent_conn(self.agent_id, &cancel),
        )
        .await
        .map_err(|_| ProxyError::Timeout(DIAL_TIMEOUT))??;
        let stream = conn.dial_tcp(self.port).await?;
        conn.release();

        if !self.https {
            return handshake(stream).await;
        }
        let name = ServerName::try_from(self.host.clone())
            .map_err(|e| ProxyError::Tls(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let tls = self
            .tailnet
            .tls
            .connect(name, stream)
            .await
            .map_err(ProxyError::Tls)?;
        handshake(tls).await
    }

    fn error_response(&self, err: &ProxyError) -> Response<Body> {
        let additional_info = match err {
            ProxyError::Tls(e) if self.https && e.kind() == io::ErrorKind::InvalidData => {
                "This error seems to be due to an app protocol mismatch, try switching the app's protocol to HTTP."
            }
            ProxyError::Http(e)
                if !self.https && (e.is_parse() || e.is_incomplete_message()) =>
            {
                "This error seems to be due to an app protocol mismatch, try switching the app's protocol to HTTPS."
            }
            _ => "",
        };
        let body = serde_json::json!({
            "status": StatusCode::BAD_GATEWAY.as_u16(),
            "title": "Bad Gateway",
            "description": format!("Failed to proxy request to application: {err}"),
            "dashboard_url": self.dashboard_url,
            "additional_info": additional_info,
        });
        (StatusCode::BAD_GATEWAY, Json(body)).into_response()
    }
}

async fn handshake<T>(io: T) -> Result<SendRequest<Body>, ProxyError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "upstream connection ended");
        }
    });
    Ok(sender)
}
