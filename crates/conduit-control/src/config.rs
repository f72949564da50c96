use std::{net::SocketAddr, time::Duration};

use serde::Deserialize;
use uuid::Uuid;

/// An external auth provider agents may request tokens for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExternalAuthProvider {
    pub id: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Matched against URLs the agent asks about when it does not know the provider id.
    #[serde(default)]
    pub regex: String,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub listen_addr: SocketAddr,
    pub access_url: String,
    pub replica_id: Uuid,
    pub agent_ping_period: Duration,
    pub agent_disconnect_timeout: Duration,
    pub agent_stats_interval: Duration,
    pub ws_idle_timeout: Option<Duration>,
    pub ws_max_message_bytes: usize,
    pub tailnet_idle_cutoff: Duration,
    pub tailnet_sweep_interval: Duration,
    pub provisioner_types: Vec<String>,
    pub external_auth: Vec<ExternalAuthProvider>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let ping = Duration::from_secs(15);
        Self {
            listen_addr: ([0, 0, 0, 0], 8080).into(),
            access_url: "http://127.0.0.1:8080".to_string(),
            replica_id: Uuid::new_v4(),
            agent_ping_period: ping,
            agent_disconnect_timeout: default_disconnect_timeout(ping),
            agent_stats_interval: Duration::from_secs(300),
            ws_idle_timeout: None,
            ws_max_message_bytes: 64 << 20,
            tailnet_idle_cutoff: Duration::from_secs(30 * 60),
            tailnet_sweep_interval: Duration::from_secs(5 * 60),
            provisioner_types: vec!["terraform".to_string(), "echo".to_string()],
            external_auth: Vec::new(),
        }
    }
}

fn default_disconnect_timeout(ping_period: Duration) -> Duration {
    (ping_period * 2).max(Duration::from_secs(2))
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> anyhow::Result<Option<u64>> {
    match env_str(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{name}: invalid number {raw:?}: {e}")),
    }
}

fn env_ms(name: &str, min: u64, max: u64) -> anyhow::Result<Option<Duration>> {
    Ok(env_u64(name)?.map(|ms| Duration::from_millis(ms.clamp(min, max))))
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        if let Some(addr) = env_str("CONDUIT_LISTEN_ADDR") {
            cfg.listen_addr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("CONDUIT_LISTEN_ADDR: {e}"))?;
        }
        if let Some(url) = env_str("CONDUIT_ACCESS_URL") {
            cfg.access_url = url.trim_end_matches('/').to_string();
        }
        if let Some(id) = env_str("CONDUIT_REPLICA_ID") {
            cfg.replica_id =
                Uuid::parse_str(&id).map_err(|e| anyhow::anyhow!("CONDUIT_REPLICA_ID: {e}"))?;
        }

        if let Some(ping) = env_ms("CONDUIT_AGENT_PING_PERIOD_MS", 100, 300_000)? {
            cfg.agent_ping_period = ping;
            cfg.agent_disconnect_timeout = default_disconnect_timeout(ping);
        }
        if let Some(timeout) = env_ms("CONDUIT_AGENT_DISCONNECT_TIMEOUT_MS", 2_000, 3_600_000)? {
            cfg.agent_disconnect_timeout = timeout;
        }
        if let Some(interval) = env_ms("CONDUIT_AGENT_STATS_INTERVAL_MS", 1_000, 86_400_000)? {
            cfg.agent_stats_interval = interval;
        }
        cfg.ws_idle_timeout = match env_u64("CONDUIT_WS_IDLE_TIMEOUT_MS")? {
            None | Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms.max(1_000))),
        };
        if let Some(bytes) = env_u64("CONDUIT_WS_MAX_MESSAGE_BYTES")? {
            // Never below the largest manifest an agent is expected to fetch.
            cfg.ws_max_message_bytes = (bytes as usize).clamp(1 << 20, 1 << 30);
        }

        if let Some(cutoff) = env_ms("CONDUIT_TAILNET_AGENT_IDLE_CUTOFF_MS", 1_000, 86_400_000)? {
            cfg.tailnet_idle_cutoff = cutoff;
        }
        if let Some(sweep) = env_ms("CONDUIT_TAILNET_SWEEP_INTERVAL_MS", 1_000, 86_400_000)? {
            cfg.tailnet_sweep_interval = sweep;
        }

        if let Some(types) = env_str("CONDUIT_PROVISIONER_TYPES") {
            cfg.provisioner_types = parse_list(&types);
            if cfg.provisioner_types.is_empty() {
                anyhow::bail!("CONDUIT_PROVISIONER_TYPES: no provisioner types given");
            }
        }
        if let Some(raw) = env_str("CONDUIT_EXTERNAL_AUTH") {
            cfg.external_auth = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("CONDUIT_EXTERNAL_AUTH: {e}"))?;
        }

        Ok(cfg)
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_timeout_follows_ping_period() {
        assert_eq!(
            default_disconnect_timeout(Duration::from_secs(15)),
            Duration::from_secs(30)
        );
        assert_eq!(
            default_disconnect_timeout(Duration::from_millis(100)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn provisioner_list_is_normalized() {
        assert_eq!(
            parse_list(" Terraform, echo ,,"),
            vec!["terraform".to_string(), "echo".to_string()]
        );
    }

    #[test]
    fn external_auth_providers_parse_from_json() {
        let raw = r#"[{"id":"github","type":"github","regex":"^https://github\\.com/"}]"#;
        let providers: Vec<ExternalAuthProvider> = serde_json::from_str(raw).unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].provider_type, "github");
        assert_eq!(providers[0].regex, "^https://github\\.com/");
    }
}
