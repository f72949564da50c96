use std::sync::Arc;

use conduit_core::{Store, events::Publisher, runtimeconfig::StoreManager};
use conduit_wire::mux;
use tokio_util::sync::CancellationToken;

use crate::{
    agent_api::{AgentApiDeps, AgentApiOptions, BatcherOptions, StatsBatcher, compile_external_auth},
    agent_rpc::AgentRpc,
    config::ControlConfig,
    monitor::MonitorOptions,
    provisionerd::{BrokerOptions, ProvisionerBroker},
    pubsub::WorkspacePubsub,
    tailnet::{ControllerOptions, CoordinatorHandle, InMemoryCoordinator, ServerTailnet},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ControlConfig>,
    pub store: Arc<dyn Store>,
    pub publisher: Arc<dyn Publisher>,
    pub agent_rpc: AgentRpc,
    pub tailnet: Arc<ServerTailnet>,
    pub provisioner: Arc<ProvisionerBroker>,
    /// Cancelled on server shutdown; long-lived sessions hang off it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wires the control plane together and starts its background tasks.
    pub fn new(config: ControlConfig, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let publisher: Arc<dyn Publisher> = Arc::new(WorkspacePubsub::default());
        let coordinator = CoordinatorHandle::new(Arc::new(InMemoryCoordinator::new()));
        let tailnet = ServerTailnet::with_coordinator(
            coordinator.clone(),
            ControllerOptions {
                idle_cutoff: config.tailnet_idle_cutoff,
                sweep_interval: config.tailnet_sweep_interval,
                ..ControllerOptions::default()
            },
        )?;
        let external_auth = compile_external_auth(&config.external_auth)
            .map_err(|e| anyhow::anyhow!("CONDUIT_EXTERNAL_AUTH: invalid regex: {e}"))?;

        let agent_rpc = AgentRpc {
            api: AgentApiDeps {
                store: store.clone(),
                publisher: publisher.clone(),
                stats: Arc::new(StatsBatcher::start(store.clone(), BatcherOptions::default())),
                runtime_config: StoreManager::new(store.clone()),
                external_auth: external_auth.into(),
                coordinator,
                opts: AgentApiOptions {
                    access_url: config.access_url.clone(),
                    stats_interval: config.agent_stats_interval,
                },
            },
            monitor: MonitorOptions {
                ping_period: config.agent_ping_period,
                disconnect_timeout: config.agent_disconnect_timeout,
                replica_id: config.replica_id,
            },
            mux: mux::Config {
                idle_timeout: config.ws_idle_timeout,
                ..mux::Config::default()
            },
        };
        let provisioner = Arc::new(ProvisionerBroker::new(
            store.clone(),
            publisher.clone(),
            BrokerOptions {
                access_url: config.access_url.clone(),
                provisioners: config.provisioner_types.clone(),
            },
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            publisher,
            agent_rpc,
            tailnet,
            provisioner,
            shutdown: CancellationToken::new(),
        })
    }

    /// Closes every session, then stops the background tasks. Queued agent stats are flushed.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.tailnet.close().await;
        self.agent_rpc.api.coordinator.load().close();
        self.agent_rpc.api.stats.close().await;
    }
}
