//! The API a connected agent calls over its RPC session.

mod coordinate;
mod external_auth;
mod logs;
mod manifest;
pub mod stats;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use conduit_core::{
    Store, StoreError,
    events::Publisher,
    models::{User, Workspace, WorkspaceAgent},
    runtimeconfig::StoreManager,
};
use conduit_proto::{
    agent_v2::{
        BATCH_CREATE_LOGS, BatchCreateLogsRequest, GET_EXTERNAL_AUTH, GET_MANIFEST,
        GetExternalAuthRequest, GetManifestRequest, UPDATE_STATS, UpdateStatsRequest,
    },
    tailnet_v2::COORDINATE,
};
use conduit_wire::rpc::{CallSender, ServerCall, Service};
use tonic::Status;

pub use external_auth::{ExternalAuthMatcher, compile_external_auth};
pub use stats::{BatcherOptions, StatsBatcher};

use crate::tailnet::CoordinatorHandle;

#[derive(Debug, Clone)]
pub struct AgentApiOptions {
    pub access_url: String,
    pub stats_interval: Duration,
}

/// Everything an agent session needs that outlives the session.
#[derive(Clone)]
pub struct AgentApiDeps {
    pub store: Arc<dyn Store>,
    pub publisher: Arc<dyn Publisher>,
    pub stats: Arc<StatsBatcher>,
    pub runtime_config: StoreManager,
    pub external_auth: Arc<[ExternalAuthMatcher]>,
    pub coordinator: CoordinatorHandle,
    pub opts: AgentApiOptions,
}

/// One agent's view of the control plane, bound to the workspace it was built for.
pub struct AgentApi {
    agent: WorkspaceAgent,
    workspace: Workspace,
    owner: User,
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    stats: Arc<StatsBatcher>,
    runtime_config: StoreManager,
    external_auth: Arc<[ExternalAuthMatcher]>,
    coordinator: CoordinatorHandle,
    opts: AgentApiOptions,
}

impl AgentApi {
    pub fn new(deps: AgentApiDeps, agent: WorkspaceAgent, workspace: Workspace, owner: User) -> Self {
        Self {
            agent,
            workspace,
            owner,
            store: deps.store,
            publisher: deps.publisher,
            stats: deps.stats,
            runtime_config: deps.runtime_config,
            external_auth: deps.external_auth,
            coordinator: deps.coordinator,
            opts: deps.opts,
        }
    }
}

fn internal(op: &str, err: StoreError) -> Status {
    Status::internal(format!("{op}: {err}"))
}

#[async_trait]
impl Service for AgentApi {
    async fn call(&self, call: ServerCall, tx: &mut CallSender) -> Result<(), Status> {
        match call.method() {
            GET_MANIFEST => {
                let _: GetManifestRequest = call.request()?;
                let manifest = self.manifest().await?;
                tx.send(&manifest).await
            }
            UPDATE_STATS => {
                let req: UpdateStatsRequest = call.request()?;
                let resp = self.update_stats(req).await?;
                tx.send(&resp).await
            }
            BATCH_CREATE_LOGS => {
                let req: BatchCreateLogsRequest = call.request()?;
                let resp = self.batch_create_logs(req).await?;
                tx.send(&resp).await
            }
            GET_EXTERNAL_AUTH => {
                let req: GetExternalAuthRequest = call.request()?;
                let resp = self.external_auth(req).await?;
                tx.send(&resp).await
            }
            COORDINATE => self.coordinate(call, tx).await,
            other => Err(Status::unimplemented(format!("unknown method {other}"))),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use conduit_wire::{
        Session,
        rpc::{self, RpcClient},
        transport::memory_pair,
    };

    use super::*;
    use crate::{
        config::ExternalAuthProvider,
        tailnet::InMemoryCoordinator,
        testutil::{Fixture, RecordingPublisher},
    };

    pub struct ApiHarness {
        pub fx: Fixture,
        pub publisher: Arc<RecordingPublisher>,
        pub coordinator: Arc<InMemoryCoordinator>,
        pub stats: Arc<StatsBatcher>,
        pub client: RpcClient,
    }

    pub fn deps(fx: &Fixture, publisher: Arc<RecordingPublisher>) -> AgentApiDeps {
        deps_with(fx, publisher, Arc::new(InMemoryCoordinator::new()), &[])
    }

    fn deps_with(
        fx: &Fixture,
        publisher: Arc<RecordingPublisher>,
        coordinator: Arc<InMemoryCoordinator>,
        providers: &[ExternalAuthProvider],
    ) -> AgentApiDeps {
        AgentApiDeps {
            store: fx.store.clone(),
            publisher,
            stats: Arc::new(StatsBatcher::start(fx.store.clone(), BatcherOptions::default())),
            runtime_config: StoreManager::new(fx.store.clone()),
            external_auth: compile_external_auth(providers).unwrap().into(),
            coordinator: CoordinatorHandle::new(coordinator),
            opts: AgentApiOptions {
                access_url: "https://dev.example.com".to_string(),
                stats_interval: Duration::from_secs(300),
            },
        }
    }

    impl ApiHarness {
        pub fn new() -> Self {
            Self::with_external_auth(Vec::new())
        }

        pub fn with_external_auth(providers: Vec<ExternalAuthProvider>) -> Self {
            let fx = Fixture::new();
            let publisher = Arc::new(RecordingPublisher::default());
            let coordinator = Arc::new(InMemoryCoordinator::new());
            let deps = deps_with(&fx, publisher.clone(), coordinator.clone(), &providers);
            let stats = deps.stats.clone();
            let api = Arc::new(AgentApi::new(
                deps,
                fx.agent.clone(),
                fx.workspace.clone(),
                fx.user.clone(),
            ));

            let (server_t, client_t) = memory_pair();
            let server = Session::server(server_t);
            tokio::spawn(rpc::serve(server, api));
            let client = RpcClient::new(Session::client(client_t));
            Self {
                fx,
                publisher,
                coordinator,
                stats,
                client,
            }
        }
    }
}
