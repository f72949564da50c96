//! Provisioner daemons connect here to pull jobs and report on them.

mod broker;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use conduit_core::{models::ProvisionerDaemon, now};
use conduit_proto::provisionerd_v1::{
    ACQUIRE_JOB, AcquireJobRequest, CANCEL_JOB, COMPLETE_JOB, CancelJobRequest, CompletedJob,
    FAIL_JOB, FailJobRequest, UPDATE_JOB, UpdateJobRequest,
};
use conduit_wire::{
    CloseCode, Role, Session, Transport, mux,
    rpc::{self, CallSender, ServerCall, Service},
};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::Instrument;
use uuid::Uuid;

pub use broker::{BrokerOptions, ProvisionerBroker};

use crate::{error::json_error, state::AppState, ws};

/// The broker as seen by one connected daemon.
pub struct DaemonService {
    broker: Arc<ProvisionerBroker>,
    daemon_id: Uuid,
}

impl DaemonService {
    pub fn new(broker: Arc<ProvisionerBroker>, daemon_id: Uuid) -> Self {
        Self { broker, daemon_id }
    }

    async fn update_stream(&self, mut call: ServerCall, tx: &mut CallSender) -> Result<(), Status> {
        let cancel = call.cancelled();
        loop {
            let req = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                req = call.recv::<UpdateJobRequest>() => req?,
            };
            let Some(req) = req else {
                return Ok(());
            };
            let resp = self.broker.update_job(self.daemon_id, req).await?;
            tx.send(&resp).await?;
        }
    }
}

#[async_trait]
impl Service for DaemonService {
    async fn call(&self, call: ServerCall, tx: &mut CallSender) -> Result<(), Status> {
        match call.method() {
            ACQUIRE_JOB => {
                let _: AcquireJobRequest = call.request()?;
                let job = self.broker.acquire_job(self.daemon_id).await?;
                tx.send(&job).await
            }
            UPDATE_JOB => self.update_stream(call, tx).await,
            CANCEL_JOB => {
                let req: CancelJobRequest = call.request()?;
                self.broker.cancel_job(self.daemon_id, req).await?;
                tx.send(&conduit_proto::rpc::Empty {}).await
            }
            FAIL_JOB => {
                let req: FailJobRequest = call.request()?;
                self.broker.fail_job(self.daemon_id, req).await?;
                tx.send(&conduit_proto::rpc::Empty {}).await
            }
            COMPLETE_JOB => {
                let req: CompletedJob = call.request()?;
                self.broker.complete_job(self.daemon_id, req).await?;
                tx.send(&conduit_proto::rpc::Empty {}).await
            }
            other => Err(Status::unimplemented(format!("unknown method {other}"))),
        }
    }
}

fn daemon_name() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("provisionerd-{suffix}")
}

/// Serves one daemon over `transport` until either side closes or `shutdown` fires.
pub async fn serve_daemon(
    broker: Arc<ProvisionerBroker>,
    daemon: ProvisionerDaemon,
    transport: Transport,
    mux: mux::Config,
    shutdown: CancellationToken,
) {
    let span = tracing::info_span!("provisionerd", daemon_id = %daemon.id, daemon = %daemon.name);
    async move {
        tracing::info!(provisioners = ?daemon.provisioners, "provisioner daemon connected");
        let session = Session::new(transport, Role::Server, mux);
        let closer = session.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => closer.close(CloseCode::GOING_AWAY, "server shutting down"),
                _ = closer.closed() => {}
            }
        });

        let service = Arc::new(DaemonService::new(broker, daemon.id));
        if let Err(err) = rpc::serve(session.clone(), service).await {
            tracing::warn!(error = %err, "provisioner daemon session failed");
            session.close(CloseCode::INTERNAL_ERROR, format!("serve: {err}"));
        }
        session.shutdown(CloseCode::NORMAL, "").await;
        tracing::info!("provisioner daemon disconnected");
    }
    .instrument(span)
    .await
}

pub async fn provisioner_daemon_serve(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let daemon = ProvisionerDaemon {
        id: Uuid::new_v4(),
        name: daemon_name(),
        provisioners: state.provisioner.provisioners().to_vec(),
        created_at: now(),
    };
    if let Err(err) = state.store.insert_provisioner_daemon(daemon.clone()).await {
        tracing::warn!(error = %err, "register provisioner daemon");
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error registering provisioner daemon.",
        );
    }

    let max = state.config.ws_max_message_bytes;
    let mux = state.agent_rpc.mux.clone();
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| {
            serve_daemon(
                state.provisioner.clone(),
                daemon,
                ws::transport(socket),
                mux,
                state.shutdown.child_token(),
            )
        })
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conduit_core::models::{JobType, STORAGE_METHOD_INLINE_ARCHIVE, TemplateVersion, TemplateVersionImportJob};
    use conduit_core::{Store, models::ProvisionerJob};
    use conduit_proto::provisionerd_v1::{AcquiredJob, UpdateJobResponse, completed_job};
    use conduit_wire::{RpcClient, memory_pair};

    use super::*;
    use crate::testutil::{Fixture, RecordingPublisher};

    fn import_job(fx: &Fixture) -> ProvisionerJob {
        let version = TemplateVersion {
            id: Uuid::new_v4(),
            template_id: None,
            organization_id: fx.org.id,
            name: "v1".to_string(),
            job_id: Uuid::new_v4(),
        };
        fx.store.insert_template_version(version.clone());
        let job = ProvisionerJob {
            id: version.job_id,
            created_at: now(),
            updated_at: now(),
            started_at: None,
            canceled_at: None,
            completed_at: None,
            error: None,
            organization_id: fx.org.id,
            initiator_id: fx.user.id,
            provisioner: "echo".to_string(),
            storage_method: STORAGE_METHOD_INLINE_ARCHIVE.to_string(),
            storage_source: Vec::new(),
            job_type: JobType::TemplateVersionImport,
            input: serde_json::to_vec(&TemplateVersionImportJob {
                template_version_id: version.id,
            })
            .unwrap(),
            worker_id: None,
        };
        fx.store.insert_provisioner_job(job.clone());
        job
    }

    #[test]
    fn daemon_names_are_random() {
        let a = daemon_name();
        assert!(a.starts_with("provisionerd-"));
        assert_eq!(a.len(), "provisionerd-".len() + 8);
        assert_ne!(a, daemon_name());
    }

    #[tokio::test]
    async fn daemon_runs_a_job_over_the_session() {
        let fx = Fixture::new();
        let job = import_job(&fx);
        let broker = Arc::new(ProvisionerBroker::new(
            fx.store.clone(),
            Arc::new(RecordingPublisher::default()),
            BrokerOptions {
                access_url: "https://dev.example.com".to_string(),
                provisioners: vec!["echo".to_string()],
            },
        ));
        let daemon = ProvisionerDaemon {
            id: Uuid::new_v4(),
            name: daemon_name(),
            provisioners: vec!["echo".to_string()],
            created_at: now(),
        };
        let (server_t, client_t) = memory_pair();
        let task = tokio::spawn(serve_daemon(
            broker,
            daemon,
            server_t,
            mux::Config::default(),
            CancellationToken::new(),
        ));
        let client = RpcClient::new(Session::client(client_t));

        let acquired: AcquiredJob = client.unary(ACQUIRE_JOB, &AcquireJobRequest {}).await.unwrap();
        assert_eq!(acquired.job_id, job.id.to_string());

        let mut updates = client.stream(UPDATE_JOB).await.unwrap();
        for _ in 0..3 {
            updates
                .send(&UpdateJobRequest {
                    job_id: job.id.to_string(),
                    logs: Vec::new(),
                })
                .await
                .unwrap();
            let resp: UpdateJobResponse = updates.recv().await.unwrap().unwrap();
            assert!(!resp.canceled);
        }
        updates.tx.finish().await.unwrap();
        assert!(updates.recv::<UpdateJobResponse>().await.unwrap().is_none());

        let _: conduit_proto::rpc::Empty = client
            .unary(
                COMPLETE_JOB,
                &CompletedJob {
                    job_id: job.id.to_string(),
                    r#type: Some(completed_job::Type::TemplateImport(Default::default())),
                },
            )
            .await
            .unwrap();
        let stored = fx.store.provisioner_job_by_id(job.id).await.unwrap();
        assert!(stored.completed_at.is_some());

        client.session().shutdown(CloseCode::NORMAL, "").await;
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn updates_for_foreign_jobs_end_the_stream_with_an_error() {
        let fx = Fixture::new();
        let job = import_job(&fx);
        let broker = Arc::new(ProvisionerBroker::new(
            fx.store.clone(),
            Arc::new(RecordingPublisher::default()),
            BrokerOptions {
                access_url: String::new(),
                provisioners: vec!["echo".to_string()],
            },
        ));
        // Another daemon holds the job.
        broker.acquire_job(Uuid::new_v4()).await.unwrap();

        let (server_t, client_t) = memory_pair();
        let service = Arc::new(DaemonService::new(broker, Uuid::new_v4()));
        tokio::spawn(rpc::serve(Session::server(server_t), service));
        let client = RpcClient::new(Session::client(client_t));

        let mut updates = client.stream(UPDATE_JOB).await.unwrap();
        updates
            .send(&UpdateJobRequest {
                job_id: job.id.to_string(),
                logs: Vec::new(),
            })
            .await
            .unwrap();
        let err = updates.recv::<UpdateJobResponse>().await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }
}
