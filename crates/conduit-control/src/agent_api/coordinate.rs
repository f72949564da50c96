use conduit_proto::tailnet_v2::{
    CoordinateRequest, coordinate_request::Disconnect,
};
use conduit_wire::rpc::{CallSender, ServerCall};
use tonic::Status;

use super::AgentApi;
use crate::tailnet::{PeerKind, coordinator::PeerStream};

impl AgentApi {
    /// Relays between the agent and the coordinator until either side ends. The agent leaves the
    /// coordinator gracefully when it finishes its side of the call, and as lost when the session
    /// goes away under it.
    pub(super) async fn coordinate(
        &self,
        mut call: ServerCall,
        tx: &mut CallSender,
    ) -> Result<(), Status> {
        let PeerStream {
            requests,
            mut responses,
        } = self
            .coordinator
            .load()
            .coordinate(self.agent.id, &self.agent.name, PeerKind::Agent);
        let cancel = call.cancelled();
        tracing::debug!(agent_id = %self.agent.id, "agent joined coordinator");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                req = call.recv::<CoordinateRequest>() => {
                    let Some(req) = req? else {
                        let _ = requests
                            .send(CoordinateRequest {
                                disconnect: Some(Disconnect {}),
                                ..Default::default()
                            })
                            .await;
                        return Ok(());
                    };
                    let disconnect = req.disconnect.is_some();
                    if requests.send(req).await.is_err() {
                        return Err(Status::unavailable("coordinator closed"));
                    }
                    if disconnect {
                        return Ok(());
                    }
                }
                resp = responses.recv() => match resp {
                    Some(resp) => tx.send(&resp).await?,
                    None => return Err(Status::unavailable("coordinator closed")),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conduit_proto::tailnet_v2::{
        COORDINATE, CoordinateResponse, Node, coordinate_request::UpdateSelf,
        coordinate_response::peer_update::Kind,
    };
    use uuid::Uuid;

    use super::*;
    use crate::{
        agent_api::testing::ApiHarness,
        tailnet::{Coordinator, MultiAgentConn, coordinator::PeerConn},
    };

    fn node(id: Uuid) -> Node {
        Node {
            id: id.to_string(),
            addresses: vec!["fd7a:115c:a1e0::1/128".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn agent_nodes_reach_subscribed_clients_and_departures_are_seen() {
        let h = ApiHarness::new();
        let agent_id = h.fx.agent.id;
        let client = PeerConn::new(h.coordinator.coordinate(
            Uuid::new_v4(),
            "client",
            PeerKind::Client,
        ));
        client.subscribe_agent(agent_id).await.unwrap();

        let mut call = h.client.stream(COORDINATE).await.unwrap();
        call.send(&CoordinateRequest {
            update_self: Some(UpdateSelf {
                node: Some(node(agent_id)),
            }),
            ..Default::default()
        })
        .await
        .unwrap();

        let never = tokio_util::sync::CancellationToken::new();
        let resp = tokio::time::timeout(Duration::from_secs(5), client.next_update(&never))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.peer_updates[0].id, agent_id.to_string());
        assert_eq!(resp.peer_updates[0].kind, Kind::Node as i32);

        call.tx.finish().await.unwrap();
        let resp = tokio::time::timeout(Duration::from_secs(5), client.next_update(&never))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.peer_updates[0].kind, Kind::Disconnected as i32);
    }

    #[tokio::test]
    async fn agent_receives_client_nodes() {
        let h = ApiHarness::new();
        let agent_id = h.fx.agent.id;
        let mut call = h.client.stream(COORDINATE).await.unwrap();
        call.send(&CoordinateRequest::default()).await.unwrap();
        // Wait for the agent to be registered before the client tunnels to it.
        for _ in 0..100 {
            if !h.coordinator.peers(PeerKind::Agent).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let client_id = Uuid::new_v4();
        let client = PeerConn::new(h.coordinator.coordinate(client_id, "client", PeerKind::Client));
        client.update_self(node(client_id)).await.unwrap();
        client.subscribe_agent(agent_id).await.unwrap();

        let resp: CoordinateResponse = tokio::time::timeout(Duration::from_secs(5), call.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(resp.peer_updates[0].id, client_id.to_string());
    }
}
