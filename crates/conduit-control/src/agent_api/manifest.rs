use conduit_proto::agent_v2::{Manifest, WorkspaceAgentScript};
use tonic::Status;

use super::{AgentApi, internal};

impl AgentApi {
    pub(super) async fn manifest(&self) -> Result<Manifest, Status> {
        // Reload so directory/env edits made by a rebuild of the same agent row are visible.
        let agent = self
            .store
            .workspace_agent_by_id(self.agent.id)
            .await
            .map_err(|e| internal("get workspace agent", e))?;
        let scripts = self
            .store
            .workspace_agent_scripts(agent.id)
            .await
            .map_err(|e| internal("get workspace agent scripts", e))?;

        Ok(Manifest {
            agent_id: agent.id.to_string(),
            agent_name: agent.name,
            owner_username: self.owner.username.clone(),
            owner_email: self.owner.email.clone(),
            workspace_id: self.workspace.id.to_string(),
            workspace_name: self.workspace.name.clone(),
            directory: agent.directory,
            environment_variables: agent.env.into_iter().collect(),
            scripts: scripts
                .into_iter()
                .map(|s| WorkspaceAgentScript {
                    display_name: s.display_name,
                    script: s.script,
                    run_on_start: s.run_on_start,
                    run_on_stop: s.run_on_stop,
                    timeout_seconds: s.timeout_seconds,
                    log_path: s.log_path,
                })
                .collect(),
            access_url: self.opts.access_url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::models::WorkspaceAgentScript as ScriptRow;
    use conduit_proto::agent_v2::{GET_MANIFEST, GetManifestRequest};

    use super::*;
    use crate::agent_api::testing::ApiHarness;

    #[tokio::test]
    async fn manifest_describes_the_agent_and_its_workspace() {
        let h = ApiHarness::new();
        h.fx.store.insert_workspace_agent_script(ScriptRow {
            agent_id: h.fx.agent.id,
            display_name: "Startup".to_string(),
            script: "echo hello".to_string(),
            run_on_start: true,
            run_on_stop: false,
            timeout_seconds: 60,
            log_path: "/tmp/startup.log".to_string(),
        });

        let m: Manifest = h
            .client
            .unary(GET_MANIFEST, &GetManifestRequest {})
            .await
            .unwrap();
        assert_eq!(m.agent_id, h.fx.agent.id.to_string());
        assert_eq!(m.owner_username, "alice");
        assert_eq!(m.workspace_name, "dev");
        assert_eq!(m.directory, "/home/coder");
        assert_eq!(m.environment_variables.get("EDITOR").map(String::as_str), Some("vim"));
        assert_eq!(m.access_url, "https://dev.example.com");
        assert_eq!(m.scripts.len(), 1);
        assert!(m.scripts[0].run_on_start);
    }

    #[tokio::test]
    async fn store_failures_surface_as_internal_errors() {
        let h = ApiHarness::new();
        h.fx.store.fail_next("workspace_agent_scripts");
        let err = h
            .client
            .unary::<_, Manifest>(GET_MANIFEST, &GetManifestRequest {})
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        assert!(err.message().starts_with("get workspace agent scripts"));
    }
}
