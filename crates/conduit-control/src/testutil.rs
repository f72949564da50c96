use std::{collections::BTreeMap, sync::Arc};

use conduit_core::{
    MemStore,
    events::{Publisher, WorkspaceEvent, WorkspaceEventKind},
    models::{
        BuildTransition, Organization, Template, User, Workspace, WorkspaceAgent, WorkspaceBuild,
        WorkspaceResource,
    },
    now,
};
use parking_lot::Mutex;
use uuid::Uuid;

/// One user owning one workspace whose latest build has a single agent.
pub struct Fixture {
    pub store: Arc<MemStore>,
    pub user: User,
    pub org: Organization,
    pub template: Template,
    pub workspace: Workspace,
    pub build: WorkspaceBuild,
    pub agent: WorkspaceAgent,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(MemStore::new());
        let user = User {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
        };
        let org = Organization {
            id: Uuid::new_v4(),
            name: "acme".to_string(),
        };
        let template = Template {
            id: Uuid::new_v4(),
            organization_id: org.id,
            name: "docker".to_string(),
            provisioner: "echo".to_string(),
        };
        let workspace = Workspace {
            id: Uuid::new_v4(),
            owner_id: user.id,
            organization_id: org.id,
            template_id: template.id,
            name: "dev".to_string(),
            deleted: false,
        };
        let build = WorkspaceBuild {
            id: Uuid::new_v4(),
            workspace_id: workspace.id,
            template_version_id: Uuid::new_v4(),
            build_number: 1,
            transition: BuildTransition::Start,
            initiator_id: user.id,
            job_id: Uuid::new_v4(),
            provisioner_state: Vec::new(),
            created_at: now(),
            updated_at: now(),
        };
        let resource = WorkspaceResource {
            id: Uuid::new_v4(),
            job_id: build.job_id,
            transition: BuildTransition::Start,
            resource_type: "docker_container".to_string(),
            name: "main".to_string(),
            created_at: now(),
        };
        let agent = WorkspaceAgent {
            id: Uuid::new_v4(),
            name: "main".to_string(),
            resource_id: resource.id,
            auth_token: Uuid::new_v4(),
            directory: "/home/coder".to_string(),
            env: BTreeMap::from([("EDITOR".to_string(), "vim".to_string())]),
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            first_connected_at: None,
            last_connected_at: None,
            disconnected_at: None,
            last_connected_replica_id: None,
            connection_timeout_seconds: 120,
            logs_length: 0,
            logs_overflowed: false,
            created_at: now(),
            updated_at: now(),
        };

        store.insert_user(user.clone());
        store.insert_organization(org.clone());
        store.insert_template(template.clone());
        store.insert_workspace(workspace.clone());
        store.insert_workspace_build(build.clone());
        store.insert_workspace_resource(resource);
        store.insert_workspace_agent(agent.clone());

        Self {
            store,
            user,
            org,
            template,
            workspace,
            build,
            agent,
        }
    }

    /// Adds a newer build so the fixture's agent no longer belongs to the latest one.
    pub fn supersede_build(&self) -> WorkspaceBuild {
        let next = WorkspaceBuild {
            id: Uuid::new_v4(),
            build_number: self.build.build_number + 1,
            job_id: Uuid::new_v4(),
            ..self.build.clone()
        };
        self.store.insert_workspace_build(next.clone());
        next
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<WorkspaceEvent>>,
}

impl RecordingPublisher {
    pub fn count(&self, kind: WorkspaceEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, event: WorkspaceEvent) {
        self.events.lock().push(event);
    }
}
