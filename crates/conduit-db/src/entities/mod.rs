pub mod external_auth_links;
pub mod organizations;
pub mod parameter_schemas;
pub mod parameter_values;
pub mod provisioner_daemons;
pub mod provisioner_job_logs;
pub mod provisioner_jobs;
pub mod runtime_config;
pub mod template_versions;
pub mod templates;
pub mod users;
pub mod workspace_agent_logs;
pub mod workspace_agent_scripts;
pub mod workspace_agent_stats;
pub mod workspace_agents;
pub mod workspace_builds;
pub mod workspace_resources;
pub mod workspaces;
