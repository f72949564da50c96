pub const GET_MANIFEST: &str = "agent.v2.Agent/GetManifest";
pub const UPDATE_STATS: &str = "agent.v2.Agent/UpdateStats";
pub const BATCH_CREATE_LOGS: &str = "agent.v2.Agent/BatchCreateLogs";
pub const GET_EXTERNAL_AUTH: &str = "agent.v2.Agent/GetExternalAuth";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetManifestRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Manifest {
    #[prost(string, tag = "1")]
    pub agent_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub agent_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub owner_username: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub workspace_id: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub workspace_name: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub directory: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "7")]
    pub environment_variables:
        ::std::collections::HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "8")]
    pub scripts: ::prost::alloc::vec::Vec<WorkspaceAgentScript>,
    #[prost(string, tag = "9")]
    pub access_url: ::prost::alloc::string::String,
    #[prost(string, tag = "10")]
    pub owner_email: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkspaceAgentScript {
    #[prost(string, tag = "1")]
    pub display_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub script: ::prost::alloc::string::String,
    #[prost(bool, tag = "3")]
    pub run_on_start: bool,
    #[prost(bool, tag = "4")]
    pub run_on_stop: bool,
    #[prost(int32, tag = "5")]
    pub timeout_seconds: i32,
    #[prost(string, tag = "6")]
    pub log_path: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Stats {
    #[prost(map = "string, int64", tag = "1")]
    pub connections_by_proto: ::std::collections::HashMap<::prost::alloc::string::String, i64>,
    #[prost(int64, tag = "2")]
    pub connection_count: i64,
    #[prost(int64, tag = "3")]
    pub rx_packets: i64,
    #[prost(int64, tag = "4")]
    pub rx_bytes: i64,
    #[prost(int64, tag = "5")]
    pub tx_packets: i64,
    #[prost(int64, tag = "6")]
    pub tx_bytes: i64,
    #[prost(int64, tag = "7")]
    pub session_count_ssh: i64,
    #[prost(int64, tag = "8")]
    pub session_count_vscode: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateStatsRequest {
    #[prost(message, optional, tag = "1")]
    pub stats: ::core::option::Option<Stats>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateStatsResponse {
    #[prost(int64, tag = "1")]
    pub report_interval_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Log {
    #[prost(int64, tag = "1")]
    pub created_at_unix_ms: i64,
    #[prost(string, tag = "2")]
    pub output: ::prost::alloc::string::String,
    #[prost(enumeration = "LogLevel", tag = "3")]
    pub level: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchCreateLogsRequest {
    #[prost(message, repeated, tag = "1")]
    pub logs: ::prost::alloc::vec::Vec<Log>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchCreateLogsResponse {
    #[prost(bool, tag = "1")]
    pub log_limit_exceeded: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetExternalAuthRequest {
    /// Provider id. When empty, `match_url` selects the provider.
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub match_url: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetExternalAuthResponse {
    #[prost(string, tag = "1")]
    pub provider_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub provider_type: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub access_token: ::prost::alloc::string::String,
    /// Where the owner has to authenticate when no token is linked yet.
    #[prost(string, tag = "4")]
    pub url: ::prost::alloc::string::String,
}
