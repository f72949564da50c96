pub const ACQUIRE_JOB: &str = "provisionerd.v1.ProvisionerDaemon/AcquireJob";
pub const UPDATE_JOB: &str = "provisionerd.v1.ProvisionerDaemon/UpdateJob";
pub const CANCEL_JOB: &str = "provisionerd.v1.ProvisionerDaemon/CancelJob";
pub const FAIL_JOB: &str = "provisionerd.v1.ProvisionerDaemon/FailJob";
pub const COMPLETE_JOB: &str = "provisionerd.v1.ProvisionerDaemon/CompleteJob";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ParameterDestination {
    EnvironmentVariable = 0,
    ProvisionerVariable = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParameterValue {
    #[prost(enumeration = "ParameterDestination", tag = "1")]
    pub destination: i32,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub value: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParameterSchema {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub description: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "3")]
    pub default_source_value: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bool, tag = "4")]
    pub allow_override_source: bool,
    #[prost(enumeration = "ParameterDestination", tag = "5")]
    pub destination: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metadata {
    #[prost(string, tag = "1")]
    pub access_url: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub workspace_transition: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub workspace_name: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub workspace_owner: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub workspace_id: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub workspace_owner_id: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub template_name: ::prost::alloc::string::String,
    #[prost(string, tag = "8")]
    pub template_version: ::prost::alloc::string::String,
    #[prost(string, tag = "9")]
    pub organization_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AcquireJobRequest {}

/// An empty `job_id` means no job was available.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AcquiredJob {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub created_at_unix_ms: i64,
    #[prost(string, tag = "3")]
    pub provisioner: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub user_name: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "5")]
    pub template_source_archive: ::prost::alloc::vec::Vec<u8>,
    #[prost(oneof = "acquired_job::Type", tags = "6, 7")]
    pub r#type: ::core::option::Option<acquired_job::Type>,
}

pub mod acquired_job {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WorkspaceBuild {
        #[prost(string, tag = "1")]
        pub workspace_build_id: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub workspace_name: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "3")]
        pub parameter_values: ::prost::alloc::vec::Vec<super::ParameterValue>,
        #[prost(bytes = "vec", tag = "4")]
        pub state: ::prost::alloc::vec::Vec<u8>,
        #[prost(message, optional, tag = "5")]
        pub metadata: ::core::option::Option<super::Metadata>,
        #[prost(bool, tag = "6")]
        pub dry_run: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TemplateImport {
        #[prost(string, tag = "1")]
        pub template_version_id: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "2")]
        pub metadata: ::core::option::Option<super::Metadata>,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "6")]
        WorkspaceBuild(WorkspaceBuild),
        #[prost(message, tag = "7")]
        TemplateImport(TemplateImport),
    }
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
    #[prost(string, tag = "1")]
    pub source: ::prost::alloc::string::String,
    #[prost(enumeration = "LogLevel", tag = "2")]
    pub level: i32,
    #[prost(int64, tag = "3")]
    pub created_at_unix_ms: i64,
    #[prost(string, tag = "4")]
    pub stage: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub output: ::prost::alloc::string::String,
}

/// One frame of the streaming `UpdateJob` call. Each frame is answered with an
/// [`UpdateJobResponse`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateJobRequest {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub logs: ::prost::alloc::vec::Vec<Log>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateJobResponse {
    #[prost(bool, tag = "1")]
    pub canceled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelJobRequest {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub error: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FailJobRequest {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub error: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Agent {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub auth_token: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub directory: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "4")]
    pub env: ::std::collections::HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
    #[prost(string, tag = "5")]
    pub operating_system: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub architecture: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub startup_script: ::prost::alloc::string::String,
    #[prost(int32, tag = "8")]
    pub connection_timeout_seconds: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resource {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub r#type: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub agents: ::prost::alloc::vec::Vec<Agent>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompletedJob {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    #[prost(oneof = "completed_job::Type", tags = "2, 3")]
    pub r#type: ::core::option::Option<completed_job::Type>,
}

pub mod completed_job {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WorkspaceBuild {
        #[prost(bytes = "vec", tag = "1")]
        pub state: ::prost::alloc::vec::Vec<u8>,
        #[prost(message, repeated, tag = "2")]
        pub resources: ::prost::alloc::vec::Vec<super::Resource>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TemplateImport {
        #[prost(message, repeated, tag = "1")]
        pub parameter_schemas: ::prost::alloc::vec::Vec<super::ParameterSchema>,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "2")]
        WorkspaceBuild(WorkspaceBuild),
        #[prost(message, tag = "3")]
        TemplateImport(TemplateImport),
    }
}
