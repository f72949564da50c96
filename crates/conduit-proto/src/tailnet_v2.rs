pub const COORDINATE: &str = "tailnet.v2.Tailnet/Coordinate";

/// Network description of one overlay participant.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Node {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub as_of_unix_ms: i64,
    #[prost(string, tag = "3")]
    pub key: ::prost::alloc::string::String,
    #[prost(int32, tag = "4")]
    pub preferred_relay: i32,
    /// Overlay addresses in CIDR form, e.g. `fd7a:115c:a1e0:ab12::1/128`.
    #[prost(string, repeated, tag = "5")]
    pub addresses: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Underlay `host:port` endpoints the node can be reached on.
    #[prost(string, repeated, tag = "6")]
    pub endpoints: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CoordinateRequest {
    #[prost(message, optional, tag = "1")]
    pub update_self: ::core::option::Option<coordinate_request::UpdateSelf>,
    #[prost(message, optional, tag = "2")]
    pub add_tunnel: ::core::option::Option<coordinate_request::Tunnel>,
    #[prost(message, optional, tag = "3")]
    pub remove_tunnel: ::core::option::Option<coordinate_request::Tunnel>,
    #[prost(message, optional, tag = "4")]
    pub disconnect: ::core::option::Option<coordinate_request::Disconnect>,
}

pub mod coordinate_request {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct UpdateSelf {
        #[prost(message, optional, tag = "1")]
        pub node: ::core::option::Option<super::Node>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Tunnel {
        #[prost(string, tag = "1")]
        pub id: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Disconnect {}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CoordinateResponse {
    #[prost(message, repeated, tag = "1")]
    pub peer_updates: ::prost::alloc::vec::Vec<coordinate_response::PeerUpdate>,
    #[prost(string, tag = "2")]
    pub error: ::prost::alloc::string::String,
}

pub mod coordinate_response {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PeerUpdate {
        #[prost(string, tag = "1")]
        pub id: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "2")]
        pub node: ::core::option::Option<super::Node>,
        #[prost(enumeration = "peer_update::Kind", tag = "3")]
        pub kind: i32,
        #[prost(string, tag = "4")]
        pub reason: ::prost::alloc::string::String,
    }

    pub mod peer_update {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum Kind {
            Unspecified = 0,
            Node = 1,
            Disconnected = 2,
            Lost = 3,
        }
    }
}
