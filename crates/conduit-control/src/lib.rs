//! The conduit control plane: agent RPC sessions, the server's overlay node and app proxy, and
//! the provisioner job broker.

pub mod agent_api;
pub mod agent_rpc;
pub mod config;
pub mod error;
pub mod monitor;
pub mod provisionerd;
pub mod pubsub;
pub mod routes;
pub mod state;
pub mod tailnet;
pub mod ws;

#[cfg(test)]
mod testutil;
