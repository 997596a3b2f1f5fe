//! sg-daemon: Local SSH gateway daemon
//!
//! The daemon listens on a loopback port for SSH clients, resolves the
//! workspace named by the login through the editor-host brokers, opens an
//! authenticated session to the workspace (directly or through a WebSocket
//! tunnel) and bridges the two sessions channel by channel.

pub mod bridge;
pub mod broker;
pub mod ipc;
pub mod server;
pub mod state;
pub mod upstream;

pub use state::GatewayState;
