//! sg-core: Shared abstractions for the local SSH gateway
//!
//! This crate provides the domain types, failure taxonomy, configuration
//! structures and IPC messages used by the gateway daemon and by the
//! editor-host processes that supervise it.

pub mod config;
pub mod error;
pub mod exit;
pub mod ipc;
pub mod retry;
pub mod types;
pub mod version;

pub use error::{ConfigError, DisconnectKind, FailureCode, FailureContext, FailureRecord, IpcError};
pub use exit::DaemonExit;
pub use retry::RetryPolicy;
pub use types::{HostId, WorkspaceAuthInfo, WorkspaceId, WorkspacePhase};

/// Version of the gateway daemon and its IPC surface
pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");
