//! sg-host: the editor-host side of the SSH gateway
//!
//! Each editor window runs a broker server that answers the daemon's
//! credential lookups, announces it to the daemon, and keeps the daemon
//! process alive through the lifecycle manager.

pub mod broker_server;
pub mod daemon_client;
pub mod lifecycle;
pub mod version;

pub use broker_server::{AuthInfoProvider, HostBrokerServer, LogTelemetry, ProviderError, TelemetrySink};
pub use daemon_client::DaemonClient;
pub use lifecycle::{DaemonOutcome, DaemonSpawner, DaemonSupervisor, LifecycleError, ProcessSpawner};
pub use version::{check_daemon_version, check_running_daemon, VersionCheck};
