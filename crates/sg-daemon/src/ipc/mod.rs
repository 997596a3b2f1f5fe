//! Daemon IPC server
//!
//! Editor-host processes announce their broker endpoints here and query
//! the daemon's version and status.

mod server;

pub use server::DaemonIpcServer;
