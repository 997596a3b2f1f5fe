//! Daemon Lifecycle Manager
//!
//! Runs the gateway daemon as a detached process and decides from its exit
//! code whether to restart it.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use sg_core::config::HostConfig;
use sg_core::DaemonExit;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Failed to spawn daemon {executable:?}: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The daemon rejected its command line; restarting cannot help
    #[error("Daemon rejected its options")]
    InvalidOptions,

    #[error("Daemon kept failing after {restarts} restarts (last exit code: {last_code:?})")]
    RestartsExhausted {
        restarts: u32,
        last_code: Option<i32>,
    },
}

/// Starts one daemon process and waits for it to exit
#[async_trait]
pub trait DaemonSpawner: Send + Sync {
    /// Exit code of the process, `None` when it was killed by a signal
    async fn run_once(&self) -> Result<Option<i32>, LifecycleError>;
}

/// Spawns the daemon executable detached from the calling process
pub struct ProcessSpawner {
    executable: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(config.daemon_executable.clone(), config.daemon_args())
    }
}

#[async_trait]
impl DaemonSpawner for ProcessSpawner {
    async fn run_once(&self) -> Result<Option<i32>, LifecycleError> {
        let mut cmd = tokio::process::Command::new(&self.executable);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // own process group, so the daemon outlives the host's terminal
        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(windows)]
        {
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let spawn_error = |source| LifecycleError::Spawn {
            executable: self.executable.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_error)?;
        tracing::info!(
            pid = child.id().unwrap_or_default(),
            "Started daemon {:?}",
            self.executable
        );

        let status = child.wait().await.map_err(spawn_error)?;
        Ok(status.code())
    }
}

/// How a supervised daemon run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonOutcome {
    /// The daemon shut down cleanly
    Stopped,
    /// Another daemon instance already serves the port
    AlreadyServing,
}

/// Keeps the daemon running, restarting it a bounded number of times
pub struct DaemonSupervisor<S: DaemonSpawner> {
    spawner: S,
    max_restarts: u32,
    restart_delay: Duration,
}

impl<S: DaemonSpawner> DaemonSupervisor<S> {
    pub fn new(spawner: S, max_restarts: u32, restart_delay: Duration) -> Self {
        Self {
            spawner,
            max_restarts,
            restart_delay,
        }
    }

    /// Run the daemon until it exits in a way that needs no restart.
    ///
    /// Resolves only when the daemon has exited, so callers normally spawn
    /// this on a background task.
    pub async fn ensure_started(&self) -> Result<DaemonOutcome, LifecycleError> {
        let mut restarts = 0;

        loop {
            let code = self.spawner.run_once().await?;

            match code.map(DaemonExit::from_code) {
                Some(DaemonExit::Ok) => {
                    tracing::info!("Daemon stopped");
                    return Ok(DaemonOutcome::Stopped);
                }
                Some(DaemonExit::ListenPortFailed) => {
                    tracing::info!("Daemon port already served by another instance");
                    return Ok(DaemonOutcome::AlreadyServing);
                }
                Some(DaemonExit::InvalidOptions) => {
                    tracing::error!("Daemon rejected its options");
                    return Err(LifecycleError::InvalidOptions);
                }
                Some(DaemonExit::UnexpectedError) | None => {}
            }

            if restarts >= self.max_restarts {
                tracing::error!(restarts, last_code = ?code, "Giving up on daemon");
                return Err(LifecycleError::RestartsExhausted {
                    restarts,
                    last_code: code,
                });
            }

            restarts += 1;
            tracing::warn!(
                exit_code = ?code,
                restart = restarts,
                max_restarts = self.max_restarts,
                "Daemon exited unexpectedly, restarting in {:?}",
                self.restart_delay
            );
            tokio::time::sleep(self.restart_delay).await;
        }
    }
}

impl DaemonSupervisor<ProcessSpawner> {
    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(
            ProcessSpawner::from_config(config),
            config.max_restarts,
            config.restart_delay,
        )
    }
}
