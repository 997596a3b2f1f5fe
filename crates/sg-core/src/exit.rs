//! Daemon process exit codes

/// Exit status of the gateway daemon process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    /// Clean shutdown (idle grace elapsed, shutdown request, signal)
    Ok,
    /// The local listener could not be bound, usually because another
    /// daemon instance already serves the port
    ListenPortFailed,
    /// Any other fatal error
    UnexpectedError,
    /// Command line could not be parsed
    InvalidOptions,
}

impl DaemonExit {
    pub fn code(self) -> i32 {
        match self {
            DaemonExit::Ok => 0,
            DaemonExit::ListenPortFailed => 100,
            DaemonExit::UnexpectedError => 101,
            DaemonExit::InvalidOptions => 102,
        }
    }

    /// Map a raw exit code back. Unknown codes count as unexpected errors.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => DaemonExit::Ok,
            100 => DaemonExit::ListenPortFailed,
            102 => DaemonExit::InvalidOptions,
            _ => DaemonExit::UnexpectedError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(DaemonExit::Ok.code(), 0);
        assert_eq!(DaemonExit::ListenPortFailed.code(), 100);
        assert_eq!(DaemonExit::UnexpectedError.code(), 101);
        assert_eq!(DaemonExit::InvalidOptions.code(), 102);
    }

    #[test]
    fn test_unknown_code_is_unexpected() {
        assert_eq!(DaemonExit::from_code(100), DaemonExit::ListenPortFailed);
        assert_eq!(DaemonExit::from_code(1), DaemonExit::UnexpectedError);
        assert_eq!(DaemonExit::from_code(-1), DaemonExit::UnexpectedError);
    }
}
