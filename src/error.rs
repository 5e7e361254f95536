//! The ambient error type mapping every fallible, non-asserted failure in the crate to one of the
//! exit codes documented for the `rpctrace` binary: 0 on success, 1 for file/exec errors, 2 for
//! kernel/child errors.
//!
//! Assertion violations (broken wrapper invariants, an unrecognized descriptor kind from the
//! kernel) are deliberately *not* representable here: per the core's error handling design, those
//! are program bugs and abort the process rather than unwind through a `Result`.

use std::path::PathBuf;
use thiserror::Error;

/// Failures that can occur while resolving and launching the traced child.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The command wasn't found on `PATH` and wasn't a direct path to an executable.
    #[error("command not found: {0}")]
    CommandNotFound(PathBuf),

    /// A kernel call involved in creating or exec'ing the child task failed.
    #[error("{operation} failed: {kern_return:#x}")]
    Kernel {
        /// Which step failed, for the diagnostic shown to the user (e.g. `"task_create"`).
        operation: &'static str,
        /// The raw `kern_return_t` the kernel handed back.
        kern_return: i32,
    },

    /// `posix_spawn` (or the underlying libc call) itself failed.
    #[error("posix_spawn failed: {0}")]
    PosixSpawn(#[source] std::io::Error),
}

/// Top-level error type for the `rpctrace` binary.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Spawning the traced child failed.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Opening the `-o FILE` trace output failed.
    #[error("could not open trace output file: {0}")]
    Io(#[from] std::io::Error),

    /// A kernel call made by the forward loop failed in a way that is reported rather than
    /// asserted (currently unused by the loop itself, which asserts; reserved for future
    /// primitives that may legitimately fail, e.g. `waitpid`).
    #[error("kernel call failed: {0}")]
    Kernel(String),

    /// A CLI argument was invalid in a way `clap` itself doesn't catch (e.g. no command given).
    #[error("{0}")]
    Cli(String),
}

impl TraceError {
    /// The process exit code for this error: 1 for file/exec errors, 2 for kernel/child errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            TraceError::Spawn(SpawnError::CommandNotFound(_)) => 1,
            TraceError::Spawn(_) => 2,
            TraceError::Io(_) => 1,
            TraceError::Kernel(_) => 2,
            TraceError::Cli(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            TraceError::Spawn(SpawnError::CommandNotFound("foo".into())).exit_code(),
            1
        );
        assert_eq!(
            TraceError::Spawn(SpawnError::Kernel {
                operation: "task_create",
                kern_return: 5,
            })
            .exit_code(),
            2
        );
        assert_eq!(
            TraceError::Io(io::Error::new(io::ErrorKind::NotFound, "nope")).exit_code(),
            1
        );
        assert_eq!(TraceError::Cli("no command given".into()).exit_code(), 1);
    }
}
