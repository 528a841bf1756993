//! Library error type.

use crate::result::ExecResult;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A command exited non-zero while `errexit` was set.
    #[error("command exited with code {code}")]
    NonZeroExit { code: i32, result: ExecResult },

    /// A pipeline stage exited non-zero while `pipefail` was set.
    #[error("pipeline stage {stage} exited with code {code}")]
    PipelineStageFailed {
        stage: usize,
        code: i32,
        result: ExecResult,
    },

    /// A blocking run was requested on a runner that already started.
    #[error("runner already started")]
    AlreadyStarted,

    /// A blocking run was requested from inside an async runtime.
    #[error("blocking run inside an async runtime; await the runner instead")]
    BlockingInAsyncContext,

    #[error("failed to spawn '{command}'")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The exit code carried by policy errors, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::NonZeroExit { code, .. } | Error::PipelineStageFailed { code, .. } => {
                Some(*code)
            }
            _ => None,
        }
    }

    /// The captured stdout of the failed invocation, if any.
    pub fn stdout(&self) -> Option<&[u8]> {
        self.result().and_then(|r| r.stdout.as_deref())
    }

    /// The captured stderr of the failed invocation, if any.
    pub fn stderr(&self) -> Option<&[u8]> {
        self.result().and_then(|r| r.stderr.as_deref())
    }

    /// The full result of the failed invocation, if any.
    pub fn result(&self) -> Option<&ExecResult> {
        match self {
            Error::NonZeroExit { result, .. } | Error::PipelineStageFailed { result, .. } => {
                Some(result)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
