//! Terminal result of one invocation.

use serde::Serialize;

/// What a finished runner produced.
///
/// `code` is always populated; the byte buffers are present only when the
/// corresponding capture was on. Signal-terminated children report the
/// POSIX-style code for the signal (INT → 130, TERM → 143, KILL → 137).
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<Vec<u8>>,
}

impl ExecResult {
    pub(crate) fn from_code(code: i32) -> Self {
        ExecResult {
            code,
            stdout: None,
            stderr: None,
            stdin: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Captured stdout decoded as UTF-8 (lossily).
    pub fn text(&self) -> String {
        decode(self.stdout.as_deref())
    }

    /// Captured stderr decoded as UTF-8 (lossily).
    pub fn stderr_text(&self) -> String {
        decode(self.stderr.as_deref())
    }
}

fn decode(bytes: Option<&[u8]>) -> String {
    match bytes {
        Some(b) => String::from_utf8_lossy(b).into_owned(),
        None => String::new(),
    }
}
