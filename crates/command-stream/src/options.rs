//! Per-invocation options.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::output::AnsiOverride;

/// Where the child's stdin comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StdinMode {
    /// Forward the parent's stdin (the tty itself when the parent is
    /// interactive, a pump otherwise).
    #[default]
    Inherit,
    /// Close stdin immediately.
    Ignore,
    /// Leave stdin open for manual writing through the runner's stdin
    /// handle. The caller is responsible for closing it.
    Pipe,
    /// Write the given bytes and close.
    Bytes(Vec<u8>),
}

impl From<String> for StdinMode {
    fn from(value: String) -> Self {
        StdinMode::Bytes(value.into_bytes())
    }
}

impl From<&str> for StdinMode {
    fn from(value: &str) -> Self {
        StdinMode::Bytes(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for StdinMode {
    fn from(value: Vec<u8>) -> Self {
        StdinMode::Bytes(value)
    }
}

/// Options for one invocation.
///
/// The defaults mirror child output to the parent's streams and capture it
/// into the result, the way an interactive shell feels.
#[derive(Debug, Clone)]
pub struct Options {
    /// Copy child output to the parent's stdout/stderr.
    pub mirror: bool,
    /// Accumulate child output into the result buffers.
    pub capture: bool,
    pub stdin: StdinMode,
    /// Working directory for the child; inherits the process cwd when unset.
    pub cwd: Option<PathBuf>,
    /// Environment for the child; replaces the inherited environment when
    /// set.
    pub env: Option<HashMap<String, String>>,
    /// Attach the child directly to the controlling terminal (no pumping,
    /// no capture, no mirror). Only honored when all three parent streams
    /// are ttys.
    pub interactive: bool,
    /// Let the mini parser split on `&&`, `;`, `||`, `( … )`.
    pub shell_operators: bool,
    /// External cancellation handle; aborting it kills the runner with TERM.
    pub cancel: Option<CancellationToken>,
    /// Per-invocation override of the global output policy.
    pub ansi: Option<AnsiOverride>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            mirror: true,
            capture: true,
            stdin: StdinMode::Inherit,
            cwd: None,
            env: None,
            interactive: false,
            shell_operators: true,
            cancel: None,
            ansi: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mirror(mut self, on: bool) -> Self {
        self.mirror = on;
        self
    }

    pub fn capture(mut self, on: bool) -> Self {
        self.capture = on;
        self
    }

    pub fn stdin(mut self, stdin: impl Into<StdinMode>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn interactive(mut self, on: bool) -> Self {
        self.interactive = on;
        self
    }

    pub fn shell_operators(mut self, on: bool) -> Self {
        self.shell_operators = on;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn ansi(mut self, ansi: AnsiOverride) -> Self {
        self.ansi = Some(ansi);
        self
    }
}
