//! Virtual commands: in-process handlers that run where a child process
//! otherwise would, including transparently inside pipelines.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::builtins;

/// Call context handed to every virtual command.
#[derive(Debug)]
pub struct VirtualContext {
    pub args: Vec<String>,
    /// Collected input bytes, when the invocation had any (a pipeline feed
    /// or a `stdin: bytes` option). `None` means "no input", not "empty".
    pub stdin: Option<Vec<u8>>,
    pub cwd: PathBuf,
    /// Replacement environment, when the invocation set one.
    pub env: Option<HashMap<String, String>>,
    /// Cancelled when the runner is killed; long-running handlers should
    /// race against it.
    pub cancel: CancellationToken,
}

impl VirtualContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Collected stdin decoded as UTF-8 (lossily), empty when absent.
    pub fn stdin_text(&self) -> String {
        match &self.stdin {
            Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            None => String::new(),
        }
    }
}

/// What a unary virtual command returns.
#[derive(Debug, Clone, Default)]
pub struct VirtualOutput {
    pub code: i32,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

impl VirtualOutput {
    pub fn ok() -> Self {
        VirtualOutput::default()
    }

    pub fn with_stdout(stdout: impl Into<Vec<u8>>) -> Self {
        VirtualOutput {
            code: 0,
            stdout: Some(stdout.into()),
            stderr: None,
        }
    }

    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        VirtualOutput {
            code,
            stdout: None,
            stderr: Some(message.into().into_bytes()),
        }
    }
}

/// A virtual command that computes its whole result in one call.
#[async_trait]
pub trait VirtualCommand: Send + Sync {
    async fn call(&self, ctx: VirtualContext) -> std::io::Result<VirtualOutput>;
}

/// A lazy byte sequence; the streaming side of a virtual command.
///
/// The runner races `next_chunk` against its cancellation token and calls
/// `cancel` when a consumer goes away, so implementations get a chance to
/// release whatever the sequence was reading from.
#[async_trait]
pub trait ByteSource: Send {
    async fn next_chunk(&mut self) -> Option<std::io::Result<Vec<u8>>>;

    async fn cancel(&mut self) {}
}

/// A virtual command whose stdout is produced lazily, chunk by chunk.
pub trait StreamingCommand: Send + Sync {
    fn open(&self, ctx: VirtualContext) -> Box<dyn ByteSource>;
}

/// Registered handler, in either shape.
pub(crate) enum Handler {
    Unary(Arc<dyn VirtualCommand>),
    Streaming(Arc<dyn StreamingCommand>),
}

impl Clone for Handler {
    fn clone(&self) -> Self {
        match self {
            Handler::Unary(h) => Handler::Unary(h.clone()),
            Handler::Streaming(h) => Handler::Streaming(h.clone()),
        }
    }
}

pub(crate) struct FnCommand<F>(pub F);

#[async_trait]
impl<F, Fut> VirtualCommand for FnCommand<F>
where
    F: Fn(VirtualContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::io::Result<VirtualOutput>> + Send + 'static,
{
    async fn call(&self, ctx: VirtualContext) -> std::io::Result<VirtualOutput> {
        (self.0)(ctx).await
    }
}

static REGISTRY: LazyLock<RwLock<HashMap<String, Handler>>> =
    LazyLock::new(|| RwLock::new(builtins::defaults()));
static ENABLED: AtomicBool = AtomicBool::new(true);

/// Commands whose semantics depend on reading a real pipe; when the caller
/// asked for `stdin: pipe` or supplied stdin bytes, these fall back to a
/// real process.
const NEEDS_REAL_STDIN: &[&str] = &["cat", "sleep"];

/// Register a closure as a virtual command.
pub fn register<F, Fut>(name: &str, handler: F)
where
    F: Fn(VirtualContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::io::Result<VirtualOutput>> + Send + 'static,
{
    register_command(name, Arc::new(FnCommand(handler)));
}

/// Register a [`VirtualCommand`] implementation.
pub fn register_command(name: &str, handler: Arc<dyn VirtualCommand>) {
    REGISTRY
        .write()
        .unwrap()
        .insert(name.to_string(), Handler::Unary(handler));
}

/// Register a [`StreamingCommand`] implementation.
pub fn register_streaming(name: &str, handler: Arc<dyn StreamingCommand>) {
    REGISTRY
        .write()
        .unwrap()
        .insert(name.to_string(), Handler::Streaming(handler));
}

/// Remove a registration. Returns whether the name was registered.
pub fn unregister(name: &str) -> bool {
    REGISTRY.write().unwrap().remove(name).is_some()
}

/// Registered command names, sorted.
pub fn list_commands() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY.read().unwrap().keys().cloned().collect();
    names.sort();
    names
}

pub fn enable_virtual_commands() {
    ENABLED.store(true, Ordering::SeqCst);
}

pub fn disable_virtual_commands() {
    ENABLED.store(false, Ordering::SeqCst);
}

pub(crate) fn enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

pub(crate) fn lookup(name: &str) -> Option<Handler> {
    REGISTRY.read().unwrap().get(name).cloned()
}

pub(crate) fn needs_real_process_for_stdin(name: &str) -> bool {
    NEEDS_REAL_STDIN.contains(&name)
}

/// Restore the default registrations and re-enable dispatch.
pub(crate) fn reset_registry() {
    *REGISTRY.write().unwrap() = builtins::defaults();
    ENABLED.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_invoke_closure() {
        register("shout", |ctx: VirtualContext| async move {
            Ok(VirtualOutput::with_stdout(
                ctx.args.join(" ").to_uppercase() + "\n",
            ))
        });
        let Handler::Unary(handler) = lookup("shout").expect("registered") else {
            panic!("expected unary handler");
        };
        let out = handler
            .call(VirtualContext {
                args: vec!["hey".to_string()],
                stdin: None,
                cwd: std::env::temp_dir(),
                env: None,
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(out.code, 0);
        assert_eq!(out.stdout.as_deref(), Some(b"HEY\n".as_ref()));
        assert!(unregister("shout"));
        assert!(!unregister("shout"));
    }

    #[test]
    fn test_defaults_are_registered() {
        let names = list_commands();
        for builtin in ["cd", "pwd", "echo", "cat", "sleep", "true", "false", "exit"] {
            assert!(names.iter().any(|n| n == builtin), "missing {builtin}");
        }
    }

    #[test]
    fn test_needs_real_stdin_set() {
        assert!(needs_real_process_for_stdin("cat"));
        assert!(needs_real_process_for_stdin("sleep"));
        assert!(!needs_real_process_for_stdin("echo"));
    }
}
