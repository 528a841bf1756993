//! Interrupt supervision across all in-flight runners.
//!
//! Runners join a process-global active set at construction and leave it
//! exactly once during cleanup. While the set is non-empty a SIGINT listener
//! forwards interrupts: real children get the signal on their process group,
//! virtual commands get cancelled through their token. Whether a forwarded
//! interrupt then terminates the host is a policy flag, since a library has
//! no way to enumerate whatever other interrupt handling the embedding
//! process carries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::io::{self, ParentStream};
use crate::runner::RunnerInner;

/// Signals the runner knows how to deliver and map to exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Int,
    Term,
    Kill,
}

impl Signal {
    /// The POSIX-style exit code for a child killed by this signal.
    pub fn exit_code(self) -> i32 {
        match self {
            Signal::Int => 130,
            Signal::Term => 143,
            Signal::Kill => 137,
        }
    }

    #[cfg(unix)]
    pub(crate) fn raw(self) -> i32 {
        match self {
            Signal::Int => libc::SIGINT,
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

static ACTIVE: Mutex<Vec<Weak<RunnerInner>>> = Mutex::new(Vec::new());
static LISTENER: Mutex<Option<tokio::task::JoinHandle<()>>> = Mutex::new(None);
static INTERRUPT_EXIT: AtomicBool = AtomicBool::new(true);

pub(crate) fn register(inner: &Arc<RunnerInner>) {
    let mut active = ACTIVE.lock().unwrap();
    active.retain(|w| w.strong_count() > 0);
    active.push(Arc::downgrade(inner));
}

/// Remove a runner from the active set; the last removal stops the
/// interrupt listener.
pub(crate) fn remove(inner: &Arc<RunnerInner>) {
    let mut active = ACTIVE.lock().unwrap();
    active.retain(|w| w.upgrade().is_some_and(|a| !Arc::ptr_eq(&a, inner)));
    if active.is_empty() {
        if let Some(handle) = LISTENER.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Install the SIGINT listener if it is not already running. Called from a
/// runner's driver, so a runtime is in scope.
pub(crate) fn ensure_listener() {
    #[cfg(unix)]
    {
        let mut listener = LISTENER.lock().unwrap();
        if listener.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *listener = Some(tokio::spawn(listen()));
    }
}

#[cfg(unix)]
async fn listen() {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
        tracing::warn!(target: "command_stream::signal", "could not install SIGINT listener");
        return;
    };
    while sigint.recv().await.is_some() {
        let forwarded = interrupt_active_runners();
        tracing::debug!(target: "command_stream::signal", forwarded, "SIGINT received");
        if INTERRUPT_EXIT.load(Ordering::SeqCst) {
            // Shell feel: hand back 128 + SIGINT after flushing our side.
            let _ = io::write_parent_blocking(ParentStream::Stdout, b"");
            std::process::exit(130);
        }
    }
}

fn snapshot() -> Vec<Arc<RunnerInner>> {
    ACTIVE
        .lock()
        .unwrap()
        .iter()
        .filter_map(Weak::upgrade)
        .collect()
}

/// Forward an interrupt to every active runner, as the SIGINT listener
/// would. Returns false when there was nothing to interrupt.
///
/// Real children receive SIGINT on their process group; virtual commands
/// are cancelled and finish with code 130.
pub fn interrupt_active_runners() -> bool {
    let runners = snapshot();
    if runners.is_empty() {
        return false;
    }
    for runner in runners {
        runner.initiate_kill(Signal::Int);
    }
    true
}

/// Control whether a forwarded SIGINT terminates the host process with
/// code 130 (the default, preserving shell-like feel for standalone tools).
/// Embedders with their own interrupt handling should turn this off.
pub fn set_interrupt_exit(on: bool) {
    INTERRUPT_EXIT.store(on, Ordering::SeqCst);
}

/// The parent's stdout or stderr turned out to be closed: drive every
/// active runner through a graceful shutdown.
pub(crate) fn parent_stream_closed() {
    let runners = snapshot();
    if runners.is_empty() {
        return;
    }
    tracing::debug!(
        target: "command_stream::signal",
        runners = runners.len(),
        "parent stream closed; shutting down active runners"
    );
    for runner in runners {
        runner.soft_shutdown();
    }
}

/// Cancel everything in flight (used by global-state reset).
pub(crate) fn cancel_all_active() {
    for runner in snapshot() {
        runner.initiate_kill(Signal::Term);
    }
}

pub(crate) fn reset_interrupt_policy() {
    INTERRUPT_EXIT.store(true, Ordering::SeqCst);
}
