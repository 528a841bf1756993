//! Process-global state owned by the library.

use std::path::PathBuf;
use std::sync::{LazyLock, Mutex};

use crate::output;
use crate::settings;
use crate::signal;
use crate::virt;

/// The working directory at first library use; `reset_global_state`
/// restores it.
static INITIAL_CWD: LazyLock<Option<PathBuf>> = LazyLock::new(|| std::env::current_dir().ok());

pub(crate) fn capture_initial_cwd() {
    LazyLock::force(&INITIAL_CWD);
}

static SHELL_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Locate the external POSIX shell, cached process-wide.
pub(crate) fn shell_path() -> PathBuf {
    let mut cache = SHELL_PATH.lock().unwrap();
    if let Some(path) = cache.as_ref() {
        return path.clone();
    }
    let path = which::which("sh").unwrap_or_else(|_| PathBuf::from("/bin/sh"));
    tracing::debug!(target: "command_stream::runner", shell = %path.display(), "detected shell");
    *cache = Some(path.clone());
    path
}

pub(crate) fn clear_shell_cache() {
    *SHELL_PATH.lock().unwrap() = None;
}

/// Restore the library's process-global state to how it looked at first
/// use: the initial working directory (if it still exists), no in-flight
/// runners, no cached shell detection, default shell settings and output
/// policy, virtual commands enabled.
pub fn reset_global_state() {
    if let Some(dir) = INITIAL_CWD.as_ref() {
        if dir.exists() {
            let _ = std::env::set_current_dir(dir);
        }
    }
    signal::cancel_all_active();
    signal::reset_interrupt_policy();
    clear_shell_cache();
    settings::reset_settings();
    output::reset_ansi_config();
    virt::reset_registry();
}
