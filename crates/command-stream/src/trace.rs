//! Opt-in trace logging.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Install a stderr trace subscriber when `COMMAND_STREAM_VERBOSE=true`.
///
/// Only that exact opt-in counts; `CI=true` must not imply verbose. If the
/// host already installed a global subscriber, this quietly loses the race
/// and the host's subscriber receives our events instead.
pub(crate) fn init_verbose_trace() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let enabled = std::env::var("COMMAND_STREAM_VERBOSE").is_ok_and(|v| v == "true");
        if !enabled {
            return;
        }
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("command_stream=trace"))
            .with_writer(std::io::stderr)
            .try_init();
    });
}
