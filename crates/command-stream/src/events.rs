//! Runner events and subscription.

use tokio::sync::broadcast;

use crate::result::ExecResult;

/// Which channel a chunk arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Stdout,
    Stderr,
}

/// One chunk of child output, as yielded by [`Runner::stream`].
///
/// [`Runner::stream`]: crate::Runner::stream
#[derive(Debug, Clone)]
pub struct Chunk {
    pub kind: ChunkKind,
    pub data: Vec<u8>,
}

/// Everything a runner emits, in emission order per runner: any number of
/// `Stdout`/`Stderr` chunks, then exactly one `End`, then exactly one
/// `Exit`.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    End(ExecResult),
    Exit(i32),
}

/// Subscription to a runner's event channel.
///
/// Yields `None` after the `Exit` event. A slow subscriber that lags the
/// broadcast ring skips ahead and keeps going; the terminal events are the
/// last two in the channel and are never skipped past.
pub struct EventStream {
    rx: broadcast::Receiver<RunnerEvent>,
    done: bool,
    /// The runner was already finished when this subscription was made:
    /// drain whatever is buffered, then end instead of waiting on a
    /// channel that will never close.
    finished_hint: bool,
}

impl EventStream {
    pub(crate) fn new(rx: broadcast::Receiver<RunnerEvent>) -> Self {
        EventStream {
            rx,
            done: false,
            finished_hint: false,
        }
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished_hint = true;
    }

    pub async fn next(&mut self) -> Option<RunnerEvent> {
        if self.done {
            return None;
        }
        loop {
            if self.finished_hint {
                match self.rx.try_recv() {
                    Ok(event) => {
                        if matches!(event, RunnerEvent::Exit(_)) {
                            self.done = true;
                        }
                        return Some(event);
                    }
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        tracing::trace!(target: "command_stream::runner", skipped, "event subscriber lagged");
                        continue;
                    }
                    Err(_) => {
                        self.done = true;
                        return None;
                    }
                }
            }
            match self.rx.recv().await {
                Ok(event) => {
                    if matches!(event, RunnerEvent::Exit(_)) {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::trace!(target: "command_stream::runner", skipped, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}
