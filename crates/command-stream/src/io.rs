//! Broken-pipe-safe writes to parent and child streams.
//!
//! A closed parent stream must never abort the host: EPIPE comes back as
//! [`WriteOutcome::Closed`] and the caller decides (for parent streams that
//! means the graceful-shutdown path; for child stdin it means the child went
//! away and the write is a no-op).

use std::io::Write as _;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Written,
    /// The far end is gone (EPIPE); the bytes were dropped.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParentStream {
    Stdout,
    Stderr,
}

fn is_broken_pipe(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::BrokenPipe || err.raw_os_error() == Some(libc::EPIPE)
}

/// Write to a parent stream through the async runtime writer.
pub(crate) async fn write_parent(
    stream: ParentStream,
    bytes: &[u8],
) -> std::io::Result<WriteOutcome> {
    let result = match stream {
        ParentStream::Stdout => {
            let mut out = tokio::io::stdout();
            match out.write_all(bytes).await {
                Ok(()) => out.flush().await,
                Err(e) => Err(e),
            }
        }
        ParentStream::Stderr => {
            let mut err = tokio::io::stderr();
            match err.write_all(bytes).await {
                Ok(()) => err.flush().await,
                Err(e) => Err(e),
            }
        }
    };
    settle_parent_write(stream, result)
}

/// Write to a parent stream through the locked blocking writer. Used on
/// paths that are not on the runtime (interrupt handling, blocking runs).
pub(crate) fn write_parent_blocking(
    stream: ParentStream,
    bytes: &[u8],
) -> std::io::Result<WriteOutcome> {
    let result = match stream {
        ParentStream::Stdout => {
            let mut out = std::io::stdout().lock();
            out.write_all(bytes).and_then(|()| out.flush())
        }
        ParentStream::Stderr => {
            let mut err = std::io::stderr().lock();
            err.write_all(bytes).and_then(|()| err.flush())
        }
    };
    settle_parent_write(stream, result)
}

fn settle_parent_write(
    stream: ParentStream,
    result: std::io::Result<()>,
) -> std::io::Result<WriteOutcome> {
    match result {
        Ok(()) => Ok(WriteOutcome::Written),
        Err(e) if is_broken_pipe(&e) => {
            tracing::debug!(target: "command_stream::io", ?stream, "parent stream closed mid-write");
            Ok(WriteOutcome::Closed)
        }
        Err(e) => Err(e),
    }
}

/// Write to a child's stdin; a child that already closed its end is not an
/// error.
pub(crate) async fn write_child_stdin(
    stdin: &mut ChildStdin,
    bytes: &[u8],
) -> std::io::Result<WriteOutcome> {
    match stdin.write_all(bytes).await {
        Ok(()) => Ok(WriteOutcome::Written),
        Err(e) if is_broken_pipe(&e) => {
            tracing::trace!(target: "command_stream::io", "child stdin closed before write completed");
            Ok(WriteOutcome::Closed)
        }
        Err(e) => Err(e),
    }
}
