//! Real-process execution: spawn, pump, wait, kill.

use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use command_stream_parse::{Redirect, RedirectKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::events::ChunkKind;
use crate::io::{self, WriteOutcome};
use crate::options::{Options, StdinMode};
use crate::result::ExecResult;
use crate::runner::RunnerInner;
use crate::signal::Signal;

const READ_BUF_SIZE: usize = 4096;
const KILL_GRACE: Duration = Duration::from_millis(250);

#[cfg(unix)]
pub(crate) fn stdin_is_tty() -> bool {
    // SAFETY: isatty only inspects the fd.
    unsafe { libc::isatty(0) == 1 }
}

#[cfg(not(unix))]
pub(crate) fn stdin_is_tty() -> bool {
    false
}

#[cfg(unix)]
fn all_stdio_ttys() -> bool {
    // SAFETY: isatty only inspects the fd.
    unsafe { libc::isatty(0) == 1 && libc::isatty(1) == 1 && libc::isatty(2) == 1 }
}

#[cfg(not(unix))]
fn all_stdio_ttys() -> bool {
    false
}

/// Deliver a signal to a process and its group.
pub(crate) fn kill_group(pid: u32, signal: Signal) {
    #[cfg(unix)]
    {
        // SAFETY: kill() is async-signal-safe; the negative pid targets the
        // process group created at spawn.
        unsafe {
            libc::kill(pid as i32, signal.raw());
            libc::kill(-(pid as i32), signal.raw());
        }
    }
    #[cfg(not(unix))]
    let _ = (pid, signal);
}

enum StdinPlan {
    Inherit,
    Null,
    /// Pump the parent's (non-tty) stdin into the child.
    PumpParent,
    /// Leave stdin open for the caller; the handle parks in the runner.
    Slot,
    Write(Vec<u8>),
    Feed(mpsc::UnboundedReceiver<Vec<u8>>),
}

pub(crate) fn base_command(program: &str, args: &[String], opts: &Options) -> tokio::process::Command {
    let mut command = tokio::process::Command::new(program);
    command.args(args);
    if let Some(dir) = &opts.cwd {
        command.current_dir(dir);
    }
    if let Some(env) = &opts.env {
        command.env_clear();
        command.envs(env);
    }
    // A fresh process group per child so signals reach the whole subtree.
    // SAFETY: setsid() is async-signal-safe and runs before exec.
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    command
}

/// Run a real child to completion for this runner: spawn with a fresh
/// process group, pump stdout/stderr through capture + mirror + events,
/// feed stdin per the options, and map the exit status.
pub(crate) async fn run_real(
    inner: &Arc<RunnerInner>,
    program: String,
    args: Vec<String>,
    redirects: Vec<Redirect>,
    opts: &Options,
) -> Result<ExecResult> {
    if opts.interactive && all_stdio_ttys() {
        return run_interactive(inner, &program, &args, opts).await;
    }

    let mut command = base_command(&program, &args, opts);

    let feed = inner.stdin_feed.lock().unwrap().take();
    let plan = match feed {
        Some(rx) => StdinPlan::Feed(rx),
        None => match &opts.stdin {
            StdinMode::Inherit => {
                if stdin_is_tty() {
                    StdinPlan::Inherit
                } else {
                    StdinPlan::PumpParent
                }
            }
            StdinMode::Ignore => StdinPlan::Null,
            StdinMode::Pipe => StdinPlan::Slot,
            StdinMode::Bytes(bytes) => StdinPlan::Write(bytes.clone()),
        },
    };
    command.stdin(match &plan {
        StdinPlan::Inherit => Stdio::inherit(),
        StdinPlan::Null => Stdio::null(),
        _ => Stdio::piped(),
    });

    let redirect_file = open_redirect(&redirects, opts)?;
    let redirected = redirect_file.is_some();
    command.stdout(match redirect_file {
        Some(file) => Stdio::from(file),
        None => Stdio::piped(),
    });
    command.stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| Error::Spawn {
        command: program.clone(),
        source,
    })?;
    if let Some(pid) = child.id() {
        inner.child_pid.store(pid as i32, Ordering::SeqCst);
    }
    tracing::debug!(
        target: "command_stream::runner",
        command = %program,
        pid = child.id(),
        "spawned child"
    );

    match plan {
        StdinPlan::Slot => {
            *inner.stdin_slot.lock().unwrap() = child.stdin.take();
        }
        StdinPlan::Write(bytes) => {
            if let Some(mut stdin) = child.stdin.take() {
                inner.record_stdin(&bytes);
                tokio::spawn(async move {
                    if let Err(e) = async {
                        io::write_child_stdin(&mut stdin, &bytes).await?;
                        stdin.shutdown().await
                    }
                    .await
                    {
                        tracing::warn!(target: "command_stream::io", error = %e, "stdin write failed");
                    }
                });
            }
        }
        StdinPlan::Feed(mut rx) => {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    while let Some(chunk) = rx.recv().await {
                        match io::write_child_stdin(&mut stdin, &chunk).await {
                            Ok(WriteOutcome::Written) => {}
                            Ok(WriteOutcome::Closed) | Err(_) => return,
                        }
                    }
                    let _ = stdin.shutdown().await;
                });
            }
        }
        StdinPlan::PumpParent => {
            if let Some(mut stdin) = child.stdin.take() {
                let cancel = inner.cancel.child_token();
                tokio::spawn(async move {
                    let mut parent = tokio::io::stdin();
                    let mut buf = [0u8; READ_BUF_SIZE];
                    loop {
                        tokio::select! {
                            read = parent.read(&mut buf) => match read {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    match io::write_child_stdin(&mut stdin, &buf[..n]).await {
                                        Ok(WriteOutcome::Written) => {}
                                        Ok(WriteOutcome::Closed) | Err(_) => break,
                                    }
                                }
                            },
                            _ = cancel.cancelled() => break,
                        }
                    }
                    let _ = stdin.shutdown().await;
                });
            }
        }
        StdinPlan::Inherit | StdinPlan::Null => {}
    }

    inner.state_running();

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_done = stdout.is_none();
    let mut err_done = stderr.is_none();
    debug_assert!(redirected || !out_done, "stdout must be piped unless redirected");

    let mut killed = inner.is_cancelled();
    if killed {
        inner.signal_child(inner.kill_signal_or_term());
    }

    let mut out_buf = [0u8; READ_BUF_SIZE];
    let mut err_buf = [0u8; READ_BUF_SIZE];
    while !out_done || !err_done {
        tokio::select! {
            read = read_some(&mut stdout, &mut out_buf), if !out_done => match read {
                Ok(0) | Err(_) => out_done = true,
                Ok(n) => inner.emit_chunk(ChunkKind::Stdout, &out_buf[..n]).await,
            },
            read = read_some(&mut stderr, &mut err_buf), if !err_done => match read {
                Ok(0) | Err(_) => err_done = true,
                Ok(n) => inner.emit_chunk(ChunkKind::Stderr, &err_buf[..n]).await,
            },
            _ = inner.cancel.cancelled(), if !killed => {
                killed = true;
                inner.signal_child(inner.kill_signal_or_term());
            }
            _ = tokio::time::sleep(KILL_GRACE), if killed => {
                inner.signal_child(Signal::Kill);
            }
        }
    }

    let status = wait_with_escalation(inner, &mut child, killed).await?;
    Ok(ExecResult::from_code(map_status(inner, status)))
}

async fn run_interactive(
    inner: &Arc<RunnerInner>,
    program: &str,
    args: &[String],
    opts: &Options,
) -> Result<ExecResult> {
    // The terminal owns all three streams: no pumping, no mirror, and
    // nothing to capture.
    inner.options.lock().unwrap().capture = false;

    let mut command = base_command(program, args, opts);
    command.stdin(Stdio::inherit());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());

    let mut child = command.spawn().map_err(|source| Error::Spawn {
        command: program.to_string(),
        source,
    })?;
    if let Some(pid) = child.id() {
        inner.child_pid.store(pid as i32, Ordering::SeqCst);
    }
    inner.state_running();

    let killed = inner.is_cancelled();
    if killed {
        inner.signal_child(inner.kill_signal_or_term());
    }
    let status = wait_with_escalation(inner, &mut child, killed).await?;
    Ok(ExecResult::from_code(map_status(inner, status)))
}

async fn read_some<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

/// Wait for exit; a cancellation mid-wait delivers the kill signal, and a
/// child that survives the signal gets KILL after a short grace period.
async fn wait_with_escalation(
    inner: &Arc<RunnerInner>,
    child: &mut tokio::process::Child,
    mut killed: bool,
) -> Result<std::process::ExitStatus> {
    loop {
        tokio::select! {
            status = child.wait() => return Ok(status?),
            _ = inner.cancel.cancelled(), if !killed => {
                killed = true;
                inner.signal_child(inner.kill_signal_or_term());
            }
            _ = tokio::time::sleep(KILL_GRACE), if killed => {
                inner.signal_child(Signal::Kill);
            }
        }
    }
}

fn map_status(inner: &Arc<RunnerInner>, status: std::process::ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => {
            if inner.is_cancelled() {
                inner.kill_code()
            } else {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal().map(|s| 128 + s).unwrap_or(1)
                }
                #[cfg(not(unix))]
                {
                    1
                }
            }
        }
    }
}

pub(crate) fn open_redirect(
    redirects: &[Redirect],
    opts: &Options,
) -> Result<Option<std::fs::File>> {
    let Some(redirect) = redirects.last() else {
        return Ok(None);
    };
    let path = match &opts.cwd {
        Some(dir) => dir.join(&redirect.target),
        None => std::path::PathBuf::from(&redirect.target),
    };
    let mut open = std::fs::OpenOptions::new();
    open.create(true).write(true);
    match redirect.kind {
        RedirectKind::Overwrite => open.truncate(true),
        RedirectKind::Append => open.append(true),
    };
    Ok(Some(open.open(path)?))
}
