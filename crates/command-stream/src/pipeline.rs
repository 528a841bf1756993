//! Pipeline execution: composing real processes, virtual commands, and
//! mixed combinations with end-to-end streaming.
//!
//! Strategy selection:
//! 1. any virtual stage → streaming relay over lazy byte channels;
//! 2. a stage known to line-buffer against a pipe (`jq`, `grep`, …) →
//!    the same relay, whose unbounded per-stage buffer plays the role of
//!    the tee: the producer never stalls on a slow consumer;
//! 3. otherwise → native OS pipes, every stage spawned up front.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use command_stream_parse::SimpleCmd;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};

use crate::child::{self, kill_group};
use crate::error::{Error, Result};
use crate::events::{ChunkKind, RunnerEvent};
use crate::io::{self, WriteOutcome};
use crate::options::{Options, StdinMode};
use crate::result::ExecResult;
use crate::runner::{Runner, RunnerInner};
use crate::settings::shell;
use crate::signal::Signal;
use crate::virt::{self, Handler, VirtualContext};

const READ_BUF_SIZE: usize = 4096;
const KILL_GRACE: Duration = Duration::from_millis(250);

/// Filters that buffer noticeably under pipe-to-pipe stdio; they get the
/// relay treatment so upstream stages keep streaming in real time.
const BUFFERING_FILTERS: &[&str] = &["jq", "grep", "sed", "cat", "awk"];

fn stage_is_virtual(stage: &SimpleCmd, opts: &Options, is_first: bool) -> bool {
    let stdin_forces_real = is_first
        && matches!(opts.stdin, StdinMode::Pipe | StdinMode::Bytes(_))
        && virt::needs_real_process_for_stdin(&stage.cmd);
    virt::enabled()
        && stage.redirects.is_empty()
        && !stdin_forces_real
        && virt::lookup(&stage.cmd).is_some()
}

/// Run parsed pipeline stages under this runner.
pub(crate) async fn run_stages(
    inner: &Arc<RunnerInner>,
    stages: Vec<SimpleCmd>,
    opts: &Options,
) -> Result<ExecResult> {
    inner.state_running();
    let any_virtual = stages
        .iter()
        .enumerate()
        .any(|(i, s)| stage_is_virtual(s, opts, i == 0));
    if any_virtual {
        relay_pipeline(inner, stages, opts, "mixed").await
    } else if stages
        .iter()
        .any(|s| BUFFERING_FILTERS.contains(&s.cmd.as_str()))
    {
        relay_pipeline(inner, stages, opts, "tee-split").await
    } else {
        native_pipeline(inner, stages, opts).await
    }
}

/// Outcome of one stage: its exit code and (for non-last stages) the
/// stderr it accumulated.
struct StageDone {
    code: i32,
    stderr: Vec<u8>,
}

async fn relay_pipeline(
    inner: &Arc<RunnerInner>,
    stages: Vec<SimpleCmd>,
    opts: &Options,
    strategy: &'static str,
) -> Result<ExecResult> {
    let n = stages.len();
    tracing::debug!(
        target: "command_stream::pipeline",
        strategy,
        stages = n,
        "running streaming pipeline"
    );

    let feed = inner.stdin_feed.lock().unwrap().take();
    let mut input = match feed {
        Some(rx) => Some(rx),
        None => match &opts.stdin {
            StdinMode::Bytes(bytes) => {
                let (tx, rx) = mpsc::unbounded_channel();
                inner.record_stdin(bytes);
                let _ = tx.send(bytes.clone());
                Some(rx)
            }
            _ => None,
        },
    };

    let mut dones = Vec::with_capacity(n);
    for (i, stage) in stages.into_iter().enumerate() {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        dones.push(spawn_stage(
            inner,
            stage,
            input.take(),
            out_tx,
            i == n - 1,
            i == 0,
            opts,
        ));
        input = Some(out_rx);
    }

    // The last stage's output is the pipeline's stdout.
    let mut last_rx = input.take().expect("pipeline has at least one stage");
    while let Some(chunk) = last_rx.recv().await {
        inner.emit_chunk(ChunkKind::Stdout, &chunk).await;
    }

    let mut codes = Vec::with_capacity(n);
    for (i, done) in dones.into_iter().enumerate() {
        let stage_done = done.await.unwrap_or(StageDone {
            code: 1,
            stderr: Vec::new(),
        });
        if i < n - 1 {
            inner.push_captured_err(stage_done.stderr);
        }
        codes.push(stage_done.code);
    }

    Ok(ExecResult::from_code(settle_codes(inner, &codes)))
}

fn spawn_stage(
    inner: &Arc<RunnerInner>,
    stage: SimpleCmd,
    input: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    is_last: bool,
    is_first: bool,
    opts: &Options,
) -> oneshot::Receiver<StageDone> {
    let (done_tx, done_rx) = oneshot::channel();
    let inner = inner.clone();
    let opts = opts.clone();
    tokio::spawn(async move {
        let done = if stage_is_virtual(&stage, &opts, is_first) {
            run_virtual_stage(&inner, stage, input, out_tx, is_last, &opts).await
        } else {
            run_real_stage(&inner, stage, input, out_tx, is_last, is_first, &opts).await
        };
        let _ = done_tx.send(done);
    });
    done_rx
}

async fn collect_input(input: Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    let mut rx = input?;
    let mut collected = Vec::new();
    while let Some(chunk) = rx.recv().await {
        collected.extend_from_slice(&chunk);
    }
    Some(collected)
}

async fn run_virtual_stage(
    inner: &Arc<RunnerInner>,
    stage: SimpleCmd,
    input: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    is_last: bool,
    opts: &Options,
) -> StageDone {
    let handler = virt::lookup(&stage.cmd).expect("dispatch checked the registry");
    let stdin = collect_input(input).await;
    let cwd = match &opts.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().unwrap_or_else(|_| "/".into()),
    };
    let ctx = VirtualContext {
        args: stage.arg_texts(),
        stdin,
        cwd,
        env: opts.env.clone(),
        cancel: inner.cancel.child_token(),
    };

    match handler {
        Handler::Unary(handler) => {
            tokio::select! {
                outcome = handler.call(ctx) => match outcome {
                    Ok(out) => {
                        if let Some(stdout) = out.stdout {
                            let _ = out_tx.send(stdout);
                        }
                        let stderr = out.stderr.unwrap_or_default();
                        let stderr = emit_or_keep(inner, is_last, stderr).await;
                        StageDone {
                            code: out.code,
                            stderr,
                        }
                    }
                    Err(e) => {
                        let message = format!("{}: {e}\n", stage.cmd).into_bytes();
                        let stderr = emit_or_keep(inner, is_last, message).await;
                        StageDone {
                            code: e.raw_os_error().unwrap_or(1),
                            stderr,
                        }
                    }
                },
                _ = inner.cancel.cancelled() => StageDone {
                    code: inner.kill_code(),
                    stderr: Vec::new(),
                },
            }
        }
        Handler::Streaming(handler) => {
            let mut source = handler.open(ctx);
            let code = loop {
                tokio::select! {
                    chunk = source.next_chunk() => match chunk {
                        Some(Ok(bytes)) => {
                            if out_tx.send(bytes).is_err() {
                                // Consumer went away; stop producing.
                                source.cancel().await;
                                break 0;
                            }
                        }
                        Some(Err(e)) => {
                            let message = format!("{}: {e}\n", stage.cmd).into_bytes();
                            emit_or_keep(inner, is_last, message).await;
                            source.cancel().await;
                            break e.raw_os_error().unwrap_or(1);
                        }
                        None => break 0,
                    },
                    _ = inner.cancel.cancelled() => {
                        source.cancel().await;
                        break inner.kill_code();
                    }
                }
            };
            StageDone {
                code,
                stderr: Vec::new(),
            }
        }
    }
}

/// Last-stage stderr goes out live; earlier stages fold theirs into the
/// final result.
async fn emit_or_keep(inner: &Arc<RunnerInner>, is_last: bool, stderr: Vec<u8>) -> Vec<u8> {
    if is_last {
        if !stderr.is_empty() {
            inner.emit_chunk(ChunkKind::Stderr, &stderr).await;
        }
        Vec::new()
    } else {
        stderr
    }
}

async fn run_real_stage(
    inner: &Arc<RunnerInner>,
    stage: SimpleCmd,
    input: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    is_last: bool,
    is_first: bool,
    opts: &Options,
) -> StageDone {
    let mut command = stage_command(&stage, opts);
    command.stdin(if input.is_some() {
        Stdio::piped()
    } else if is_first && opts.stdin == StdinMode::Inherit {
        Stdio::inherit()
    } else {
        Stdio::null()
    });
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let code = if e.kind() == std::io::ErrorKind::NotFound {
                127
            } else {
                1
            };
            let message = format!("{}: {e}\n", stage.cmd).into_bytes();
            let stderr = emit_or_keep(inner, is_last, message).await;
            return StageDone {
                code,
                stderr,
            };
        }
    };
    let pid = child.id();

    if let (Some(mut rx), Some(mut stdin)) = (input, child.stdin.take()) {
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while let Some(chunk) = rx.recv().await {
                match io::write_child_stdin(&mut stdin, &chunk).await {
                    Ok(WriteOutcome::Written) => {}
                    Ok(WriteOutcome::Closed) | Err(_) => return,
                }
            }
            let _ = stdin.shutdown().await;
        });
    }

    let mut killed = inner.is_cancelled();
    if killed {
        if let Some(pid) = pid {
            kill_group(pid, inner.kill_signal_or_term());
        }
    }

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_done = stdout.is_none();
    let mut err_done = stderr.is_none();
    let mut out_buf = [0u8; READ_BUF_SIZE];
    let mut err_buf = [0u8; READ_BUF_SIZE];
    let mut stderr_acc: Vec<u8> = Vec::new();
    let mut downstream_gone = false;

    while !out_done || !err_done {
        tokio::select! {
            read = read_some(&mut stdout, &mut out_buf), if !out_done => match read {
                Ok(0) | Err(_) => out_done = true,
                Ok(n) => {
                    // Keep draining even when the consumer is gone so this
                    // producer never stalls on a full pipe.
                    if !downstream_gone && out_tx.send(out_buf[..n].to_vec()).is_err() {
                        downstream_gone = true;
                    }
                }
            },
            read = read_some(&mut stderr, &mut err_buf), if !err_done => match read {
                Ok(0) | Err(_) => err_done = true,
                Ok(n) => {
                    if is_last {
                        inner.emit_chunk(ChunkKind::Stderr, &err_buf[..n]).await;
                    } else {
                        stderr_acc.extend_from_slice(&err_buf[..n]);
                    }
                }
            },
            _ = inner.cancel.cancelled(), if !killed => {
                killed = true;
                if let Some(pid) = pid {
                    kill_group(pid, inner.kill_signal_or_term());
                }
            }
            _ = tokio::time::sleep(KILL_GRACE), if killed => {
                if let Some(pid) = pid {
                    kill_group(pid, Signal::Kill);
                }
            }
        }
    }

    let code = loop {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => break map_stage_status(inner, status),
                Err(_) => break 1,
            },
            _ = inner.cancel.cancelled(), if !killed => {
                killed = true;
                if let Some(pid) = pid {
                    kill_group(pid, inner.kill_signal_or_term());
                }
            }
            _ = tokio::time::sleep(KILL_GRACE), if killed => {
                if let Some(pid) = pid {
                    kill_group(pid, Signal::Kill);
                }
            }
        }
    };

    StageDone {
        code,
        stderr: stderr_acc,
    }
}

fn stage_command(stage: &SimpleCmd, opts: &Options) -> tokio::process::Command {
    child::base_command(&stage.cmd, &stage.arg_texts(), opts)
}

async fn read_some<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

fn map_stage_status(inner: &Arc<RunnerInner>, status: std::process::ExitStatus) -> i32 {
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

async fn native_pipeline(
    inner: &Arc<RunnerInner>,
    stages: Vec<SimpleCmd>,
    opts: &Options,
) -> Result<ExecResult> {
    let n = stages.len();
    tracing::debug!(
        target: "command_stream::pipeline",
        stages = n,
        "running native-pipe pipeline"
    );

    let feed = inner.stdin_feed.lock().unwrap().take();
    let mut children: Vec<tokio::process::Child> = Vec::with_capacity(n);
    let mut pids: Vec<u32> = Vec::new();
    let mut err_tasks = Vec::new();
    let mut prev_stdout: Option<tokio::process::ChildStdout> = None;

    for (i, stage) in stages.iter().enumerate() {
        let is_last = i == n - 1;
        let mut command = stage_command(stage, opts);

        if i == 0 {
            if feed.is_some() || matches!(opts.stdin, StdinMode::Bytes(_)) {
                command.stdin(Stdio::piped());
            } else if opts.stdin == StdinMode::Inherit {
                command.stdin(Stdio::inherit());
            } else {
                command.stdin(Stdio::null());
            }
        } else {
            let stdio: Stdio = prev_stdout
                .take()
                .expect("previous stage stdout wired")
                .try_into()
                .map_err(Error::Io)?;
            command.stdin(stdio);
        }

        if is_last {
            match child::open_redirect(&stage.redirects, opts)? {
                Some(file) => command.stdout(Stdio::from(file)),
                None => command.stdout(Stdio::piped()),
            };
        } else {
            command.stdout(Stdio::piped());
        }
        command.stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                for pid in &pids {
                    kill_group(*pid, Signal::Term);
                }
                return Err(Error::Spawn {
                    command: stage.cmd.clone(),
                    source,
                });
            }
        };
        if let Some(pid) = child.id() {
            pids.push(pid);
        }
        if !is_last {
            prev_stdout = child.stdout.take();
            if let Some(mut stderr) = child.stderr.take() {
                err_tasks.push(tokio::spawn(async move {
                    let mut acc = Vec::new();
                    let _ = stderr.read_to_end(&mut acc).await;
                    acc
                }));
            }
        }
        children.push(child);
    }

    // First-stage stdin, when the pipeline itself was given input.
    if let Some(stdin) = children[0].stdin.take() {
        let mut stdin = stdin;
        match (feed, &opts.stdin) {
            (Some(mut rx), _) => {
                tokio::spawn(async move {
                    use tokio::io::AsyncWriteExt;
                    while let Some(chunk) = rx.recv().await {
                        match io::write_child_stdin(&mut stdin, &chunk).await {
                            Ok(WriteOutcome::Written) => {}
                            Ok(WriteOutcome::Closed) | Err(_) => return,
                        }
                    }
                    let _ = stdin.shutdown().await;
                });
            }
            (None, StdinMode::Bytes(bytes)) => {
                let bytes = bytes.clone();
                inner.record_stdin(&bytes);
                tokio::spawn(async move {
                    use tokio::io::AsyncWriteExt;
                    let _ = io::write_child_stdin(&mut stdin, &bytes).await;
                    let _ = stdin.shutdown().await;
                });
            }
            _ => {}
        }
    }

    // One watcher delivers cancellation to every stage's process group.
    let watcher = {
        let inner = inner.clone();
        let pids = pids.clone();
        tokio::spawn(async move {
            inner.cancel.cancelled().await;
            let signal = inner.kill_signal_or_term();
            for pid in &pids {
                kill_group(*pid, signal);
            }
            tokio::time::sleep(KILL_GRACE).await;
            for pid in &pids {
                kill_group(*pid, Signal::Kill);
            }
        })
    };

    // Pump the last stage's stdout and stderr through the runner's sink.
    let last = children.last_mut().expect("pipeline has at least one stage");
    let mut stdout = last.stdout.take();
    let mut stderr = last.stderr.take();
    let mut out_done = stdout.is_none();
    let mut err_done = stderr.is_none();
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
        }
    }

    let mut codes = Vec::with_capacity(n);
    for child in &mut children {
        let code = match child.wait().await {
            Ok(status) => map_stage_status(inner, status),
            Err(_) => 1,
        };
        codes.push(code);
    }
    watcher.abort();

    for task in err_tasks {
        if let Ok(stderr) = task.await {
            inner.push_captured_err(stderr);
        }
    }

    Ok(ExecResult::from_code(settle_codes(inner, &codes)))
}

fn settle_codes(inner: &Arc<RunnerInner>, codes: &[i32]) -> i32 {
    if shell::settings().pipefail {
        match codes.iter().enumerate().find(|&(_, &code)| code != 0) {
            Some((stage, &code)) => {
                inner.set_failed_stage(stage, code);
                code
            }
            None => 0,
        }
    } else {
        codes.last().copied().unwrap_or(0)
    }
}

/// Run a composed `source | destination` pair of runners.
///
/// The source's stdout events feed the destination's stdin; the
/// destination's output is re-emitted as the pipeline's own. The
/// destination's options govern mirroring and capture; the source only
/// contributes bytes (its stderr folds into the final result).
pub(crate) async fn run_pair(
    inner: &Arc<RunnerInner>,
    src: Runner,
    dst: Runner,
    opts: &Options,
) -> Result<ExecResult> {
    inner.state_running();

    {
        let mut src_opts = src.inner.options.lock().unwrap();
        src_opts.mirror = false;
        if opts.stdin != StdinMode::Inherit {
            src_opts.stdin = opts.stdin.clone();
        }
    }
    inner.adopt_stage(&src);
    inner.adopt_stage(&dst);

    let (tx, rx) = mpsc::unbounded_channel();
    *dst.inner.stdin_feed.lock().unwrap() = Some(rx);

    let mut src_events = src.events();
    let feed = tokio::spawn(async move {
        while let Some(event) = src_events.next().await {
            if let RunnerEvent::Stdout(data) = event {
                if tx.send(data).is_err() {
                    break;
                }
            }
        }
    });

    let mut dst_events = dst.events();
    while let Some(event) = dst_events.next().await {
        match event {
            RunnerEvent::Stdout(data) => inner.forward_chunk(ChunkKind::Stdout, &data),
            RunnerEvent::Stderr(data) => inner.forward_chunk(ChunkKind::Stderr, &data),
            RunnerEvent::End(_) | RunnerEvent::Exit(_) => {}
        }
    }

    let src_result = src.wait_raw().await;
    let dst_result = dst.wait_raw().await;
    let _ = feed.await;

    if let Some(stderr) = src_result.stderr {
        inner.push_captured_err(stderr);
    }

    let codes = [src_result.code, dst_result.code];
    Ok(ExecResult::from_code(settle_codes(inner, &codes)))
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
