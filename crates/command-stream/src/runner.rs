//! The per-invocation runner: one state machine shared by every way of
//! consuming a command.
//!
//! A [`Runner`] is constructed cold. The first driver — awaiting it,
//! iterating [`Runner::stream`], subscribing to [`Runner::events`],
//! touching [`Runner::stdin`], or an explicit [`Runner::start`] — moves it
//! `Fresh → Starting` exactly once; a single guard serializes entry and a
//! dedicated task drives execution to the terminal events. `End` and `Exit`
//! fire exactly once per runner, after every data chunk, and nothing is
//! emitted after them.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::task::{Context, Poll};

use command_stream_parse::{needs_real_shell, parse_command, quote, Ast, SimpleCmd};
use tokio::process::ChildStdin;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::child;
use crate::error::{Error, Result};
use crate::events::{Chunk, ChunkKind, EventStream, RunnerEvent};
use crate::io::{self, ParentStream, WriteOutcome};
use crate::options::{Options, StdinMode};
use crate::output;
use crate::pipeline;
use crate::result::ExecResult;
use crate::seq;
use crate::settings::shell;
use crate::signal::{self, Signal};
use crate::state;
use crate::trace;
use crate::virt::{self, Handler, VirtualContext};

/// Runner lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Fresh,
    Starting,
    Running,
    Finishing,
    Finished,
}

/// What to execute; fixed at construction.
#[derive(Debug)]
pub(crate) enum Spec {
    /// A command string for the mini parser (or a real shell).
    Shell(String),
    /// A program and argv, executed directly.
    Exec { program: String, args: Vec<String> },
    /// A pre-parsed simple command (internal: sequence/pipeline stages).
    Simple(SimpleCmd),
    /// Pre-parsed pipeline stages (internal).
    Stages(Vec<SimpleCmd>),
    /// Two composed runners, source stdout feeding destination stdin.
    Pipe { src: Runner, dst: Runner },
}

impl Spec {
    pub(crate) fn display(&self) -> String {
        match self {
            Spec::Shell(s) => s.clone(),
            Spec::Exec { program, args } => std::iter::once(program.as_str())
                .chain(args.iter().map(String::as_str))
                .map(quote)
                .collect::<Vec<_>>()
                .join(" "),
            Spec::Simple(cmd) => display_simple(cmd),
            Spec::Stages(stages) => stages
                .iter()
                .map(display_simple)
                .collect::<Vec<_>>()
                .join(" | "),
            Spec::Pipe { src, dst } => format!(
                "{} | {}",
                src.inner.spec.display(),
                dst.inner.spec.display()
            ),
        }
    }
}

fn display_simple(cmd: &SimpleCmd) -> String {
    std::iter::once(cmd.cmd.clone())
        .chain(cmd.args.iter().map(|w| quote(&w.text)))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Default)]
pub(crate) struct Captured {
    out: Vec<Vec<u8>>,
    err: Vec<Vec<u8>>,
    inp: Vec<Vec<u8>>,
}

fn concat(chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
    for chunk in chunks {
        out.extend_from_slice(chunk);
    }
    out
}

pub(crate) struct RunnerInner {
    pub(crate) spec: Spec,
    pub(crate) options: Mutex<Options>,
    state: watch::Sender<State>,
    start_once: Once,
    started: AtomicBool,
    finish_flag: AtomicBool,
    pub(crate) cancelled: AtomicBool,
    kill_signal: Mutex<Option<Signal>>,
    pub(crate) cancel: CancellationToken,
    events: broadcast::Sender<RunnerEvent>,
    result: watch::Sender<Option<ExecResult>>,
    captured: Mutex<Captured>,
    pub(crate) child_pid: AtomicI32,
    pub(crate) stdin_slot: Mutex<Option<ChildStdin>>,
    /// Internal byte feed used when this runner is a pipeline destination.
    pub(crate) stdin_feed: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    /// With `pipefail`, the first failing stage (index, code).
    failed_stage: Mutex<Option<(usize, i32)>>,
    /// Sub-runners this runner owns (pipeline stages, sequence commands);
    /// killed recursively.
    stage_runners: Mutex<Vec<Runner>>,
    /// A stream consumer went away; emit nothing further.
    suppress_output: AtomicBool,
}

/// Handle to one command invocation.
///
/// Cloning is cheap and shares the underlying invocation.
#[derive(Clone)]
pub struct Runner {
    pub(crate) inner: Arc<RunnerInner>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("spec", &self.inner.spec)
            .finish()
    }
}

impl Runner {
    pub(crate) fn from_spec(spec: Spec, options: Options) -> Runner {
        state::capture_initial_cwd();
        trace::init_verbose_trace();

        let (state_tx, _) = watch::channel(State::Fresh);
        let (result_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(1024);
        let inner = Arc::new(RunnerInner {
            spec,
            options: Mutex::new(options),
            state: state_tx,
            start_once: Once::new(),
            started: AtomicBool::new(false),
            finish_flag: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            kill_signal: Mutex::new(None),
            cancel: CancellationToken::new(),
            events: events_tx,
            result: result_tx,
            captured: Mutex::new(Captured::default()),
            child_pid: AtomicI32::new(0),
            stdin_slot: Mutex::new(None),
            stdin_feed: Mutex::new(None),
            failed_stage: Mutex::new(None),
            stage_runners: Mutex::new(Vec::new()),
            suppress_output: AtomicBool::new(false),
        });
        signal::register(&inner);
        Runner { inner }
    }

    /// A runner for a command string, parsed by the mini parser (or handed
    /// to a real shell when the string needs one).
    pub fn shell(command: impl Into<String>) -> Runner {
        Runner::from_spec(Spec::Shell(command.into()), Options::default())
    }

    pub fn shell_with(command: impl Into<String>, options: Options) -> Runner {
        Runner::from_spec(Spec::Shell(command.into()), options)
    }

    /// A runner that executes `program` with `args` directly, no parsing.
    pub fn exec(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Runner {
        Runner::from_spec(
            Spec::Exec {
                program: program.into(),
                args: args.into_iter().map(Into::into).collect(),
            },
            Options::default(),
        )
    }

    pub fn exec_with(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
        options: Options,
    ) -> Runner {
        Runner::from_spec(
            Spec::Exec {
                program: program.into(),
                args: args.into_iter().map(Into::into).collect(),
            },
            options,
        )
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        *self.inner.state.borrow()
    }

    pub fn finished(&self) -> bool {
        self.state() == State::Finished
    }

    pub fn cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Pid of the spawned child, when a real process is (or was) running.
    pub fn pid(&self) -> Option<u32> {
        match self.inner.child_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid as u32),
        }
    }

    /// Terminal result, once finished.
    pub fn result(&self) -> Option<ExecResult> {
        self.inner.result.borrow().clone()
    }

    pub fn code(&self) -> Option<i32> {
        self.result().map(|r| r.code)
    }

    pub(crate) fn ensure_started(&self) {
        let inner = self.inner.clone();
        self.inner.start_once.call_once(move || {
            inner.started.store(true, Ordering::SeqCst);
            inner.state.send_replace(State::Starting);
            tokio::spawn(drive(inner));
        });
    }

    /// Begin execution and return a handle resolving to the terminal
    /// result. Options are replaced if the runner is still fresh; a second
    /// start ignores them.
    pub fn start_with(&self, options: Options) -> ResultHandle {
        if !self.inner.started.load(Ordering::SeqCst) {
            *self.inner.options.lock().unwrap() = options;
        }
        self.start()
    }

    pub fn start(&self) -> ResultHandle {
        self.ensure_started();
        ResultHandle {
            inner: self.inner.clone(),
            rx: self.inner.result.subscribe(),
        }
    }

    /// Run to completion. Equivalent to awaiting the runner.
    pub async fn run(&self) -> Result<ExecResult> {
        self.start().wait().await
    }

    /// Run to completion on the calling thread, for non-async callers.
    ///
    /// Fails with [`Error::AlreadyStarted`] when the runner was already
    /// started asynchronously, and with [`Error::BlockingInAsyncContext`]
    /// when called from inside a runtime.
    pub fn run_blocking(&self) -> Result<ExecResult> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::BlockingInAsyncContext);
        }
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run())
    }

    /// Chunks of output (both channels) as they arrive, auto-starting the
    /// runner.
    ///
    /// Dropping the stream before its end cancels the runner and discards
    /// anything still buffered.
    pub fn stream(&self) -> OutputStream {
        self.stream_filtered(None)
    }

    /// Like [`Runner::stream`], stdout chunks only.
    pub fn stdout_stream(&self) -> OutputStream {
        self.stream_filtered(Some(ChunkKind::Stdout))
    }

    /// Like [`Runner::stream`], stderr chunks only.
    pub fn stderr_stream(&self) -> OutputStream {
        self.stream_filtered(Some(ChunkKind::Stderr))
    }

    fn stream_filtered(&self, filter: Option<ChunkKind>) -> OutputStream {
        let mut events = EventStream::new(self.inner.events.subscribe());
        self.ensure_started();
        if self.finished() {
            events.mark_finished();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let forward = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let chunk = match event {
                    RunnerEvent::Stdout(data) => Chunk {
                        kind: ChunkKind::Stdout,
                        data,
                    },
                    RunnerEvent::Stderr(data) => Chunk {
                        kind: ChunkKind::Stderr,
                        data,
                    },
                    RunnerEvent::End(_) | RunnerEvent::Exit(_) => continue,
                };
                if filter.is_some_and(|kind| kind != chunk.kind) {
                    continue;
                }
                if tx.send(chunk).is_err() {
                    break;
                }
            }
        });
        OutputStream {
            runner: self.clone(),
            rx,
            forward,
        }
    }

    /// Subscribe to the event channel, auto-starting the runner.
    ///
    /// A subscription made after the runner finished yields whatever is
    /// still buffered, then ends.
    pub fn events(&self) -> EventStream {
        let mut events = EventStream::new(self.inner.events.subscribe());
        self.ensure_started();
        if self.finished() {
            events.mark_finished();
        }
        events
    }

    /// The child's stdin handle, auto-starting the runner.
    ///
    /// Resolves once the implementation is decided: `Some` for a real
    /// child spawned with a piped stdin (`stdin: pipe`), `None` for
    /// virtual commands, for children whose stdin went elsewhere, and for
    /// finished runners.
    pub async fn stdin(&self) -> Option<StdinHandle> {
        self.ensure_started();
        let mut state_rx = self.inner.state.subscribe();
        loop {
            let current = *state_rx.borrow_and_update();
            match current {
                State::Running | State::Finishing => {
                    return self
                        .inner
                        .stdin_slot
                        .lock()
                        .unwrap()
                        .take()
                        .map(|stdin| StdinHandle {
                            stdin,
                            runner: self.inner.clone(),
                        });
                }
                State::Finished => return None,
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Captured stdout once finished (auto-starts and waits).
    pub async fn stdout_bytes(&self) -> Option<Vec<u8>> {
        self.ensure_started();
        self.wait_raw().await.stdout
    }

    pub async fn stderr_bytes(&self) -> Option<Vec<u8>> {
        self.ensure_started();
        self.wait_raw().await.stderr
    }

    pub async fn stdin_bytes(&self) -> Option<Vec<u8>> {
        self.ensure_started();
        self.wait_raw().await.stdin
    }

    pub async fn stdout_text(&self) -> String {
        self.ensure_started();
        self.wait_raw().await.text()
    }

    pub async fn stderr_text(&self) -> String {
        self.ensure_started();
        self.wait_raw().await.stderr_text()
    }

    /// Compose this runner's stdout into `destination`'s stdin.
    ///
    /// The destination's options (notably `capture` and `mirror`) govern
    /// the pipeline's observable output.
    pub fn pipe(&self, destination: Runner) -> Runner {
        let options = destination.inner.options.lock().unwrap().clone();
        Runner::from_spec(
            Spec::Pipe {
                src: self.clone(),
                dst: destination,
            },
            options,
        )
    }

    /// Cancel the runner: mark it cancelled, deliver `signal` to the child
    /// process group, cancel any virtual handler, kill owned sub-runners,
    /// and finish with the signal-mapped exit code.
    pub async fn kill(&self, signal: Signal) {
        if self.finished() {
            return;
        }
        self.inner.initiate_kill(signal);
        let mut rx = self.inner.result.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
    }

    pub(crate) async fn wait_raw(&self) -> ExecResult {
        let mut rx = self.inner.result.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(guard) => guard.clone().expect("checked by wait_for"),
            Err(_) => ExecResult::from_code(1),
        }
    }

    pub(crate) fn adopt_stage(&self, stage: &Runner) {
        self.inner.stage_runners.lock().unwrap().push(stage.clone());
        if self.inner.cancelled.load(Ordering::SeqCst) {
            stage.inner.initiate_kill(self.inner.kill_signal_or_term());
        }
    }
}

impl RunnerInner {
    pub(crate) fn state_running(&self) {
        self.state.send_replace(State::Running);
    }

    pub(crate) fn adopt_stage(&self, stage: &Runner) {
        self.stage_runners.lock().unwrap().push(stage.clone());
        if self.cancelled.load(Ordering::SeqCst) {
            stage.inner.initiate_kill(self.kill_signal_or_term());
        }
    }

    pub(crate) fn kill_code(&self) -> i32 {
        self.kill_signal_or_term().exit_code()
    }

    pub(crate) fn kill_signal_or_term(&self) -> Signal {
        self.kill_signal.lock().unwrap().unwrap_or(Signal::Term)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Deliver `signal` to the child's process group (and the pid itself).
    pub(crate) fn signal_child(&self, signal: Signal) {
        #[cfg(unix)]
        {
            let pid = self.child_pid.load(Ordering::SeqCst);
            if pid > 0 {
                // SAFETY: kill() is async-signal-safe; the negative pid
                // targets the process group created at spawn.
                unsafe {
                    libc::kill(pid, signal.raw());
                    libc::kill(-pid, signal.raw());
                }
            }
        }
        #[cfg(not(unix))]
        let _ = signal;
    }

    /// Synchronous half of `kill`: usable from `Drop` and signal handlers.
    pub(crate) fn initiate_kill(self: &Arc<Self>, signal: Signal) {
        if self.finish_flag.load(Ordering::SeqCst) {
            return;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.kill_signal.lock().unwrap().get_or_insert(signal);

        let stages: Vec<Runner> = self.stage_runners.lock().unwrap().clone();
        for stage in stages {
            stage.inner.initiate_kill(signal);
        }
        if let Spec::Pipe { src, dst } = &self.spec {
            src.inner.initiate_kill(signal);
            dst.inner.initiate_kill(signal);
        }

        self.cancel.cancel();
        self.signal_child(signal);

        if !self.started.load(Ordering::SeqCst) {
            // Never driven: claim the start guard so a later driver cannot
            // run, and finish directly with the mapped code.
            let this = self.clone();
            self.start_once.call_once(move || {
                this.started.store(true, Ordering::SeqCst);
                this.state.send_replace(State::Finishing);
            });
            self.finish(ExecResult::from_code(signal.exit_code()));
        }
    }

    /// Graceful shutdown after the parent's streams closed: stop emitting,
    /// close the child's stdin, let it exit on its own, and TERM it on the
    /// next scheduler turn if it has not.
    pub(crate) fn soft_shutdown(self: &Arc<Self>) {
        if self.finish_flag.load(Ordering::SeqCst) {
            return;
        }
        self.suppress_output.store(true, Ordering::SeqCst);
        *self.stdin_slot.lock().unwrap() = None;

        let real_child = self.child_pid.load(Ordering::SeqCst) > 0;
        if !real_child {
            // Virtual implementations stop through their token.
            self.cancelled.store(true, Ordering::SeqCst);
            self.kill_signal.lock().unwrap().get_or_insert(Signal::Term);
            self.cancel.cancel();
            return;
        }

        let this = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    if !this.finish_flag.load(Ordering::SeqCst) {
                        this.initiate_kill(Signal::Term);
                    }
                });
            }
            Err(_) => this.initiate_kill(Signal::Term),
        }
    }

    pub(crate) fn set_failed_stage(&self, stage: usize, code: i32) {
        self.failed_stage.lock().unwrap().get_or_insert((stage, code));
    }

    fn emit_gates_closed(&self) -> bool {
        self.finish_flag.load(Ordering::SeqCst)
            || self.cancelled.load(Ordering::SeqCst)
            || self.suppress_output.load(Ordering::SeqCst)
    }

    /// Push one chunk through policy, capture, events, and (optionally)
    /// the mirror to the parent's stream.
    pub(crate) async fn emit_chunk(&self, kind: ChunkKind, bytes: &[u8]) {
        if self.emit_gates_closed() {
            return;
        }
        let (mirror, capture, ansi) = {
            let opts = self.options.lock().unwrap();
            (opts.mirror, opts.capture, opts.ansi)
        };
        let processed = output::process_output(bytes, ansi.as_ref());
        self.record_chunk(kind, capture, &processed);
        if mirror {
            let stream = match kind {
                ChunkKind::Stdout => ParentStream::Stdout,
                ChunkKind::Stderr => ParentStream::Stderr,
            };
            match io::write_parent(stream, &processed).await {
                Ok(WriteOutcome::Written) => {}
                Ok(WriteOutcome::Closed) => signal::parent_stream_closed(),
                Err(e) => {
                    tracing::warn!(target: "command_stream::io", error = %e, "parent write failed");
                }
            }
        }
    }

    /// Like `emit_chunk` but without mirroring: used when re-emitting a
    /// sub-runner's output (the sub-runner already mirrored it).
    pub(crate) fn forward_chunk(&self, kind: ChunkKind, bytes: &[u8]) {
        if self.emit_gates_closed() {
            return;
        }
        let capture = self.options.lock().unwrap().capture;
        self.record_chunk(kind, capture, bytes);
    }

    fn record_chunk(&self, kind: ChunkKind, capture: bool, bytes: &[u8]) {
        if capture {
            let mut captured = self.captured.lock().unwrap();
            match kind {
                ChunkKind::Stdout => captured.out.push(bytes.to_vec()),
                ChunkKind::Stderr => captured.err.push(bytes.to_vec()),
            }
        }
        let _ = self.events.send(match kind {
            ChunkKind::Stdout => RunnerEvent::Stdout(bytes.to_vec()),
            ChunkKind::Stderr => RunnerEvent::Stderr(bytes.to_vec()),
        });
    }

    pub(crate) fn record_stdin(&self, bytes: &[u8]) {
        if self.options.lock().unwrap().capture {
            self.captured.lock().unwrap().inp.push(bytes.to_vec());
        }
    }

    pub(crate) fn push_captured_err(&self, bytes: Vec<u8>) {
        if !bytes.is_empty() && self.options.lock().unwrap().capture {
            self.captured.lock().unwrap().err.push(bytes);
        }
    }

    /// Terminal transition: store the result, emit `End` then `Exit`, mark
    /// `Finished`, release resources, leave the active set. Idempotent.
    pub(crate) fn finish(self: &Arc<Self>, mut result: ExecResult) {
        if self.finish_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(State::Finishing);

        let capture = self.options.lock().unwrap().capture;
        if capture {
            let captured = self.captured.lock().unwrap();
            if result.stdout.is_none() {
                result.stdout = Some(concat(&captured.out));
            }
            if result.stderr.is_none() {
                result.stderr = Some(concat(&captured.err));
            }
            if result.stdin.is_none() && !captured.inp.is_empty() {
                result.stdin = Some(concat(&captured.inp));
            }
        }

        tracing::debug!(
            target: "command_stream::runner",
            code = result.code,
            command = %self.spec.display(),
            "finished"
        );

        self.result.send_replace(Some(result.clone()));
        let _ = self.events.send(RunnerEvent::End(result.clone()));
        let _ = self.events.send(RunnerEvent::Exit(result.code));
        self.state.send_replace(State::Finished);

        *self.stdin_slot.lock().unwrap() = None;
        *self.stdin_feed.lock().unwrap() = None;
        self.stage_runners.lock().unwrap().clear();
        signal::remove(self);
    }
}

/// Resolves to the runner's terminal result, applying the `errexit` and
/// `pipefail` surfacing policies.
pub struct ResultHandle {
    inner: Arc<RunnerInner>,
    rx: watch::Receiver<Option<ExecResult>>,
}

impl ResultHandle {
    pub async fn wait(mut self) -> Result<ExecResult> {
        let result = match self.rx.wait_for(Option::is_some).await {
            Ok(guard) => guard.clone().expect("checked by wait_for"),
            Err(_) => ExecResult::from_code(1),
        };
        if result.code != 0 && shell::settings().errexit {
            if let Some((stage, code)) = *self.inner.failed_stage.lock().unwrap() {
                return Err(Error::PipelineStageFailed {
                    stage,
                    code,
                    result,
                });
            }
            return Err(Error::NonZeroExit {
                code: result.code,
                result,
            });
        }
        Ok(result)
    }
}

impl IntoFuture for Runner {
    type Output = Result<ExecResult>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.start().wait().await })
    }
}

impl IntoFuture for &Runner {
    type Output = Result<ExecResult>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        let runner = self.clone();
        runner.into_future()
    }
}

/// Async sequence of output chunks; see [`Runner::stream`].
pub struct OutputStream {
    runner: Runner,
    rx: mpsc::UnboundedReceiver<Chunk>,
    forward: tokio::task::JoinHandle<()>,
}

impl OutputStream {
    pub async fn next(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }
}

impl futures::Stream for OutputStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.forward.abort();
        if !self.runner.finished() {
            self.runner.inner.suppress_output.store(true, Ordering::SeqCst);
            self.runner.inner.initiate_kill(Signal::Term);
        }
    }
}

/// Writable handle to a piped child stdin; see [`Runner::stdin`].
pub struct StdinHandle {
    stdin: ChildStdin,
    runner: Arc<RunnerInner>,
}

impl StdinHandle {
    /// Write to the child. A child that already closed its end is not an
    /// error; the write becomes a no-op.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.runner.record_stdin(bytes);
        io::write_child_stdin(&mut self.stdin, bytes).await?;
        Ok(())
    }

    /// Close the child's stdin, delivering EOF.
    pub async fn close(mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        self.stdin.shutdown().await?;
        Ok(())
    }
}

async fn drive(inner: Arc<RunnerInner>) {
    signal::ensure_listener();

    // External cancellation handle: abort means TERM.
    let external = inner.options.lock().unwrap().cancel.clone();
    if let Some(external) = external {
        let this = inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = external.cancelled() => this.initiate_kill(Signal::Term),
                _ = this.cancel.cancelled() => {}
            }
        });
    }

    let display_str = inner.spec.display();
    let settings = shell::settings();
    if settings.verbose {
        let _ = io::write_parent(ParentStream::Stderr, format!("{display_str}\n").as_bytes()).await;
    }
    if settings.xtrace {
        let _ = io::write_parent(ParentStream::Stderr, format!("+ {display_str}\n").as_bytes()).await;
    }
    tracing::debug!(target: "command_stream::runner", command = %display_str, "starting");

    match execute(&inner).await {
        Ok(result) => inner.finish(result),
        Err(e) => {
            // Every failure inside the core path still resolves to exactly
            // one terminal result; policy errors re-surface at the await.
            let code = match &e {
                Error::Spawn { source, .. }
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    127
                }
                _ => 1,
            };
            inner.emit_chunk(ChunkKind::Stderr, format!("{e}\n").as_bytes()).await;
            inner.finish(ExecResult::from_code(code));
        }
    }
}

async fn execute(inner: &Arc<RunnerInner>) -> Result<ExecResult> {
    if inner.is_cancelled() {
        return Ok(ExecResult::from_code(inner.kill_code()));
    }
    let opts = inner.options.lock().unwrap().clone();
    match &inner.spec {
        Spec::Exec { program, args } => {
            child::run_real(inner, program.clone(), args.clone(), Vec::new(), &opts).await
        }
        Spec::Simple(cmd) => run_simple(inner, cmd.clone(), &opts).await,
        Spec::Stages(stages) => pipeline::run_stages(inner, stages.clone(), &opts).await,
        Spec::Pipe { src, dst } => {
            pipeline::run_pair(inner, src.clone(), dst.clone(), &opts).await
        }
        Spec::Shell(command) => {
            if needs_real_shell(command) {
                tracing::debug!(target: "command_stream::runner", command = %command, "dispatching to real shell");
                return run_via_shell(inner, command, &opts).await;
            }
            match parse_command(command, opts.shell_operators) {
                Ok(ast) => run_ast(inner, ast, &opts).await,
                Err(e) => {
                    tracing::debug!(
                        target: "command_stream::runner",
                        command = %command,
                        error = %e,
                        "mini parse failed; dispatching to real shell"
                    );
                    run_via_shell(inner, command, &opts).await
                }
            }
        }
    }
}

async fn run_via_shell(
    inner: &Arc<RunnerInner>,
    command: &str,
    opts: &Options,
) -> Result<ExecResult> {
    let shell = state::shell_path();
    child::run_real(
        inner,
        shell.to_string_lossy().into_owned(),
        vec!["-c".to_string(), command.to_string()],
        Vec::new(),
        opts,
    )
    .await
}

/// Execute a parsed form. Boxed for async recursion (subshell bodies
/// re-enter here).
pub(crate) fn run_ast<'a>(
    inner: &'a Arc<RunnerInner>,
    ast: Ast,
    opts: &'a Options,
) -> Pin<Box<dyn Future<Output = Result<ExecResult>> + Send + 'a>> {
    Box::pin(async move {
        match ast {
            Ast::Simple(cmd) => run_simple(inner, cmd, opts).await,
            Ast::Pipeline(stages) => pipeline::run_stages(inner, stages, opts).await,
            Ast::Sequence {
                commands,
                operators,
            } => seq::run_sequence(inner, commands, operators, opts).await,
            Ast::Subshell(body) => seq::run_subshell(inner, *body, opts).await,
        }
    })
}

async fn run_simple(
    inner: &Arc<RunnerInner>,
    cmd: SimpleCmd,
    opts: &Options,
) -> Result<ExecResult> {
    let stdin_forces_real = matches!(opts.stdin, StdinMode::Pipe | StdinMode::Bytes(_))
        && virt::needs_real_process_for_stdin(&cmd.cmd);
    let dispatch_virtual = virt::enabled()
        && cmd.redirects.is_empty()
        && !stdin_forces_real
        && virt::lookup(&cmd.cmd).is_some();

    if dispatch_virtual {
        run_virtual(inner, cmd, opts).await
    } else {
        child::run_real(inner, cmd.cmd.clone(), cmd.arg_texts(), cmd.redirects, opts).await
    }
}

async fn run_virtual(
    inner: &Arc<RunnerInner>,
    cmd: SimpleCmd,
    opts: &Options,
) -> Result<ExecResult> {
    let handler = virt::lookup(&cmd.cmd).expect("dispatch checked the registry");

    // Input: explicit bytes win; otherwise drain a pipeline feed if one was
    // wired up. A plain `inherit` gives the handler no input.
    let stdin_bytes = match &opts.stdin {
        StdinMode::Bytes(bytes) => Some(bytes.clone()),
        _ => {
            let feed = inner.stdin_feed.lock().unwrap().take();
            match feed {
                Some(mut rx) => {
                    let mut collected = Vec::new();
                    while let Some(chunk) = rx.recv().await {
                        collected.extend_from_slice(&chunk);
                    }
                    Some(collected)
                }
                None => None,
            }
        }
    };
    if let Some(bytes) = &stdin_bytes {
        inner.record_stdin(bytes);
    }

    let cwd = match &opts.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let ctx = VirtualContext {
        args: cmd.arg_texts(),
        stdin: stdin_bytes,
        cwd,
        env: opts.env.clone(),
        cancel: inner.cancel.child_token(),
    };

    inner.state.send_replace(State::Running);
    tracing::trace!(target: "command_stream::virtual", command = %cmd.cmd, "dispatching virtual command");

    match handler {
        Handler::Unary(handler) => {
            tokio::select! {
                outcome = handler.call(ctx) => match outcome {
                    Ok(out) => {
                        if let Some(stdout) = &out.stdout {
                            inner.emit_chunk(ChunkKind::Stdout, stdout).await;
                        }
                        if let Some(stderr) = &out.stderr {
                            inner.emit_chunk(ChunkKind::Stderr, stderr).await;
                        }
                        Ok(ExecResult::from_code(out.code))
                    }
                    Err(e) => {
                        let code = e.raw_os_error().unwrap_or(1);
                        inner
                            .emit_chunk(ChunkKind::Stderr, format!("{}: {e}\n", cmd.cmd).as_bytes())
                            .await;
                        Ok(ExecResult::from_code(code))
                    }
                },
                _ = inner.cancel.cancelled() => {
                    Ok(ExecResult::from_code(inner.kill_code()))
                }
            }
        }
        Handler::Streaming(handler) => {
            let mut source = handler.open(ctx);
            let code = loop {
                tokio::select! {
                    chunk = source.next_chunk() => match chunk {
                        Some(Ok(bytes)) => {
                            inner.emit_chunk(ChunkKind::Stdout, &bytes).await;
                            if inner.suppress_output.load(Ordering::SeqCst) {
                                source.cancel().await;
                                break inner.kill_code();
                            }
                        }
                        Some(Err(e)) => {
                            let code = e.raw_os_error().unwrap_or(1);
                            inner
                                .emit_chunk(
                                    ChunkKind::Stderr,
                                    format!("{}: {e}\n", cmd.cmd).as_bytes(),
                                )
                                .await;
                            source.cancel().await;
                            break code;
                        }
                        None => break 0,
                    },
                    _ = inner.cancel.cancelled() => {
                        source.cancel().await;
                        break inner.kill_code();
                    }
                }
            };
            Ok(ExecResult::from_code(code))
        }
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
