use super::*;
use crate::events::RunnerEvent;

use std::time::Duration;

async fn wait_finished(runner: &Runner, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if runner.finished() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    runner.finished()
}

fn quiet() -> Options {
    Options::new().mirror(false)
}

#[tokio::test]
async fn test_fresh_runner_has_no_result() {
    let runner = Runner::shell_with("echo hi", quiet());
    assert_eq!(runner.state(), State::Fresh);
    assert!(runner.result().is_none());
    assert!(runner.code().is_none());
    // Drive it so the child does not outlive the test.
    let result = runner.run().await.unwrap();
    assert_eq!(result.code, 0);
}

#[tokio::test]
async fn test_await_yields_captured_stdout() {
    let result = Runner::shell_with("echo hello world", quiet())
        .run()
        .await
        .unwrap();
    assert_eq!(result.code, 0);
    assert_eq!(result.text(), "hello world\n");
    assert_eq!(result.stderr_text(), "");
}

#[tokio::test]
async fn test_exec_spec_bypasses_parsing() {
    let result = Runner::exec_with("echo", ["a|b"], quiet()).run().await.unwrap();
    assert_eq!(result.text(), "a|b\n");
}

#[tokio::test]
async fn test_capture_off_leaves_buffers_empty() {
    let result = Runner::shell_with("echo hi", quiet().capture(false))
        .run()
        .await
        .unwrap();
    assert_eq!(result.code, 0);
    assert!(result.stdout.is_none());
    assert!(result.stderr.is_none());
}

#[tokio::test]
async fn test_terminal_events_fire_once_in_order() {
    let runner = Runner::shell_with("echo data", quiet());
    let mut events = runner.events();
    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        seen.push(event);
    }
    // All chunks precede End; End precedes Exit; both terminal events are
    // the last two.
    assert!(seen.len() >= 3, "expected data + End + Exit, got {seen:?}");
    let end_pos = seen
        .iter()
        .position(|e| matches!(e, RunnerEvent::End(_)))
        .expect("End fired");
    assert_eq!(end_pos, seen.len() - 2);
    assert!(matches!(seen[seen.len() - 1], RunnerEvent::Exit(0)));
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, RunnerEvent::End(_)))
            .count(),
        1
    );
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, RunnerEvent::Exit(_)))
            .count(),
        1
    );

    // A late subscription after Finished sees nothing new.
    assert!(runner.finished());
}

#[tokio::test]
async fn test_late_subscription_sees_nothing() {
    let runner = Runner::shell_with("echo gone", quiet());
    runner.run().await.unwrap();

    let mut events = runner.events();
    assert!(events.next().await.is_none());

    let mut stream = runner.stream();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_result_stdout_matches_event_chunks() {
    let runner = Runner::shell_with("printf abc", quiet());
    let mut events = runner.events();
    let mut from_events = Vec::new();
    let mut from_end = None;
    while let Some(event) = events.next().await {
        match event {
            RunnerEvent::Stdout(data) => from_events.extend_from_slice(&data),
            RunnerEvent::End(result) => from_end = result.stdout.clone(),
            _ => {}
        }
    }
    assert_eq!(from_end.as_deref(), Some(from_events.as_slice()));
}

#[tokio::test]
async fn test_start_twice_is_idempotent() {
    let runner = Runner::shell_with("echo once", quiet());
    let first = runner.start();
    let second = runner.start();
    let a = first.wait().await.unwrap();
    let b = second.wait().await.unwrap();
    assert_eq!(a.code, b.code);
    assert_eq!(a.text(), b.text());
    assert_eq!(a.text(), "once\n");
}

#[test]
fn test_run_blocking_outside_runtime() {
    let result = Runner::shell_with("echo blocking", quiet())
        .run_blocking()
        .unwrap();
    assert_eq!(result.text(), "blocking\n");
}

#[test]
fn test_run_blocking_after_async_start_fails() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let runner = Runner::shell_with("echo hi", quiet());
    runtime.block_on(async {
        runner.run().await.unwrap();
    });
    assert!(matches!(runner.run_blocking(), Err(Error::AlreadyStarted)));
}

#[tokio::test]
async fn test_run_blocking_inside_runtime_fails() {
    let runner = Runner::shell_with("echo hi", quiet());
    assert!(matches!(
        runner.run_blocking(),
        Err(Error::BlockingInAsyncContext)
    ));
    runner.run().await.unwrap();
}

#[tokio::test]
async fn test_kill_before_start_finishes_with_signal_code() {
    let runner = Runner::shell_with("echo never", quiet());
    runner.kill(Signal::Term).await;
    assert!(runner.finished());
    assert!(runner.cancelled());
    assert_eq!(runner.code(), Some(143));
    // A later await observes the same terminal result.
    let result = runner.run().await.unwrap();
    assert_eq!(result.code, 143);
}

#[tokio::test]
async fn test_kill_running_child_maps_signal() {
    let runner = Runner::exec_with("sleep", ["30"], quiet());
    let handle = runner.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    runner.kill(Signal::Term).await;
    let result = handle.wait().await.unwrap();
    assert_eq!(result.code, 143);
    assert!(runner.cancelled());
}

#[tokio::test]
async fn test_kill_is_idempotent() {
    let runner = Runner::exec_with("sleep", ["30"], quiet());
    runner.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    runner.kill(Signal::Int).await;
    let first = runner.code();
    runner.kill(Signal::Kill).await;
    assert_eq!(runner.code(), first);
    assert_eq!(first, Some(130));
}

#[tokio::test]
async fn test_virtual_command_result_matches_direct_invocation() {
    crate::virt::register("unit-double", |ctx: VirtualContext| async move {
        let n: i64 = ctx.args[0].parse().unwrap_or(0);
        Ok(crate::virt::VirtualOutput::with_stdout(format!("{}\n", n * 2)))
    });
    let result = Runner::shell_with("unit-double 21", quiet())
        .run()
        .await
        .unwrap();
    assert_eq!(result.code, 0);
    assert_eq!(result.text(), "42\n");
    crate::virt::unregister("unit-double");
}

#[tokio::test]
async fn test_virtual_handler_error_maps_to_code() {
    crate::virt::register("unit-broken", |_ctx: VirtualContext| async move {
        Err::<crate::virt::VirtualOutput, _>(std::io::Error::other("boom"))
    });
    let result = Runner::shell_with("unit-broken", quiet()).run().await.unwrap();
    assert_eq!(result.code, 1);
    assert!(result.stderr_text().contains("boom"));
    crate::virt::unregister("unit-broken");
}

#[tokio::test]
async fn test_stdin_pipe_forces_real_cat_and_returns_handle() {
    let runner = Runner::shell_with("cat", quiet().stdin(StdinMode::Pipe));
    let handle = runner.start();
    let mut stdin = runner.stdin().await.expect("piped stdin handle");
    stdin.write_all(b"fed through the pipe").await.unwrap();
    stdin.close().await.unwrap();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.code, 0);
    assert_eq!(result.text(), "fed through the pipe");
    assert_eq!(result.stdin.as_deref(), Some(b"fed through the pipe".as_ref()));
}

#[tokio::test]
async fn test_stdin_is_none_for_virtual_and_finished_runners() {
    let runner = Runner::shell_with("echo virtual", quiet());
    runner.run().await.unwrap();
    assert!(runner.stdin().await.is_none());
}

#[tokio::test]
async fn test_stdin_bytes_are_written_and_captured() {
    let runner = Runner::shell_with("cat", quiet().stdin("from bytes"));
    let result = runner.run().await.unwrap();
    assert_eq!(result.text(), "from bytes");
    assert_eq!(result.stdin.as_deref(), Some(b"from bytes".as_ref()));
}

#[tokio::test]
async fn test_buffer_accessors_auto_start() {
    let runner = Runner::shell_with("echo buffered", quiet());
    assert_eq!(runner.stdout_text().await, "buffered\n");
    assert!(runner.finished());
    assert_eq!(runner.stdout_bytes().await.as_deref(), Some(b"buffered\n".as_ref()));
    assert_eq!(runner.stderr_text().await, "");
}

#[tokio::test]
async fn test_kind_filtered_streams() {
    let runner = Runner::shell_with(r#"sh -c "echo out; echo err >&2""#, quiet());
    let mut out = runner.stdout_stream();
    let mut err = runner.stderr_stream();

    let mut out_bytes = Vec::new();
    while let Some(chunk) = out.next().await {
        assert_eq!(chunk.kind, ChunkKind::Stdout);
        out_bytes.extend_from_slice(&chunk.data);
    }
    let mut err_bytes = Vec::new();
    while let Some(chunk) = err.next().await {
        assert_eq!(chunk.kind, ChunkKind::Stderr);
        err_bytes.extend_from_slice(&chunk.data);
    }
    assert_eq!(out_bytes, b"out\n");
    assert_eq!(err_bytes, b"err\n");
}

#[tokio::test]
async fn test_stream_yields_chunks_then_ends() {
    let mut stream = Runner::shell_with("echo streamed", quiet()).stream();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        assert_eq!(chunk.kind, ChunkKind::Stdout);
        collected.extend_from_slice(&chunk.data);
    }
    assert_eq!(collected, b"streamed\n");
}

struct Counter {
    limit: usize,
    emitted: usize,
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait::async_trait]
impl crate::virt::ByteSource for Counter {
    async fn next_chunk(&mut self) -> Option<std::io::Result<Vec<u8>>> {
        if self.emitted >= self.limit {
            return None;
        }
        self.emitted += 1;
        tokio::time::sleep(Duration::from_millis(5)).await;
        Some(Ok(format!("{}\n", self.emitted).into_bytes()))
    }

    async fn cancel(&mut self) {
        self.cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

struct CounterCommand {
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl crate::virt::StreamingCommand for CounterCommand {
    fn open(&self, _ctx: VirtualContext) -> Box<dyn crate::virt::ByteSource> {
        Box::new(Counter {
            limit: 100_000,
            emitted: 0,
            cancelled: self.cancelled.clone(),
        })
    }
}

#[tokio::test]
async fn test_breaking_stream_cancels_generator() {
    let cancelled = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    crate::virt::register_streaming(
        "unit-counter",
        std::sync::Arc::new(CounterCommand {
            cancelled: cancelled.clone(),
        }),
    );

    let runner = Runner::shell_with("unit-counter", quiet());
    {
        let mut stream = runner.stream();
        let first = stream.next().await.expect("one chunk");
        assert_eq!(first.data, b"1\n");
    }
    assert!(wait_finished(&runner, Duration::from_secs(2)).await);
    assert_eq!(runner.code(), Some(143));
    assert!(cancelled.load(std::sync::atomic::Ordering::SeqCst));
    crate::virt::unregister("unit-counter");
}

#[tokio::test]
async fn test_external_cancellation_token_kills_with_term() {
    let token = tokio_util::sync::CancellationToken::new();
    let runner = Runner::exec_with("sleep", ["30"], quiet().cancel(token.clone()));
    let handle = runner.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.code, 143);
}

#[tokio::test]
async fn test_unknown_command_reports_not_found() {
    let result = Runner::shell_with("definitely-not-a-command-xyz", quiet())
        .run()
        .await
        .unwrap();
    assert_eq!(result.code, 127);
    assert!(!result.stderr_text().is_empty());
}

#[tokio::test]
async fn test_spec_display_for_xtrace() {
    let runner = Runner::exec_with("echo", ["a b"], quiet());
    assert_eq!(runner.inner.spec.display(), "echo 'a b'");
    runner.run().await.unwrap();
}

#[tokio::test]
async fn test_simple_redirect_goes_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out.txt");
    let command = format!("echo redirected > {}", target.display());
    let result = Runner::shell_with(command, quiet()).run().await.unwrap();
    assert_eq!(result.code, 0);
    let contents = std::fs::read_to_string(&target).unwrap();
    assert_eq!(contents, "redirected\n");
}
