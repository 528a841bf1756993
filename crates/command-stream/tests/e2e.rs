//! End-to-end scenarios over the public surface.
//!
//! Everything here runs serialized: these tests exercise process-global
//! state (shell settings, the virtual registry, the working directory, the
//! active-runner set).

use std::time::Duration;

use command_stream::{
    cmd, disable_virtual_commands, enable_virtual_commands, exec, interrupt_active_runners,
    list_commands, quote, register, reset_global_state, run, set_interrupt_exit, sh, shell,
    ChunkKind, Error, Options, Runner, Signal, VirtualContext, VirtualOutput,
};
use serial_test::serial;

fn quiet() -> Options {
    Options::new().mirror(false)
}

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

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

// S1 — quoting round-trips through the template builder.
#[tokio::test]
#[serial]
async fn s1_interpolated_single_quote() {
    let result = cmd!("echo {}", "it's").start_with(quiet()).wait().await.unwrap();
    assert_eq!(result.code, 0);
    assert_eq!(result.text(), "it's\n");
}

#[tokio::test]
#[serial]
async fn s1_quoting_survives_a_real_shell() {
    // The backtick forces dispatch through the system shell, so the quoted
    // interpolation must survive real shell evaluation.
    let result = cmd!("echo `true` {}", "it's")
        .start_with(quiet())
        .wait()
        .await
        .unwrap();
    assert_eq!(result.code, 0);
    assert_eq!(result.text(), "it's\n");
}

#[tokio::test]
#[serial]
async fn s1_quoting_survives_without_virtual_dispatch() {
    disable_virtual_commands();
    let result = cmd!("echo {}", "it's").start_with(quiet()).wait().await.unwrap();
    enable_virtual_commands();
    assert_eq!(result.code, 0);
    assert_eq!(result.text(), "it's\n");
}

// Property 3 — `echo ${quote(v)}` round-trips values without single quotes.
#[tokio::test]
#[serial]
async fn quote_round_trips_through_echo() {
    for value in ["plain", "two words", "$HOME", "a;b|c&&d", "tabs\tkept", ""] {
        let command = format!("echo {}", quote(value));
        let result = command_stream::run(command).await.unwrap();
        assert_eq!(result.text(), format!("{value}\n"), "value {value:?}");
    }
}

// S2 — pipeline ordering.
#[tokio::test]
#[serial]
async fn s2_pipeline_grep() {
    let result = cmd!("printf 'a\\nb\\nc\\n' | grep b")
        .start_with(quiet())
        .wait()
        .await
        .unwrap();
    assert_eq!(result.code, 0);
    assert_eq!(result.text(), "b\n");
}

// S3 — pipefail surfaces the first failing stage's code.
#[tokio::test]
#[serial]
async fn s3_pipefail_first_nonzero_code() {
    shell::pipefail(true);
    let result = cmd!(r#"sh -c "exit 3" | cat"#)
        .start_with(quiet())
        .wait()
        .await
        .unwrap();
    shell::pipefail(false);
    assert_eq!(result.code, 3);
}

#[tokio::test]
#[serial]
async fn pipefail_off_keeps_last_stage_code() {
    let result = cmd!(r#"sh -c "exit 3" | cat"#)
        .start_with(quiet())
        .wait()
        .await
        .unwrap();
    assert_eq!(result.code, 0);
}

// S4 — errexit turns a non-zero exit into an error carrying the result.
#[tokio::test]
#[serial]
async fn s4_errexit_throws_with_code() {
    shell::errexit(true);
    let outcome = cmd!("exit 7").start_with(quiet()).wait().await;
    shell::errexit(false);
    match outcome {
        Err(Error::NonZeroExit { code, result }) => {
            assert_eq!(code, 7);
            assert_eq!(result.code, 7);
        }
        other => panic!("expected NonZeroExit, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn errexit_with_pipefail_names_the_failing_stage() {
    shell::errexit(true);
    shell::pipefail(true);
    let outcome = cmd!(r#"sh -c "exit 3" | cat"#).start_with(quiet()).wait().await;
    shell::pipefail(false);
    shell::errexit(false);
    match outcome {
        Err(Error::PipelineStageFailed { stage, code, .. }) => {
            assert_eq!(stage, 0);
            assert_eq!(code, 3);
        }
        other => panic!("expected PipelineStageFailed, got {other:?}"),
    }
}

// S5 — breaking a stream early kills the whole invocation.
#[tokio::test]
#[serial]
#[cfg(unix)]
async fn s5_stream_early_break_terminates_child() {
    let runner = Runner::exec_with("yes", Vec::<String>::new(), quiet().capture(false));
    let pid;
    {
        let mut stream = runner.stream();
        let first = stream.next().await.expect("yes produces output");
        assert_eq!(first.kind, ChunkKind::Stdout);
        assert!(!first.data.is_empty());
        pid = runner.pid().expect("real child has a pid");
    }
    assert!(wait_finished(&runner, Duration::from_millis(500)).await);
    assert!(!process_alive(pid), "yes (pid {pid}) should be gone");
}

// S6 — a registered virtual command participates in a pipeline.
#[tokio::test]
#[serial]
async fn s6_virtual_command_in_pipeline() {
    register("greet", |ctx: VirtualContext| async move {
        Ok(VirtualOutput::with_stdout(format!(
            "Hello, {}!\n",
            ctx.stdin_text().trim()
        )))
    });
    assert!(list_commands().iter().any(|c| c == "greet"));

    let src = Runner::shell_with("echo World", quiet());
    let dst = Runner::shell_with("greet", quiet());
    let result = src.pipe(dst).run().await.unwrap();
    assert_eq!(result.code, 0);
    assert_eq!(result.text(), "Hello, World!\n");

    command_stream::unregister("greet");
    assert!(!list_commands().iter().any(|c| c == "greet"));
}

// S7 — a forwarded interrupt reaches the child's process group.
#[tokio::test]
#[serial]
#[cfg(unix)]
async fn s7_interrupt_forwarding() {
    set_interrupt_exit(false);
    let runner = Runner::exec_with("sleep", ["30"], quiet());
    let handle = runner.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let pid = runner.pid().expect("real child has a pid");

    assert!(interrupt_active_runners());
    let result = handle.wait().await.unwrap();
    assert_eq!(result.code, 130);
    assert!(wait_finished(&runner, Duration::from_millis(500)).await);
    // Give the reaper a moment, then the pid must be gone.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!process_alive(pid), "sleep (pid {pid}) should be gone");
    set_interrupt_exit(true);
}

#[tokio::test]
#[serial]
async fn interrupt_with_nothing_active_is_not_consumed() {
    assert!(!interrupt_active_runners());
}

// S8 — subshell cwd isolation.
#[tokio::test]
#[serial]
async fn s8_subshell_cwd_isolation() {
    let original = std::env::current_dir().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let base = std::fs::canonicalize(dir.path()).unwrap();
    std::env::set_current_dir(&base).unwrap();

    let result = cmd!("(cd /; pwd); pwd").start_with(quiet()).wait().await.unwrap();
    let cwd_after = std::env::current_dir().unwrap();
    std::env::set_current_dir(&original).unwrap();

    assert_eq!(result.code, 0);
    let text = result.text();
    assert!(text.starts_with("/\n"), "stdout was {text:?}");
    assert!(
        text.ends_with(&format!("{}\n", base.display())),
        "stdout was {text:?}"
    );
    assert_eq!(cwd_after, base, "parent cwd must be untouched");
}

// Sequences: short-circuiting and `;`.
#[tokio::test]
#[serial]
async fn sequence_short_circuit_operators() {
    let result = cmd!("true && echo yes || echo no").start_with(quiet()).wait().await.unwrap();
    assert_eq!(result.text(), "yes\n");

    let result = cmd!("false && echo yes || echo no").start_with(quiet()).wait().await.unwrap();
    assert_eq!(result.text(), "no\n");
    assert_eq!(result.code, 0);

    let result = cmd!("false; echo after").start_with(quiet()).wait().await.unwrap();
    assert_eq!(result.text(), "after\n");
    assert_eq!(result.code, 0);

    let result = cmd!("false && echo skipped").start_with(quiet()).wait().await.unwrap();
    assert_eq!(result.text(), "");
    assert_eq!(result.code, 1);
}

// Convenience surface.
#[tokio::test]
#[serial]
async fn sh_run_exec_helpers() {
    // `sh` mirrors by default; keep the output quiet by capturing a silent
    // command.
    let result = sh("true").await.unwrap();
    assert_eq!(result.code, 0);

    let result = run("echo quiet").await.unwrap();
    assert_eq!(result.text(), "quiet\n");

    let result = exec("printf", ["%s", "argv"]).await.unwrap();
    assert_eq!(result.text(), "argv");
}

#[tokio::test]
#[serial]
async fn shell_flag_toggles() {
    assert!(shell::set("errexit"));
    assert!(shell::settings().errexit);
    assert!(shell::unset("e"));
    assert!(!shell::settings().errexit);
    assert!(shell::set("x"));
    assert!(shell::settings().xtrace);
    assert!(shell::unset("xtrace"));
    assert!(!shell::set("nosuchflag"));
    assert_eq!(shell::settings(), command_stream::Settings::default());
}

// Property 8 — reset restores the load-time working directory.
#[tokio::test]
#[serial]
async fn reset_global_state_restores_everything() {
    // Force the load-time cwd capture before this test moves around.
    reset_global_state();
    let initial = std::env::current_dir().unwrap();

    shell::errexit(true);
    shell::pipefail(true);
    command_stream::configure_ansi(command_stream::AnsiOverride {
        preserve_ansi: Some(false),
        preserve_control_chars: Some(false),
    });
    disable_virtual_commands();
    command_stream::unregister("echo");
    let dir = tempfile::tempdir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();

    reset_global_state();

    assert_eq!(std::env::current_dir().unwrap(), initial);
    assert_eq!(shell::settings(), command_stream::Settings::default());
    assert_eq!(
        command_stream::ansi_config(),
        command_stream::AnsiConfig::default()
    );
    assert!(list_commands().iter().any(|c| c == "echo"));

    // Virtual dispatch works again after the reset.
    let result = cmd!("echo back").start_with(quiet()).wait().await.unwrap();
    assert_eq!(result.text(), "back\n");
}

// Killing a pipeline kills every stage.
#[tokio::test]
#[serial]
#[cfg(unix)]
async fn killing_a_pipeline_kills_all_stages() {
    let src = Runner::exec_with("yes", Vec::<String>::new(), quiet().capture(false));
    let dst = Runner::shell_with("sleep 30", quiet());
    let pipeline = src.pipe(dst);
    let handle = pipeline.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    pipeline.kill(Signal::Term).await;
    let result = handle.wait().await.unwrap();
    assert_eq!(result.code, 143);
    assert!(wait_finished(&src, Duration::from_millis(500)).await);
}

// Kill-to-exit-code mapping at the boundary.
#[tokio::test]
#[serial]
async fn signal_exit_code_mapping() {
    for (signal, code) in [
        (Signal::Int, 130),
        (Signal::Term, 143),
        (Signal::Kill, 137),
    ] {
        let runner = Runner::exec_with("sleep", ["30"], quiet());
        runner.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.kill(signal).await;
        assert_eq!(runner.code(), Some(code), "signal {signal:?}");
    }
}
