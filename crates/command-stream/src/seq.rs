//! Sequence (`&&`, `;`, `||`) and subshell execution.

use std::path::PathBuf;
use std::sync::Arc;

use command_stream_parse::{Ast, SeqOp};

use crate::error::Result;
use crate::options::Options;
use crate::result::ExecResult;
use crate::runner::{run_ast, RunnerInner};

/// Run a command list with shell short-circuit semantics: `&&` skips on
/// failure, `||` skips on success, `;` never skips. The sequence's code is
/// the last executed command's; output concatenates in execution order.
pub(crate) async fn run_sequence(
    inner: &Arc<RunnerInner>,
    commands: Vec<Ast>,
    operators: Vec<SeqOp>,
    opts: &Options,
) -> Result<ExecResult> {
    inner.state_running();
    let mut last_code = 0;
    for (i, node) in commands.into_iter().enumerate() {
        if i > 0 {
            let skip = match operators.get(i - 1) {
                Some(SeqOp::And) => last_code != 0,
                Some(SeqOp::Or) => last_code == 0,
                _ => false,
            };
            if skip {
                continue;
            }
        }
        if inner.is_cancelled() {
            last_code = inner.kill_code();
            break;
        }
        last_code = run_ast(inner, node, opts).await?.code;
    }
    Ok(ExecResult::from_code(last_code))
}

/// Run a subshell body with working-directory isolation: cwd is saved
/// before and restored after, so `cd` inside `( … )` does not leak out.
pub(crate) async fn run_subshell(
    inner: &Arc<RunnerInner>,
    body: Ast,
    opts: &Options,
) -> Result<ExecResult> {
    inner.state_running();
    let saved = std::env::current_dir().ok();
    let outcome = run_ast(inner, body, opts).await;
    restore_cwd(saved);
    Ok(ExecResult::from_code(outcome?.code))
}

/// Put the process back where it was. A saved directory that no longer
/// exists falls back to home, then to the filesystem root; the process
/// must never be left somewhere it cannot stat.
fn restore_cwd(saved: Option<PathBuf>) {
    if let Some(dir) = saved {
        if std::env::set_current_dir(&dir).is_ok() {
            return;
        }
        tracing::warn!(
            target: "command_stream::runner",
            dir = %dir.display(),
            "saved working directory is gone; falling back"
        );
    }
    if let Some(home) = std::env::home_dir() {
        if std::env::set_current_dir(&home).is_ok() {
            return;
        }
    }
    let _ = std::env::set_current_dir("/");
}
