//! Default virtual commands.
//!
//! Only commands the executors themselves lean on are built in: `cd` must
//! mutate the process working directory for subshell save/restore to mean
//! anything, and the rest keep simple scripts from paying a fork for a
//! one-liner. Bodies stay minimal; the calling convention is the contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::virt::{FnCommand, Handler, VirtualContext, VirtualOutput};

pub(crate) fn defaults() -> HashMap<String, Handler> {
    let mut map = HashMap::new();
    let mut add = |name: &str, handler: Handler| {
        map.insert(name.to_string(), handler);
    };

    add("cd", Handler::Unary(Arc::new(FnCommand(cd))));
    add("pwd", Handler::Unary(Arc::new(FnCommand(pwd))));
    add("echo", Handler::Unary(Arc::new(FnCommand(echo))));
    add("sleep", Handler::Unary(Arc::new(FnCommand(sleep))));
    add("cat", Handler::Unary(Arc::new(FnCommand(cat))));
    add("true", Handler::Unary(Arc::new(FnCommand(succeed))));
    add("false", Handler::Unary(Arc::new(FnCommand(fail))));
    add("exit", Handler::Unary(Arc::new(FnCommand(exit))));
    map
}

async fn cd(ctx: VirtualContext) -> std::io::Result<VirtualOutput> {
    let target = match ctx.args.first() {
        Some(dir) => std::path::PathBuf::from(dir),
        None => match std::env::home_dir() {
            Some(home) => home,
            None => return Ok(VirtualOutput::failure(1, "cd: no home directory\n")),
        },
    };
    match std::env::set_current_dir(&target) {
        Ok(()) => Ok(VirtualOutput::ok()),
        Err(e) => Ok(VirtualOutput::failure(
            1,
            format!("cd: {}: {e}\n", target.display()),
        )),
    }
}

async fn pwd(_ctx: VirtualContext) -> std::io::Result<VirtualOutput> {
    let cwd = std::env::current_dir()?;
    Ok(VirtualOutput::with_stdout(format!("{}\n", cwd.display())))
}

async fn echo(ctx: VirtualContext) -> std::io::Result<VirtualOutput> {
    let mut args = ctx.args.as_slice();
    let mut newline = true;
    if args.first().map(String::as_str) == Some("-n") {
        newline = false;
        args = &args[1..];
    }
    let mut out = args.join(" ");
    if newline {
        out.push('\n');
    }
    Ok(VirtualOutput::with_stdout(out))
}

async fn sleep(ctx: VirtualContext) -> std::io::Result<VirtualOutput> {
    let Some(arg) = ctx.args.first() else {
        return Ok(VirtualOutput::failure(1, "sleep: missing operand\n"));
    };
    let Ok(seconds) = arg.parse::<f64>() else {
        return Ok(VirtualOutput::failure(
            1,
            format!("sleep: invalid time interval '{arg}'\n"),
        ));
    };
    tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
    Ok(VirtualOutput::ok())
}

async fn cat(ctx: VirtualContext) -> std::io::Result<VirtualOutput> {
    if let Some(stdin) = ctx.stdin {
        return Ok(VirtualOutput::with_stdout(stdin));
    }
    let mut out = Vec::new();
    for path in &ctx.args {
        match tokio::fs::read(ctx.cwd.join(path)).await {
            Ok(bytes) => out.extend_from_slice(&bytes),
            Err(e) => return Ok(VirtualOutput::failure(1, format!("cat: {path}: {e}\n"))),
        }
    }
    Ok(VirtualOutput::with_stdout(out))
}

async fn succeed(_ctx: VirtualContext) -> std::io::Result<VirtualOutput> {
    Ok(VirtualOutput::ok())
}

async fn fail(_ctx: VirtualContext) -> std::io::Result<VirtualOutput> {
    Ok(VirtualOutput {
        code: 1,
        ..Default::default()
    })
}

async fn exit(ctx: VirtualContext) -> std::io::Result<VirtualOutput> {
    let code = ctx
        .args
        .first()
        .and_then(|a| a.parse::<i32>().ok())
        .unwrap_or(0);
    Ok(VirtualOutput {
        code,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx(args: &[&str]) -> VirtualContext {
        VirtualContext {
            args: args.iter().map(|s| s.to_string()).collect(),
            stdin: None,
            cwd: std::env::temp_dir(),
            env: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_echo_joins_args() {
        let out = echo(ctx(&["hello", "world"])).await.unwrap();
        assert_eq!(out.stdout.as_deref(), Some(b"hello world\n".as_ref()));
    }

    #[tokio::test]
    async fn test_echo_dash_n_suppresses_newline() {
        let out = echo(ctx(&["-n", "hi"])).await.unwrap();
        assert_eq!(out.stdout.as_deref(), Some(b"hi".as_ref()));
    }

    #[tokio::test]
    async fn test_exit_parses_code() {
        assert_eq!(exit(ctx(&["7"])).await.unwrap().code, 7);
        assert_eq!(exit(ctx(&[])).await.unwrap().code, 0);
    }

    #[tokio::test]
    async fn test_cat_echoes_stdin() {
        let mut c = ctx(&[]);
        c.stdin = Some(b"payload".to_vec());
        let out = cat(c).await.unwrap();
        assert_eq!(out.stdout.as_deref(), Some(b"payload".as_ref()));
    }

    #[tokio::test]
    async fn test_cat_missing_file_fails() {
        let out = cat(ctx(&["definitely-not-here.txt"])).await.unwrap();
        assert_eq!(out.code, 1);
        assert!(out.stderr.is_some());
    }

    #[tokio::test]
    async fn test_sleep_rejects_garbage() {
        let out = sleep(ctx(&["soon"])).await.unwrap();
        assert_eq!(out.code, 1);
    }
}
