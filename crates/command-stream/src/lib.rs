//! Programmable shell-command execution with streaming output.
//!
//! Commands are built with the [`cmd!`] macro (safely quoting every
//! interpolated value) and observed through whichever access pattern fits:
//! awaiting the [`Runner`] for a single [`ExecResult`], iterating
//! [`Runner::stream`] for chunks as they arrive, subscribing to
//! [`Runner::events`], or writing to the live child via [`Runner::stdin`].
//! Pipelines, `&&`/`;`/`||` sequences, and `( … )` subshells run natively;
//! anything beyond the mini grammar is handed to the system shell.
//!
//! ```no_run
//! use command_stream::cmd;
//!
//! # #[tokio::main]
//! # async fn main() -> command_stream::Result<()> {
//! let greeting = cmd!("echo {}", "it's fine").await?;
//! assert_eq!(greeting.text(), "it's fine\n");
//!
//! let filtered = cmd!("printf 'a\\nb\\nc\\n' | grep b").await?;
//! assert_eq!(filtered.text(), "b\n");
//! # Ok(())
//! # }
//! ```
//!
//! Setting `COMMAND_STREAM_VERBOSE=true` in the environment enables trace
//! logging; `CI=true` alone does not.

mod builtins;
mod child;
mod error;
mod events;
mod io;
mod options;
mod output;
mod pipeline;
mod result;
mod runner;
mod seq;
mod settings;
mod signal;
mod state;
mod trace;
mod virt;

pub use command_stream_parse::{
    needs_real_shell, parse_command, quote, quote_all, render_template, Ast, ParseError, Raw,
    SeqOp, SimpleCmd, TemplateValue, Word,
};
pub use error::{Error, Result};
pub use events::{Chunk, ChunkKind, EventStream, RunnerEvent};
pub use options::{Options, StdinMode};
pub use output::{ansi_config, configure_ansi, process_output, AnsiConfig, AnsiOverride};
pub use result::ExecResult;
pub use runner::{OutputStream, ResultHandle, Runner, State, StdinHandle};
pub use settings::{shell, Settings};
pub use signal::{interrupt_active_runners, set_interrupt_exit, Signal};
pub use state::reset_global_state;
pub use virt::{
    disable_virtual_commands, enable_virtual_commands, list_commands, register, register_command,
    register_streaming, unregister, ByteSource, StreamingCommand, VirtualCommand, VirtualContext,
    VirtualOutput,
};

/// Build a [`Runner`] from a command template.
///
/// With interpolated values, the template follows `format!` placeholder
/// syntax: each `{}` receives the next value, quoted for safe shell use
/// ([`Raw`] values skip quoting, lists quote element-wise), and `{{`/`}}`
/// escape literal braces. Without values the template is taken verbatim.
/// A template that is one bare `{}` passes a command-shaped value through
/// unquoted, so user-built command strings keep working.
#[macro_export]
macro_rules! cmd {
    ($template:literal) => {
        $crate::Runner::shell($template)
    };
    ($template:literal, $($value:expr),+ $(,)?) => {
        $crate::Runner::shell($crate::render_template(
            $template,
            &[$($crate::IntoTemplateValue::into_template_value(&$value)),+],
        ))
    };
}

/// Conversion of interpolated values into quoted template values; see
/// [`cmd!`].
pub trait IntoTemplateValue {
    fn into_template_value(&self) -> TemplateValue;
}

impl IntoTemplateValue for str {
    fn into_template_value(&self) -> TemplateValue {
        TemplateValue::Text(self.to_string())
    }
}

impl IntoTemplateValue for String {
    fn into_template_value(&self) -> TemplateValue {
        TemplateValue::Text(self.clone())
    }
}

impl IntoTemplateValue for Raw {
    fn into_template_value(&self) -> TemplateValue {
        TemplateValue::Raw(self.0.clone())
    }
}

impl IntoTemplateValue for bool {
    fn into_template_value(&self) -> TemplateValue {
        TemplateValue::Text(self.to_string())
    }
}

impl IntoTemplateValue for std::path::Path {
    fn into_template_value(&self) -> TemplateValue {
        TemplateValue::Text(self.to_string_lossy().into_owned())
    }
}

impl IntoTemplateValue for std::path::PathBuf {
    fn into_template_value(&self) -> TemplateValue {
        self.as_path().into_template_value()
    }
}

impl IntoTemplateValue for [String] {
    fn into_template_value(&self) -> TemplateValue {
        TemplateValue::List(self.to_vec())
    }
}

impl IntoTemplateValue for Vec<String> {
    fn into_template_value(&self) -> TemplateValue {
        TemplateValue::List(self.clone())
    }
}

impl IntoTemplateValue for [&str] {
    fn into_template_value(&self) -> TemplateValue {
        TemplateValue::List(self.iter().map(|s| s.to_string()).collect())
    }
}

impl IntoTemplateValue for Vec<&str> {
    fn into_template_value(&self) -> TemplateValue {
        self.as_slice().into_template_value()
    }
}

impl<T: IntoTemplateValue + ?Sized> IntoTemplateValue for &T {
    fn into_template_value(&self) -> TemplateValue {
        (**self).into_template_value()
    }
}

macro_rules! impl_template_value_display {
    ($($ty:ty),+) => {
        $(impl IntoTemplateValue for $ty {
            fn into_template_value(&self) -> TemplateValue {
                TemplateValue::Text(self.to_string())
            }
        })+
    };
}

impl_template_value_display!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, char);

/// A command factory carrying default options; the equivalent of calling
/// the builder with an options bag up front.
#[derive(Debug, Clone, Default)]
pub struct Shell {
    defaults: Options,
}

impl Shell {
    pub fn new() -> Self {
        Shell::default()
    }

    pub fn with_options(options: Options) -> Self {
        Shell { defaults: options }
    }

    pub fn options(&self) -> &Options {
        &self.defaults
    }

    /// A runner for `command` carrying this factory's defaults.
    pub fn command(&self, command: impl Into<String>) -> Runner {
        Runner::shell_with(command, self.defaults.clone())
    }

    /// A runner executing `program` with `args` directly.
    pub fn exec(
        &self,
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Runner {
        Runner::exec_with(program, args, self.defaults.clone())
    }
}

/// Run a command string to completion with default options.
pub async fn sh(command: impl Into<String>) -> Result<ExecResult> {
    Runner::shell(command).run().await
}

/// Run a command string to completion with the given options.
pub async fn sh_with(command: impl Into<String>, options: Options) -> Result<ExecResult> {
    Runner::shell_with(command, options).run().await
}

/// Execute `program` with `args` directly (no parsing) to completion.
pub async fn exec(
    program: impl Into<String>,
    args: impl IntoIterator<Item = impl Into<String>>,
) -> Result<ExecResult> {
    Runner::exec(program, args).run().await
}

/// Execute `program` with `args` and the given options.
pub async fn exec_with(
    program: impl Into<String>,
    args: impl IntoIterator<Item = impl Into<String>>,
    options: Options,
) -> Result<ExecResult> {
    Runner::exec_with(program, args, options).run().await
}

/// Run a command capturing quietly: mirroring is forced off, capture on.
pub async fn run(command: impl Into<String>) -> Result<ExecResult> {
    run_with(command, Options::default()).await
}

/// Like [`run`], starting from the given options.
pub async fn run_with(command: impl Into<String>, options: Options) -> Result<ExecResult> {
    let options = options.mirror(false).capture(true);
    Runner::shell_with(command, options).run().await
}
