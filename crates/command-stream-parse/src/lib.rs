//! Quoting and command-line parsing for the command-stream runner.
//!
//! This crate is the synchronous leaf of the workspace: it knows how to turn
//! interpolated values into safely quoted shell words, how to split a command
//! string into the small AST the runner executes natively, and how to detect
//! command strings that need a real POSIX shell instead.

mod ast;
mod parser;
mod quote;
mod template;

pub use ast::{Ast, Redirect, RedirectKind, SeqOp, SimpleCmd, Word};
pub use parser::{needs_real_shell, parse_command, ParseError};
pub use quote::{quote, quote_all, Raw};
pub use template::{render_template, split_template, TemplateValue};
