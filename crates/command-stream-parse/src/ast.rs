//! The small AST the runner executes natively.

/// One argument word, with its quoting preserved.
///
/// `quoted` is the quote character the word was (first) wrapped in, or
/// `None` for a bare word. The distinction matters to callers that rebuild
/// command strings or decide whether a word could still glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    pub text: String,
    pub quoted: Option<char>,
}

impl Word {
    pub fn bare(text: impl Into<String>) -> Self {
        Word {
            text: text.into(),
            quoted: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// `> file`
    Overwrite,
    /// `>> file`
    Append,
}

/// A simple stdout redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub target: String,
}

/// A single command: program, arguments, simple redirections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleCmd {
    pub cmd: String,
    pub args: Vec<Word>,
    pub redirects: Vec<Redirect>,
}

impl SimpleCmd {
    /// Argument texts without quoting metadata.
    pub fn arg_texts(&self) -> Vec<String> {
        self.args.iter().map(|w| w.text.clone()).collect()
    }
}

/// Sequence operators, parallel to the command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOp {
    /// `;` — always run the next command.
    Always,
    /// `&&` — run the next command only on success.
    And,
    /// `||` — run the next command only on failure.
    Or,
}

/// Parsed form of a command string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ast {
    Simple(SimpleCmd),
    Pipeline(Vec<SimpleCmd>),
    Sequence {
        commands: Vec<Ast>,
        operators: Vec<SeqOp>,
    },
    Subshell(Box<Ast>),
}
