//! Tokenizer and recursive-descent parser for the mini shell grammar.
//!
//! Recognized: `|`, `;`, `&&`, `||`, `( … )`, `> file`, `>> file`, and
//! words quoted with `"…"` or `'…'`. Anything beyond that is the real
//! shell's business; see [`needs_real_shell`].

use crate::ast::{Ast, Redirect, RedirectKind, SeqOp, SimpleCmd, Word};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("unbalanced quote in command")]
    UnbalancedQuote,

    #[error("unbalanced parenthesis in command")]
    UnbalancedParen,

    #[error("unexpected token '{0}'")]
    Unexpected(String),

    #[error("missing redirect target")]
    MissingRedirectTarget,

    #[error("empty command")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Word(Word),
    Pipe,
    Semi,
    AndAnd,
    OrOr,
    LParen,
    RParen,
    Gt,
    GtGt,
}

impl Tok {
    fn display(&self) -> &str {
        match self {
            Tok::Word(w) => &w.text,
            Tok::Pipe => "|",
            Tok::Semi => ";",
            Tok::AndAnd => "&&",
            Tok::OrOr => "||",
            Tok::LParen => "(",
            Tok::RParen => ")",
            Tok::Gt => ">",
            Tok::GtGt => ">>",
        }
    }
}

fn lex(input: &str) -> Result<Vec<Tok>, ParseError> {
    let mut toks = Vec::new();
    let mut cur = String::new();
    let mut cur_quote: Option<char> = None;
    let mut have_word = false;
    let mut chars = input.chars().peekable();

    macro_rules! flush_word {
        () => {
            if have_word {
                toks.push(Tok::Word(Word {
                    text: std::mem::take(&mut cur),
                    quoted: cur_quote.take(),
                }));
                have_word = false;
            }
        };
    }

    while let Some(ch) = chars.next() {
        match ch {
            ' ' | '\t' | '\n' => flush_word!(),
            '\'' => {
                have_word = true;
                cur_quote.get_or_insert('\'');
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '\'' {
                        closed = true;
                        break;
                    }
                    cur.push(c);
                }
                if !closed {
                    return Err(ParseError::UnbalancedQuote);
                }
            }
            '"' => {
                have_word = true;
                cur_quote.get_or_insert('"');
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.peek() {
                            Some(&'"' | &'\\' | &'$' | &'`') => {
                                cur.push(chars.next().unwrap());
                            }
                            _ => cur.push('\\'),
                        },
                        _ => cur.push(c),
                    }
                }
                if !closed {
                    return Err(ParseError::UnbalancedQuote);
                }
            }
            '\\' => {
                if let Some(c) = chars.next() {
                    cur.push(c);
                    have_word = true;
                }
            }
            '|' => {
                flush_word!();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    toks.push(Tok::OrOr);
                } else {
                    toks.push(Tok::Pipe);
                }
            }
            '&' => {
                flush_word!();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    toks.push(Tok::AndAnd);
                } else {
                    return Err(ParseError::Unexpected("&".to_string()));
                }
            }
            ';' => {
                flush_word!();
                toks.push(Tok::Semi);
            }
            '(' => {
                flush_word!();
                toks.push(Tok::LParen);
            }
            ')' => {
                flush_word!();
                toks.push(Tok::RParen);
            }
            '>' => {
                flush_word!();
                if chars.peek() == Some(&'>') {
                    chars.next();
                    toks.push(Tok::GtGt);
                } else {
                    toks.push(Tok::Gt);
                }
            }
            _ => {
                cur.push(ch);
                have_word = true;
            }
        }
    }
    flush_word!();

    Ok(toks)
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
    allow_operators: bool,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_sequence(&mut self) -> Result<Ast, ParseError> {
        let mut commands = vec![self.parse_item()?];
        let mut operators = Vec::new();

        while self.allow_operators {
            let op = match self.peek() {
                Some(Tok::Semi) => SeqOp::Always,
                Some(Tok::AndAnd) => SeqOp::And,
                Some(Tok::OrOr) => SeqOp::Or,
                _ => break,
            };
            self.bump();
            // A trailing `;` is fine; trailing `&&` / `||` is not.
            if matches!(self.peek(), None | Some(Tok::RParen)) {
                if op == SeqOp::Always {
                    break;
                }
                return Err(ParseError::Empty);
            }
            operators.push(op);
            commands.push(self.parse_item()?);
        }

        if commands.len() == 1 {
            Ok(commands.pop().unwrap())
        } else {
            Ok(Ast::Sequence {
                commands,
                operators,
            })
        }
    }

    fn parse_item(&mut self) -> Result<Ast, ParseError> {
        if self.allow_operators && self.peek() == Some(&Tok::LParen) {
            self.bump();
            let body = self.parse_sequence()?;
            match self.bump() {
                Some(Tok::RParen) => return Ok(Ast::Subshell(Box::new(body))),
                _ => return Err(ParseError::UnbalancedParen),
            }
        }
        self.parse_pipeline()
    }

    fn parse_pipeline(&mut self) -> Result<Ast, ParseError> {
        let mut stages = vec![self.parse_simple()?];
        while self.peek() == Some(&Tok::Pipe) {
            self.bump();
            stages.push(self.parse_simple()?);
        }
        if stages.len() == 1 {
            Ok(Ast::Simple(stages.pop().unwrap()))
        } else {
            Ok(Ast::Pipeline(stages))
        }
    }

    fn parse_simple(&mut self) -> Result<SimpleCmd, ParseError> {
        let mut words: Vec<Word> = Vec::new();
        let mut redirects = Vec::new();

        loop {
            match self.peek() {
                Some(Tok::Word(_)) => {
                    let Some(Tok::Word(w)) = self.bump() else {
                        unreachable!()
                    };
                    words.push(w);
                }
                Some(Tok::Gt | Tok::GtGt) => {
                    let kind = match self.bump() {
                        Some(Tok::GtGt) => RedirectKind::Append,
                        _ => RedirectKind::Overwrite,
                    };
                    match self.bump() {
                        Some(Tok::Word(w)) => redirects.push(Redirect {
                            kind,
                            target: w.text,
                        }),
                        _ => return Err(ParseError::MissingRedirectTarget),
                    }
                }
                _ => break,
            }
        }

        if words.is_empty() {
            return Err(ParseError::Empty);
        }
        let cmd = words.remove(0).text;
        Ok(SimpleCmd {
            cmd,
            args: words,
            redirects,
        })
    }
}

/// Parse a command string into the mini AST.
///
/// With `allow_operators` off, sequence and subshell splitting is disabled
/// and such tokens make the parse fail, which callers treat as "hand the
/// string to a real shell".
pub fn parse_command(input: &str, allow_operators: bool) -> Result<Ast, ParseError> {
    let toks = lex(input)?;
    if toks.is_empty() {
        return Err(ParseError::Empty);
    }
    let mut parser = Parser {
        toks,
        pos: 0,
        allow_operators,
    };
    let ast = parser.parse_sequence()?;
    match parser.peek() {
        None => Ok(ast),
        Some(tok) => Err(ParseError::Unexpected(tok.display().to_string())),
    }
}

/// True when the string uses shell metasyntax the mini parser does not
/// handle, so execution must go through a spawned POSIX shell: globs,
/// variable expansion, backticks, command substitution, heredocs, input or
/// fd-duplicating redirections, background `&`.
///
/// Quoted regions never trigger the predicate.
pub fn needs_real_shell(input: &str) -> bool {
    let mut chars = input.chars().peekable();
    let mut prev: Option<char> = None;
    let mut prev2: Option<char> = None;

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                }
            }
            '"' => {
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            chars.next();
                        }
                        _ => {}
                    }
                }
            }
            '\\' => {
                chars.next();
            }
            '`' | '$' | '*' | '?' | '[' | '<' => return true,
            '&' => {
                if chars.peek() == Some(&'&') {
                    chars.next();
                } else {
                    // `&>` redirect or background `&`.
                    return true;
                }
            }
            '>' => {
                if chars.peek() == Some(&'&') {
                    return true;
                }
                // Fd-prefixed redirect like `2> file`.
                if let Some(d) = prev {
                    if d.is_ascii_digit() && prev2.is_none_or(|p| p == ' ' || p == '\t') {
                        return true;
                    }
                }
            }
            _ => {}
        }
        prev2 = prev;
        prev = Some(ch);
    }
    false
}
