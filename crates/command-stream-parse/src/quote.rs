//! Shell quoting for interpolated values.

/// Marker that bypasses quoting entirely when interpolated into a template.
///
/// Use this for fragments the caller has already quoted (or deliberately
/// wants expanded by the shell).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raw(pub String);

impl Raw {
    pub fn new(value: impl Into<String>) -> Self {
        Raw(value.into())
    }
}

/// Characters that never need quoting.
fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=' | ',' | '+' | '@' | ':')
}

fn is_safe_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_safe_char)
}

/// True when `s` is wrapped in a matched pair of `quote` characters.
fn is_wrapped_in(s: &str, quote: char) -> bool {
    s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote)
}

/// Quote a single value for safe interpolation into a shell command.
///
/// Rules, in order:
/// - empty string → `''`
/// - words made only of safe characters pass through unquoted
/// - strings already wrapped in single quotes with no inner single quote
///   pass through unchanged
/// - strings wrapped in double quotes are re-wrapped in single quotes
/// - everything else is wrapped in single quotes, with each inner `'`
///   escaped as `'\''`
pub fn quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    if is_safe_word(value) {
        return value.to_string();
    }
    if is_wrapped_in(value, '\'') && !value[1..value.len() - 1].contains('\'') {
        return value.to_string();
    }
    if is_wrapped_in(value, '"') {
        let inner = &value[1..value.len() - 1];
        return format!("'{}'", inner.replace('\'', "'\\''"));
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Quote a list of values element-wise and join with single spaces.
pub fn quote_all<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| quote(v.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_empty() {
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_quote_safe_word_passes_through() {
        assert_eq!(quote("hello"), "hello");
        assert_eq!(quote("a/b-c.d_e=f,g+h@i:j"), "a/b-c.d_e=f,g+h@i:j");
        assert_eq!(quote("v1.2.3"), "v1.2.3");
    }

    #[test]
    fn test_quote_spaces() {
        assert_eq!(quote("hello world"), "'hello world'");
    }

    #[test]
    fn test_quote_single_quote_escaped() {
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(quote("don't"), "'don'\\''t'");
    }

    #[test]
    fn test_quote_injection_attempt() {
        assert_eq!(quote("$HOME"), "'$HOME'");
        assert_eq!(quote("$(whoami)"), "'$(whoami)'");
        assert_eq!(quote("`ls`"), "'`ls`'");
        assert_eq!(quote("a;b"), "'a;b'");
    }

    #[test]
    fn test_quote_already_single_quoted() {
        assert_eq!(quote("'already quoted'"), "'already quoted'");
        // Inner single quote defeats pass-through; the whole thing is re-quoted.
        assert_eq!(quote("'it's'"), "''\\''it'\\''s'\\'''");
    }

    #[test]
    fn test_quote_double_quoted_rewraps() {
        assert_eq!(quote("\"hello world\""), "'hello world'");
        assert_eq!(quote("\"it's\""), "'it'\\''s'");
    }

    #[test]
    fn test_quote_all_joins_with_spaces() {
        assert_eq!(quote_all(["a", "b c", "d"]), "a 'b c' d");
        assert_eq!(quote_all(Vec::<String>::new()), "");
    }
}
