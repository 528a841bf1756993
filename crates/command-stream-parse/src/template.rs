//! Template rendering: literal fragments interleaved with quoted values.
//!
//! The `cmd!` macro in the runner crate hands us its format string plus the
//! interpolated values; this module concatenates literal fragments with the
//! quoted form of each value, in order. Substituted content is never
//! re-scanned, so a value can not smuggle a placeholder in.

use crate::quote::{quote, quote_all};

/// An interpolated template value, carrying enough of the original to apply
/// the single-interpolation pass-through rule.
#[derive(Debug, Clone)]
pub enum TemplateValue {
    /// A plain value, quoted on interpolation.
    Text(String),
    /// A list value, quoted element-wise and space-joined.
    List(Vec<String>),
    /// A raw fragment that bypasses quoting.
    Raw(String),
}

impl TemplateValue {
    fn rendered(&self) -> String {
        match self {
            TemplateValue::Text(s) => quote(s),
            TemplateValue::List(items) => quote_all(items),
            TemplateValue::Raw(s) => s.clone(),
        }
    }
}

/// Split a template string on `{}` placeholders into its literal fragments.
///
/// `{{` and `}}` escape literal braces, as in `format!`. A template with N
/// placeholders yields N+1 fragments.
pub fn split_template(template: &str) -> Vec<String> {
    let mut fragments = vec![String::new()];
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                fragments.last_mut().unwrap().push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                fragments.last_mut().unwrap().push('}');
            }
            '{' if chars.peek() == Some(&'}') => {
                chars.next();
                fragments.push(String::new());
            }
            _ => fragments.last_mut().unwrap().push(ch),
        }
    }

    fragments
}

/// True when `s` plausibly is a whole shell command on its own: its first
/// whitespace-separated token looks like a program name.
fn is_plausible_command(s: &str) -> bool {
    let Some(first) = s.split_whitespace().next() else {
        return false;
    };
    first
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
}

/// Render a template into a command string.
///
/// Literal fragments concatenate with the quoted form of each value, in
/// order. When a single interpolation is the entire template (both
/// surrounding fragments empty) and the value itself reads as a shell
/// command, it passes through unquoted so user-built command strings keep
/// working.
///
/// # Panics
///
/// Panics when the number of `{}` placeholders does not match the number of
/// values; this is a programmer error in the macro call site.
pub fn render_template(template: &str, values: &[TemplateValue]) -> String {
    let fragments = split_template(template);
    assert_eq!(
        fragments.len(),
        values.len() + 1,
        "template '{template}' has {} placeholder(s) but {} value(s) were interpolated",
        fragments.len() - 1,
        values.len(),
    );

    // Whole-template interpolation of a plausible command passes through.
    if let [TemplateValue::Text(s)] = values {
        if fragments.iter().all(String::is_empty) && is_plausible_command(s) {
            return s.clone();
        }
    }

    let mut out = String::with_capacity(template.len());
    for (i, fragment) in fragments.iter().enumerate() {
        out.push_str(fragment);
        if let Some(value) = values.get(i) {
            out.push_str(&value.rendered());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_no_placeholders() {
        assert_eq!(split_template("echo hello"), vec!["echo hello"]);
    }

    #[test]
    fn test_split_placeholders() {
        assert_eq!(split_template("echo {} {}"), vec!["echo ", " ", ""]);
    }

    #[test]
    fn test_split_escaped_braces() {
        assert_eq!(split_template("awk '{{print}}'"), vec!["awk '{print}'"]);
        assert_eq!(split_template("a {{}} b"), vec!["a {} b"]);
    }

    #[test]
    fn test_render_quotes_values() {
        let cmd = render_template(
            "echo {}",
            &[TemplateValue::Text("it's".to_string())],
        );
        assert_eq!(cmd, "echo 'it'\\''s'");
    }

    #[test]
    fn test_render_list_value() {
        let cmd = render_template(
            "ls {}",
            &[TemplateValue::List(vec![
                "a".to_string(),
                "b c".to_string(),
            ])],
        );
        assert_eq!(cmd, "ls a 'b c'");
    }

    #[test]
    fn test_render_raw_bypasses_quoting() {
        let cmd = render_template(
            "ls {}",
            &[TemplateValue::Raw("*.txt".to_string())],
        );
        assert_eq!(cmd, "ls *.txt");
    }

    #[test]
    fn test_render_whole_template_passthrough() {
        let cmd = render_template(
            "{}",
            &[TemplateValue::Text("echo hello world".to_string())],
        );
        assert_eq!(cmd, "echo hello world");
    }

    #[test]
    fn test_render_whole_template_non_command_is_quoted() {
        // Not a plausible command, so the normal quoting applies.
        let cmd = render_template(
            "{}",
            &[TemplateValue::Text("$(rm -rf /)".to_string())],
        );
        assert_eq!(cmd, "'$(rm -rf /)'");
    }

    #[test]
    #[should_panic(expected = "placeholder")]
    fn test_render_mismatched_arity_panics() {
        render_template("echo {} {}", &[TemplateValue::Text("x".to_string())]);
    }
}
