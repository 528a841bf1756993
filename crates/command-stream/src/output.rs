//! Output policy: ANSI and control-character stripping.
//!
//! A process-global preserve/strip pair, overridable per invocation. The
//! policy applies to captured buffers and emitted events; when both flags
//! preserve, chunks pass through byte-identical.

use std::borrow::Cow;
use std::sync::{LazyLock, RwLock};

use regex::bytes::Regex;
use serde::Serialize;

/// Global stripping policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnsiConfig {
    /// Keep `ESC[…m|G|K|H|F|J` sequences.
    pub preserve_ansi: bool,
    /// Keep C0 control characters (TAB, LF, CR always survive) and DEL.
    pub preserve_control_chars: bool,
}

impl Default for AnsiConfig {
    fn default() -> Self {
        AnsiConfig {
            preserve_ansi: true,
            preserve_control_chars: true,
        }
    }
}

/// Per-invocation override; unset fields fall back to the global config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnsiOverride {
    pub preserve_ansi: Option<bool>,
    pub preserve_control_chars: Option<bool>,
}

static CONFIG: RwLock<AnsiConfig> = RwLock::new(AnsiConfig {
    preserve_ansi: true,
    preserve_control_chars: true,
});

/// Update the global policy; unset fields keep their current value.
pub fn configure_ansi(update: AnsiOverride) {
    let mut config = CONFIG.write().unwrap();
    if let Some(v) = update.preserve_ansi {
        config.preserve_ansi = v;
    }
    if let Some(v) = update.preserve_control_chars {
        config.preserve_control_chars = v;
    }
}

pub fn ansi_config() -> AnsiConfig {
    *CONFIG.read().unwrap()
}

pub(crate) fn reset_ansi_config() {
    *CONFIG.write().unwrap() = AnsiConfig::default();
}

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[mGKHFJ]").unwrap());

fn effective(overrides: Option<&AnsiOverride>) -> AnsiConfig {
    let mut config = ansi_config();
    if let Some(o) = overrides {
        if let Some(v) = o.preserve_ansi {
            config.preserve_ansi = v;
        }
        if let Some(v) = o.preserve_control_chars {
            config.preserve_control_chars = v;
        }
    }
    config
}

fn keep_byte(b: u8) -> bool {
    !(b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r') || b == 0x7f)
}

/// Apply the stripping policy to one chunk.
///
/// Returns the input unchanged (borrowed) when nothing is stripped.
pub fn process_output<'a>(bytes: &'a [u8], overrides: Option<&AnsiOverride>) -> Cow<'a, [u8]> {
    let config = effective(overrides);
    let mut owned: Option<Vec<u8>> = None;

    if !config.preserve_ansi {
        if let Cow::Owned(stripped) = ANSI_RE.replace_all(bytes, &b""[..]) {
            owned = Some(stripped);
        }
    }
    if !config.preserve_control_chars {
        let current: &[u8] = owned.as_deref().unwrap_or(bytes);
        if current.iter().any(|&b| !keep_byte(b)) {
            owned = Some(current.iter().copied().filter(|&b| keep_byte(b)).collect());
        }
    }

    match owned {
        Some(stripped) => Cow::Owned(stripped),
        None => Cow::Borrowed(bytes),
    }
}
