//! Global shell settings (`set -e` and friends).

use std::sync::RwLock;

use serde::Serialize;

/// Snapshot of the global flags.
///
/// `nounset` is accepted and stored but has no effect: this library does no
/// variable expansion of its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Settings {
    pub errexit: bool,
    pub verbose: bool,
    pub xtrace: bool,
    pub pipefail: bool,
    pub nounset: bool,
}

static SETTINGS: RwLock<Settings> = RwLock::new(Settings {
    errexit: false,
    verbose: false,
    xtrace: false,
    pipefail: false,
    nounset: false,
});

/// Flag toggles and queries, shell-style.
pub mod shell {
    use super::{Settings, SETTINGS};

    pub fn errexit(on: bool) {
        SETTINGS.write().unwrap().errexit = on;
    }

    pub fn verbose(on: bool) {
        SETTINGS.write().unwrap().verbose = on;
    }

    pub fn xtrace(on: bool) {
        SETTINGS.write().unwrap().xtrace = on;
    }

    pub fn pipefail(on: bool) {
        SETTINGS.write().unwrap().pipefail = on;
    }

    pub fn nounset(on: bool) {
        SETTINGS.write().unwrap().nounset = on;
    }

    /// Set a flag by name (`"errexit"` or the short `"e"` form). Returns
    /// false for unrecognized flags.
    pub fn set(flag: &str) -> bool {
        toggle(flag, true)
    }

    /// Unset a flag by name. Returns false for unrecognized flags.
    pub fn unset(flag: &str) -> bool {
        toggle(flag, false)
    }

    fn toggle(flag: &str, on: bool) -> bool {
        match flag {
            "errexit" | "e" => errexit(on),
            "verbose" | "v" => verbose(on),
            "xtrace" | "x" => xtrace(on),
            "pipefail" => pipefail(on),
            "nounset" | "u" => nounset(on),
            _ => return false,
        }
        true
    }

    pub fn settings() -> Settings {
        *SETTINGS.read().unwrap()
    }
}

pub(crate) fn reset_settings() {
    *SETTINGS.write().unwrap() = Settings::default();
}

#[cfg(test)]
mod tests {
    use super::*;

    // Toggle behavior is exercised in the integration suite, where tests
    // touching process-global flags run serialized.

    #[test]
    fn test_defaults_are_all_off() {
        assert_eq!(Settings::default(), Settings {
            errexit: false,
            verbose: false,
            xtrace: false,
            pipefail: false,
            nounset: false,
        });
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(!shell::set("nosuchflag"));
        assert!(!shell::unset("nosuchflag"));
    }
}
