//! Per-connection pinentry state.
//!
//! The upstream sets these through `SET*` commands and `OPTION` lines
//! before invoking `GETPIN`/`CONFIRM`/`MESSAGE`.  `RESET` and every new
//! connection start from the defaults the binary computed at startup.

use std::time::Duration;

/// Connection options set through `OPTION` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    pub grab: bool,
    /// The upstream permits caching the passphrase outside gpg-agent.
    pub allow_external_password_cache: bool,
    pub tty_type: String,
    pub tty_name: String,
    pub tty_alert: String,
    pub lc_ctype: String,
    pub lc_messages: String,
    pub owner: String,
    pub touch_file: String,
    pub parent_wid: String,
    pub invisible_char: String,
}

/// Everything a dialog invocation depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Arguments of the last dialog command (`GETPIN`, `CONFIRM --one-button`, …).
    pub cmd_args: String,
    /// Detailed description of the request.
    pub desc: String,
    /// Label right before the entry field.
    pub prompt: String,
    /// Error text from a failed previous attempt.
    pub error: String,
    pub ok_btn: String,
    /// Broken in GnuPG's own pinentry for years; kept for parity.
    pub not_ok_btn: String,
    pub cancel_btn: String,
    pub title: String,
    /// Dialog timeout; zero means wait forever.
    pub timeout: Duration,
    /// Label for the confirmation entry; non-empty switches GETPIN into
    /// ask-twice mode.
    pub repeat_prompt: String,
    /// Shown between mismatching attempts.
    pub repeat_error: String,
    pub quality_bar: String,
    pub quality_bar_tooltip: String,
    pub gen_pin_label: String,
    pub gen_pin_tooltip: String,
    /// Stable cache identifier for the key; empty means uncacheable.
    pub key_info: String,
    pub opts: Options,
}

impl Settings {
    /// Baseline for fresh connections.
    pub fn base(timeout: Duration, grab: bool, parent_wid: u64) -> Self {
        Self {
            timeout,
            opts: Options {
                grab,
                parent_wid: format!("0x{parent_wid:08X}"),
                ..Options::default()
            },
            ..Self::default()
        }
    }

    /// The repeat-mismatch error text, with the protocol default.
    pub fn repeat_error_text(&self) -> &str {
        if self.repeat_error.is_empty() {
            "Does not match - try again"
        } else {
            &self.repeat_error
        }
    }

    /// Whether this connection may use the external password cache.
    pub fn cache_allowed(&self) -> bool {
        self.opts.allow_external_password_cache && !self.key_info.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_formats_parent_window() {
        let settings = Settings::base(Duration::ZERO, true, 0xdead);
        assert_eq!(settings.opts.parent_wid, "0x0000DEAD");
        assert!(settings.opts.grab);
    }

    #[test]
    fn cache_needs_both_option_and_key_info() {
        let mut settings = Settings::default();
        assert!(!settings.cache_allowed());
        settings.opts.allow_external_password_cache = true;
        assert!(!settings.cache_allowed());
        settings.key_info = "n/FOO".to_string();
        assert!(settings.cache_allowed());
    }

    #[test]
    fn repeat_error_has_a_default() {
        let mut settings = Settings::default();
        assert_eq!(settings.repeat_error_text(), "Does not match - try again");
        settings.repeat_error = "nope".to_string();
        assert_eq!(settings.repeat_error_text(), "nope");
    }
}
