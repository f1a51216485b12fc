//! Quoting for strings that end up inside remote command lines.
//!
//! Remote commands are interpreted by PowerShell. [`escape_powershell`] uses
//! the backtick escape of PowerShell's argument mode, so an escaped string can
//! be concatenated with further escaped segments and still parse as a single
//! argument. [`quote_powershell`] produces a verbatim string for values that
//! must stay one token no matter what they contain. [`quote_posix`] is used
//! where a POSIX shell sees the string.

use regex::Regex;
use std::sync::OnceLock;

/// Characters that PowerShell treats specially in argument mode.
///
/// Includes the wildcard brackets and the typographic quotes PowerShell
/// accepts in place of `'` and `"`.
const POWERSHELL_SPECIAL: &[char] = &[
    ' ', '\t', '\'', '"', '`', '$', ';', '&', '|', '(', ')', '{', '}', '@', '#', ',', '<', '>',
    '[', ']', '\u{2018}', '\u{2019}', '\u{201a}', '\u{201b}', '\u{201c}', '\u{201d}', '\u{201e}',
];

#[allow(clippy::expect_used)]
fn safe_token() -> &'static Regex {
    static SAFE: OnceLock<Regex> = OnceLock::new();
    SAFE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_./:\\=+-]+$").expect("static regex is valid"))
}

/// Whether `value` can be interpolated without escaping.
pub fn is_safe_token(value: &str) -> bool {
    safe_token().is_match(value)
}

/// Escape `raw` for use as one PowerShell argument.
///
/// An empty string becomes `''`.
pub fn escape_powershell(raw: &str) -> String {
    if raw.is_empty() {
        return "''".to_string();
    }
    if is_safe_token(raw) {
        return raw.to_string();
    }
    let mut escaped = String::with_capacity(raw.len() + 8);
    for ch in raw.chars() {
        match ch {
            '\n' => escaped.push_str("`n"),
            '\r' => escaped.push_str("`r"),
            c if POWERSHELL_SPECIAL.contains(&c) => {
                escaped.push('`');
                escaped.push(c);
            }
            c => escaped.push(c),
        }
    }
    escaped
}

/// Undo [`escape_powershell`]. Used for display and by test doubles.
pub fn unescape_powershell(escaped: &str) -> String {
    if escaped == "''" {
        return String::new();
    }
    let mut raw = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(ch) = chars.next() {
        if ch != '`' {
            raw.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => raw.push('\n'),
            Some('r') => raw.push('\r'),
            Some(other) => raw.push(other),
            None => raw.push('`'),
        }
    }
    raw
}

/// Single-quote `raw` as a PowerShell verbatim string.
pub fn quote_powershell(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

/// Single-quote `raw` for a POSIX shell.
pub fn quote_posix(raw: &str) -> String {
    if !raw.is_empty() && is_safe_token(raw) && !raw.contains('\\') {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', r"'\''"))
}
