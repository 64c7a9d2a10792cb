//! Small helpers for input normalization and validation.

use regex::Regex;

/// Case-fold a username, email or role name for lookup/uniqueness checks.
#[must_use]
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Basic email format check.
#[must_use]
pub fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email.trim()))
}

/// Length in characters, not bytes.
pub(super) fn char_len(value: &str) -> usize {
    value.chars().count()
}
