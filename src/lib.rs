//! # Gatekeeper (credential verification and session tokens)
//!
//! `gatekeeper` verifies API client credentials, enforces account lockout,
//! assigns and checks roles, and mints signed session tokens.
//!
//! ## Login pipeline
//!
//! A login request resolves the username, checks the lockout state, verifies
//! the password hash, confirms the sign-in against policy, resolves the
//! identity's roles and finally issues a signed token. Every gate
//! short-circuits: a locked account never reveals whether the password was
//! correct, and an unknown username looks the same as a wrong password.
//!
//! ## Lockout
//!
//! - **Threshold:** after `lockout_max_attempts` consecutive failures the
//!   identity is locked for `lockout_minutes`.
//! - **Reset:** a successful sign-in clears the counter and any lock.
//! - **Concurrency:** counter increments are compare-and-swap writes guarded by
//!   the identity's concurrency stamp and retried a bounded number of times.
//!
//! ## Tokens
//!
//! Tokens are HS256 JWTs signed with a secret loaded once at startup. They are
//! fully self-contained; there is no server-side session state and revocation
//! happens only through expiry.

pub mod api;
pub mod cli;
pub mod identity;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }
}
