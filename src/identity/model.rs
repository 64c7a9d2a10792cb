//! Identity and role records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::validation::normalize;

/// An account capable of authenticating.
///
/// `concurrency_stamp` is the optimistic-concurrency token: stores only accept
/// an update whose stamp matches the stored one, and issue a fresh stamp on
/// every successful write.
#[derive(Clone)]
pub struct Identity {
    pub id: Uuid,
    pub username: String,
    pub normalized_username: String,
    pub email: String,
    pub normalized_email: String,
    pub email_confirmed: bool,
    pub password_hash: String,
    pub lockout_enabled: bool,
    pub lockout_end: Option<DateTime<Utc>>,
    pub access_failed_count: u32,
    pub concurrency_stamp: Uuid,
}

impl Identity {
    /// A fresh, unlocked identity with lockout enabled.
    #[must_use]
    pub fn new(username: &str, email: &str, password_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.trim().to_string(),
            normalized_username: normalize(username),
            email: email.trim().to_string(),
            normalized_email: normalize(email),
            email_confirmed: false,
            password_hash,
            lockout_enabled: true,
            lockout_end: None,
            access_failed_count: 0,
            concurrency_stamp: Uuid::new_v4(),
        }
    }

    pub fn set_username(&mut self, username: &str) {
        self.username = username.trim().to_string();
        self.normalized_username = normalize(username);
    }

    /// Changing the email address drops its confirmation.
    pub fn set_email(&mut self, email: &str) {
        self.email = email.trim().to_string();
        self.normalized_email = normalize(email);
        self.email_confirmed = false;
    }
}

// The password hash stays out of logs.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("email_confirmed", &self.email_confirmed)
            .field("lockout_enabled", &self.lockout_enabled)
            .field("lockout_end", &self.lockout_end)
            .field("access_failed_count", &self.access_failed_count)
            .finish_non_exhaustive()
    }
}

/// Public view of an identity, safe to return to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub email_confirmed: bool,
    pub lockout_enabled: bool,
    pub lockout_end: Option<DateTime<Utc>>,
    pub access_failed_count: u32,
}

impl From<&Identity> for IdentitySummary {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id,
            username: identity.username.clone(),
            email: identity.email.clone(),
            email_confirmed: identity.email_confirmed,
            lockout_enabled: identity.lockout_enabled,
            lockout_end: identity.lockout_end,
            access_failed_count: identity.access_failed_count,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub normalized_name: String,
    pub concurrency_stamp: Uuid,
}

impl Role {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            normalized_name: normalize(name),
            concurrency_stamp: Uuid::new_v4(),
        }
    }

    pub fn rename(&mut self, name: &str) {
        self.name = name.trim().to_string();
        self.normalized_name = normalize(name);
        self.concurrency_stamp = Uuid::new_v4();
    }
}

/// Registration payload. Missing fields deserialize as empty strings so that
/// validation can report every one of them.
#[derive(Clone, Default, Deserialize)]
pub struct NewRegistration {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub role: String,
}

impl fmt::Debug for NewRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewRegistration")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Collection outcome that keeps "nothing there" apart from "missing resource".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Listing<T> {
    Empty,
    Items(Vec<T>),
}

impl<T> From<Vec<T>> for Listing<T> {
    fn from(items: Vec<T>) -> Self {
        if items.is_empty() {
            Self::Empty
        } else {
            Self::Items(items)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_new_normalizes_and_starts_unlocked() {
        let identity = Identity::new(" Alice ", "Alice@Example.com", "hash".to_string());
        assert_eq!(identity.username, "Alice");
        assert_eq!(identity.normalized_username, "alice");
        assert_eq!(identity.normalized_email, "alice@example.com");
        assert!(identity.lockout_enabled);
        assert!(identity.lockout_end.is_none());
        assert_eq!(identity.access_failed_count, 0);
    }

    #[test]
    fn identity_debug_hides_password_hash() {
        let identity = Identity::new("alice", "alice@example.com", "$argon2id$secret".to_string());
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains("argon2id"));
        assert!(rendered.contains("alice"));
    }

    #[test]
    fn set_email_drops_confirmation() {
        let mut identity = Identity::new("alice", "alice@example.com", String::new());
        identity.email_confirmed = true;
        identity.set_email("Alice@New.example");
        assert!(!identity.email_confirmed);
        assert_eq!(identity.normalized_email, "alice@new.example");
    }

    #[test]
    fn role_rename_regenerates_stamp() {
        let mut role = Role::new("Student");
        let stamp = role.concurrency_stamp;
        role.rename(" Teacher ");
        assert_eq!(role.name, "Teacher");
        assert_eq!(role.normalized_name, "teacher");
        assert_ne!(role.concurrency_stamp, stamp);
    }

    #[test]
    fn listing_from_empty_vec_is_empty() {
        assert_eq!(Listing::<u8>::from(Vec::new()), Listing::Empty);
        assert_eq!(Listing::from(vec![1u8]), Listing::Items(vec![1]));
    }

    #[test]
    fn registration_missing_fields_default_to_empty() -> anyhow::Result<()> {
        let registration: NewRegistration = serde_json::from_str(r#"{"username":"bob"}"#)?;
        assert_eq!(registration.username, "bob");
        assert!(registration.email.is_empty());
        assert!(registration.password.is_empty());
        assert!(registration.role.is_empty());
        Ok(())
    }
}
