//! Identity policy configuration, read once at startup.

use chrono::Duration;

use super::lockout::LockoutPolicy;

const DEFAULT_PASSWORD_MIN_LENGTH: usize = 6;
const DEFAULT_USERNAME_MIN_LENGTH: usize = 3;
const DEFAULT_LOCKOUT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_LOCKOUT_MINUTES: i64 = 5;
const DEFAULT_TOKEN_LIFETIME_HOURS: i64 = 2;
const DEFAULT_ISSUER: &str = "gatekeeper";
const DEFAULT_AUDIENCE: &str = "gatekeeper-clients";
const DEFAULT_ADMIN_ROLE: &str = "admin";

#[derive(Clone, Debug)]
pub struct IdentityConfig {
    password_min_length: usize,
    username_min_length: usize,
    lockout_max_attempts: u32,
    lockout_minutes: i64,
    token_lifetime_hours: i64,
    issuer: String,
    audience: String,
    require_confirmed_email: bool,
    admin_role: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            password_min_length: DEFAULT_PASSWORD_MIN_LENGTH,
            username_min_length: DEFAULT_USERNAME_MIN_LENGTH,
            lockout_max_attempts: DEFAULT_LOCKOUT_MAX_ATTEMPTS,
            lockout_minutes: DEFAULT_LOCKOUT_MINUTES,
            token_lifetime_hours: DEFAULT_TOKEN_LIFETIME_HOURS,
            issuer: DEFAULT_ISSUER.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
            require_confirmed_email: false,
            admin_role: DEFAULT_ADMIN_ROLE.to_string(),
        }
    }

    #[must_use]
    pub fn with_password_min_length(mut self, length: usize) -> Self {
        self.password_min_length = length;
        self
    }

    #[must_use]
    pub fn with_username_min_length(mut self, length: usize) -> Self {
        self.username_min_length = length;
        self
    }

    #[must_use]
    pub fn with_lockout_max_attempts(mut self, attempts: u32) -> Self {
        self.lockout_max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_lockout_minutes(mut self, minutes: i64) -> Self {
        self.lockout_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_token_lifetime_hours(mut self, hours: i64) -> Self {
        self.token_lifetime_hours = hours;
        self
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: String) -> Self {
        self.audience = audience;
        self
    }

    #[must_use]
    pub fn with_require_confirmed_email(mut self, required: bool) -> Self {
        self.require_confirmed_email = required;
        self
    }

    #[must_use]
    pub fn with_admin_role(mut self, role: String) -> Self {
        self.admin_role = role;
        self
    }

    #[must_use]
    pub fn password_min_length(&self) -> usize {
        self.password_min_length
    }

    #[must_use]
    pub fn username_min_length(&self) -> usize {
        self.username_min_length
    }

    #[must_use]
    pub fn lockout_max_attempts(&self) -> u32 {
        self.lockout_max_attempts
    }

    #[must_use]
    pub fn lockout_minutes(&self) -> i64 {
        self.lockout_minutes
    }

    #[must_use]
    pub fn token_lifetime_hours(&self) -> i64 {
        self.token_lifetime_hours
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    #[must_use]
    pub fn require_confirmed_email(&self) -> bool {
        self.require_confirmed_email
    }

    #[must_use]
    pub fn admin_role(&self) -> &str {
        &self.admin_role
    }

    /// Negative durations are treated as zero.
    #[must_use]
    pub fn lockout_policy(&self) -> LockoutPolicy {
        let minutes = self.lockout_minutes.max(0);
        LockoutPolicy::new(
            self.lockout_max_attempts,
            Duration::try_minutes(minutes).unwrap_or(Duration::MAX),
        )
    }
}
