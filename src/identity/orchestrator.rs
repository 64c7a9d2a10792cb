//! Login, registration and role administration flows.
//!
//! A login walks the [`LoginStage`]s in order and stops at the first failing
//! gate. The only write a rejected login performs is the failed-attempt
//! increment on a wrong password. Identity writes re-read and retry on a
//! stale concurrency stamp, at most [`MAX_CONCURRENCY_RETRIES`] times.

use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::config::IdentityConfig;
use super::error::IdentityError;
use super::hasher::PasswordHasher;
use super::lockout::{FailureOutcome, LockoutPolicy, LockoutState};
use super::model::{Identity, IdentitySummary, Listing, NewRegistration, Role};
use super::store::{ConflictKind, CredentialStore, RoleRegistry, StoreError, StoreResult};
use super::token::{IssuedToken, SessionClaims, Signer, TokenError, TokenIssuer};
use super::validation::{char_len, normalize, valid_email};

type Result<T> = std::result::Result<T, IdentityError>;

/// Attempts made for one logical identity write before giving up with
/// [`IdentityError::Conflict`].
pub const MAX_CONCURRENCY_RETRIES: u32 = 3;

// Verified against when the username is unknown, so both rejections cost one
// hash verification.
const DUMMY_PASSWORD: &str = "gatekeeper-dummy-password";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginStage {
    Received,
    UsernameResolved,
    LockoutChecked,
    PasswordVerified,
    RolesResolved,
    TokenIssued,
}

impl fmt::Display for LoginStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Received => "received",
            Self::UsernameResolved => "username_resolved",
            Self::LockoutChecked => "lockout_checked",
            Self::PasswordVerified => "password_verified",
            Self::RolesResolved => "roles_resolved",
            Self::TokenIssued => "token_issued",
        };
        f.write_str(stage)
    }
}

pub struct Orchestrator {
    config: IdentityConfig,
    credentials: Arc<dyn CredentialStore>,
    roles: Arc<dyn RoleRegistry>,
    hasher: Arc<dyn PasswordHasher>,
    tokens: TokenIssuer,
    lockout: LockoutPolicy,
    clock: Arc<dyn Clock>,
    dummy_hash: OnceCell<String>,
}

impl Orchestrator {
    /// # Errors
    /// Returns an error if the configured token lifetime is not positive.
    pub fn new(
        config: IdentityConfig,
        credentials: Arc<dyn CredentialStore>,
        roles: Arc<dyn RoleRegistry>,
        hasher: Arc<dyn PasswordHasher>,
        signer: Arc<dyn Signer>,
    ) -> std::result::Result<Self, TokenError> {
        let tokens = TokenIssuer::new(
            signer,
            config.issuer().to_string(),
            config.audience().to_string(),
            config.token_lifetime_hours(),
        )?;
        let lockout = config.lockout_policy();
        Ok(Self {
            config,
            credentials,
            roles,
            hasher,
            tokens,
            lockout,
            clock: Arc::new(SystemClock),
            dummy_hash: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.credentials.backend_name()
    }

    /// Verify credentials and issue a session token.
    ///
    /// `remember_me` is accepted for client compatibility; tokens are
    /// stateless, so it does not change the lifetime.
    ///
    /// # Errors
    /// [`IdentityError::InvalidCredential`] for an unknown username or a wrong
    /// password, [`IdentityError::LockedOut`] while locked,
    /// [`IdentityError::NotAllowed`] when sign-in policy refuses the identity.
    #[instrument(skip(self, password))]
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<IssuedToken> {
        debug!(stage = %LoginStage::Received);
        let mut problems = Vec::new();
        if username.trim().is_empty() {
            problems.push("username is required".to_string());
        }
        if password.is_empty() {
            problems.push("password is required".to_string());
        }
        if !problems.is_empty() {
            return Err(IdentityError::Validation(problems));
        }

        let identity = match self.credentials.find_by_username(username).await {
            Ok(identity) => identity,
            Err(StoreError::NotFound(_)) => {
                let dummy = self.dummy_hash().await?;
                // Outcome is irrelevant; only the cost matters.
                let _ = self.verify_password(dummy, password).await;
                info!("login rejected: unknown username");
                return Err(IdentityError::InvalidCredential);
            }
            Err(e) => return Err(IdentityError::from_store("identity", e)),
        };
        debug!(stage = %LoginStage::UsernameResolved, identity = %identity.id);

        if let LockoutState::Locked { until } = self.lockout.state(&identity, self.clock.now()) {
            info!(identity = %identity.id, %until, "login rejected: locked out");
            return Err(IdentityError::LockedOut { until });
        }
        debug!(stage = %LoginStage::LockoutChecked);

        if !self
            .verify_password(identity.password_hash.clone(), password)
            .await?
        {
            self.record_failure(identity).await?;
            return Err(IdentityError::InvalidCredential);
        }
        debug!(stage = %LoginStage::PasswordVerified);

        let identity = self.confirm_sign_in(identity.id).await.inspect_err(|e| {
            info!("login rejected at sign-in confirmation: {e}");
        })?;

        let roles = self
            .roles
            .roles_for(identity.id)
            .await
            .map_err(|e| IdentityError::from_store("role", e))?;
        debug!(stage = %LoginStage::RolesResolved, roles = roles.len());

        let issued = self
            .tokens
            .issue(&identity, &roles, self.clock.now())
            .map_err(|e| IdentityError::internal("token signing", e))?;
        debug!(stage = %LoginStage::TokenIssued, expires_at = %issued.expires_at);
        info!(identity = %identity.id, "login succeeded");
        Ok(issued)
    }

    /// Create an identity holding `registration.role`.
    ///
    /// Registering into the admin role needs an admin `caller`, unless no
    /// identity holds that role yet.
    ///
    /// # Errors
    /// [`IdentityError::Validation`] listing every input problem,
    /// [`IdentityError::Conflict`] for a taken email or username,
    /// [`IdentityError::NotFound`] for an unknown role,
    /// [`IdentityError::NotAllowed`] for an unauthorized admin grant.
    #[instrument(skip(self, registration, caller), fields(username = %registration.username))]
    pub async fn register(
        &self,
        registration: NewRegistration,
        caller: Option<&SessionClaims>,
    ) -> Result<IdentitySummary> {
        self.validate_registration(&registration)?;

        if Self::identity_exists(self.credentials.find_by_email(&registration.email).await)? {
            return Err(IdentityError::Conflict(ConflictKind::Email.to_string()));
        }
        if Self::identity_exists(self.credentials.find_by_username(&registration.username).await)? {
            return Err(IdentityError::Conflict(ConflictKind::Username.to_string()));
        }

        let role = self
            .roles
            .find_role_by_name(&registration.role)
            .await
            .map_err(|e| IdentityError::from_store("role", e))?;
        self.authorize_role_grant(&role, caller).await?;

        let hash = self.hash_password(&registration.password).await?;
        let identity = Identity::new(&registration.username, &registration.email, hash);

        let created = match self.credentials.create_identity(identity, &[role.id]).await {
            Ok(created) => created,
            // The role went away between lookup and insert.
            Err(StoreError::NotFound(_)) => {
                return Err(IdentityError::NotFound("role".to_string()));
            }
            Err(e) => return Err(IdentityError::from_store("identity", e)),
        };
        info!(identity = %created.id, role = %role.name, "identity registered");
        Ok(IdentitySummary::from(&created))
    }

    /// # Errors
    /// Returns [`IdentityError::Internal`] on a storage failure.
    pub async fn list_identities(&self) -> Result<Listing<IdentitySummary>> {
        let identities = self
            .credentials
            .list_identities()
            .await
            .map_err(|e| IdentityError::from_store("identity", e))?;
        Ok(identities.iter().map(IdentitySummary::from).collect::<Vec<_>>().into())
    }

    /// # Errors
    /// Returns [`IdentityError::NotFound`] for an unknown identity.
    pub async fn identity(&self, id: Uuid) -> Result<IdentitySummary> {
        let identity = self
            .credentials
            .find_by_id(id)
            .await
            .map_err(|e| IdentityError::from_store("identity", e))?;
        Ok(IdentitySummary::from(&identity))
    }

    /// Clear any lock and the failed-attempt counter.
    ///
    /// # Errors
    /// Returns [`IdentityError::NotFound`] for an unknown identity.
    #[instrument(skip(self))]
    pub async fn unlock(&self, id: Uuid) -> Result<IdentitySummary> {
        let identity = self
            .mutate_identity_by_id(id, |identity, _| Ok(LockoutPolicy::unlock(identity)))
            .await?;
        info!(identity = %id, "identity unlocked");
        Ok(IdentitySummary::from(&identity))
    }

    /// Turning lockout off also clears any lock in place.
    ///
    /// # Errors
    /// Returns [`IdentityError::NotFound`] for an unknown identity.
    #[instrument(skip(self))]
    pub async fn set_lockout_enabled(&self, id: Uuid, enabled: bool) -> Result<IdentitySummary> {
        let identity = self
            .mutate_identity_by_id(id, |identity, _| {
                let mut changed = identity.lockout_enabled != enabled;
                identity.lockout_enabled = enabled;
                if !enabled {
                    changed |= LockoutPolicy::unlock(identity);
                }
                Ok(changed)
            })
            .await?;
        info!(identity = %id, enabled, "lockout toggled");
        Ok(IdentitySummary::from(&identity))
    }

    /// # Errors
    /// Returns [`IdentityError::NotFound`] for an unknown identity.
    #[instrument(skip(self))]
    pub async fn confirm_email(&self, id: Uuid) -> Result<IdentitySummary> {
        let identity = self
            .mutate_identity_by_id(id, |identity, _| {
                let changed = !identity.email_confirmed;
                identity.email_confirmed = true;
                Ok(changed)
            })
            .await?;
        info!(identity = %id, "email confirmed");
        Ok(IdentitySummary::from(&identity))
    }

    /// # Errors
    /// [`IdentityError::Validation`] for a short new password,
    /// [`IdentityError::InvalidCredential`] when `current` does not match.
    #[instrument(skip(self, current, new_password))]
    pub async fn change_password(&self, id: Uuid, current: &str, new_password: &str) -> Result<()> {
        self.check_password_length(new_password)?;
        let identity = self
            .credentials
            .find_by_id(id)
            .await
            .map_err(|e| IdentityError::from_store("identity", e))?;
        if !self
            .verify_password(identity.password_hash.clone(), current)
            .await?
        {
            return Err(IdentityError::InvalidCredential);
        }

        let hash = self.hash_password(new_password).await?;
        self.mutate_identity(identity, |identity, _| {
            identity.password_hash.clone_from(&hash);
            Ok(true)
        })
        .await?;
        info!(identity = %id, "password changed");
        Ok(())
    }

    /// A new address starts unconfirmed.
    ///
    /// # Errors
    /// [`IdentityError::Validation`] for a malformed address,
    /// [`IdentityError::Conflict`] if another identity holds it.
    #[instrument(skip(self))]
    pub async fn change_email(&self, id: Uuid, email: &str) -> Result<IdentitySummary> {
        if !valid_email(email) {
            return Err(IdentityError::validation("email is not valid"));
        }
        let wanted = normalize(email);
        let identity = self
            .mutate_identity_by_id(id, |identity, _| {
                if identity.normalized_email == wanted && identity.email == email.trim() {
                    return Ok(false);
                }
                identity.set_email(email);
                Ok(true)
            })
            .await?;
        Ok(IdentitySummary::from(&identity))
    }

    /// # Errors
    /// [`IdentityError::Validation`] for a short username,
    /// [`IdentityError::Conflict`] if another identity holds it.
    #[instrument(skip(self))]
    pub async fn change_username(&self, id: Uuid, username: &str) -> Result<IdentitySummary> {
        let min = self.config.username_min_length();
        if char_len(username.trim()) < min {
            return Err(IdentityError::validation(format!(
                "username must be at least {min} characters"
            )));
        }
        let identity = self
            .mutate_identity_by_id(id, |identity, _| {
                if identity.username == username.trim() {
                    return Ok(false);
                }
                identity.set_username(username);
                Ok(true)
            })
            .await?;
        Ok(IdentitySummary::from(&identity))
    }

    /// # Errors
    /// Returns [`IdentityError::Internal`] on a storage failure.
    pub async fn list_roles(&self) -> Result<Listing<Role>> {
        self.roles
            .list_roles()
            .await
            .map(Listing::from)
            .map_err(|e| IdentityError::from_store("role", e))
    }

    /// # Errors
    /// Returns [`IdentityError::NotFound`] for an unknown role.
    pub async fn role_by_id(&self, id: Uuid) -> Result<Role> {
        self.roles
            .find_role_by_id(id)
            .await
            .map_err(|e| IdentityError::from_store("role", e))
    }

    /// Case-insensitive substring search. No match is `NotFound`.
    ///
    /// # Errors
    /// Returns [`IdentityError::NotFound`] when nothing matches.
    pub async fn search_roles(&self, fragment: &str) -> Result<Vec<Role>> {
        let roles = self
            .roles
            .search_roles(fragment)
            .await
            .map_err(|e| IdentityError::from_store("role", e))?;
        if roles.is_empty() {
            return Err(IdentityError::NotFound("role".to_string()));
        }
        Ok(roles)
    }

    /// # Errors
    /// [`IdentityError::Validation`] for a blank name,
    /// [`IdentityError::Conflict`] if the normalized name exists.
    #[instrument(skip(self))]
    pub async fn create_role(&self, name: &str) -> Result<Role> {
        Self::check_role_name(name)?;
        let role = self
            .roles
            .create_role(name)
            .await
            .map_err(|e| IdentityError::from_store("role", e))?;
        info!(role = %role.name, "role created");
        Ok(role)
    }

    /// # Errors
    /// [`IdentityError::NotFound`] for an unknown role,
    /// [`IdentityError::Conflict`] if another role has the new name.
    #[instrument(skip(self))]
    pub async fn update_role(&self, id: Uuid, name: &str) -> Result<Role> {
        Self::check_role_name(name)?;
        self.roles
            .update_role(id, name)
            .await
            .map_err(|e| IdentityError::from_store("role", e))
    }

    /// # Errors
    /// Returns [`IdentityError::NotFound`] for an unknown role.
    #[instrument(skip(self))]
    pub async fn delete_role(&self, id: Uuid) -> Result<()> {
        self.roles
            .delete_role(id)
            .await
            .map_err(|e| IdentityError::from_store("role", e))?;
        info!(role = %id, "role deleted");
        Ok(())
    }

    /// Idempotent.
    ///
    /// # Errors
    /// Returns [`IdentityError::NotFound`] for an unknown identity or role.
    #[instrument(skip(self))]
    pub async fn assign_role(&self, identity_id: Uuid, role_name: &str) -> Result<()> {
        Self::check_role_name(role_name)?;
        self.credentials
            .find_by_id(identity_id)
            .await
            .map_err(|e| IdentityError::from_store("identity", e))?;
        self.roles
            .assign_role(identity_id, role_name)
            .await
            .map_err(|e| IdentityError::from_store("role", e))
    }

    /// # Errors
    /// Returns [`IdentityError::Internal`] on a storage failure.
    pub async fn identity_roles(&self, identity_id: Uuid) -> Result<Vec<Role>> {
        self.roles
            .roles_for(identity_id)
            .await
            .map_err(|e| IdentityError::from_store("role", e))
    }

    /// Bearer validation for inbound requests.
    ///
    /// # Errors
    /// Returns [`IdentityError::InvalidCredential`] for a bad or expired token.
    pub fn verify_token(&self, token: &str) -> Result<SessionClaims> {
        self.tokens.verify(token, self.clock.now()).map_err(|e| {
            debug!("bearer rejected: {e}");
            IdentityError::InvalidCredential
        })
    }

    #[must_use]
    pub fn is_admin(&self, claims: &SessionClaims) -> bool {
        claims.has_role(self.config.admin_role())
    }

    /// Create each missing role; existing ones are left alone.
    ///
    /// # Errors
    /// Returns [`IdentityError::Internal`] on a storage failure.
    pub async fn seed_roles(&self, names: &[String]) -> Result<()> {
        for name in names.iter().filter(|name| !name.trim().is_empty()) {
            match self.roles.create_role(name).await {
                Ok(role) => info!(role = %role.name, "seeded role"),
                Err(StoreError::Conflict(_)) => debug!(role = %name, "role already present"),
                Err(e) => return Err(IdentityError::from_store("role", e)),
            }
        }
        Ok(())
    }

    /// Compute the dummy hash up front so the first unknown-username login
    /// costs the same single verification as every later one.
    ///
    /// # Errors
    /// Returns [`IdentityError::Internal`] if hashing fails.
    pub async fn warm_up(&self) -> Result<()> {
        self.dummy_hash().await.map(|_| ())
    }

    /// # Errors
    /// Returns [`IdentityError::Internal`] if the backend is unreachable.
    pub async fn health(&self) -> Result<()> {
        self.credentials
            .health_check()
            .await
            .map_err(|e| IdentityError::from_store("storage", e))
    }

    fn validate_registration(&self, registration: &NewRegistration) -> Result<()> {
        let mut problems = Vec::new();

        let username = registration.username.trim();
        let username_min = self.config.username_min_length();
        if username.is_empty() {
            problems.push("username is required".to_string());
        } else if char_len(username) < username_min {
            problems.push(format!("username must be at least {username_min} characters"));
        }

        if registration.email.trim().is_empty() {
            problems.push("email is required".to_string());
        } else if !valid_email(&registration.email) {
            problems.push("email is not valid".to_string());
        }

        let password_min = self.config.password_min_length();
        if registration.password.is_empty() {
            problems.push("password is required".to_string());
        } else if char_len(&registration.password) < password_min {
            problems.push(format!("password must be at least {password_min} characters"));
        }

        if registration.role.trim().is_empty() {
            problems.push("role is required".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(IdentityError::Validation(problems))
        }
    }

    fn check_password_length(&self, password: &str) -> Result<()> {
        let min = self.config.password_min_length();
        if char_len(password) < min {
            return Err(IdentityError::validation(format!(
                "password must be at least {min} characters"
            )));
        }
        Ok(())
    }

    fn check_role_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(IdentityError::validation("role name is required"));
        }
        Ok(())
    }

    fn identity_exists(lookup: StoreResult<Identity>) -> Result<bool> {
        match lookup {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(IdentityError::from_store("identity", e)),
        }
    }

    async fn authorize_role_grant(&self, role: &Role, caller: Option<&SessionClaims>) -> Result<()> {
        if role.normalized_name != normalize(self.config.admin_role()) {
            return Ok(());
        }
        if caller.is_some_and(|claims| self.is_admin(claims)) {
            return Ok(());
        }
        let holders = self
            .roles
            .member_count(role.id)
            .await
            .map_err(|e| IdentityError::from_store("role", e))?;
        if holders == 0 {
            info!("no admin yet, allowing bootstrap registration");
            return Ok(());
        }
        warn!("admin role grant refused for non-admin caller");
        Err(IdentityError::NotAllowed)
    }

    async fn record_failure(&self, identity: Identity) -> Result<()> {
        let lockout = self.lockout;
        self.mutate_identity(identity, |identity, now| {
            Ok(match lockout.register_failure(identity, now) {
                FailureOutcome::Counted { failed_attempts } => {
                    info!(identity = %identity.id, failed_attempts, "failed login counted");
                    true
                }
                FailureOutcome::Locked { until } => {
                    warn!(identity = %identity.id, %until, "identity locked out");
                    true
                }
                FailureOutcome::AlreadyLocked { .. } | FailureOutcome::Ignored => false,
            })
        })
        .await?;
        Ok(())
    }

    // Works on a fresh read, so a lock set by a concurrent failure while the
    // password was being verified still rejects the login.
    async fn confirm_sign_in(&self, id: Uuid) -> Result<Identity> {
        let lockout = self.lockout;
        let require_confirmed = self.config.require_confirmed_email();
        self.mutate_identity_by_id(id, |identity, now| {
            if let LockoutState::Locked { until } = lockout.state(identity, now) {
                return Err(IdentityError::LockedOut { until });
            }
            if require_confirmed && !identity.email_confirmed {
                return Err(IdentityError::NotAllowed);
            }
            Ok(lockout.register_success(identity))
        })
        .await
    }

    async fn mutate_identity_by_id<F>(&self, id: Uuid, change: F) -> Result<Identity>
    where
        F: FnMut(&mut Identity, DateTime<Utc>) -> Result<bool> + Send,
    {
        let identity = self
            .credentials
            .find_by_id(id)
            .await
            .map_err(|e| IdentityError::from_store("identity", e))?;
        self.mutate_identity(identity, change).await
    }

    /// Apply `change` and write it back with compare-and-swap. `change`
    /// returns whether it modified the identity; an unchanged identity is not
    /// written. On a stale stamp the identity is re-read and `change` applied
    /// again, up to [`MAX_CONCURRENCY_RETRIES`] attempts.
    async fn mutate_identity<F>(&self, mut identity: Identity, mut change: F) -> Result<Identity>
    where
        F: FnMut(&mut Identity, DateTime<Utc>) -> Result<bool> + Send,
    {
        for attempt in 1..=MAX_CONCURRENCY_RETRIES {
            if !change(&mut identity, self.clock.now())? {
                return Ok(identity);
            }
            match self.credentials.update_identity(identity.clone()).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::Conflict(ConflictKind::Stale)) => {
                    debug!(identity = %identity.id, attempt, "stale identity write, re-reading");
                    identity = self
                        .credentials
                        .find_by_id(identity.id)
                        .await
                        .map_err(|e| IdentityError::from_store("identity", e))?;
                }
                Err(e) => return Err(IdentityError::from_store("identity", e)),
            }
        }
        warn!(identity = %identity.id, "giving up after {MAX_CONCURRENCY_RETRIES} stale writes");
        Err(IdentityError::Conflict(ConflictKind::Stale.to_string()))
    }

    async fn hash_password(&self, plaintext: &str) -> Result<String> {
        let hasher = Arc::clone(&self.hasher);
        let plaintext = plaintext.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&plaintext))
            .await
            .map_err(|e| IdentityError::internal("password hashing task", e))?
            .map_err(|e| IdentityError::internal("password hashing", e))
    }

    async fn verify_password(&self, hash: String, plaintext: &str) -> Result<bool> {
        let hasher = Arc::clone(&self.hasher);
        let plaintext = plaintext.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&hash, &plaintext))
            .await
            .map_err(|e| IdentityError::internal("password verification task", e))?
            .map_err(|e| IdentityError::internal("password verification", e))
    }

    async fn dummy_hash(&self) -> Result<String> {
        self.dummy_hash
            .get_or_try_init(|| self.hash_password(DUMMY_PASSWORD))
            .await
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::hasher::HashError;
    use crate::identity::memory::MemoryStore;
    use crate::identity::token::HmacSigner;
    use anyhow::Result;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    const SECRET: &str = "orchestrator-test-secret-0123456789abcdef";

    /// Reversible stand-in so unit tests skip Argon2.
    #[derive(Default)]
    struct PlainHasher {
        hashes: AtomicU32,
        verifications: AtomicU32,
    }

    impl PasswordHasher for PlainHasher {
        fn hash(&self, plaintext: &str) -> std::result::Result<String, HashError> {
            self.hashes.fetch_add(1, Ordering::SeqCst);
            Ok(format!("plain:{plaintext}"))
        }

        fn verify(&self, hash: &str, plaintext: &str) -> std::result::Result<bool, HashError> {
            self.verifications.fetch_add(1, Ordering::SeqCst);
            hash.strip_prefix("plain:")
                .map(|stored| stored == plaintext)
                .ok_or(HashError::Malformed)
        }
    }

    struct FixedClock(Mutex<DateTime<Utc>>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0.lock().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
        }
    }

    /// Lets a concurrent writer sneak in before the first `interfere` updates.
    struct RacingStore {
        inner: MemoryStore,
        interfere: AtomicU32,
    }

    #[async_trait]
    impl CredentialStore for RacingStore {
        async fn find_by_username(&self, username: &str) -> StoreResult<Identity> {
            self.inner.find_by_username(username).await
        }
        async fn find_by_email(&self, email: &str) -> StoreResult<Identity> {
            self.inner.find_by_email(email).await
        }
        async fn find_by_id(&self, id: Uuid) -> StoreResult<Identity> {
            self.inner.find_by_id(id).await
        }
        async fn list_identities(&self) -> StoreResult<Vec<Identity>> {
            self.inner.list_identities().await
        }
        async fn create_identity(&self, identity: Identity, roles: &[Uuid]) -> StoreResult<Identity> {
            self.inner.create_identity(identity, roles).await
        }
        async fn update_identity(&self, identity: Identity) -> StoreResult<Identity> {
            let remaining = self.interfere.load(Ordering::SeqCst);
            if remaining > 0 {
                self.interfere.store(remaining - 1, Ordering::SeqCst);
                // Another request counts a failure first.
                let mut other = self.inner.find_by_id(identity.id).await?;
                other.access_failed_count += 1;
                self.inner.update_identity(other).await?;
            }
            self.inner.update_identity(identity).await
        }
        async fn health_check(&self) -> StoreResult<()> {
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "racing"
        }
    }

    /// Locks the identity right after handing out the login read, as a
    /// concurrent failed login would while the password is being verified.
    struct LockAfterReadStore {
        inner: MemoryStore,
        lock_for: chrono::Duration,
    }

    #[async_trait]
    impl CredentialStore for LockAfterReadStore {
        async fn find_by_username(&self, username: &str) -> StoreResult<Identity> {
            let read = self.inner.find_by_username(username).await?;
            let mut other = read.clone();
            other.lockout_end = Some(Utc::now() + self.lock_for);
            self.inner.update_identity(other).await?;
            Ok(read)
        }
        async fn find_by_email(&self, email: &str) -> StoreResult<Identity> {
            self.inner.find_by_email(email).await
        }
        async fn find_by_id(&self, id: Uuid) -> StoreResult<Identity> {
            self.inner.find_by_id(id).await
        }
        async fn list_identities(&self) -> StoreResult<Vec<Identity>> {
            self.inner.list_identities().await
        }
        async fn create_identity(&self, identity: Identity, roles: &[Uuid]) -> StoreResult<Identity> {
            self.inner.create_identity(identity, roles).await
        }
        async fn update_identity(&self, identity: Identity) -> StoreResult<Identity> {
            self.inner.update_identity(identity).await
        }
        async fn health_check(&self) -> StoreResult<()> {
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "lock-after-read"
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        store: Arc<MemoryStore>,
        hasher: Arc<PlainHasher>,
        clock: Arc<FixedClock>,
    }

    fn fixture(config: IdentityConfig) -> Result<Fixture> {
        let store = Arc::new(MemoryStore::new());
        let hasher = Arc::new(PlainHasher::default());
        let clock = Arc::new(FixedClock(Mutex::new(Utc::now())));
        let signer = Arc::new(HmacSigner::new(&SecretString::from(SECRET))?);
        let orchestrator = Orchestrator::new(
            config,
            store.clone(),
            store.clone(),
            hasher.clone(),
            signer,
        )?
        .with_clock(clock.clone());
        Ok(Fixture {
            orchestrator,
            store,
            hasher,
            clock,
        })
    }

    fn registration(username: &str, email: &str, password: &str, role: &str) -> NewRegistration {
        NewRegistration {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            role: role.to_string(),
        }
    }

    async fn with_alice(config: IdentityConfig) -> Result<Fixture> {
        let fixture = fixture(config)?;
        fixture.orchestrator.create_role("student").await?;
        fixture
            .orchestrator
            .register(registration("alice", "alice@example.com", "secret", "student"), None)
            .await?;
        Ok(fixture)
    }

    #[tokio::test]
    async fn login_issues_token_with_roles() -> Result<()> {
        let fixture = with_alice(IdentityConfig::new()).await?;
        let issued = fixture.orchestrator.login("ALICE", "secret", false).await?;
        let claims = fixture.orchestrator.verify_token(&issued.token)?;
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.roles, vec!["student".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_username_looks_like_wrong_password() -> Result<()> {
        let fixture = with_alice(IdentityConfig::new()).await?;
        let before = fixture.hasher.verifications.load(Ordering::SeqCst);
        let unknown = fixture.orchestrator.login("mallory", "secret", false).await;
        assert!(matches!(unknown, Err(IdentityError::InvalidCredential)));
        assert_eq!(fixture.hasher.verifications.load(Ordering::SeqCst), before + 1);

        let wrong = fixture.orchestrator.login("alice", "wrong!", false).await;
        assert!(matches!(wrong, Err(IdentityError::InvalidCredential)));
        Ok(())
    }

    #[tokio::test]
    async fn locked_identity_skips_password_check() -> Result<()> {
        let fixture = with_alice(IdentityConfig::new().with_lockout_max_attempts(2)).await?;
        for _ in 0..2 {
            let _ = fixture.orchestrator.login("alice", "wrong!", false).await;
        }
        let before = fixture.hasher.verifications.load(Ordering::SeqCst);
        let locked = fixture.orchestrator.login("alice", "secret", false).await;
        assert!(matches!(locked, Err(IdentityError::LockedOut { .. })));
        assert_eq!(fixture.hasher.verifications.load(Ordering::SeqCst), before);
        Ok(())
    }

    #[tokio::test]
    async fn login_succeeds_after_lock_expires() -> Result<()> {
        let fixture = with_alice(
            IdentityConfig::new()
                .with_lockout_max_attempts(1)
                .with_lockout_minutes(5),
        )
        .await?;
        let _ = fixture.orchestrator.login("alice", "wrong!", false).await;
        if let Ok(mut now) = fixture.clock.0.lock() {
            *now += chrono::Duration::minutes(5);
        }
        fixture.orchestrator.login("alice", "secret", false).await?;
        let alice = fixture.store.find_by_username("alice").await?;
        assert_eq!(alice.access_failed_count, 0);
        assert!(alice.lockout_end.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unconfirmed_email_is_not_allowed_when_required() -> Result<()> {
        let fixture = with_alice(IdentityConfig::new().with_require_confirmed_email(true)).await?;
        let refused = fixture.orchestrator.login("alice", "secret", false).await;
        assert!(matches!(refused, Err(IdentityError::NotAllowed)));

        let alice = fixture.store.find_by_username("alice").await?;
        fixture.orchestrator.confirm_email(alice.id).await?;
        fixture.orchestrator.login("alice", "secret", false).await?;
        Ok(())
    }

    #[tokio::test]
    async fn login_requires_both_fields() -> Result<()> {
        let fixture = fixture(IdentityConfig::new())?;
        match fixture.orchestrator.login(" ", "", false).await {
            Err(IdentityError::Validation(problems)) => assert_eq!(problems.len(), 2),
            other => panic!("expected validation error, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn failure_counting_survives_a_concurrent_write() -> Result<()> {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            interfere: AtomicU32::new(0),
        });
        let roles = Arc::new(MemoryStore::new());
        roles.create_role("student").await?;
        let signer = Arc::new(HmacSigner::new(&SecretString::from(SECRET))?);
        let orchestrator = Orchestrator::new(
            IdentityConfig::new(),
            store.clone(),
            roles,
            Arc::new(PlainHasher::default()),
            signer,
        )?;
        let alice = store
            .create_identity(
                Identity::new("alice", "alice@example.com", "plain:secret".to_string()),
                &[],
            )
            .await?;

        store.interfere.store(1, Ordering::SeqCst);
        let _ = orchestrator.login("alice", "wrong!", false).await;
        // Both the concurrent failure and ours are counted.
        assert_eq!(store.find_by_id(alice.id).await?.access_failed_count, 2);

        store.interfere.store(MAX_CONCURRENCY_RETRIES, Ordering::SeqCst);
        let exhausted = orchestrator.login("alice", "wrong!", false).await;
        assert!(matches!(exhausted, Err(IdentityError::Conflict(_))));
        Ok(())
    }

    #[tokio::test]
    async fn lock_set_during_password_check_rejects_login() -> Result<()> {
        let store = Arc::new(LockAfterReadStore {
            inner: MemoryStore::new(),
            lock_for: chrono::Duration::minutes(5),
        });
        let roles = Arc::new(MemoryStore::new());
        let signer = Arc::new(HmacSigner::new(&SecretString::from(SECRET))?);
        let orchestrator = Orchestrator::new(
            IdentityConfig::new(),
            store.clone(),
            roles,
            Arc::new(PlainHasher::default()),
            signer,
        )?;
        let alice = store
            .create_identity(
                Identity::new("alice", "alice@example.com", "plain:secret".to_string()),
                &[],
            )
            .await?;

        let result = orchestrator.login("alice", "secret", false).await;
        assert!(
            matches!(result, Err(IdentityError::LockedOut { .. })),
            "got {result:?}"
        );
        assert!(store.find_by_id(alice.id).await?.lockout_end.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn warm_up_moves_dummy_hashing_out_of_login() -> Result<()> {
        let fixture = with_alice(IdentityConfig::new()).await?;
        fixture.orchestrator.warm_up().await?;
        let hashes = fixture.hasher.hashes.load(Ordering::SeqCst);
        let verifications = fixture.hasher.verifications.load(Ordering::SeqCst);

        let unknown = fixture.orchestrator.login("mallory", "secret", false).await;
        assert!(matches!(unknown, Err(IdentityError::InvalidCredential)));
        assert_eq!(fixture.hasher.hashes.load(Ordering::SeqCst), hashes);
        assert_eq!(
            fixture.hasher.verifications.load(Ordering::SeqCst),
            verifications + 1
        );
        Ok(())
    }

    #[tokio::test]
    async fn registration_reports_every_problem() -> Result<()> {
        let fixture = fixture(IdentityConfig::new())?;
        match fixture
            .orchestrator
            .register(registration("al", "nope", "123", ""), None)
            .await
        {
            Err(IdentityError::Validation(problems)) => {
                assert_eq!(
                    problems,
                    vec![
                        "username must be at least 3 characters".to_string(),
                        "email is not valid".to_string(),
                        "password must be at least 6 characters".to_string(),
                        "role is required".to_string(),
                    ]
                );
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn registration_into_unknown_role_creates_nothing() -> Result<()> {
        let fixture = fixture(IdentityConfig::new())?;
        let result = fixture
            .orchestrator
            .register(registration("bob", "bob@example.com", "secret", "ghost"), None)
            .await;
        assert!(matches!(result, Err(IdentityError::NotFound(entity)) if entity == "role"));
        assert_eq!(fixture.orchestrator.list_identities().await?, Listing::Empty);
        Ok(())
    }

    #[tokio::test]
    async fn admin_registration_bootstraps_then_requires_admin() -> Result<()> {
        let fixture = fixture(IdentityConfig::new())?;
        fixture.orchestrator.seed_roles(&["admin".to_string()]).await?;

        fixture
            .orchestrator
            .register(registration("root", "root@example.com", "secret", "admin"), None)
            .await?;
        let second = fixture
            .orchestrator
            .register(registration("eve", "eve@example.com", "secret", "Admin"), None)
            .await;
        assert!(matches!(second, Err(IdentityError::NotAllowed)));

        let token = fixture.orchestrator.login("root", "secret", false).await?;
        let claims = fixture.orchestrator.verify_token(&token.token)?;
        fixture
            .orchestrator
            .register(
                registration("ops", "ops@example.com", "secret", "admin"),
                Some(&claims),
            )
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn change_password_requires_current() -> Result<()> {
        let fixture = with_alice(IdentityConfig::new()).await?;
        let alice = fixture.store.find_by_username("alice").await?;

        let wrong = fixture
            .orchestrator
            .change_password(alice.id, "nope!!", "better-secret")
            .await;
        assert!(matches!(wrong, Err(IdentityError::InvalidCredential)));

        fixture
            .orchestrator
            .change_password(alice.id, "secret", "better-secret")
            .await?;
        fixture.orchestrator.login("alice", "better-secret", false).await?;
        Ok(())
    }

    #[tokio::test]
    async fn change_email_and_username_keep_uniqueness() -> Result<()> {
        let fixture = with_alice(IdentityConfig::new()).await?;
        let bob = fixture
            .orchestrator
            .register(registration("bob", "bob@example.com", "secret", "student"), None)
            .await?;

        let email = fixture.orchestrator.change_email(bob.id, "ALICE@example.com").await;
        assert!(matches!(email, Err(IdentityError::Conflict(_))));
        let username = fixture.orchestrator.change_username(bob.id, "Alice").await;
        assert!(matches!(username, Err(IdentityError::Conflict(_))));

        let renamed = fixture.orchestrator.change_username(bob.id, "robert").await?;
        assert_eq!(renamed.username, "robert");
        Ok(())
    }

    #[tokio::test]
    async fn disabling_lockout_clears_lock() -> Result<()> {
        let fixture = with_alice(IdentityConfig::new().with_lockout_max_attempts(1)).await?;
        let _ = fixture.orchestrator.login("alice", "wrong!", false).await;
        let alice = fixture.store.find_by_username("alice").await?;
        assert!(alice.lockout_end.is_some());

        let summary = fixture.orchestrator.set_lockout_enabled(alice.id, false).await?;
        assert!(!summary.lockout_enabled);
        assert!(summary.lockout_end.is_none());
        let _ = fixture.orchestrator.login("alice", "wrong!", false).await;
        fixture.orchestrator.login("alice", "secret", false).await?;
        Ok(())
    }

    #[tokio::test]
    async fn search_with_no_match_is_not_found() -> Result<()> {
        let fixture = fixture(IdentityConfig::new())?;
        fixture.orchestrator.create_role("Teacher").await?;
        assert_eq!(fixture.orchestrator.search_roles("each").await?.len(), 1);
        assert!(matches!(
            fixture.orchestrator.search_roles("zzz").await,
            Err(IdentityError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn seeding_is_idempotent() -> Result<()> {
        let fixture = fixture(IdentityConfig::new())?;
        let names = vec!["admin".to_string(), "Student".to_string(), String::new()];
        fixture.orchestrator.seed_roles(&names).await?;
        fixture.orchestrator.seed_roles(&names).await?;
        match fixture.orchestrator.list_roles().await? {
            Listing::Items(roles) => assert_eq!(roles.len(), 2),
            Listing::Empty => panic!("expected seeded roles"),
        }
        Ok(())
    }
}
