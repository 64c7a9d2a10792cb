//! Credential verification and token issuance core.
//!
//! The [`Orchestrator`] is the entry point callers use. It is assembled from
//! four injected collaborators:
//!
//! - [`CredentialStore`]: identities, their password hashes and lockout state.
//! - [`RoleRegistry`]: roles and identity-role assignments.
//! - [`PasswordHasher`]: hash/verify, Argon2id by default.
//! - [`Signer`]: signs and verifies claim sets, HS256 by default.
//!
//! [`memory::MemoryStore`] and [`postgres::PgStore`] implement both storage
//! traits; either can back the orchestrator without touching its logic.

mod clock;
mod config;
mod error;
mod hasher;
mod lockout;
pub mod memory;
mod model;
mod orchestrator;
pub mod postgres;
mod store;
mod token;
mod validation;

pub use clock::{Clock, SystemClock};
pub use config::IdentityConfig;
pub use error::IdentityError;
pub use hasher::{Argon2Hasher, HashError, PasswordHasher};
pub use lockout::{FailureOutcome, LockoutPolicy, LockoutState};
pub use model::{Identity, IdentitySummary, Listing, NewRegistration, Role};
pub use orchestrator::{LoginStage, MAX_CONCURRENCY_RETRIES, Orchestrator};
pub use store::{ConflictKind, CredentialStore, RoleRegistry, StoreError, StoreResult};
pub use token::{
    HmacSigner, IssuedToken, MAX_LIFETIME_HOURS, SessionClaims, Signer, TokenError, TokenIssuer,
};
pub use validation::{normalize, valid_email};
