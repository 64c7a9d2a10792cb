//! Password hashing collaborator.

use argon2::{
    Algorithm, Argon2, Params, PasswordHasher as _, PasswordVerifier, Version,
    password_hash::{self, PasswordHash, SaltString},
};
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("failed to hash password: {0}")]
    Hash(String),
    #[error("stored password hash is malformed")]
    Malformed,
    #[error("invalid hasher parameters: {0}")]
    Params(String),
}

/// Produces and checks password hashes. Implementations must never retain or
/// log the plaintext.
pub trait PasswordHasher: Send + Sync {
    /// # Errors
    /// Returns an error if the hashing primitive fails.
    fn hash(&self, plaintext: &str) -> Result<String, HashError>;

    /// `Ok(false)` is a mismatch; `Err` means the check could not be made.
    ///
    /// # Errors
    /// Returns an error if the stored hash cannot be parsed or the primitive fails.
    fn verify(&self, hash: &str, plaintext: &str) -> Result<bool, HashError>;
}

/// Argon2id with a random salt per hash, PHC string output.
#[derive(Clone, Debug, Default)]
pub struct Argon2Hasher {
    params: Params,
}

impl Argon2Hasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Custom memory (KiB) and iteration cost.
    ///
    /// # Errors
    /// Returns an error if Argon2 rejects the parameters.
    pub fn with_cost(m_cost_kib: u32, t_cost: u32) -> Result<Self, HashError> {
        let params = Params::new(m_cost_kib, t_cost, Params::DEFAULT_P_COST, None)
            .map_err(|e| HashError::Params(e.to_string()))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, plaintext: &str) -> Result<String, HashError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| HashError::Hash(e.to_string()))
    }

    fn verify(&self, hash: &str, plaintext: &str) -> Result<bool, HashError> {
        let parsed = PasswordHash::new(hash).map_err(|_| HashError::Malformed)?;
        // Cost parameters come from the PHC string, not from `self`.
        match self.argon2().verify_password(plaintext.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(HashError::Hash(e.to_string())),
        }
    }
}
