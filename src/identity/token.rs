//! Session token claims, signing and verification.
//!
//! The signing key is derived once from the configured secret and shared
//! read-only; every instance configured with the same secret verifies tokens
//! issued by any other.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::model::{Identity, Role};
use super::validation::normalize;

/// Longest accepted token lifetime, one hundred years.
pub const MAX_LIFETIME_HOURS: i64 = 24 * 365 * 100;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("signing secret must be at least {0} bytes")]
    WeakSecret(usize),
    #[error("token lifetime must be between 1 and {} hours", MAX_LIFETIME_HOURS)]
    Lifetime,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// Claims carried by an issued session token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Username.
    pub sub: String,
    pub email: String,
    /// Stable identity id.
    pub id: Uuid,
    /// One entry per role held at issuance.
    #[serde(rename = "role", default)]
    pub roles: Vec<String>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

impl SessionClaims {
    /// Role membership under normalized comparison.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        let wanted = normalize(role);
        self.roles.iter().any(|held| normalize(held) == wanted)
    }
}

/// Signs and verifies claim sets. Verification checks signature, issuer and
/// audience; expiry is checked by [`TokenIssuer`] against its clock.
pub trait Signer: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    /// # Errors
    /// Returns an error if encoding or signing fails.
    fn sign(&self, claims: &SessionClaims) -> Result<String, TokenError>;

    /// # Errors
    /// Returns an error on a malformed token, a bad signature, or an
    /// unexpected issuer/audience.
    fn verify(&self, token: &str, issuer: &str, audience: &str)
    -> Result<SessionClaims, TokenError>;
}

/// HS256 signer over a symmetric secret.
pub struct HmacSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl HmacSigner {
    pub const MIN_SECRET_LEN: usize = 32;

    /// # Errors
    /// Returns [`TokenError::WeakSecret`] if the secret is shorter than
    /// [`Self::MIN_SECRET_LEN`] bytes.
    pub fn new(secret: &SecretString) -> Result<Self, TokenError> {
        let bytes = secret.expose_secret().as_bytes();
        if bytes.len() < Self::MIN_SECRET_LEN {
            return Err(TokenError::WeakSecret(Self::MIN_SECRET_LEN));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
        })
    }
}

impl Signer for HmacSigner {
    fn algorithm(&self) -> Algorithm {
        Algorithm::HS256
    }

    fn sign(&self, claims: &SessionClaims) -> Result<String, TokenError> {
        Ok(jsonwebtoken::encode(
            &Header::new(self.algorithm()),
            claims,
            &self.encoding,
        )?)
    }

    fn verify(
        &self,
        token: &str,
        issuer: &str,
        audience: &str,
    ) -> Result<SessionClaims, TokenError> {
        let mut validation = Validation::new(self.algorithm());
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.validate_exp = false;
        validation.leeway = 0;

        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenIssuer {
    signer: Arc<dyn Signer>,
    issuer: String,
    audience: String,
    lifetime: Duration,
}

impl TokenIssuer {
    /// # Errors
    /// Returns [`TokenError::Lifetime`] unless `lifetime_hours` is in
    /// `1..=MAX_LIFETIME_HOURS`.
    pub fn new(
        signer: Arc<dyn Signer>,
        issuer: String,
        audience: String,
        lifetime_hours: i64,
    ) -> Result<Self, TokenError> {
        if !(1..=MAX_LIFETIME_HOURS).contains(&lifetime_hours) {
            return Err(TokenError::Lifetime);
        }
        let lifetime = Duration::try_hours(lifetime_hours).ok_or(TokenError::Lifetime)?;
        Ok(Self {
            signer,
            issuer,
            audience,
            lifetime,
        })
    }

    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Claims for `identity` at `now`, truncated to whole seconds.
    #[must_use]
    pub fn claims_for(&self, identity: &Identity, roles: &[Role], now: DateTime<Utc>) -> SessionClaims {
        let iat = now.timestamp();
        SessionClaims {
            sub: identity.username.clone(),
            email: identity.email.clone(),
            id: identity.id,
            roles: roles.iter().map(|role| role.name.clone()).collect(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat,
            exp: iat + self.lifetime.num_seconds(),
        }
    }

    /// # Errors
    /// Returns [`TokenError::Lifetime`] if the expiry falls outside the
    /// representable range, otherwise the signer's error.
    pub fn issue(
        &self,
        identity: &Identity,
        roles: &[Role],
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let issued_at = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
        let expires_at = issued_at
            .checked_add_signed(self.lifetime)
            .ok_or(TokenError::Lifetime)?;
        let claims = self.claims_for(identity, roles, now);
        let token = self.signer.sign(&claims)?;
        Ok(IssuedToken {
            token,
            issued_at,
            expires_at,
        })
    }

    /// Bearer validation: signature, issuer, audience, then `now < exp`.
    ///
    /// # Errors
    /// Returns [`TokenError::Expired`] for an expired token, otherwise the
    /// signer's verification error.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims, TokenError> {
        let claims = self.signer.verify(token, &self.issuer, &self.audience)?;
        if now.timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    const SECRET: &str = "an-hs256-secret-of-at-least-32-bytes!!";

    fn issuer(lifetime_hours: i64) -> Result<TokenIssuer> {
        let signer = HmacSigner::new(&SecretString::from(SECRET))?;
        Ok(TokenIssuer::new(
            Arc::new(signer),
            "gatekeeper".to_string(),
            "clients".to_string(),
            lifetime_hours,
        )?)
    }

    fn identity() -> Identity {
        Identity::new("alice", "alice@example.com", String::new())
    }

    #[test]
    fn rejects_short_secret() {
        assert!(matches!(
            HmacSigner::new(&SecretString::from("short")),
            Err(TokenError::WeakSecret(32))
        ));
    }

    #[test]
    fn rejects_non_positive_lifetime() -> Result<()> {
        let signer: Arc<dyn Signer> = Arc::new(HmacSigner::new(&SecretString::from(SECRET))?);
        assert!(matches!(
            TokenIssuer::new(signer, "i".to_string(), "a".to_string(), 0),
            Err(TokenError::Lifetime)
        ));
        Ok(())
    }

    #[test]
    fn rejects_lifetime_past_the_representable_range() -> Result<()> {
        let signer: Arc<dyn Signer> = Arc::new(HmacSigner::new(&SecretString::from(SECRET))?);
        assert!(matches!(
            TokenIssuer::new(signer, "i".to_string(), "a".to_string(), 3_000_000_000),
            Err(TokenError::Lifetime)
        ));
        assert!(issuer(MAX_LIFETIME_HOURS).is_ok());
        Ok(())
    }

    #[test]
    fn issue_fails_instead_of_overflowing_the_expiry() -> Result<()> {
        let issuer = issuer(MAX_LIFETIME_HOURS)?;
        let near_end = DateTime::<Utc>::MAX_UTC - Duration::hours(1);
        assert!(matches!(
            issuer.issue(&identity(), &[], near_end),
            Err(TokenError::Lifetime)
        ));
        assert!(issuer.issue(&identity(), &[], Utc::now()).is_ok());
        Ok(())
    }

    #[test]
    fn issued_token_decodes_to_identity_claims() -> Result<()> {
        let issuer = issuer(3)?;
        let identity = identity();
        let roles = vec![Role::new("A"), Role::new("B")];
        let now = Utc::now();

        let issued = issuer.issue(&identity, &roles, now)?;
        let claims = issuer.verify(&issued.token, now)?;

        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.email, "alice@example.com");
        assert_eq!(claims.id, identity.id);
        assert_eq!(claims.roles, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(claims.iat, now.timestamp());
        assert_eq!(claims.exp, now.timestamp() + 3 * 3600);
        assert_eq!(issued.expires_at.timestamp(), claims.exp);
        Ok(())
    }

    #[test]
    fn role_claim_is_named_role() -> Result<()> {
        let issuer = issuer(1)?;
        let claims = issuer.claims_for(&identity(), &[Role::new("student")], Utc::now());
        let value = serde_json::to_value(&claims)?;
        assert_eq!(value["role"], serde_json::json!(["student"]));
        assert!(value.get("roles").is_none());
        Ok(())
    }

    #[test]
    fn verify_rejects_expired_token() -> Result<()> {
        let issuer = issuer(1)?;
        let now = Utc::now();
        let issued = issuer.issue(&identity(), &[], now)?;

        let at_expiry = now + Duration::hours(1);
        assert!(matches!(
            issuer.verify(&issued.token, at_expiry),
            Err(TokenError::Expired)
        ));
        assert!(issuer.verify(&issued.token, at_expiry - Duration::seconds(1)).is_ok());
        Ok(())
    }

    #[test]
    fn verify_rejects_wrong_audience_and_secret() -> Result<()> {
        let issuer = issuer(1)?;
        let now = Utc::now();
        let issued = issuer.issue(&identity(), &[], now)?;

        let signer: Arc<dyn Signer> = Arc::new(HmacSigner::new(&SecretString::from(SECRET))?);
        let other_audience = TokenIssuer::new(signer, "gatekeeper".to_string(), "other".to_string(), 1)?;
        assert!(matches!(
            other_audience.verify(&issued.token, now),
            Err(TokenError::Invalid(_))
        ));

        let other_secret: Arc<dyn Signer> = Arc::new(HmacSigner::new(&SecretString::from(
            "a-completely-different-secret-value-here",
        ))?);
        let other_key = TokenIssuer::new(other_secret, "gatekeeper".to_string(), "clients".to_string(), 1)?;
        assert!(matches!(
            other_key.verify(&issued.token, now),
            Err(TokenError::Invalid(_))
        ));
        Ok(())
    }

    #[test]
    fn tokens_verify_across_instances_sharing_the_secret() -> Result<()> {
        let first = issuer(1)?;
        let second = issuer(1)?;
        let now = Utc::now();
        let issued = first.issue(&identity(), &[], now)?;
        assert_eq!(second.verify(&issued.token, now)?.sub, "alice");
        Ok(())
    }

    #[test]
    fn has_role_is_case_insensitive() {
        let claims = SessionClaims {
            sub: "a".to_string(),
            email: "a@example.com".to_string(),
            id: Uuid::new_v4(),
            roles: vec!["Admin".to_string()],
            iss: String::new(),
            aud: String::new(),
            iat: 0,
            exp: 0,
        };
        assert!(claims.has_role("ADMIN"));
        assert!(!claims.has_role("student"));
    }
}
