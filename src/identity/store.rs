//! Storage contracts for identities and roles.
//!
//! Backends normalize lookup arguments themselves, so callers may pass raw
//! user input. Every mutating call compares and regenerates a concurrency
//! stamp; a stale stamp surfaces as [`ConflictKind::Stale`].

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::model::{Identity, Role};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    Username,
    Email,
    RoleName,
    /// The record changed since it was read.
    Stale,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Username => f.write_str("username already exists"),
            Self::Email => f.write_str("email already exists"),
            Self::RoleName => f.write_str("role already exists"),
            Self::Stale => f.write_str("record was modified concurrently"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(ConflictKind),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> StoreResult<Identity>;
    async fn find_by_email(&self, email: &str) -> StoreResult<Identity>;
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Identity>;
    async fn list_identities(&self) -> StoreResult<Vec<Identity>>;

    /// Insert the identity together with its initial role assignments.
    /// Either everything is committed or nothing is.
    async fn create_identity(&self, identity: Identity, roles: &[Uuid]) -> StoreResult<Identity>;

    /// Compare-and-swap on `identity.concurrency_stamp`; returns the stored
    /// record with its new stamp.
    async fn update_identity(&self, identity: Identity) -> StoreResult<Identity>;

    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}

#[async_trait]
pub trait RoleRegistry: Send + Sync {
    async fn role_exists(&self, name: &str) -> StoreResult<bool>;
    async fn list_roles(&self) -> StoreResult<Vec<Role>>;
    async fn find_role_by_id(&self, id: Uuid) -> StoreResult<Role>;
    async fn find_role_by_name(&self, name: &str) -> StoreResult<Role>;
    /// Case-insensitive substring match on the role name.
    async fn search_roles(&self, fragment: &str) -> StoreResult<Vec<Role>>;
    async fn create_role(&self, name: &str) -> StoreResult<Role>;
    async fn update_role(&self, id: Uuid, name: &str) -> StoreResult<Role>;
    async fn delete_role(&self, id: Uuid) -> StoreResult<()>;
    /// Idempotent: assigning a role the identity already holds succeeds.
    async fn assign_role(&self, identity_id: Uuid, role_name: &str) -> StoreResult<()>;
    async fn roles_for(&self, identity_id: Uuid) -> StoreResult<Vec<Role>>;
    async fn member_count(&self, role_id: Uuid) -> StoreResult<u64>;
}
