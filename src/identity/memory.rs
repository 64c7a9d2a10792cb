//! In-memory identity and role storage.
//!
//! A single mutex guards identities, roles and assignments together, which
//! makes identity creation plus its initial role assignment atomic. Used when
//! no database is configured, and by the tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{Identity, Role};
use super::store::{ConflictKind, CredentialStore, RoleRegistry, StoreError, StoreResult};
use super::validation::normalize;

#[derive(Default)]
struct State {
    identities: HashMap<Uuid, Identity>,
    roles: HashMap<Uuid, Role>,
    // (identity_id, role_id)
    assignments: HashSet<(Uuid, Uuid)>,
}

impl State {
    fn identity_where(&self, matches: impl Fn(&Identity) -> bool) -> StoreResult<Identity> {
        self.identities
            .values()
            .find(|identity| matches(identity))
            .cloned()
            .ok_or_else(|| StoreError::NotFound("identity".to_string()))
    }

    fn role_by_name(&self, normalized_name: &str) -> Option<&Role> {
        self.roles
            .values()
            .find(|role| role.normalized_name == normalized_name)
    }

    fn check_identity_unique(&self, identity: &Identity) -> StoreResult<()> {
        for other in self.identities.values().filter(|other| other.id != identity.id) {
            if other.normalized_username == identity.normalized_username {
                return Err(StoreError::Conflict(ConflictKind::Username));
            }
            if other.normalized_email == identity.normalized_email {
                return Err(StoreError::Conflict(ConflictKind::Email));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_roles(mut roles: Vec<Role>) -> Vec<Role> {
    roles.sort_by(|a, b| a.normalized_name.cmp(&b.normalized_name));
    roles
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_by_username(&self, username: &str) -> StoreResult<Identity> {
        let wanted = normalize(username);
        let state = self.state.lock().await;
        state.identity_where(|identity| identity.normalized_username == wanted)
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Identity> {
        let wanted = normalize(email);
        let state = self.state.lock().await;
        state.identity_where(|identity| identity.normalized_email == wanted)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Identity> {
        let state = self.state.lock().await;
        state
            .identities
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("identity".to_string()))
    }

    async fn list_identities(&self) -> StoreResult<Vec<Identity>> {
        let state = self.state.lock().await;
        let mut identities: Vec<Identity> = state.identities.values().cloned().collect();
        identities.sort_by(|a, b| a.normalized_username.cmp(&b.normalized_username));
        Ok(identities)
    }

    async fn create_identity(&self, identity: Identity, roles: &[Uuid]) -> StoreResult<Identity> {
        let mut state = self.state.lock().await;
        if state.identities.contains_key(&identity.id) {
            return Err(StoreError::Conflict(ConflictKind::Stale));
        }
        state.check_identity_unique(&identity)?;
        if let Some(missing) = roles.iter().find(|id| !state.roles.contains_key(*id)) {
            return Err(StoreError::NotFound(format!("role {missing}")));
        }

        for role_id in roles {
            state.assignments.insert((identity.id, *role_id));
        }
        state.identities.insert(identity.id, identity.clone());
        Ok(identity)
    }

    async fn update_identity(&self, mut identity: Identity) -> StoreResult<Identity> {
        let mut state = self.state.lock().await;
        let stored_stamp = state
            .identities
            .get(&identity.id)
            .map(|stored| stored.concurrency_stamp)
            .ok_or_else(|| StoreError::NotFound("identity".to_string()))?;
        if stored_stamp != identity.concurrency_stamp {
            return Err(StoreError::Conflict(ConflictKind::Stale));
        }
        state.check_identity_unique(&identity)?;

        identity.concurrency_stamp = Uuid::new_v4();
        state.identities.insert(identity.id, identity.clone());
        Ok(identity)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl RoleRegistry for MemoryStore {
    async fn role_exists(&self, name: &str) -> StoreResult<bool> {
        let wanted = normalize(name);
        let state = self.state.lock().await;
        Ok(state.role_by_name(&wanted).is_some())
    }

    async fn list_roles(&self) -> StoreResult<Vec<Role>> {
        let state = self.state.lock().await;
        Ok(sorted_roles(state.roles.values().cloned().collect()))
    }

    async fn find_role_by_id(&self, id: Uuid) -> StoreResult<Role> {
        let state = self.state.lock().await;
        state
            .roles
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("role".to_string()))
    }

    async fn find_role_by_name(&self, name: &str) -> StoreResult<Role> {
        let wanted = normalize(name);
        let state = self.state.lock().await;
        state
            .role_by_name(&wanted)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("role".to_string()))
    }

    async fn search_roles(&self, fragment: &str) -> StoreResult<Vec<Role>> {
        let wanted = normalize(fragment);
        let state = self.state.lock().await;
        Ok(sorted_roles(
            state
                .roles
                .values()
                .filter(|role| role.normalized_name.contains(&wanted))
                .cloned()
                .collect(),
        ))
    }

    async fn create_role(&self, name: &str) -> StoreResult<Role> {
        let role = Role::new(name);
        let mut state = self.state.lock().await;
        if state.role_by_name(&role.normalized_name).is_some() {
            return Err(StoreError::Conflict(ConflictKind::RoleName));
        }
        state.roles.insert(role.id, role.clone());
        Ok(role)
    }

    async fn update_role(&self, id: Uuid, name: &str) -> StoreResult<Role> {
        let wanted = normalize(name);
        let mut state = self.state.lock().await;
        if state
            .role_by_name(&wanted)
            .is_some_and(|other| other.id != id)
        {
            return Err(StoreError::Conflict(ConflictKind::RoleName));
        }
        let role = state
            .roles
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound("role".to_string()))?;
        role.rename(name);
        Ok(role.clone())
    }

    async fn delete_role(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.roles.remove(&id).is_none() {
            return Err(StoreError::NotFound("role".to_string()));
        }
        state.assignments.retain(|(_, role_id)| *role_id != id);
        Ok(())
    }

    async fn assign_role(&self, identity_id: Uuid, role_name: &str) -> StoreResult<()> {
        let wanted = normalize(role_name);
        let mut state = self.state.lock().await;
        if !state.identities.contains_key(&identity_id) {
            return Err(StoreError::NotFound("identity".to_string()));
        }
        let role_id = state
            .role_by_name(&wanted)
            .map(|role| role.id)
            .ok_or_else(|| StoreError::NotFound("role".to_string()))?;
        state.assignments.insert((identity_id, role_id));
        Ok(())
    }

    async fn roles_for(&self, identity_id: Uuid) -> StoreResult<Vec<Role>> {
        let state = self.state.lock().await;
        Ok(sorted_roles(
            state
                .assignments
                .iter()
                .filter(|(assigned, _)| *assigned == identity_id)
                .filter_map(|(_, role_id)| state.roles.get(role_id).cloned())
                .collect(),
        ))
    }

    async fn member_count(&self, role_id: Uuid) -> StoreResult<u64> {
        let state = self.state.lock().await;
        let count = state
            .assignments
            .iter()
            .filter(|(_, assigned)| *assigned == role_id)
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }
}
