#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use gatekeeper::identity::{
    Argon2Hasher, Clock, HmacSigner, IdentityConfig, NewRegistration, Orchestrator,
    memory::MemoryStore,
};
use secrecy::SecretString;
use std::sync::{Arc, Mutex};

pub const SECRET: &str = "integration-secret-of-at-least-32-bytes";

/// Clock the test moves by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map_or_else(|_| Utc::now(), |now| *now)
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub clock: Arc<ManualClock>,
}

/// In-memory orchestrator with cheap Argon2 parameters and the default
/// `admin` and `student` roles.
pub async fn harness(config: IdentityConfig) -> Result<Harness> {
    let store = Arc::new(MemoryStore::new());
    let hasher = Argon2Hasher::with_cost(1024, 1)?;
    let signer = HmacSigner::new(&SecretString::from(SECRET))?;
    let clock = ManualClock::new();

    let orchestrator = Orchestrator::new(
        config,
        store.clone(),
        store,
        Arc::new(hasher),
        Arc::new(signer),
    )?
    .with_clock(clock.clone());
    orchestrator
        .seed_roles(&["admin".to_string(), "student".to_string()])
        .await?;

    Ok(Harness {
        orchestrator: Arc::new(orchestrator),
        clock,
    })
}

pub fn registration(username: &str, email: &str, password: &str, role: &str) -> NewRegistration {
    NewRegistration {
        username: username.to_string(),
        email: email.to_string(),
        password: password.to_string(),
        role: role.to_string(),
    }
}
