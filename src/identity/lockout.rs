//! Failed-attempt counting and temporary lockout.
//!
//! The policy is pure: it inspects and mutates an [`Identity`] in memory and
//! leaves persistence (and the compare-and-swap retry) to the orchestrator.
//!
//! States cycle `Unlocked -> Locked -> Unlocked`. Reaching
//! `max_failed_attempts` consecutive failures locks the identity for
//! `duration` from that moment and resets the counter, so an identity coming
//! out of a lock gets a full set of attempts again. Expiry is strict: the lock
//! holds while `now < lockout_end`.

use chrono::{DateTime, Duration, Utc};

use super::model::Identity;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockoutState {
    Unlocked,
    Locked { until: DateTime<Utc> },
}

/// What a failed verification did to the identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Counter incremented, still unlocked.
    Counted { failed_attempts: u32 },
    /// This failure reached the threshold.
    Locked { until: DateTime<Utc> },
    /// Already locked; nothing changed.
    AlreadyLocked { until: DateTime<Utc> },
    /// Lockout disabled for this identity; nothing changed.
    Ignored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockoutPolicy {
    max_failed_attempts: u32,
    duration: Duration,
}

impl LockoutPolicy {
    /// A threshold of zero is treated as one.
    #[must_use]
    pub fn new(max_failed_attempts: u32, duration: Duration) -> Self {
        Self {
            max_failed_attempts: max_failed_attempts.max(1),
            duration,
        }
    }

    #[must_use]
    pub fn max_failed_attempts(&self) -> u32 {
        self.max_failed_attempts
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub fn state(&self, identity: &Identity, now: DateTime<Utc>) -> LockoutState {
        if !identity.lockout_enabled {
            return LockoutState::Unlocked;
        }
        match identity.lockout_end {
            Some(until) if now < until => LockoutState::Locked { until },
            _ => LockoutState::Unlocked,
        }
    }

    #[must_use]
    pub fn is_locked_out(&self, identity: &Identity, now: DateTime<Utc>) -> bool {
        matches!(self.state(identity, now), LockoutState::Locked { .. })
    }

    pub fn register_failure(&self, identity: &mut Identity, now: DateTime<Utc>) -> FailureOutcome {
        if !identity.lockout_enabled {
            return FailureOutcome::Ignored;
        }
        if let LockoutState::Locked { until } = self.state(identity, now) {
            return FailureOutcome::AlreadyLocked { until };
        }

        let failed_attempts = identity.access_failed_count.saturating_add(1);
        if failed_attempts >= self.max_failed_attempts {
            let until = now
                .checked_add_signed(self.duration)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            identity.lockout_end = Some(until);
            identity.access_failed_count = 0;
            FailureOutcome::Locked { until }
        } else {
            identity.access_failed_count = failed_attempts;
            FailureOutcome::Counted { failed_attempts }
        }
    }

    /// Clears the counter and any lock. Returns whether anything changed.
    pub fn register_success(&self, identity: &mut Identity) -> bool {
        Self::unlock(identity)
    }

    /// Administrative unlock; does not look at the attempt count.
    pub fn unlock(identity: &mut Identity) -> bool {
        let changed = identity.access_failed_count != 0 || identity.lockout_end.is_some();
        identity.access_failed_count = 0;
        identity.lockout_end = None;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity::new("alice", "alice@example.com", String::new())
    }

    fn policy() -> LockoutPolicy {
        LockoutPolicy::new(3, Duration::minutes(5))
    }

    #[test]
    fn locks_after_threshold_and_resets_counter() {
        let policy = policy();
        let now = Utc::now();
        let mut identity = identity();

        assert_eq!(
            policy.register_failure(&mut identity, now),
            FailureOutcome::Counted { failed_attempts: 1 }
        );
        assert_eq!(
            policy.register_failure(&mut identity, now),
            FailureOutcome::Counted { failed_attempts: 2 }
        );
        assert_eq!(
            policy.register_failure(&mut identity, now),
            FailureOutcome::Locked {
                until: now + Duration::minutes(5)
            }
        );
        assert_eq!(identity.access_failed_count, 0);
        assert!(policy.is_locked_out(&identity, now));
    }

    #[test]
    fn lock_expires_strictly_at_lockout_end() {
        let policy = LockoutPolicy::new(1, Duration::minutes(5));
        let now = Utc::now();
        let mut identity = identity();
        policy.register_failure(&mut identity, now);

        let until = now + Duration::minutes(5);
        assert!(policy.is_locked_out(&identity, until - Duration::seconds(1)));
        assert_eq!(policy.state(&identity, until), LockoutState::Unlocked);
    }

    #[test]
    fn failures_while_locked_do_not_extend_the_lock() {
        let policy = LockoutPolicy::new(1, Duration::minutes(5));
        let now = Utc::now();
        let mut identity = identity();
        policy.register_failure(&mut identity, now);
        let later = now + Duration::minutes(1);

        assert_eq!(
            policy.register_failure(&mut identity, later),
            FailureOutcome::AlreadyLocked {
                until: now + Duration::minutes(5)
            }
        );
        assert_eq!(identity.lockout_end, Some(now + Duration::minutes(5)));
    }

    #[test]
    fn disabled_lockout_ignores_failures() {
        let policy = LockoutPolicy::new(1, Duration::minutes(5));
        let now = Utc::now();
        let mut identity = identity();
        identity.lockout_enabled = false;

        assert_eq!(policy.register_failure(&mut identity, now), FailureOutcome::Ignored);
        assert_eq!(identity.access_failed_count, 0);
        assert!(!policy.is_locked_out(&identity, now));
    }

    #[test]
    fn disabled_lockout_hides_existing_lock() {
        let policy = LockoutPolicy::new(1, Duration::minutes(5));
        let now = Utc::now();
        let mut identity = identity();
        policy.register_failure(&mut identity, now);
        identity.lockout_enabled = false;
        assert_eq!(policy.state(&identity, now), LockoutState::Unlocked);
    }

    #[test]
    fn success_clears_counter_and_lock() {
        let policy = policy();
        let now = Utc::now();
        let mut identity = identity();
        policy.register_failure(&mut identity, now);
        assert!(policy.register_success(&mut identity));
        assert_eq!(identity.access_failed_count, 0);
        assert!(identity.lockout_end.is_none());
        assert!(!policy.register_success(&mut identity));
    }

    #[test]
    fn zero_threshold_is_clamped_to_one() {
        let policy = LockoutPolicy::new(0, Duration::minutes(1));
        assert_eq!(policy.max_failed_attempts(), 1);
    }
}
