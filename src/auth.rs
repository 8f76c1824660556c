use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// In-memory session registry behind a single shared password. Sessions die
/// with the process; a restart logs everyone out, which is acceptable for a
/// single-household deployment.
pub struct SessionGate {
    password_digest: Option<[u8; 32]>,
    ttl: Duration,
    sessions: HashMap<String, DateTime<Utc>>,
}

impl SessionGate {
    pub fn new(password: Option<&str>, ttl_hours: i64) -> Self {
        Self {
            password_digest: password.map(|value| Sha256::digest(value.as_bytes()).into()),
            ttl: Duration::hours(ttl_hours),
            sessions: HashMap::new(),
        }
    }

    /// With no password configured the gate is disabled and every request
    /// passes authorization.
    pub fn enabled(&self) -> bool {
        self.password_digest.is_some()
    }

    /// Mints a session token on a password match. Expired sessions are
    /// evicted here; the registry is low-cardinality, so sweeping it on each
    /// successful login is enough.
    pub fn authenticate(&mut self, password: &str, now: DateTime<Utc>) -> Option<String> {
        let expected = self.password_digest?;
        let submitted: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        if submitted != expected {
            return None;
        }

        let ttl = self.ttl;
        self.sessions.retain(|_, created_at| now - *created_at < ttl);

        let token = Uuid::new_v4().simple().to_string();
        self.sessions.insert(token.clone(), now);
        Some(token)
    }

    pub fn is_authorized(&self, token: &str, now: DateTime<Utc>) -> bool {
        if !self.enabled() {
            return true;
        }
        self.sessions
            .get(token)
            .is_some_and(|created_at| now - *created_at < self.ttl)
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_is_accepted() {
        let mut gate = SessionGate::new(Some("hunter2"), 24);
        let now = Utc::now();

        let token = gate.authenticate("hunter2", now).unwrap();
        assert!(gate.is_authorized(&token, now));
        assert!(gate.is_authorized(&token, now + Duration::hours(23)));
    }

    #[test]
    fn wrong_password_yields_no_token() {
        let mut gate = SessionGate::new(Some("hunter2"), 24);
        assert!(gate.authenticate("letmein", Utc::now()).is_none());
    }

    #[test]
    fn unknown_token_is_rejected() {
        let gate = SessionGate::new(Some("hunter2"), 24);
        assert!(!gate.is_authorized("deadbeef", Utc::now()));
    }

    #[test]
    fn expired_token_is_rejected_and_evicted() {
        let mut gate = SessionGate::new(Some("hunter2"), 24);
        let start = Utc::now();
        let token = gate.authenticate("hunter2", start).unwrap();

        let later = start + Duration::hours(25);
        assert!(!gate.is_authorized(&token, later));

        // Next successful login sweeps the stale entry out of the registry.
        gate.authenticate("hunter2", later).unwrap();
        assert_eq!(gate.session_count(), 1);
        assert!(!gate.is_authorized(&token, later));
    }

    #[test]
    fn disabled_gate_authorizes_everything_and_mints_nothing() {
        let mut gate = SessionGate::new(None, 24);
        assert!(!gate.enabled());
        assert!(gate.is_authorized("anything", Utc::now()));
        assert!(gate.authenticate("anything", Utc::now()).is_none());
    }
}
