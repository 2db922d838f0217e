use parking_lot::Mutex;
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};

use super::Service;

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN: Duration = Duration::minutes(5);

/// Authenticated session of one deployment: token plus the endpoints picked
/// from its service catalog.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub expires_at: Option<OffsetDateTime>,
    pub endpoints: HashMap<Service, String>,
}

impl Session {
    pub fn is_fresh(&self, now: OffsetDateTime) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - EXPIRY_MARGIN > now,
            None => true,
        }
    }
}

/// Sessions keyed by deployment name, owned by the client.
#[derive(Default)]
pub struct ConnectionPool {
    sessions: Mutex<HashMap<String, Session>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, deployment: &str) -> Option<Session> {
        self.sessions.lock().get(deployment).cloned()
    }

    pub fn contains(&self, deployment: &str) -> bool {
        self.sessions.lock().contains_key(deployment)
    }

    /// Inserts or replaces the session in place.
    pub fn put(&self, deployment: &str, session: Session) {
        self.sessions.lock().insert(deployment.to_string(), session);
    }

    pub fn evict(&self, deployment: &str) -> bool {
        self.sessions.lock().remove(deployment).is_some()
    }
}
