use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::warn;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashMap;
use std::sync::Arc;

use super::crypto::Address;
use super::storage::StorageError;

/// Default session lifetime, renewed on every successful validation
pub const DEFAULT_SESSION_TTL_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session")]
    InvalidSession,

    #[error("Session expired")]
    SessionExpired,

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// A bearer session tied to one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub address: Address,
    pub expires: DateTime<Utc>,
}

/// Token → session map.
///
/// Expired sessions stay in the map until the next lookup touches them.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl_secs: i64) -> Self {
        SessionStore {
            sessions: Arc::new(DashMap::new()),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    pub fn from_sessions(sessions: HashMap<String, Session>, ttl_secs: i64) -> Self {
        let store = Self::new(ttl_secs);
        for (token, session) in sessions {
            store.sessions.insert(token, session);
        }
        store
    }

    /// Opens a session for `address` and returns its token
    pub fn create(&self, address: &Address, now: DateTime<Utc>) -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        self.sessions.insert(
            token.clone(),
            Session {
                address: address.clone(),
                expires: now + self.ttl,
            },
        );
        token
    }

    /// Checks a token and pushes its expiry to `now + ttl`.
    ///
    /// # Returns
    ///
    /// The address the session belongs to
    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<Address, SessionError> {
        let token = token.trim();

        {
            let mut session = self
                .sessions
                .get_mut(token)
                .ok_or(SessionError::InvalidSession)?;

            if session.expires >= now {
                session.expires = now + self.ttl;
                return Ok(session.address.clone());
            }
        }

        self.sessions.remove(token);
        warn!("Evicted expired session");
        Err(SessionError::SessionExpired)
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.remove(token.trim()).is_some()
    }

    /// Removes every session belonging to `address`
    pub fn revoke_address(&self, address: &Address) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| &session.address != address);
        before - self.sessions.len()
    }

    /// Drops sessions that expired before `now`
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.expires >= now);
        before - self.sessions.len()
    }

    /// Copy of every session, for persisting
    pub fn snapshot(&self) -> HashMap<String, Session> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
