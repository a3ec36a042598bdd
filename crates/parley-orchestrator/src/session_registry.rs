//! Live session registry keyed by tenant and contact.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_types::{ContactKey, InterviewStatus, Session, SessionView, StateError};

use crate::locks::{read_unpoisoned, write_unpoisoned};

/// Owns every non-terminal [`Session`]. Terminal sessions are removed.
///
/// Mutation for one contact only happens from that contact's queue worker
/// (or the monitor holding its lease), so the map lock is held briefly.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ContactKey, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ContactKey) -> Option<Session> {
        read_unpoisoned(&self.sessions).get(key).cloned()
    }

    pub fn contains(&self, key: &ContactKey) -> bool {
        read_unpoisoned(&self.sessions).contains_key(key)
    }

    pub fn len(&self) -> usize {
        read_unpoisoned(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts a live session, returning any session it replaced.
    pub fn insert(&self, session: Session) -> Result<Option<Session>, StateError> {
        if session.status().is_terminal() {
            return Err(StateError::Terminal {
                status: session.status(),
            });
        }
        Ok(write_unpoisoned(&self.sessions).insert(session.key.clone(), session))
    }

    /// Applies `apply` to the session; a session left terminal is evicted.
    pub fn update<R>(&self, key: &ContactKey, apply: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut sessions = write_unpoisoned(&self.sessions);
        let session = sessions.get_mut(key)?;
        let result = apply(session);
        if session.status().is_terminal() {
            sessions.remove(key);
        }
        Some(result)
    }

    pub fn remove(&self, key: &ContactKey) -> Option<Session> {
        write_unpoisoned(&self.sessions).remove(key)
    }

    /// Moves the session to `status` and evicts it.
    pub fn close(&self, key: &ContactKey, status: InterviewStatus) -> Result<Session, StateError> {
        let mut sessions = write_unpoisoned(&self.sessions);
        let Some(mut session) = sessions.remove(key) else {
            return Err(StateError::NoSession);
        };
        if session.status() == status && status.is_terminal() {
            return Ok(session);
        }
        if let Err(error) = session.close(status) {
            if !session.status().is_terminal() {
                sessions.insert(key.clone(), session);
            }
            return Err(error);
        }
        Ok(session)
    }

    pub fn keys(&self) -> Vec<ContactKey> {
        let mut keys = read_unpoisoned(&self.sessions)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Keys of sessions idle for strictly longer than `threshold`.
    pub fn idle_keys(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<ContactKey> {
        let mut keys = read_unpoisoned(&self.sessions)
            .values()
            .filter(|session| session.is_idle(now, threshold))
            .map(|session| session.key.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn views(&self, now: DateTime<Utc>) -> Vec<SessionView> {
        let mut views = read_unpoisoned(&self.sessions)
            .values()
            .map(|session| session.view(now))
            .collect::<Vec<_>>();
        views.sort_by(|left, right| {
            (&left.tenant_id, &left.contact_id).cmp(&(&right.tenant_id, &right.contact_id))
        });
        views
    }

    pub fn count_for_tenant(&self, tenant_id: &str) -> usize {
        read_unpoisoned(&self.sessions)
            .keys()
            .filter(|key| key.tenant_id == tenant_id)
            .count()
    }
}
