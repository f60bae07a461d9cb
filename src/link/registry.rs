//! Process-wide registry of link sessions and handshake timeouts.
use std::collections::HashMap;

use super::session::{LinkSession, LinkState, SessionId};
use super::tree::fold_name;

/// A pending handshake deadline for one session.
#[derive(Debug, Clone)]
pub struct PendingTimeout {
    /// What the session is, for the expiry notice.
    pub description: String,
    /// Unix time after which the session is considered stalled.
    pub deadline: u64,
}

/// All live link sessions, keyed by identity. Each session has at most
/// one pending timeout; the entry is cleared when negotiation completes
/// or the session dies.
#[derive(Debug, Default)]
pub struct LinkTable {
    sessions: HashMap<SessionId, LinkSession>,
    timeouts: HashMap<SessionId, PendingTimeout>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session with a handshake deadline `timeout_secs` from `now`.
    pub fn register(&mut self, session: LinkSession, timeout_secs: u64, now: u64) {
        self.timeouts.insert(
            session.id,
            PendingTimeout {
                description: session.describe().to_owned(),
                deadline: now + timeout_secs,
            },
        );
        self.sessions.insert(session.id, session);
    }

    /// Remove a session and its timeout entry. Returns the session, or
    /// `None` if it was already gone.
    pub fn unregister(&mut self, id: SessionId) -> Option<LinkSession> {
        self.timeouts.remove(&id);
        self.sessions.remove(&id)
    }

    /// Negotiation finished; the session no longer has a deadline.
    pub fn clear_timeout(&mut self, id: SessionId) {
        self.timeouts.remove(&id);
    }

    pub fn get(&self, id: SessionId) -> Option<&LinkSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut LinkSession> {
        self.sessions.get_mut(&id)
    }

    pub fn timeout(&self, id: SessionId) -> Option<&PendingTimeout> {
        self.timeouts.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions whose handshake deadline has passed. The caller closes
    /// them; this only reads.
    pub fn sweep_expired(&self, now: u64) -> Vec<SessionId> {
        self.timeouts
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Snapshot of established sessions, minus the one a broadcast came
    /// from. A snapshot, so a session dying mid-broadcast cannot disturb
    /// the iteration.
    pub fn established_except(&self, except: Option<SessionId>) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.state == LinkState::Established && Some(s.id) != except)
            .map(|s| s.id)
            .collect()
    }

    /// The established session representing `server`, if it is directly
    /// linked to us.
    pub fn session_for_server(&self, server: &str) -> Option<SessionId> {
        let key = fold_name(server);
        self.sessions
            .values()
            .find(|s| s.server_name.as_deref().is_some_and(|n| fold_name(n) == key))
            .map(|s| s.id)
    }
}
