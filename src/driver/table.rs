//! Session table
//!
//! Owns every session of a driver and indexes them by peer control address,
//! data address and SSRC. Optional hooks see each session as it enters and
//! leaves the table.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::error::{MidiError, Result};
use crate::session::Session;
use crate::types::SessionId;

type Hook = Box<dyn FnMut(&Session)>;

/// Sessions keyed by id with secondary indices
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    by_control: HashMap<SocketAddr, SessionId>,
    by_data: HashMap<SocketAddr, SessionId>,
    by_ssrc: HashMap<u32, SessionId>,
    on_insert: Option<Hook>,
    on_remove: Option<Hook>,
}

impl fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.sessions.keys().collect();
        ids.sort_unstable();
        f.debug_struct("SessionTable")
            .field("sessions", &ids)
            .finish_non_exhaustive()
    }
}

impl SessionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table that calls `on_insert` after every insert and
    /// `on_remove` before every removal
    #[must_use]
    pub fn with_hooks(
        on_insert: impl FnMut(&Session) + 'static,
        on_remove: impl FnMut(&Session) + 'static,
    ) -> Self {
        Self {
            on_insert: Some(Box::new(on_insert)),
            on_remove: Some(Box::new(on_remove)),
            ..Self::default()
        }
    }

    /// Add a session
    ///
    /// # Errors
    ///
    /// Returns `MidiError::InvalidArgument` if the id or the peer control
    /// address is already present.
    pub fn insert(&mut self, session: Session) -> Result<()> {
        let id = session.id();
        if self.sessions.contains_key(&id) {
            return Err(MidiError::invalid_argument(
                "session",
                format!("{id} already exists"),
            ));
        }
        let control = session.peer().control_addr;
        if let Some(existing) = self.by_control.get(&control) {
            return Err(MidiError::invalid_argument(
                "peer",
                format!("{control} already has session {existing}"),
            ));
        }

        self.sessions.insert(id, session);
        self.reindex(id);
        if let (Some(hook), Some(session)) = (self.on_insert.as_mut(), self.sessions.get(&id)) {
            hook(session);
        }
        Ok(())
    }

    /// Remove a session and its index entries
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        if let (Some(hook), Some(session)) = (self.on_remove.as_mut(), self.sessions.get(&id)) {
            hook(session);
        }
        let session = self.sessions.remove(&id)?;
        self.unindex(id);
        Some(session)
    }

    /// Refresh the index entries of `id` after its peer changed
    pub fn reindex(&mut self, id: SessionId) {
        self.unindex(id);
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        let peer = session.peer();
        self.by_control.insert(peer.control_addr, id);
        self.by_data.insert(peer.data_addr, id);
        if let Some(ssrc) = peer.ssrc {
            self.by_ssrc.insert(ssrc, id);
        }
    }

    fn unindex(&mut self, id: SessionId) {
        self.by_control.retain(|_, v| *v != id);
        self.by_data.retain(|_, v| *v != id);
        self.by_ssrc.retain(|_, v| *v != id);
    }

    /// Session by id
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Mutable session by id
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Session whose peer control port is `addr`
    #[must_use]
    pub fn by_control_addr(&self, addr: SocketAddr) -> Option<SessionId> {
        self.by_control.get(&addr).copied()
    }

    /// Session whose peer data port is `addr`
    #[must_use]
    pub fn by_data_addr(&self, addr: SocketAddr) -> Option<SessionId> {
        self.by_data.get(&addr).copied()
    }

    /// Session whose peer uses `ssrc`
    #[must_use]
    pub fn by_ssrc(&self, ssrc: u32) -> Option<SessionId> {
        self.by_ssrc.get(&ssrc).copied()
    }

    /// Visit every session in id order and sum what the visitor returns
    pub fn apply(&mut self, mut visit: impl FnMut(&mut Session) -> usize) -> usize {
        let mut total = 0;
        for id in self.ids() {
            if let Some(session) = self.sessions.get_mut(&id) {
                total += visit(session);
            }
        }
        total
    }

    /// Ids in ascending order
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Check whether `id` is present
    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Number of sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
