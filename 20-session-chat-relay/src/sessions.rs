//! Registry of named chat sessions and their members.
//!
//! The registry maintains both directions: session name → members (for
//! broadcast) and connection → session name (so `session_of` is a single
//! lookup). Every mutation updates both maps before returning. A session
//! exists exactly as long as it has at least one member.

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;

use crate::connections::ConnId;

/// Longest accepted session name in bytes. Replies echo the name, and even
/// fully escaped it still fits in a server packet.
pub const MAX_SESSION_NAME: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("already in session '{0}'")]
    AlreadyInSession(String),
    #[error("session '{0}' already exists")]
    SessionExists(String),
    #[error("session name is missing")]
    MissingName,
    #[error("session name is longer than {MAX_SESSION_NAME} bytes")]
    NameTooLong,
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("not in a session")]
    NotInSession,
}

/// Result of a successful [`SessionRegistry::leave`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub session: String,
    /// The connection was the last member and the session is gone.
    pub closed: bool,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    members: BTreeMap<String, HashSet<ConnId>>,
    membership: HashMap<ConnId, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_of(&self, conn: ConnId) -> Option<&str> {
        self.membership.get(&conn).map(String::as_str)
    }

    pub fn create(&mut self, name: &str, conn: ConnId) -> Result<(), SessionError> {
        self.ensure_not_member(conn)?;
        if self.members.contains_key(name) {
            return Err(SessionError::SessionExists(name.to_string()));
        }
        if name.trim().is_empty() {
            return Err(SessionError::MissingName);
        }
        ensure_name_fits(name)?;

        self.members
            .insert(name.to_string(), HashSet::from([conn]));
        self.membership.insert(conn, name.to_string());
        Ok(())
    }

    pub fn join(&mut self, name: &str, conn: ConnId) -> Result<(), SessionError> {
        self.ensure_not_member(conn)?;
        ensure_name_fits(name)?;
        let members = self
            .members
            .get_mut(name)
            .ok_or_else(|| SessionError::SessionNotFound(name.to_string()))?;

        members.insert(conn);
        self.membership.insert(conn, name.to_string());
        Ok(())
    }

    /// Removes the connection from its session, deleting the session when it
    /// was the last member.
    pub fn leave(&mut self, conn: ConnId) -> Result<Departure, SessionError> {
        let session = self
            .membership
            .remove(&conn)
            .ok_or(SessionError::NotInSession)?;

        let closed = match self.members.get_mut(&session) {
            Some(members) => {
                members.remove(&conn);
                members.is_empty()
            }
            None => true,
        };
        if closed {
            self.members.remove(&session);
        }

        Ok(Departure { session, closed })
    }

    /// Members of the named session; empty when it does not exist.
    pub fn members_of(&self, name: &str) -> Vec<ConnId> {
        self.members
            .get(name)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Open session names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    fn ensure_not_member(&self, conn: ConnId) -> Result<(), SessionError> {
        match self.membership.get(&conn) {
            Some(current) => Err(SessionError::AlreadyInSession(current.clone())),
            None => Ok(()),
        }
    }
}

fn ensure_name_fits(name: &str) -> Result<(), SessionError> {
    if name.len() > MAX_SESSION_NAME {
        return Err(SessionError::NameTooLong);
    }
    Ok(())
}
