//! Registry of authenticated connections.
//!
//! Keeps two maps in step: connection → identity for teardown, and
//! client id → connection so a second login for the same id is refused.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

/// Handle the event loop assigns to every accepted transport.
pub type ConnId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnId,
    pub client_id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("client '{0}' is already logged in")]
    DuplicateLogin(String),
    #[error("connection is already logged in")]
    AlreadyRegistered,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    by_conn: HashMap<ConnId, Connection>,
    by_client: BTreeMap<String, ConnId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, conn: ConnId, client_id: &str) -> Result<(), RegisterError> {
        if self.by_conn.contains_key(&conn) {
            return Err(RegisterError::AlreadyRegistered);
        }
        if self.by_client.contains_key(client_id) {
            return Err(RegisterError::DuplicateLogin(client_id.to_string()));
        }

        self.by_client.insert(client_id.to_string(), conn);
        self.by_conn.insert(
            conn,
            Connection {
                id: conn,
                client_id: client_id.to_string(),
            },
        );
        Ok(())
    }

    /// Removes the connection if present. Unknown connections are ignored.
    pub fn unregister(&mut self, conn: ConnId) -> Option<Connection> {
        let connection = self.by_conn.remove(&conn)?;
        self.by_client.remove(&connection.client_id);
        Some(connection)
    }

    pub fn lookup_by_id(&self, client_id: &str) -> Option<&Connection> {
        self.by_client
            .get(client_id)
            .and_then(|conn| self.by_conn.get(conn))
    }

    pub fn get(&self, conn: ConnId) -> Option<&Connection> {
        self.by_conn.get(&conn)
    }

    pub fn is_registered(&self, conn: ConnId) -> bool {
        self.by_conn.contains_key(&conn)
    }

    /// Client ids of every live connection, sorted.
    pub fn list_all(&self) -> Vec<String> {
        self.by_client.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_conn.is_empty()
    }
}
