//! Packet dispatch over the connection and session registries.
//!
//! [`ServerState`] owns every piece of shared relay state. It never touches a
//! socket: `dispatch` turns one decoded packet into a list of [`Action`]s and
//! the event loop carries them out. This keeps the routing rules testable
//! without a network.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    connections::{ConnId, Connection, ConnectionRegistry, RegisterError},
    credentials::CredentialStore,
    message::{Message, Roster},
    packet::{Packet, SERVER_SOURCE},
    sessions::{SessionError, SessionRegistry},
};

/// Work the event loop must perform after a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send { to: ConnId, packet: Packet },
    /// Flush anything already queued for the connection, then close it.
    Close { conn: ConnId },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("missing password")]
    MissingCredential,
    #[error("invalid client id or password")]
    BadCredentials,
    #[error(transparent)]
    Register(#[from] RegisterError),
}

pub struct ServerState {
    connections: ConnectionRegistry,
    sessions: SessionRegistry,
    credentials: CredentialStore,
}

impl ServerState {
    pub fn new(credentials: CredentialStore) -> Self {
        Self {
            connections: ConnectionRegistry::new(),
            sessions: SessionRegistry::new(),
            credentials,
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn is_authenticated(&self, conn: ConnId) -> bool {
        self.connections.is_registered(conn)
    }

    pub fn dispatch(&mut self, conn: ConnId, packet: &Packet) -> Vec<Action> {
        let message = Message::from_packet(packet);
        let Some(client_id) = self.connections.get(conn).map(|c| c.client_id.clone()) else {
            return self.authenticate(conn, &packet.source, message);
        };

        match message {
            Message::Login { .. } => vec![reply(
                conn,
                Message::LoginNak {
                    reason: RegisterError::AlreadyRegistered.to_string(),
                },
            )],
            Message::NewSession { session } => vec![self.create_session(conn, &session)],
            Message::Join { session } => vec![self.join_session(conn, &session)],
            Message::LeaveSession => vec![self.leave_session(conn)],
            Message::Chat { text } => self.broadcast(conn, &client_id, text),
            Message::Query => vec![reply(
                conn,
                Message::QueryAck {
                    roster: self.roster(),
                },
            )],
            Message::Exit => {
                info!(conn, %client_id, "client exited");
                self.disconnect(conn);
                vec![Action::Close { conn }]
            }
            other => {
                warn!(conn, %client_id, kind = %other.kind(), "ignoring server-only packet type");
                Vec::new()
            }
        }
    }

    /// Removes the connection from its session and from the connection
    /// registry. Safe to call for connections that never logged in.
    pub fn disconnect(&mut self, conn: ConnId) -> Option<Connection> {
        if let Ok(departure) = self.sessions.leave(conn) {
            debug!(conn, session = %departure.session, closed = departure.closed, "left session on disconnect");
        }
        self.connections.unregister(conn)
    }

    pub fn roster(&self) -> Roster {
        Roster {
            clients: self.connections.list_all(),
            sessions: self.sessions.list_names(),
        }
    }

    fn authenticate(&mut self, conn: ConnId, client_id: &str, message: Message) -> Vec<Action> {
        let password = match message {
            Message::Login { password } => password,
            other => {
                warn!(conn, kind = %other.kind(), "first packet was not a login; dropping connection");
                return vec![Action::Close { conn }];
            }
        };

        match self.login(conn, client_id, &password) {
            Ok(()) => {
                info!(conn, %client_id, "client logged in");
                vec![reply(conn, Message::LoginAck)]
            }
            Err(err) => {
                warn!(conn, %client_id, error = %err, "login rejected");
                let reason = err.to_string();
                let response = match err {
                    LoginError::Register(RegisterError::DuplicateLogin(_)) => {
                        Message::LoginDuplicate { reason }
                    }
                    _ => Message::LoginNak { reason },
                };
                vec![reply(conn, response), Action::Close { conn }]
            }
        }
    }

    fn login(&mut self, conn: ConnId, client_id: &str, password: &str) -> Result<(), LoginError> {
        if password.is_empty() {
            return Err(LoginError::MissingCredential);
        }
        if !self.credentials.verify(client_id, password) {
            return Err(LoginError::BadCredentials);
        }
        self.connections.register(conn, client_id)?;
        Ok(())
    }

    fn create_session(&mut self, conn: ConnId, session: &str) -> Action {
        match self.sessions.create(session, conn) {
            Ok(()) => {
                info!(conn, %session, "session created");
                reply(
                    conn,
                    Message::NewSessionAck {
                        session: session.to_string(),
                    },
                )
            }
            Err(err) => reject(conn, err, |reason| Message::NewSessionNak { reason }),
        }
    }

    fn join_session(&mut self, conn: ConnId, session: &str) -> Action {
        match self.sessions.join(session, conn) {
            Ok(()) => {
                debug!(conn, %session, "joined session");
                reply(
                    conn,
                    Message::JoinAck {
                        session: session.to_string(),
                    },
                )
            }
            Err(err) => reject(conn, err, |reason| Message::JoinNak { reason }),
        }
    }

    fn leave_session(&mut self, conn: ConnId) -> Action {
        match self.sessions.leave(conn) {
            Ok(departure) => {
                if departure.closed {
                    info!(conn, session = %departure.session, "last member left; session closed");
                }
                reply(
                    conn,
                    Message::LeaveAck {
                        session: departure.session,
                    },
                )
            }
            Err(err) => reject(conn, err, |reason| Message::LeaveNak { reason }),
        }
    }

    fn broadcast(&self, conn: ConnId, client_id: &str, text: String) -> Vec<Action> {
        let Some(session) = self.sessions.session_of(conn) else {
            debug!(conn, %client_id, "dropping chat from client outside any session");
            return Vec::new();
        };
        // Also covers a chat reading "NoData", which the codec cannot tell
        // apart from a missing data field.
        if text.trim().is_empty() {
            debug!(conn, %client_id, "dropping empty chat");
            return Vec::new();
        }

        let packet = Message::Chat { text }.into_packet(client_id);
        self.sessions
            .members_of(session)
            .into_iter()
            .filter(|member| *member != conn)
            .map(|to| Action::Send {
                to,
                packet: packet.clone(),
            })
            .collect()
    }
}

fn reply(conn: ConnId, message: Message) -> Action {
    Action::Send {
        to: conn,
        packet: message.into_packet(SERVER_SOURCE),
    }
}

fn reject(conn: ConnId, err: SessionError, nak: impl FnOnce(String) -> Message) -> Action {
    debug!(conn, error = %err, "session request rejected");
    reply(conn, nak(err.to_string()))
}
