//! Typed view over protocol packets.
//!
//! [`Message`] carries only the payload each packet type actually uses; the
//! conversions to and from [`Packet`] are the single place that knows which
//! data field means what.

use std::fmt;

use crate::packet::{MAX_SERVER_DATA, Packet, PacketType, escaped_len};

const CLIENTS_LABEL: &str = "Clients Online:";
const SESSIONS_LABEL: &str = "Available Sessions:";
/// Appended to a roster section whose remaining names did not fit.
pub const TRUNCATED_MARKER: &str = "...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Login { password: String },
    LoginAck,
    LoginNak { reason: String },
    LoginDuplicate { reason: String },
    Exit,
    Join { session: String },
    JoinAck { session: String },
    JoinNak { reason: String },
    LeaveSession,
    LeaveAck { session: String },
    LeaveNak { reason: String },
    NewSession { session: String },
    NewSessionAck { session: String },
    NewSessionNak { reason: String },
    Chat { text: String },
    Query,
    QueryAck { roster: Roster },
}

impl Message {
    pub fn kind(&self) -> PacketType {
        match self {
            Message::Login { .. } => PacketType::Login,
            Message::LoginAck => PacketType::LoAck,
            Message::LoginNak { .. } => PacketType::LoNak,
            Message::LoginDuplicate { .. } => PacketType::LoDup,
            Message::Exit => PacketType::Exit,
            Message::Join { .. } => PacketType::Join,
            Message::JoinAck { .. } => PacketType::JnAck,
            Message::JoinNak { .. } => PacketType::JnNak,
            Message::LeaveSession => PacketType::LeaveSession,
            Message::LeaveAck { .. } => PacketType::LsAck,
            Message::LeaveNak { .. } => PacketType::LsNak,
            Message::NewSession { .. } => PacketType::NewSession,
            Message::NewSessionAck { .. } => PacketType::NsAck,
            Message::NewSessionNak { .. } => PacketType::NsNak,
            Message::Chat { .. } => PacketType::Message,
            Message::Query => PacketType::Query,
            Message::QueryAck { .. } => PacketType::QuAck,
        }
    }

    /// Interprets a decoded packet. A missing payload becomes an empty string.
    pub fn from_packet(packet: &Packet) -> Self {
        let data = packet.payload().unwrap_or_default().to_string();
        match packet.kind {
            PacketType::Login => Message::Login {
                password: data.trim_end_matches('\0').to_string(),
            },
            PacketType::LoAck => Message::LoginAck,
            PacketType::LoNak => Message::LoginNak { reason: data },
            PacketType::LoDup => Message::LoginDuplicate { reason: data },
            PacketType::Exit => Message::Exit,
            PacketType::Join => Message::Join { session: data },
            PacketType::JnAck => Message::JoinAck { session: data },
            PacketType::JnNak => Message::JoinNak { reason: data },
            PacketType::LeaveSession => Message::LeaveSession,
            PacketType::LsAck => Message::LeaveAck { session: data },
            PacketType::LsNak => Message::LeaveNak { reason: data },
            PacketType::NewSession => Message::NewSession { session: data },
            PacketType::NsAck => Message::NewSessionAck { session: data },
            PacketType::NsNak => Message::NewSessionNak { reason: data },
            // A chat that literally reads "NoData" arrives as empty text.
            PacketType::Message => Message::Chat { text: data },
            PacketType::Query => Message::Query,
            PacketType::QuAck => Message::QueryAck {
                roster: Roster::parse(&data),
            },
        }
    }

    pub fn into_packet(self, source: impl Into<String>) -> Packet {
        let kind = self.kind();
        let data = match self {
            Message::LoginAck | Message::Exit | Message::LeaveSession | Message::Query => {
                String::new()
            }
            Message::Login { password } => password,
            Message::LoginNak { reason }
            | Message::LoginDuplicate { reason }
            | Message::JoinNak { reason }
            | Message::LeaveNak { reason }
            | Message::NewSessionNak { reason } => reason,
            Message::Join { session }
            | Message::JoinAck { session }
            | Message::LeaveAck { session }
            | Message::NewSession { session }
            | Message::NewSessionAck { session } => session,
            Message::Chat { text } => text,
            Message::QueryAck { roster } => roster.render_within(MAX_SERVER_DATA),
        };
        Packet::new(kind, source, data)
    }
}

/// Online client ids and open session names, as returned by QUERY.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub clients: Vec<String>,
    pub sessions: Vec<String>,
}

impl Roster {
    /// Parses the labelled roster text. Names are whitespace-separated, so a
    /// session name containing spaces comes back split into several entries.
    pub fn parse(text: &str) -> Self {
        let (clients, sessions) = match text.find(SESSIONS_LABEL) {
            Some(index) => (&text[..index], &text[index + SESSIONS_LABEL.len()..]),
            None => (text, ""),
        };
        let clients = clients.trim_start().trim_start_matches(CLIENTS_LABEL);

        Self {
            clients: clients.split_whitespace().map(str::to_string).collect(),
            sessions: sessions.split_whitespace().map(str::to_string).collect(),
        }
    }
}

impl Roster {
    /// Renders the roster in at most `limit` escaped bytes. Sections that run
    /// out of room end with [`TRUNCATED_MARKER`] instead of their remaining
    /// names.
    pub fn render_within(&self, limit: usize) -> String {
        let full = self.to_string();
        if escaped_len(&full) <= limit {
            return full;
        }

        let reserved = CLIENTS_LABEL.len()
            + 1
            + SESSIONS_LABEL.len()
            + 2 * (1 + TRUNCATED_MARKER.len());
        let mut budget = limit.saturating_sub(reserved);

        let mut text = String::from(CLIENTS_LABEL);
        push_names_within(&mut text, &self.clients, &mut budget);
        text.push(' ');
        text.push_str(SESSIONS_LABEL);
        push_names_within(&mut text, &self.sessions, &mut budget);
        text
    }
}

fn push_names_within(text: &mut String, names: &[String], budget: &mut usize) {
    for name in names {
        let cost = 1 + escaped_len(name);
        if cost > *budget {
            text.push(' ');
            text.push_str(TRUNCATED_MARKER);
            return;
        }
        *budget -= cost;
        text.push(' ');
        text.push_str(name);
    }
}

impl fmt::Display for Roster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(CLIENTS_LABEL)?;
        for client in &self.clients {
            write!(f, " {client}")?;
        }
        write!(f, " {SESSIONS_LABEL}")?;
        for session in &self.sessions {
            write!(f, " {session}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{NO_DATA, SERVER_SOURCE};

    #[test]
    fn chat_keeps_spaces_through_the_wire() {
        let packet = Message::Chat {
            text: "hi there, bob".into(),
        }
        .into_packet("alice");
        let decoded = Packet::decode(&packet.encode().expect("encode")).expect("decode");

        assert_eq!(decoded.source, "alice");
        assert_eq!(
            Message::from_packet(&decoded),
            Message::Chat {
                text: "hi there, bob".into()
            }
        );
    }

    #[test]
    fn missing_payload_maps_to_empty_field() {
        let packet = Packet::new(PacketType::NewSession, "alice", NO_DATA);
        assert_eq!(
            Message::from_packet(&packet),
            Message::NewSession {
                session: String::new()
            }
        );
    }

    #[test]
    fn login_password_ignores_trailing_nul() {
        let packet = Packet::new(PacketType::Login, "alice", "pw1\0");
        assert_eq!(
            Message::from_packet(&packet),
            Message::Login {
                password: "pw1".into()
            }
        );
    }

    #[test]
    fn roster_uses_labelled_sections() {
        let roster = Roster {
            clients: vec!["alice".into(), "bob".into()],
            sessions: vec!["study".into()],
        };
        let text = roster.to_string();
        assert_eq!(
            text,
            "Clients Online: alice bob Available Sessions: study"
        );
        assert_eq!(Roster::parse(&text), roster);
    }

    #[test]
    fn empty_roster_parses_back_empty() {
        let text = Roster::default().to_string();
        assert_eq!(text, "Clients Online: Available Sessions:");
        assert_eq!(Roster::parse(&text), Roster::default());
    }

    #[test]
    fn oversized_roster_is_truncated_to_fit_a_reply() {
        let roster = Roster {
            clients: (0..140).map(|n| format!("client{n:04}")).collect(),
            sessions: vec!["study".into()],
        };
        assert!(roster.to_string().len() > MAX_SERVER_DATA);

        let packet = Message::QueryAck {
            roster: roster.clone(),
        }
        .into_packet(SERVER_SOURCE);
        let record = packet.encode().expect("roster reply fits");
        assert!(record.len() <= crate::packet::MAX_PACKET_SIZE);

        let parsed = Roster::parse(&packet.data);
        assert_eq!(parsed.clients.last().map(String::as_str), Some(TRUNCATED_MARKER));
        assert_eq!(parsed.clients[0], "client0000");
        assert!(parsed.clients.len() < roster.clients.len());
        assert!(packet.data.contains(SESSIONS_LABEL));
    }

    #[test]
    fn small_roster_is_rendered_whole() {
        let roster = Roster {
            clients: vec!["alice".into()],
            sessions: vec!["study".into()],
        };
        assert_eq!(roster.render_within(MAX_SERVER_DATA), roster.to_string());
    }

    #[test]
    fn chat_reading_the_sentinel_arrives_empty() {
        let packet = Message::Chat {
            text: NO_DATA.into(),
        }
        .into_packet("alice");
        let decoded = Packet::decode(&packet.encode().expect("encode")).expect("decode");
        assert_eq!(
            Message::from_packet(&decoded),
            Message::Chat {
                text: String::new()
            }
        );
    }

    #[test]
    fn acks_without_payload_encode_bare() {
        let packet = Message::LoginAck.into_packet(SERVER_SOURCE);
        assert_eq!(packet.encode().expect("encode"), "1 0 SERVER");
    }
}
