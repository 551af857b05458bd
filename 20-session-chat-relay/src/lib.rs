//! Multi-user chat relay with named group sessions.
//!
//! Clients log in with a client id and password, create or join one session
//! at a time, and exchange text with the other members of that session. Each
//! module owns one concrete responsibility:
//!
//! - [`packet`] is the wire codec: the `"<type> <size> <source> <data>"`
//!   record, its escaping, and line framing helpers for async streams.
//! - [`message`] gives packets a typed shape and formats the QUERY roster.
//! - [`connections`] and [`sessions`] are the two registries.
//! - [`router`] owns all relay state and turns each packet into replies,
//!   broadcasts and closes.
//! - [`server`] is the event loop that accepts TCP connections and feeds
//!   frames to the router one at a time.
//! - [`credentials`] loads the id/password list the server checks logins
//!   against.
//! - [`cli`], [`command`] and [`client`] make up the binary: argument
//!   parsing, the interactive client's slash commands, and the client itself.
//!
//! Integration tests drive a real server over loopback TCP.

pub mod cli;
pub mod client;
pub mod command;
pub mod connections;
pub mod credentials;
pub mod message;
pub mod packet;
pub mod router;
pub mod server;
pub mod sessions;
