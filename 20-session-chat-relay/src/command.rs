//! Parsing of lines typed into the interactive client.
//!
//! Lines starting with `/` are commands; anything else is chat text for the
//! current session.

use anyhow::{Result, anyhow};

#[derive(Debug, PartialEq)]
pub enum ClientCommand {
    Login {
        client_id: String,
        password: String,
        server: String,
    },
    Logout,
    JoinSession {
        session: String,
    },
    LeaveSession,
    CreateSession {
        session: String,
    },
    List,
    Quit,
    Say {
        text: String,
    },
}

impl ClientCommand {
    /// Parses one line of user input.
    ///
    /// # Syntax
    /// - `/login <client_id> <password> <server-ip> <server-port>`
    /// - `/logout`
    /// - `/joinsession <name>` and `/createsession <name>` (the rest of the
    ///   line is the name, spaces included)
    /// - `/leavesession`
    /// - `/list`
    /// - `/quit`
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty command"));
        }

        if !trimmed.starts_with('/') {
            return Ok(ClientCommand::Say {
                text: line.trim_end_matches(['\r', '\n']).to_string(),
            });
        }

        let (command, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (trimmed, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        match (command.to_lowercase().as_str(), args.len()) {
            ("/login", 4) => Ok(ClientCommand::Login {
                client_id: args[0].to_string(),
                password: args[1].to_string(),
                server: format!("{}:{}", args[2], args[3]),
            }),
            ("/login", _) => Err(anyhow!(
                "usage: /login <client_id> <password> <server-ip> <server-port>"
            )),
            ("/logout", 0) => Ok(ClientCommand::Logout),
            ("/leavesession", 0) => Ok(ClientCommand::LeaveSession),
            ("/list", 0) => Ok(ClientCommand::List),
            ("/quit", 0) => Ok(ClientCommand::Quit),
            ("/joinsession", n) if n > 0 => Ok(ClientCommand::JoinSession {
                session: rest.to_string(),
            }),
            ("/createsession", n) if n > 0 => Ok(ClientCommand::CreateSession {
                session: rest.to_string(),
            }),
            ("/joinsession", _) => Err(anyhow!("usage: /joinsession <session>")),
            ("/createsession", _) => Err(anyhow!("usage: /createsession <session>")),
            ("/logout" | "/leavesession" | "/list" | "/quit", _) => {
                Err(anyhow!("{command} takes no arguments"))
            }
            _ => Err(anyhow!(
                "unknown command. Try: /login, /logout, /joinsession, /leavesession, /createsession, /list, /quit"
            )),
        }
    }
}
