use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections.
    Server(ServerArgs),
    /// Start an interactive client; connect with /login.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    /// JSON file mapping client ids to passwords.
    #[arg(long)]
    pub credentials: PathBuf,

    /// Seconds a new connection has to send its login before it is dropped.
    #[arg(long, default_value_t = 10)]
    pub login_timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Seconds to wait for the server to answer a login.
    #[arg(long, default_value_t = 5)]
    pub login_timeout: u64,
}
