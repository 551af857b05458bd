use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use session_chat_relay::{
    cli::{Cli, Command},
    client,
    credentials::CredentialStore,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let credentials = CredentialStore::load(&args.credentials)?;
            info!(clients = credentials.len(), "loaded credentials");
            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let server = Server::new(listener, credentials)
                .with_login_timeout(Duration::from_secs(args.login_timeout));
            let addr = server.local_addr()?;
            info!("server listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
