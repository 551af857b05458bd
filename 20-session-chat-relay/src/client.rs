use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    command::ClientCommand,
    message::Message,
    packet::{Packet, read_packet, write_packet},
};

/// An authenticated connection to the relay.
struct ServerLink {
    client_id: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ServerLink {
    async fn send(&mut self, message: Message) -> io::Result<()> {
        let packet = message.into_packet(self.client_id.as_str());
        write_packet(&mut self.writer, &packet).await
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let login_timeout = Duration::from_secs(args.login_timeout);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut link: Option<ServerLink> = None;

    run_client_loop(&mut stdin, &mut link, login_timeout).await?;
    if let Some(link) = link.as_mut() {
        logout(link).await;
    }

    Ok(())
}

async fn run_client_loop(
    stdin: &mut Lines<BufReader<Stdin>>,
    link: &mut Option<ServerLink>,
    login_timeout: Duration,
) -> Result<()> {
    loop {
        select! {
            server_message = next_server_packet(link) => {
                handle_server_message(server_message, link).await?;
            }
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_stdin_input(&line, link, login_timeout).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn next_server_packet(link: &mut Option<ServerLink>) -> io::Result<Option<Packet>> {
    match link {
        Some(link) => read_packet(&mut link.reader).await,
        None => std::future::pending().await,
    }
}

async fn handle_server_message(
    message: io::Result<Option<Packet>>,
    link: &mut Option<ServerLink>,
) -> Result<()> {
    match message {
        Ok(Some(packet)) => render_server_message(&packet).await?,
        Ok(None) => {
            write_stdout("*** server closed the connection").await?;
            *link = None;
        }
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            warn!(error = ?err, "ignoring undecodable packet from server");
        }
        Err(err) => {
            write_stderr(&format!("!!! connection lost: {err}")).await?;
            *link = None;
        }
    }
    Ok(())
}

async fn handle_stdin_input(
    line: &str,
    link: &mut Option<ServerLink>,
    login_timeout: Duration,
) -> Result<bool> {
    if line.trim().is_empty() {
        return Ok(true);
    }

    let command = match ClientCommand::parse(line) {
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            return Ok(true);
        }
    };

    match command {
        ClientCommand::Login {
            client_id,
            password,
            server,
        } => {
            if link.is_some() {
                write_stderr("!!! already logged in").await?;
                return Ok(true);
            }
            match login(&client_id, &password, &server, login_timeout).await {
                Ok(established) => {
                    write_stdout(&format!("*** logged in as {client_id}")).await?;
                    *link = Some(established);
                }
                Err(err) => write_stderr(&format!("!!! login failed: {err:#}")).await?,
            }
            Ok(true)
        }
        ClientCommand::Logout => {
            match link.take() {
                Some(mut established) => {
                    logout(&mut established).await;
                    write_stdout("*** logged out").await?;
                }
                None => write_stderr("!!! please log in first").await?,
            }
            Ok(true)
        }
        ClientCommand::Quit => {
            if let Some(mut established) = link.take() {
                logout(&mut established).await;
            }
            write_stdout("*** leaving chat").await?;
            Ok(false)
        }
        other => {
            let Some(established) = link.as_mut() else {
                write_stderr("!!! please log in first").await?;
                return Ok(true);
            };
            let message = match other {
                ClientCommand::JoinSession { session } => Message::Join { session },
                ClientCommand::CreateSession { session } => Message::NewSession { session },
                ClientCommand::LeaveSession => Message::LeaveSession,
                ClientCommand::List => Message::Query,
                ClientCommand::Say { text } => Message::Chat { text },
                ClientCommand::Login { .. } | ClientCommand::Logout | ClientCommand::Quit => {
                    return Ok(true);
                }
            };
            let sent = established.send(message).await;
            if let Err(err) = sent {
                write_stderr(&format!("!!! failed to send: {err}")).await?;
                *link = None;
            }
            Ok(true)
        }
    }
}

async fn login(
    client_id: &str,
    password: &str,
    server: &str,
    login_timeout: Duration,
) -> Result<ServerLink> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    info!("connected to {}", server);

    let (reader, writer) = stream.into_split();
    let mut link = ServerLink {
        client_id: client_id.to_string(),
        reader: BufReader::new(reader),
        writer,
    };
    link.send(Message::Login {
        password: password.to_string(),
    })
    .await?;

    let response = timeout(login_timeout, read_packet(&mut link.reader))
        .await
        .context("timed out waiting for login response")??
        .context("server closed the connection during login")?;

    match Message::from_packet(&response) {
        Message::LoginAck => Ok(link),
        Message::LoginNak { reason } | Message::LoginDuplicate { reason } => Err(anyhow!(reason)),
        other => Err(anyhow!("unexpected {} reply to login", other.kind())),
    }
}

async fn logout(link: &mut ServerLink) {
    if let Err(error) = link.send(Message::Exit).await {
        warn!(?error, "failed to send exit");
    }
    if let Err(error) = link.writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render_server_message(packet: &Packet) -> io::Result<()> {
    match Message::from_packet(packet) {
        Message::NewSessionAck { session } => {
            write_stdout(&format!("*** created session {session}")).await
        }
        Message::JoinAck { session } => write_stdout(&format!("*** joined session {session}")).await,
        Message::LeaveAck { session } => write_stdout(&format!("*** left session {session}")).await,
        Message::QueryAck { roster } => {
            write_stdout(&format!(
                "*** clients online: {}",
                roster.clients.join(", ")
            ))
            .await?;
            write_stdout(&format!(
                "*** available sessions: {}",
                roster.sessions.join(", ")
            ))
            .await
        }
        Message::Chat { text } => write_stdout(&format!("<{}> {text}", packet.source)).await,
        Message::LoginNak { reason }
        | Message::LoginDuplicate { reason }
        | Message::JoinNak { reason }
        | Message::LeaveNak { reason }
        | Message::NewSessionNak { reason } => write_stderr(&format!("!!! {reason}")).await,
        other => {
            warn!(kind = %other.kind(), "unexpected packet from server");
            Ok(())
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
