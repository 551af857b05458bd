use std::{collections::HashMap, future::Future, io, net::SocketAddr, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc::{self, error::TrySendError},
    task::AbortHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    connections::ConnId,
    credentials::CredentialStore,
    packet::{Packet, read_frame, write_frame},
    router::{Action, ServerState},
};

// Readers wait once this many frames are queued for the event loop.
const EVENT_BUFFER: usize = 256;

// A client with this many records still unsent is too slow and is dropped.
const OUTBOX_BUFFER: usize = 128;

/// How long a new connection may take to deliver its LOGIN packet.
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The relay's event loop.
///
/// Per-connection tasks only move bytes. Every frame they read is handed to
/// the single loop in [`Server::run_until`], which owns [`ServerState`], so
/// registry changes happen one packet at a time in arrival order.
pub struct Server {
    listener: TcpListener,
    state: ServerState,
    login_timeout: Duration,
}

impl Server {
    pub fn new(listener: TcpListener, credentials: CredentialStore) -> Self {
        Self {
            listener,
            state: ServerState::new(credentials),
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
        }
    }

    pub fn with_login_timeout(mut self, login_timeout: Duration) -> Self {
        self.login_timeout = login_timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            mut state,
            login_timeout,
        } = self;
        let (events_tx, mut events) = mpsc::channel(EVENT_BUFFER);
        let mut links = Links::default();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&mut state, &mut links);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &mut links, &events_tx, login_timeout);
                }
                Some(event) = events.recv() => {
                    handle_event(event, &mut state, &mut links);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[derive(Debug)]
enum Event {
    Frame {
        conn: ConnId,
        record: String,
    },
    Closed {
        conn: ConnId,
        error: Option<io::Error>,
    },
}

struct Link {
    peer: SocketAddr,
    outbox: mpsc::Sender<String>,
    reader: AbortHandle,
    writer: AbortHandle,
}

#[derive(Default)]
struct Links {
    open: HashMap<ConnId, Link>,
    last_id: ConnId,
}

impl Links {
    fn next_id(&mut self) -> ConnId {
        self.last_id += 1;
        self.last_id
    }
}

fn handle_shutdown(state: &mut ServerState, links: &mut Links) {
    info!(connections = links.open.len(), "server shutting down");
    let open: Vec<ConnId> = links.open.keys().copied().collect();
    for conn in open {
        close_connection(conn, state, links);
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    links: &mut Links,
    events: &mpsc::Sender<Event>,
    login_timeout: Duration,
) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, links, events, login_timeout),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    links: &mut Links,
    events: &mpsc::Sender<Event>,
    login_timeout: Duration,
) {
    let conn = links.next_id();
    let (reader, writer) = stream.into_split();
    let (outbox, inbox) = mpsc::channel(OUTBOX_BUFFER);

    let reader = tokio::spawn(read_frames(
        conn,
        BufReader::new(reader),
        events.clone(),
        login_timeout,
    ));
    let writer = tokio::spawn(write_frames(conn, writer, inbox, events.clone()));

    links.open.insert(
        conn,
        Link {
            peer,
            outbox,
            reader: reader.abort_handle(),
            writer: writer.abort_handle(),
        },
    );
    debug!(conn, %peer, "connection accepted");
}

/// Forwards frames to the event loop. The first frame is the login attempt
/// and must arrive within `login_timeout`.
async fn read_frames(
    conn: ConnId,
    mut reader: BufReader<OwnedReadHalf>,
    events: mpsc::Sender<Event>,
    login_timeout: Duration,
) {
    let mut deadline = Some(login_timeout);
    loop {
        let result = match deadline.take() {
            Some(limit) => timeout(limit, read_frame(&mut reader))
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no login before the deadline",
                    ))
                }),
            None => read_frame(&mut reader).await,
        };
        let event = match result {
            Ok(Some(record)) => Event::Frame { conn, record },
            Ok(None) => Event::Closed { conn, error: None },
            Err(err) => Event::Closed {
                conn,
                error: Some(err),
            },
        };
        let closed = matches!(event, Event::Closed { .. });
        if events.send(event).await.is_err() || closed {
            break;
        }
    }
}

async fn write_frames(
    conn: ConnId,
    mut writer: OwnedWriteHalf,
    mut inbox: mpsc::Receiver<String>,
    events: mpsc::Sender<Event>,
) {
    // Runs until the event loop drops the outbox, so queued replies are
    // flushed before the socket is shut down.
    while let Some(record) = inbox.recv().await {
        if let Err(err) = write_frame(&mut writer, &record).await {
            let _ = events
                .send(Event::Closed {
                    conn,
                    error: Some(err),
                })
                .await;
            return;
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(conn, error = ?err, "failed to shut down writer cleanly");
    }
}

fn handle_event(event: Event, state: &mut ServerState, links: &mut Links) {
    match event {
        Event::Frame { conn, record } => handle_frame(conn, &record, state, links),
        Event::Closed { conn, error } => {
            match error {
                Some(err) => warn!(conn, error = ?err, "connection failed"),
                None => debug!(conn, "peer closed connection"),
            }
            close_connection(conn, state, links);
        }
    }
}

fn handle_frame(conn: ConnId, record: &str, state: &mut ServerState, links: &mut Links) {
    if !links.open.contains_key(&conn) {
        debug!(conn, "ignoring frame from closed connection");
        return;
    }

    let packet = match Packet::decode(record) {
        Ok(packet) => packet,
        Err(err) => {
            warn!(conn, error = %err, "dropping undecodable packet");
            if !state.is_authenticated(conn) {
                close_connection(conn, state, links);
            }
            return;
        }
    };

    debug!(conn, kind = %packet.kind, source = %packet.source, "packet received");
    let actions = state.dispatch(conn, &packet);
    apply_actions(actions, state, links);
}

fn apply_actions(actions: Vec<Action>, state: &mut ServerState, links: &mut Links) {
    for action in actions {
        match action {
            Action::Send { to, packet } => deliver(to, &packet, state, links),
            Action::Close { conn } => close_connection(conn, state, links),
        }
    }
}

fn deliver(to: ConnId, packet: &Packet, state: &mut ServerState, links: &mut Links) {
    let Some(link) = links.open.get(&to) else {
        debug!(conn = to, "dropping packet for closed connection");
        return;
    };

    let record = match packet.encode() {
        Ok(record) => record,
        Err(err) => {
            warn!(conn = to, kind = %packet.kind, error = %err, "dropping unencodable packet");
            return;
        }
    };

    match link.outbox.try_send(record) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(conn = to, peer = %link.peer, "outbound queue full; dropping slow client");
            // The peer is not reading, so a flush would never finish.
            link.writer.abort();
            close_connection(to, state, links);
        }
        Err(TrySendError::Closed(_)) => debug!(conn = to, "writer already stopped"),
    }
}

fn close_connection(conn: ConnId, state: &mut ServerState, links: &mut Links) {
    let Some(link) = links.open.remove(&conn) else {
        return;
    };
    link.reader.abort();

    match state.disconnect(conn) {
        Some(connection) => {
            info!(conn, peer = %link.peer, client_id = %connection.client_id, "client disconnected");
        }
        None => debug!(conn, peer = %link.peer, "connection closed"),
    }
}
