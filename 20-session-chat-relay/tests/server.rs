use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow};
use session_chat_relay::{
    credentials::CredentialStore,
    message::{Message, Roster},
    packet::{Packet, read_packet, write_frame, write_packet},
    server::Server,
};
use tokio::{
    io::BufReader,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        Self::start_with_login_timeout(Duration::from_secs(10)).await
    }

    async fn start_with_login_timeout(login_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let credentials = CredentialStore::from_pairs([
            ("alice", "pw1"),
            ("bob", "pw2"),
            ("carol", "pw3"),
            ("dave", "pw4"),
        ]);
        let server = Server::new(listener, credentials).with_login_timeout(login_timeout);

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

struct TestClient {
    client_id: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr, client_id: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            client_id: client_id.to_string(),
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn login(addr: SocketAddr, client_id: &str, password: &str) -> Result<Self> {
        let mut client = Self::connect(addr, client_id).await?;
        client
            .send(Message::Login {
                password: password.to_string(),
            })
            .await?;
        match client.recv().await? {
            Message::LoginAck => Ok(client),
            other => Err(anyhow!("{client_id} login answered with {other:?}")),
        }
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        let packet = message.into_packet(self.client_id.as_str());
        write_packet(&mut self.writer, &packet).await?;
        Ok(())
    }

    async fn recv_packet(&mut self) -> Result<Option<Packet>> {
        Ok(timeout(READ_TIMEOUT, read_packet(&mut self.reader)).await??)
    }

    async fn recv(&mut self) -> Result<Message> {
        let packet = self
            .recv_packet()
            .await?
            .ok_or_else(|| anyhow!("{} was disconnected", self.client_id))?;
        Ok(Message::from_packet(&packet))
    }

    /// Sends QUERY and returns the next message received, whatever it is.
    async fn recv_after_query(&mut self) -> Result<Message> {
        self.send(Message::Query).await?;
        self.recv().await
    }

    async fn roster(&mut self) -> Result<Roster> {
        self.send(Message::Query).await?;
        match self.recv().await? {
            Message::QueryAck { roster } => Ok(roster),
            other => Err(anyhow!("expected roster, got {other:?}")),
        }
    }
}

#[tokio::test]
async fn duplicate_login_is_rejected_and_first_connection_survives() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = TestClient::login(server.addr, "alice", "pw1").await?;

    let mut impostor = TestClient::connect(server.addr, "alice").await?;
    impostor
        .send(Message::Login {
            password: "pw1".into(),
        })
        .await?;
    assert!(matches!(
        impostor.recv().await?,
        Message::LoginDuplicate { .. }
    ));
    assert_eq!(impostor.recv_packet().await?, None);

    let roster = alice.roster().await?;
    assert_eq!(roster.clients, vec!["alice"]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn bad_password_is_refused_and_closed() -> Result<()> {
    let server = TestServer::start().await?;

    let mut client = TestClient::connect(server.addr, "bob").await?;
    client
        .send(Message::Login {
            password: "nope".into(),
        })
        .await?;
    assert!(matches!(client.recv().await?, Message::LoginNak { .. }));
    assert_eq!(client.recv_packet().await?, None);

    let mut retry = TestClient::login(server.addr, "bob", "pw2").await?;
    assert_eq!(retry.roster().await?.clients, vec!["bob"]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn first_packet_other_than_login_drops_connection() -> Result<()> {
    let server = TestServer::start().await?;

    let mut client = TestClient::connect(server.addr, "carol").await?;
    client.send(Message::Query).await?;
    assert_eq!(client.recv_packet().await?, None);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn session_chat_reaches_members_but_not_sender() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = TestClient::login(server.addr, "alice", "pw1").await?;
    let mut bob = TestClient::login(server.addr, "bob", "pw2").await?;
    let mut carol = TestClient::login(server.addr, "carol", "pw3").await?;

    alice
        .send(Message::NewSession {
            session: "study".into(),
        })
        .await?;
    assert_eq!(
        alice.recv().await?,
        Message::NewSessionAck {
            session: "study".into()
        }
    );

    bob.send(Message::Join {
        session: "study".into(),
    })
    .await?;
    assert_eq!(
        bob.recv().await?,
        Message::JoinAck {
            session: "study".into()
        }
    );

    alice
        .send(Message::Chat {
            text: "hi bob, welcome".into(),
        })
        .await?;
    let packet = bob
        .recv_packet()
        .await?
        .ok_or_else(|| anyhow!("bob was disconnected"))?;
    assert_eq!(packet.source, "alice");
    assert_eq!(
        Message::from_packet(&packet),
        Message::Chat {
            text: "hi bob, welcome".into()
        }
    );

    // Anything queued for alice or carol would arrive before these replies.
    assert!(matches!(alice.recv_after_query().await?, Message::QueryAck { .. }));
    assert!(matches!(carol.recv_after_query().await?, Message::QueryAck { .. }));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn last_member_leaving_removes_session() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = TestClient::login(server.addr, "alice", "pw1").await?;
    let mut bob = TestClient::login(server.addr, "bob", "pw2").await?;

    alice
        .send(Message::NewSession {
            session: "study".into(),
        })
        .await?;
    alice.recv().await?;
    bob.send(Message::Join {
        session: "study".into(),
    })
    .await?;
    bob.recv().await?;

    bob.send(Message::LeaveSession).await?;
    assert_eq!(
        bob.recv().await?,
        Message::LeaveAck {
            session: "study".into()
        }
    );
    assert_eq!(alice.roster().await?.sessions, vec!["study"]);

    alice.send(Message::LeaveSession).await?;
    assert_eq!(
        alice.recv().await?,
        Message::LeaveAck {
            session: "study".into()
        }
    );
    let roster = alice.roster().await?;
    assert!(roster.sessions.is_empty());
    assert_eq!(roster.clients, vec!["alice", "bob"]);

    bob.send(Message::LeaveSession).await?;
    assert!(matches!(bob.recv().await?, Message::LeaveNak { .. }));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn joining_unknown_session_is_refused() -> Result<()> {
    let server = TestServer::start().await?;
    let mut carol = TestClient::login(server.addr, "carol", "pw3").await?;

    carol
        .send(Message::Join {
            session: "nonexistent".into(),
        })
        .await?;
    match carol.recv().await? {
        Message::JoinNak { reason } => assert!(reason.contains("not found"), "{reason}"),
        other => panic!("expected JN_NAK, got {other:?}"),
    }

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn abrupt_disconnect_leaves_session_intact() -> Result<()> {
    let server = TestServer::start().await?;
    let mut carol = TestClient::login(server.addr, "carol", "pw3").await?;
    let mut bob = TestClient::login(server.addr, "bob", "pw2").await?;
    let mut dave = TestClient::login(server.addr, "dave", "pw4").await?;

    carol
        .send(Message::NewSession {
            session: "team".into(),
        })
        .await?;
    carol.recv().await?;
    for member in [&mut bob, &mut dave] {
        member
            .send(Message::Join {
                session: "team".into(),
            })
            .await?;
        member.recv().await?;
    }

    drop(dave);

    let mut roster = carol.roster().await?;
    let mut attempts = 0;
    while roster.clients.contains(&"dave".to_string()) {
        attempts += 1;
        if attempts > 40 {
            return Err(anyhow!("dave never left the roster"));
        }
        sleep(Duration::from_millis(25)).await;
        roster = carol.roster().await?;
    }
    assert_eq!(roster.clients, vec!["bob", "carol"]);
    assert_eq!(roster.sessions, vec!["team"]);

    carol
        .send(Message::Chat {
            text: "still here?".into(),
        })
        .await?;
    let packet = bob
        .recv_packet()
        .await?
        .ok_or_else(|| anyhow!("bob was disconnected"))?;
    assert_eq!(packet.source, "carol");
    assert_eq!(packet.data, "still here?");

    // The id is free again once the old connection is gone.
    let mut dave = TestClient::login(server.addr, "dave", "pw4").await?;
    assert_eq!(dave.roster().await?.sessions, vec!["team"]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_packets_are_dropped_without_disconnect() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = TestClient::login(server.addr, "alice", "pw1").await?;

    write_frame(&mut alice.writer, "not a packet").await?;
    write_frame(&mut alice.writer, "99 0 alice").await?;
    assert_eq!(alice.roster().await?.clients, vec!["alice"]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn exit_closes_connection_and_frees_id() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = TestClient::login(server.addr, "alice", "pw1").await?;
    let mut bob = TestClient::login(server.addr, "bob", "pw2").await?;

    alice
        .send(Message::NewSession {
            session: "solo".into(),
        })
        .await?;
    alice.recv().await?;
    alice.send(Message::Exit).await?;
    assert_eq!(alice.recv_packet().await?, None);

    let roster = bob.roster().await?;
    assert_eq!(roster.clients, vec!["bob"]);
    assert!(roster.sessions.is_empty());

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn silent_connection_is_dropped_after_login_deadline() -> Result<()> {
    let server = TestServer::start_with_login_timeout(Duration::from_millis(200)).await?;
    let mut alice = TestClient::login(server.addr, "alice", "pw1").await?;

    let mut silent = TestClient::connect(server.addr, "bob").await?;
    assert_eq!(silent.recv_packet().await?, None);

    // The deadline only applies before login.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.roster().await?.clients, vec!["alice"]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn member_that_never_reads_is_disconnected() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = TestClient::login(server.addr, "alice", "pw1").await?;
    let mut bob = TestClient::login(server.addr, "bob", "pw2").await?;

    alice
        .send(Message::NewSession {
            session: "team".into(),
        })
        .await?;
    alice.recv().await?;
    bob.send(Message::Join {
        session: "team".into(),
    })
    .await?;
    bob.recv().await?;

    // Bob stops reading; alice keeps talking until the server gives up on him.
    let text = "x".repeat(1200);
    let mut dropped = false;
    for _ in 0..100 {
        for _ in 0..200 {
            alice.send(Message::Chat { text: text.clone() }).await?;
        }
        let roster = alice.roster().await?;
        if !roster.clients.contains(&"bob".to_string()) {
            assert_eq!(roster.sessions, vec!["team"]);
            dropped = true;
            break;
        }
    }
    assert!(dropped, "bob was never disconnected");

    drop(bob);
    server.stop().await;
    Ok(())
}
