use anyhow::Result;
use hermes_service::{
    CheckAliveResponseMode, DownstreamSettings, ErrorKind, LaneObserver, PeerInfo, SessionError,
    SessionId, State, TraceKind, UpstreamSettings, downstream::Downstream, upstream::Upstream,
};

use codec::message::{
    BoardAvailable, CheckAlive, CheckAliveType, MachineReady, Message, NotificationCode,
    ServiceDescription, StartTransport, TransferState, TransportFinished,
};

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::{sleep, timeout},
};

#[derive(Debug)]
enum Event {
    Connected(SessionId, State),
    Message(SessionId, State, Message),
    State(SessionId, State),
    Disconnected(SessionId, Option<SessionError>),
}

struct Recorder(mpsc::UnboundedSender<Event>);

impl LaneObserver for Recorder {
    fn on_connected(&self, session: SessionId, state: State, _: &PeerInfo) {
        let _ = self.0.send(Event::Connected(session, state));
    }

    fn on_message(&self, session: SessionId, state: State, message: &Message) {
        let _ = self.0.send(Event::Message(session, state, message.clone()));
    }

    fn on_state(&self, session: SessionId, state: State) {
        let _ = self.0.send(Event::State(session, state));
    }

    fn on_disconnected(&self, session: SessionId, error: Option<SessionError>) {
        let _ = self.0.send(Event::Disconnected(session, error));
    }

    fn on_trace(&self, _: SessionId, _: TraceKind, _: &str) {}
}

fn recorder() -> (Recorder, mpsc::UnboundedReceiver<Event>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Recorder(sender), receiver)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Result<Event> {
    timeout(Duration::from_secs(5), events.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("event stream ended"))
}

async fn wait_connected(events: &mut mpsc::UnboundedReceiver<Event>) -> Result<SessionId> {
    loop {
        if let Event::Connected(session, _) = next_event(events).await? {
            return Ok(session);
        }
    }
}

async fn wait_state(events: &mut mpsc::UnboundedReceiver<Event>, expected: State) -> Result<()> {
    loop {
        if let Event::State(_, state) = next_event(events).await?
            && state == expected
        {
            return Ok(());
        }
    }
}

async fn wait_message(
    events: &mut mpsc::UnboundedReceiver<Event>,
    name: &str,
) -> Result<Message> {
    loop {
        if let Event::Message(_, _, message) = next_event(events).await?
            && message.name() == name
        {
            return Ok(message);
        }
    }
}

async fn wait_disconnected(
    events: &mut mpsc::UnboundedReceiver<Event>,
) -> Result<Option<SessionError>> {
    loop {
        if let Event::Disconnected(_, error) = next_event(events).await? {
            return Ok(error);
        }
    }
}

fn downstream_settings(port: u16) -> DownstreamSettings {
    let mut settings = DownstreamSettings::new("SENDER", 0);
    settings.port = Some(port);
    settings.check_alive_period_secs = 0.0;
    settings
}

fn upstream_settings(port: u16) -> UpstreamSettings {
    let mut settings = UpstreamSettings::new("RECEIVER", 0, "127.0.0.1");
    settings.port = Some(port);
    settings.check_alive_period_secs = 0.0;
    settings.reconnect_wait_secs = 0.2;
    settings
}

/// A raw scripted peer standing in for the other machine.
struct RawPeer {
    stream: TcpStream,
    decoder: codec::Decoder,
}

impl RawPeer {
    async fn connect(port: u16) -> Result<Self> {
        // The endpoint binds asynchronously after enable.
        for _ in 0..50 {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
                return Ok(Self {
                    stream,
                    decoder: codec::Decoder::default(),
                });
            }

            sleep(Duration::from_millis(50)).await;
        }

        anyhow::bail!("endpoint never started listening on {port}");
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        let document = codec::serialize(message)?;
        self.stream.write_all(document.as_bytes()).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message> {
        let mut scratch = [0u8; 1024];

        loop {
            if let Some(frame) = self.decoder.try_next()? {
                return Ok(frame.message);
            }

            let size = timeout(Duration::from_secs(5), self.stream.read(&mut scratch)).await??;
            if size == 0 {
                anyhow::bail!("peer closed the stream");
            }

            self.decoder.extend(&scratch[..size]);
        }
    }

    async fn receive_named(&mut self, name: &str) -> Result<Message> {
        loop {
            let message = self.receive().await?;
            if message.name() == name {
                return Ok(message);
            }
        }
    }

    /// Reads until the peer closes the stream.
    async fn expect_close(&mut self) -> Result<()> {
        let mut scratch = [0u8; 1024];

        loop {
            let size = timeout(Duration::from_secs(5), self.stream.read(&mut scratch)).await??;
            if size == 0 {
                return Ok(());
            }
        }
    }
}

#[tokio::test]
async fn test_handover_happy_path() -> Result<()> {
    let port = 51411;
    let (down_observer, mut down) = recorder();
    let (up_observer, mut up) = recorder();

    let downstream = Downstream::spawn(down_observer);
    downstream.enable(downstream_settings(port));

    let upstream = Upstream::spawn(up_observer);
    upstream.enable(upstream_settings(port));

    let up_session = wait_connected(&mut up).await?;
    let down_session = wait_connected(&mut down).await?;

    // Service descriptions cross; both sides reach the idle handover
    // state.
    wait_state(&mut up, State::NotAvailableNotReady).await?;
    wait_state(&mut down, State::NotAvailableNotReady).await?;

    downstream.signal(
        down_session,
        Message::BoardAvailable(BoardAvailable::new("B1", "SENDER")),
    );
    let Message::BoardAvailable(board) = wait_message(&mut up, "BoardAvailable").await? else {
        unreachable!();
    };
    assert_eq!(board.board_id, "B1");

    upstream.signal(up_session, Message::MachineReady(MachineReady::default()));
    wait_state(&mut up, State::AvailableAndReady).await?;
    wait_state(&mut down, State::AvailableAndReady).await?;

    upstream.signal(
        up_session,
        Message::StartTransport(StartTransport {
            board_id: "B1".to_string(),
            conveyor_speed: None,
        }),
    );
    wait_state(&mut down, State::Transporting).await?;

    downstream.signal(
        down_session,
        Message::TransportFinished(TransportFinished {
            transfer_state: TransferState::Complete,
            board_id: "B1".to_string(),
        }),
    );

    // A completed transfer resets the cycle on both sides.
    wait_state(&mut down, State::NotAvailableNotReady).await?;
    wait_state(&mut up, State::NotAvailableNotReady).await?;

    downstream.stop();
    upstream.stop();
    Ok(())
}

#[tokio::test]
async fn test_wrong_first_message_is_a_protocol_error() -> Result<()> {
    let port = 51412;
    let (observer, mut events) = recorder();

    let downstream = Downstream::spawn(observer);
    downstream.enable(downstream_settings(port));

    let mut peer = RawPeer::connect(port).await?;
    peer.receive_named("ServiceDescription").await?;

    // MachineReady before any ServiceDescription violates the
    // handshake.
    peer.send(&Message::MachineReady(MachineReady::default())).await?;

    let Message::Notification(notification) = peer.receive_named("Notification").await? else {
        unreachable!();
    };
    assert_eq!(notification.code, NotificationCode::ProtocolError);
    peer.expect_close().await?;

    let error = wait_disconnected(&mut events).await?;
    assert_eq!(error.map(|it| it.kind), Some(ErrorKind::PeerError));

    downstream.stop();
    Ok(())
}

#[tokio::test]
async fn test_second_connection_is_refused() -> Result<()> {
    let port = 51413;
    let (observer, mut events) = recorder();

    let downstream = Downstream::spawn(observer);
    downstream.enable(downstream_settings(port));

    let mut first = RawPeer::connect(port).await?;
    first.receive_named("ServiceDescription").await?;
    first
        .send(&Message::ServiceDescription(ServiceDescription::new("RECEIVER", 0)))
        .await?;
    wait_state(&mut events, State::NotAvailableNotReady).await?;

    let mut second = RawPeer::connect(port).await?;
    let Message::Notification(notification) = second.receive_named("Notification").await? else {
        unreachable!();
    };
    assert_eq!(
        notification.code,
        NotificationCode::ConnectionRefusedBecauseOfEstablishedConnection
    );
    second.expect_close().await?;

    // The survivor gets a stale-link probe right after the refusal.
    first.receive_named("CheckAlive").await?;

    downstream.stop();
    Ok(())
}

#[tokio::test]
async fn test_auto_pong_echoes_the_ping_id() -> Result<()> {
    let port = 51414;
    let (observer, _events) = recorder();

    let mut settings = downstream_settings(port);
    settings.check_alive_response_mode = CheckAliveResponseMode::Auto;

    let downstream = Downstream::spawn(observer);
    downstream.enable(settings);

    let mut peer = RawPeer::connect(port).await?;
    peer.receive_named("ServiceDescription").await?;
    peer.send(&Message::ServiceDescription(ServiceDescription::new("RECEIVER", 0)))
        .await?;

    peer.send(&Message::CheckAlive(CheckAlive {
        r#type: Some(CheckAliveType::Ping),
        id: Some("17".to_string()),
    }))
    .await?;

    let Message::CheckAlive(pong) = peer.receive_named("CheckAlive").await? else {
        unreachable!();
    };
    assert_eq!(pong.r#type, Some(CheckAliveType::Pong));
    assert_eq!(pong.id.as_deref(), Some("17"));

    downstream.stop();
    Ok(())
}

#[tokio::test]
async fn test_keep_alive_fires_when_idle() -> Result<()> {
    let port = 51415;
    let (observer, _events) = recorder();

    let mut settings = downstream_settings(port);
    settings.check_alive_period_secs = 0.3;

    let downstream = Downstream::spawn(observer);
    downstream.enable(settings);

    let mut peer = RawPeer::connect(port).await?;
    peer.receive_named("ServiceDescription").await?;
    peer.send(&Message::ServiceDescription(ServiceDescription::new("RECEIVER", 0)))
        .await?;

    // Two periods with no outbound traffic produce two heartbeats.
    peer.receive_named("CheckAlive").await?;
    peer.receive_named("CheckAlive").await?;

    downstream.stop();
    Ok(())
}

#[tokio::test]
async fn test_unresolvable_allowed_host_refuses_the_peer() -> Result<()> {
    let port = 51416;
    let (observer, mut events) = recorder();

    let mut settings = downstream_settings(port);
    settings.allowed_client = Some("no-such-host.invalid".to_string());

    let downstream = Downstream::spawn(observer);
    downstream.enable(settings);

    let mut peer = RawPeer::connect(port).await?;
    let Message::Notification(notification) = peer.receive_named("Notification").await? else {
        unreachable!();
    };
    assert_eq!(notification.code, NotificationCode::ConfigurationError);
    peer.expect_close().await?;

    // The session was never adopted, so nothing connected-looking
    // reaches the application.
    assert!(
        timeout(Duration::from_millis(300), wait_connected(&mut events))
            .await
            .is_err()
    );

    downstream.stop();
    Ok(())
}

#[tokio::test]
async fn test_mismatched_peer_address_refuses_the_peer() -> Result<()> {
    let port = 51417;
    let (observer, _events) = recorder();

    let mut settings = downstream_settings(port);
    // TEST-NET; never the loopback peer the test connects from.
    settings.allowed_client = Some("203.0.113.7".to_string());

    let downstream = Downstream::spawn(observer);
    downstream.enable(settings);

    let mut peer = RawPeer::connect(port).await?;
    let Message::Notification(notification) = peer.receive_named("Notification").await? else {
        unreachable!();
    };
    assert_eq!(notification.code, NotificationCode::ConfigurationError);
    assert!(notification.description.contains("203.0.113.7"));
    peer.expect_close().await?;

    downstream.stop();
    Ok(())
}

#[tokio::test]
async fn test_disconnect_event_fires_exactly_once() -> Result<()> {
    let port = 51418;
    let (observer, mut events) = recorder();

    let downstream = Downstream::spawn(observer);
    downstream.enable(downstream_settings(port));

    let mut peer = RawPeer::connect(port).await?;
    peer.receive_named("ServiceDescription").await?;
    drop(peer);

    assert!(wait_disconnected(&mut events).await?.is_none());

    // Nothing else for that session may follow, and in particular no
    // second disconnect.
    assert!(
        timeout(Duration::from_millis(300), wait_disconnected(&mut events))
            .await
            .is_err()
    );

    downstream.stop();
    Ok(())
}

#[tokio::test]
async fn test_upstream_reconnects_after_peer_loss() -> Result<()> {
    let port = 51419;
    let (down_observer, mut down) = recorder();
    let (up_observer, mut up) = recorder();

    let downstream = Downstream::spawn(down_observer);
    downstream.enable(downstream_settings(port));

    let upstream = Upstream::spawn(up_observer);
    upstream.enable(upstream_settings(port));

    let first = wait_connected(&mut up).await?;
    wait_connected(&mut down).await?;
    wait_state(&mut up, State::NotAvailableNotReady).await?;

    // The sender resets its session; the receiver must come back on
    // its own with a fresh session id.
    downstream.reset(None);
    wait_disconnected(&mut up).await?;

    let second = wait_connected(&mut up).await?;
    assert!(second > first);
    wait_state(&mut up, State::NotAvailableNotReady).await?;

    downstream.stop();
    upstream.stop();
    Ok(())
}
