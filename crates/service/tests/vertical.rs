use anyhow::Result;
use hermes_service::{
    PeerInfo, SessionError, SessionId, TraceKind, VerticalClientSettings, VerticalObserver,
    VerticalServiceSettings, VerticalState, vertical_client::VerticalClient,
    vertical_service::VerticalService,
};

use codec::message::{
    BoardArrived, BoardQuality, BoardTransfer, FlippedBoard, Message, QueryWorkOrderInfo,
    SendWorkOrderInfo,
};

use std::time::Duration;

use tokio::{sync::mpsc, time::timeout};

#[derive(Debug)]
enum Event {
    Connected(SessionId, VerticalState),
    Message(SessionId, VerticalState, Message),
    State(SessionId, VerticalState),
    Disconnected(SessionId, Option<SessionError>),
}

struct Recorder(mpsc::UnboundedSender<Event>);

impl VerticalObserver for Recorder {
    fn on_connected(&self, session: SessionId, state: VerticalState, _: &PeerInfo) {
        let _ = self.0.send(Event::Connected(session, state));
    }

    fn on_message(&self, session: SessionId, state: VerticalState, message: &Message) {
        let _ = self.0.send(Event::Message(session, state, message.clone()));
    }

    fn on_state(&self, session: SessionId, state: VerticalState) {
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

async fn wait_state(
    events: &mut mpsc::UnboundedReceiver<Event>,
    expected: VerticalState,
) -> Result<SessionId> {
    loop {
        match next_event(events).await? {
            Event::State(session, state) if state == expected => return Ok(session),
            _ => continue,
        }
    }
}

async fn wait_message(
    events: &mut mpsc::UnboundedReceiver<Event>,
    name: &str,
) -> Result<(SessionId, Message)> {
    loop {
        if let Event::Message(session, _, message) = next_event(events).await?
            && message.name() == name
        {
            return Ok((session, message));
        }
    }
}

fn board_arrived() -> Message {
    Message::BoardArrived(BoardArrived {
        machine_id: "MACHINE-1".to_string(),
        upstream_lane_id: 1,
        upstream_interface_id: None,
        magazine_id: None,
        slot_id: None,
        board_transfer: BoardTransfer::Transferred,
        board_id: "B1".to_string(),
        board_id_created_by: "MACHINE-1".to_string(),
        failed_board: BoardQuality::Good,
        flipped_board: FlippedBoard::TopSideUp,
        board: Default::default(),
    })
}

fn service_settings(port: u16) -> VerticalServiceSettings {
    let mut settings = VerticalServiceSettings::new("MACHINE-1");
    settings.port = Some(port);
    settings.check_alive_period_secs = 0.0;
    settings
}

fn client_settings(port: u16) -> VerticalClientSettings {
    let mut settings = VerticalClientSettings::new("SUPERVISOR", "127.0.0.1");
    settings.port = Some(port);
    settings.check_alive_period_secs = 0.0;
    settings.reconnect_wait_secs = 0.2;
    settings.supported_features.board_tracking = true;
    settings
}

#[tokio::test]
async fn test_handshake_and_board_tracking_broadcast() -> Result<()> {
    let port = 51521;
    let (service_observer, mut service_events) = recorder();
    let (client_observer, mut client_events) = recorder();

    let service = VerticalService::spawn(service_observer);
    service.enable(service_settings(port));

    let client = VerticalClient::spawn(client_observer);
    client.enable(client_settings(port));

    // Descriptions cross: client first, service answers.
    wait_state(&mut service_events, VerticalState::Connected).await?;
    wait_state(&mut client_events, VerticalState::Connected).await?;

    let (_, description) =
        wait_message(&mut service_events, "SupervisoryServiceDescription").await?;
    let Message::SupervisoryServiceDescription(description) = description else {
        unreachable!();
    };
    assert_eq!(description.system_id, "SUPERVISOR");
    assert!(description.supported_features.board_tracking);

    // The client advertised board tracking, so the broadcast reaches
    // it.
    service.signal_all(board_arrived());
    let (_, message) = wait_message(&mut client_events, "BoardArrived").await?;
    let Message::BoardArrived(arrived) = message else {
        unreachable!();
    };
    assert_eq!(arrived.board_id, "B1");

    service.stop();
    client.stop();
    Ok(())
}

#[tokio::test]
async fn test_broadcast_skips_untracked_clients() -> Result<()> {
    let port = 51522;
    let (service_observer, mut service_events) = recorder();
    let (client_observer, mut client_events) = recorder();

    let service = VerticalService::spawn(service_observer);
    service.enable(service_settings(port));

    let mut settings = client_settings(port);
    settings.supported_features.board_tracking = false;

    let client = VerticalClient::spawn(client_observer);
    client.enable(settings);

    wait_state(&mut service_events, VerticalState::Connected).await?;
    wait_state(&mut client_events, VerticalState::Connected).await?;

    service.signal_all(board_arrived());
    assert!(
        timeout(
            Duration::from_millis(300),
            wait_message(&mut client_events, "BoardArrived")
        )
        .await
        .is_err()
    );

    service.stop();
    client.stop();
    Ok(())
}

#[tokio::test]
async fn test_work_order_round_trip() -> Result<()> {
    let port = 51523;
    let (service_observer, mut service_events) = recorder();
    let (client_observer, mut client_events) = recorder();

    let service = VerticalService::spawn(service_observer);
    service.enable(service_settings(port));

    let client = VerticalClient::spawn(client_observer);
    client.enable(client_settings(port));

    let service_session = wait_state(&mut service_events, VerticalState::Connected).await?;
    let client_session = wait_state(&mut client_events, VerticalState::Connected).await?;

    // Station asks which work order a barcode belongs to.
    service.signal(
        service_session,
        Message::QueryWorkOrderInfo(QueryWorkOrderInfo {
            query_id: Some("Q1".to_string()),
            machine_id: "MACHINE-1".to_string(),
            magazine_id: None,
            slot_id: None,
            barcode: Some("BC-123".to_string()),
            work_order_id: None,
            batch_id: None,
        }),
    );

    let (_, query) = wait_message(&mut client_events, "QueryWorkOrderInfo").await?;
    let Message::QueryWorkOrderInfo(query) = query else {
        unreachable!();
    };
    assert_eq!(query.query_id.as_deref(), Some("Q1"));

    // Supervisor answers.
    client.signal(
        client_session,
        Message::SendWorkOrderInfo(SendWorkOrderInfo {
            query_id: Some("Q1".to_string()),
            work_order_id: Some("WO-7".to_string()),
            ..Default::default()
        }),
    );

    let (_, info) = wait_message(&mut service_events, "SendWorkOrderInfo").await?;
    let Message::SendWorkOrderInfo(info) = info else {
        unreachable!();
    };
    assert_eq!(info.work_order_id.as_deref(), Some("WO-7"));

    service.stop();
    client.stop();
    Ok(())
}
