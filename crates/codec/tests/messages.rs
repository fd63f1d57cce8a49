use anyhow::Result;
use hermes_codec::{
    Decoder, Error, serialize, serialize_with_timestamp,
    message::{
        BoardAvailable, CheckAlive, CheckAliveType, CurrentConfiguration,
        DownstreamConfiguration, Message, Notification, NotificationCode, SendHermesCapabilities,
        ServiceDescription, Severity, StopTransport, SupervisoryServiceDescription,
        TransferState, UpstreamConfiguration,
    },
};

const TIMESTAMP: &str = "2025-01-02T10:11:12.345+01:00";

fn roundtrip(message: Message) -> Result<Message> {
    let document = serialize_with_timestamp(&message, TIMESTAMP)?;

    let mut decoder = Decoder::default();
    decoder.extend(document.as_bytes());

    let frame = decoder
        .try_next()?
        .ok_or_else(|| anyhow::anyhow!("no frame in {document}"))?;

    assert!(decoder.try_next()?.is_none());
    Ok(frame.message)
}

#[test]
fn test_service_description() -> Result<()> {
    let mut message = ServiceDescription::new("MACHINE-1", 2);
    message.supported_features.board_forecast = true;
    message.supported_features.check_alive_response = true;

    let parsed = roundtrip(Message::ServiceDescription(message.clone()))?;
    assert_eq!(parsed, Message::ServiceDescription(message));

    // Without features the element is self-closing.
    let bare = ServiceDescription::new("MACHINE-1", 0);
    let document = serialize_with_timestamp(&Message::ServiceDescription(bare.clone()), TIMESTAMP)?;
    assert!(document.contains("<ServiceDescription MachineId=\"MACHINE-1\" LaneId=\"0\" Version=\"1.3\"/>"));
    assert_eq!(roundtrip(Message::ServiceDescription(bare.clone()))?, Message::ServiceDescription(bare));

    Ok(())
}

#[test]
fn test_board_available() -> Result<()> {
    let mut message = BoardAvailable::new("9bb85be7-a9dd-4a28-a1f0-26070e6f5b77", "MACHINE-1");
    message.board.product_type_id = Some("CTRL-A4".to_string());
    message.board.length = Some(160.0);
    message.board.width = Some(100.5);
    message.board.top_barcode = Some("BC<&>\"quoted\"".to_string());

    let parsed = roundtrip(Message::BoardAvailable(message.clone()))?;
    assert_eq!(parsed, Message::BoardAvailable(message));

    Ok(())
}

#[test]
fn test_notification_and_check_alive() -> Result<()> {
    let notification = Notification::new(
        NotificationCode::ConnectionRefusedBecauseOfEstablishedConnection,
        Severity::Error,
        "refusing second connection",
    );

    let document =
        serialize_with_timestamp(&Message::Notification(notification.clone()), TIMESTAMP)?;
    assert!(document.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
    assert!(document.contains("Timestamp=\"2025-01-02T10:11:12.345+01:00\""));
    assert!(document.contains("<Notification NotificationCode=\"2\" Severity=\"2\""));
    assert!(document.ends_with("</Hermes>"));
    assert_eq!(
        roundtrip(Message::Notification(notification.clone()))?,
        Message::Notification(notification)
    );

    let ping = CheckAlive {
        r#type: Some(CheckAliveType::Ping),
        id: Some("17".to_string()),
    };
    assert_eq!(
        roundtrip(Message::CheckAlive(ping.clone()))?,
        Message::CheckAlive(ping)
    );

    // The plain heartbeat has no attributes at all.
    let document =
        serialize_with_timestamp(&Message::CheckAlive(CheckAlive::default()), TIMESTAMP)?;
    assert!(document.contains("<CheckAlive/>"));

    Ok(())
}

#[test]
fn test_transport_messages() -> Result<()> {
    let stop = StopTransport {
        transfer_state: TransferState::Incomplete,
        board_id: "B1".to_string(),
    };

    let parsed = roundtrip(Message::StopTransport(stop.clone()))?;
    assert_eq!(parsed, Message::StopTransport(stop));
    assert_eq!(
        roundtrip(Message::RevokeBoardAvailable)?,
        Message::RevokeBoardAvailable
    );
    assert_eq!(
        roundtrip(Message::RevokeMachineReady)?,
        Message::RevokeMachineReady
    );

    Ok(())
}

#[test]
fn test_supervisory_messages() -> Result<()> {
    let mut message = SupervisoryServiceDescription::new("SUPERVISOR");
    message.supported_features.board_tracking = true;
    message.supported_features.configuration = true;

    let Message::SupervisoryServiceDescription(parsed) =
        roundtrip(Message::SupervisoryServiceDescription(message.clone()))?
    else {
        anyhow::bail!("wrong message type");
    };

    assert!(parsed.supported_features.board_tracking);
    assert!(parsed.supported_features.configuration);
    assert!(!parsed.supported_features.query_work_order_info);
    assert_eq!(parsed.system_id, "SUPERVISOR");

    let capabilities = SendHermesCapabilities {
        versions: vec!["1.0".to_string(), "1.3".to_string()],
    };
    assert_eq!(
        roundtrip(Message::SendHermesCapabilities(capabilities.clone()))?,
        Message::SendHermesCapabilities(capabilities)
    );

    Ok(())
}

#[test]
fn test_configuration_messages() -> Result<()> {
    let configuration = CurrentConfiguration {
        machine_id: Some("MACHINE-1".to_string()),
        supervisory_system_port: Some(1248),
        upstream_configurations: vec![UpstreamConfiguration {
            upstream_lane_id: 1,
            upstream_interface_id: None,
            host_address: "upstream.lan".to_string(),
            port: 50101,
        }],
        downstream_configurations: vec![DownstreamConfiguration {
            downstream_lane_id: 1,
            downstream_interface_id: Some("left".to_string()),
            client_address: Some("neighbour.lan".to_string()),
            port: 50101,
        }],
    };

    assert_eq!(
        roundtrip(Message::CurrentConfiguration(configuration.clone()))?,
        Message::CurrentConfiguration(configuration)
    );
    assert_eq!(roundtrip(Message::GetConfiguration)?, Message::GetConfiguration);

    Ok(())
}

#[test]
fn test_chunked_stream() -> Result<()> {
    let first = serialize_with_timestamp(
        &Message::CheckAlive(CheckAlive {
            r#type: Some(CheckAliveType::Ping),
            id: Some("split \"inside\" an attribute".to_string()),
        }),
        TIMESTAMP,
    )?;
    let second = serialize_with_timestamp(&Message::RevokeMachineReady, TIMESTAMP)?;

    let stream = format!("{first}{second}");
    let mut decoder = Decoder::default();

    // Byte-by-byte delivery must produce exactly the two frames, with
    // every chunk boundary landing inside tags and attribute values.
    let mut frames = Vec::new();
    for byte in stream.as_bytes() {
        decoder.extend(std::slice::from_ref(byte));
        while let Some(frame) = decoder.try_next()? {
            frames.push(frame);
        }
    }

    assert_eq!(frames.len(), 2);
    assert!(matches!(frames[0].message, Message::CheckAlive(_)));
    assert!(matches!(frames[1].message, Message::RevokeMachineReady));
    assert_eq!(frames[0].raw, first.as_bytes());
    assert!(decoder.is_empty());

    // Both documents in a single chunk drain in two calls.
    decoder.extend(stream.as_bytes());
    assert!(decoder.try_next()?.is_some());
    assert!(decoder.try_next()?.is_some());
    assert!(decoder.try_next()?.is_none());

    Ok(())
}

#[test]
fn test_rejects() -> Result<()> {
    let mut decoder = Decoder::default();
    decoder.extend(b"<Hermes Timestamp=\"now\"><NotInTheSchema/></Hermes>");
    match decoder.try_next() {
        Err(Error::UnknownMessage(name)) => assert_eq!(name, "NotInTheSchema"),
        other => anyhow::bail!("expected unknown message, got {other:?}"),
    }

    let mut decoder = Decoder::default();
    decoder.extend(b"this is not xml at all</Hermes>");
    assert!(matches!(decoder.try_next(), Err(Error::Malformed(_))));

    let mut decoder = Decoder::default();
    decoder.extend(b"<Hermes><CheckAlive Type=\"9\"/></Hermes>");
    assert!(matches!(
        decoder.try_next(),
        Err(Error::InvalidAttribute {
            message: "CheckAlive",
            attribute: "Type",
        })
    ));

    Ok(())
}

#[test]
fn test_live_timestamp() -> Result<()> {
    let document = serialize(&Message::GetConfiguration)?;

    // 2025-01-02T10:11:12.345+01:00 — fixed width up to the offset.
    let timestamp = document
        .split("Timestamp=\"")
        .nth(1)
        .and_then(|it| it.split('"').next())
        .ok_or_else(|| anyhow::anyhow!("no timestamp in {document}"))?;

    assert_eq!(timestamp.as_bytes()[4], b'-');
    assert_eq!(timestamp.as_bytes()[10], b'T');
    assert_eq!(timestamp.as_bytes()[19], b'.');
    assert!(timestamp.len() >= 23);

    Ok(())
}
