use anyhow::Result;
use hermes_service::{
    ConfigurationHandler, ConfigurationServiceSettings, ErrorKind, PeerInfo,
    configuration_client::{ConfigurationClient, ConfigurationReply},
    configuration_service::ConfigurationService,
};

use codec::message::{
    CurrentConfiguration, DownstreamConfiguration, NotificationCode, SetConfiguration,
};

use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;

/// Embedder double: keeps one configuration and rejects a zero
/// supervisory port.
#[derive(Default)]
struct Station {
    configuration: Mutex<CurrentConfiguration>,
}

impl ConfigurationHandler for Station {
    fn get_configuration(&self, _: &PeerInfo) -> CurrentConfiguration {
        self.configuration.lock().clone()
    }

    fn set_configuration(
        &self,
        _: &PeerInfo,
        configuration: SetConfiguration,
    ) -> Result<(), String> {
        if configuration.supervisory_system_port == Some(0) {
            return Err("port must be non-zero".to_string());
        }

        *self.configuration.lock() = CurrentConfiguration {
            machine_id: Some(configuration.machine_id),
            supervisory_system_port: configuration.supervisory_system_port,
            upstream_configurations: configuration.upstream_configurations,
            downstream_configurations: configuration.downstream_configurations,
        };

        Ok(())
    }
}

fn settings(port: u16) -> ConfigurationServiceSettings {
    ConfigurationServiceSettings {
        port: Some(port),
        ..Default::default()
    }
}

fn client(port: u16) -> ConfigurationClient {
    ConfigurationClient::new("127.0.0.1")
        .with_port(port)
        .with_timeout(Duration::from_secs(3))
}

async fn get_with_retry(client: &ConfigurationClient) -> Result<ConfigurationReply> {
    // The service binds asynchronously after enable.
    for _ in 0..50 {
        if let Ok(reply) = client.get().await {
            return Ok(reply);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    anyhow::bail!("configuration service never answered");
}

#[tokio::test]
async fn test_get_configuration() -> Result<()> {
    let port = 51531;

    let station = Station::default();
    station.configuration.lock().machine_id = Some("MACHINE-1".to_string());
    station.configuration.lock().downstream_configurations =
        vec![DownstreamConfiguration {
            downstream_lane_id: 1,
            downstream_interface_id: None,
            client_address: None,
            port: 50101,
        }];

    let service = ConfigurationService::spawn(station);
    service.enable(settings(port));

    let reply = get_with_retry(&client(port)).await?;
    assert_eq!(reply.configuration.machine_id.as_deref(), Some("MACHINE-1"));
    assert_eq!(reply.configuration.downstream_configurations.len(), 1);
    assert!(reply.notifications.is_empty());

    service.stop();
    Ok(())
}

#[tokio::test]
async fn test_set_configuration_applies() -> Result<()> {
    let port = 51532;

    let service = ConfigurationService::spawn(Station::default());
    service.enable(settings(port));

    let client = client(port);
    get_with_retry(&client).await?;

    let reply = client
        .set(SetConfiguration {
            machine_id: "MACHINE-2".to_string(),
            supervisory_system_port: Some(1250),
            ..Default::default()
        })
        .await?;

    assert!(reply.notifications.is_empty());
    assert_eq!(reply.configuration.machine_id.as_deref(), Some("MACHINE-2"));
    assert_eq!(reply.configuration.supervisory_system_port, Some(1250));

    service.stop();
    Ok(())
}

#[tokio::test]
async fn test_rejected_set_returns_notification_and_old_configuration() -> Result<()> {
    let port = 51533;

    let station = Station::default();
    station.configuration.lock().machine_id = Some("MACHINE-1".to_string());

    let service = ConfigurationService::spawn(station);
    service.enable(settings(port));

    let client = client(port);
    get_with_retry(&client).await?;

    let reply = client
        .set(SetConfiguration {
            machine_id: "MACHINE-2".to_string(),
            supervisory_system_port: Some(0),
            ..Default::default()
        })
        .await?;

    // The rejection arrives as a notification, followed by the
    // untouched configuration.
    assert_eq!(reply.notifications.len(), 1);
    assert_eq!(reply.notifications[0].code, NotificationCode::ConfigurationError);
    assert_eq!(reply.notifications[0].description, "port must be non-zero");
    assert_eq!(reply.configuration.machine_id.as_deref(), Some("MACHINE-1"));

    service.stop();
    Ok(())
}

#[tokio::test]
async fn test_silent_service_times_out() -> Result<()> {
    let port = 51534;

    // Accepts and then says nothing.
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            sockets.push(socket);
        }
    });

    let client = ConfigurationClient::new("127.0.0.1")
        .with_port(port)
        .with_timeout(Duration::from_millis(300));

    let error = client.get().await.expect_err("expected a timeout");
    assert_eq!(error.kind, ErrorKind::Timeout);

    Ok(())
}
