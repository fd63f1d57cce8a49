pub mod config;
pub mod observer;

use self::{
    config::Config,
    observer::{Logger, Station},
};

use std::{sync::Arc, time::Duration};

use service::{
    configuration_service::ConfigurationService, downstream::Downstream, upstream::Upstream,
    vertical_service::VerticalService,
};

/// In order to let integration tooling start the station from its own
/// process, a function is opened to replace the main function and run
/// the configured endpoints directly.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let mut downstreams = Vec::new();
    let mut upstreams = Vec::new();

    for lane in &config.lanes {
        if let Some(cfg) = &lane.downstream {
            let endpoint = Downstream::spawn(Logger::new(format!("downstream[{}]", lane.id)));
            endpoint.enable(cfg.settings(&config.machine_id, lane.id));
            downstreams.push(endpoint);
        }

        if let Some(cfg) = &lane.upstream {
            let endpoint = Upstream::spawn(Logger::new(format!("upstream[{}]", lane.id)));
            endpoint.enable(cfg.settings(&config.machine_id, lane.id));
            upstreams.push(endpoint);
        }
    }

    let vertical = config.vertical_service.as_ref().map(|cfg| {
        let endpoint = VerticalService::spawn(Logger::new("vertical"));
        endpoint.enable(cfg.settings(&config.machine_id));
        endpoint
    });

    let configuration = config.configuration_service.as_ref().map(|cfg| {
        let endpoint = ConfigurationService::spawn(Station::new(config.clone()));
        endpoint.enable(cfg.settings());
        endpoint
    });

    log::info!(
        "hermes station running: machine={}, lanes={}",
        config.machine_id,
        config.lanes.len()
    );

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");

    for endpoint in &downstreams {
        endpoint.stop();
    }

    for endpoint in &upstreams {
        endpoint.stop();
    }

    if let Some(endpoint) = &vertical {
        endpoint.stop();
    }

    if let Some(endpoint) = &configuration {
        endpoint.stop();
    }

    // Give the farewell notifications a moment to drain.
    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}
