use crate::config::Config;

use std::sync::Arc;

use codec::message::{CurrentConfiguration, DownstreamConfiguration, SetConfiguration, UpstreamConfiguration};
use parking_lot::Mutex;
use service::{
    ConfigurationHandler, LaneObserver, Message, PeerInfo, SessionError, SessionId, State,
    TraceKind, VerticalObserver, VerticalState,
};

/// Funnels every endpoint event into the process log, tagged with the
/// endpoint it came from.
#[derive(Clone)]
pub struct Logger {
    scope: Arc<String>,
}

impl Logger {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: Arc::new(scope.into()),
        }
    }
}

impl LaneObserver for Logger {
    fn on_connected(&self, session: SessionId, state: State, peer: &PeerInfo) {
        log::info!(
            "connected: endpoint={}, session={session}, state={state:?}, peer={peer}",
            self.scope
        );
    }

    fn on_message(&self, session: SessionId, state: State, message: &Message) {
        log::info!(
            "message: endpoint={}, session={session}, state={state:?}, message={}",
            self.scope,
            message.name()
        );
    }

    fn on_state(&self, session: SessionId, state: State) {
        log::debug!(
            "state: endpoint={}, session={session}, state={state:?}",
            self.scope
        );
    }

    fn on_disconnected(&self, session: SessionId, error: Option<SessionError>) {
        match error {
            None => log::info!("disconnected: endpoint={}, session={session}", self.scope),
            Some(error) => log::warn!(
                "disconnected: endpoint={}, session={session}, err={error}",
                self.scope
            ),
        }
    }

    fn on_trace(&self, session: SessionId, kind: TraceKind, text: &str) {
        trace(&self.scope, session, kind, text);
    }
}

impl VerticalObserver for Logger {
    fn on_connected(&self, session: SessionId, state: VerticalState, peer: &PeerInfo) {
        log::info!(
            "connected: endpoint={}, session={session}, state={state:?}, peer={peer}",
            self.scope
        );
    }

    fn on_message(&self, session: SessionId, state: VerticalState, message: &Message) {
        log::info!(
            "message: endpoint={}, session={session}, state={state:?}, message={}",
            self.scope,
            message.name()
        );
    }

    fn on_state(&self, session: SessionId, state: VerticalState) {
        log::debug!(
            "state: endpoint={}, session={session}, state={state:?}",
            self.scope
        );
    }

    fn on_disconnected(&self, session: SessionId, error: Option<SessionError>) {
        match error {
            None => log::info!("disconnected: endpoint={}, session={session}", self.scope),
            Some(error) => log::warn!(
                "disconnected: endpoint={}, session={session}, err={error}",
                self.scope
            ),
        }
    }

    fn on_trace(&self, session: SessionId, kind: TraceKind, text: &str) {
        trace(&self.scope, session, kind, text);
    }
}

fn trace(scope: &str, session: SessionId, kind: TraceKind, text: &str) {
    match kind {
        TraceKind::Sent | TraceKind::Received | TraceKind::Debug => {
            log::debug!("{kind:?}: endpoint={scope}, session={session}, {text}");
        }
        TraceKind::Info => log::info!("endpoint={scope}, session={session}, {text}"),
        TraceKind::Warning => log::warn!("endpoint={scope}, session={session}, {text}"),
        TraceKind::Error => log::error!("endpoint={scope}, session={session}, {text}"),
    }
}

/// Answers the configuration channel from the station's own config.
/// Remote rewrites are applied in memory only; the configuration file
/// on disk stays untouched.
pub struct Station {
    config: Arc<Config>,
    applied: Mutex<Option<CurrentConfiguration>>,
}

impl Station {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            applied: Mutex::new(None),
        }
    }

    fn from_file(&self) -> CurrentConfiguration {
        let mut configuration = CurrentConfiguration {
            machine_id: Some(self.config.machine_id.clone()),
            supervisory_system_port: self
                .config
                .vertical_service
                .as_ref()
                .map(|it| it.port.unwrap_or(service::CONFIGURATION_PORT)),
            ..Default::default()
        };

        for lane in &self.config.lanes {
            if let Some(upstream) = &lane.upstream {
                configuration.upstream_configurations.push(UpstreamConfiguration {
                    upstream_lane_id: lane.id,
                    upstream_interface_id: None,
                    host_address: upstream.host.clone(),
                    port: upstream.port.unwrap_or(service::BASE_PORT + lane.id as u16),
                });
            }

            if let Some(downstream) = &lane.downstream {
                configuration
                    .downstream_configurations
                    .push(DownstreamConfiguration {
                        downstream_lane_id: lane.id,
                        downstream_interface_id: None,
                        client_address: downstream.allowed_client.clone(),
                        port: downstream.port.unwrap_or(service::BASE_PORT + lane.id as u16),
                    });
            }
        }

        configuration
    }
}

impl ConfigurationHandler for Station {
    fn get_configuration(&self, _: &PeerInfo) -> CurrentConfiguration {
        self.applied
            .lock()
            .clone()
            .unwrap_or_else(|| self.from_file())
    }

    fn set_configuration(
        &self,
        peer: &PeerInfo,
        configuration: SetConfiguration,
    ) -> Result<(), String> {
        if configuration.machine_id.is_empty() {
            return Err("machine id must not be empty".to_string());
        }

        if configuration
            .upstream_configurations
            .iter()
            .any(|it| it.port == 0)
            || configuration
                .downstream_configurations
                .iter()
                .any(|it| it.port == 0)
        {
            return Err("port must be non-zero".to_string());
        }

        log::warn!(
            "configuration rewritten remotely, not persisted: peer={peer}, machine={}",
            configuration.machine_id
        );

        *self.applied.lock() = Some(CurrentConfiguration {
            machine_id: Some(configuration.machine_id),
            supervisory_system_port: configuration.supervisory_system_port,
            upstream_configurations: configuration.upstream_configurations,
            downstream_configurations: configuration.downstream_configurations,
        });

        Ok(())
    }

    fn on_trace(&self, session: SessionId, kind: TraceKind, text: &str) {
        trace("configuration", session, kind, text);
    }
}
