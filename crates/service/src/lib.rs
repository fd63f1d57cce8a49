//! ## Hermes session engine
//!
//! One long-lived object per lane or supervisory endpoint, each owning
//! its TCP wiring end to end: the framed transport, the message codec,
//! the role state machine and the connection supervision (listen or
//! connect, single-peer exclusivity, reconnect backoff).
//!
//! Each role is driven by a dedicated task. Applications talk to it
//! through a cheap cloneable handle posting work items; the role talks
//! back through an observer trait invoked from the role's own tasks,
//! with per-session event order guaranteed: `on_connected` strictly
//! before any `on_message`, strictly before the exactly-once
//! `on_disconnected`.

pub mod configuration_client;
pub mod configuration_service;
pub mod downstream;
pub mod upstream;
pub mod vertical_client;
pub mod vertical_service;

mod machine;
mod net;
mod session;

pub use codec::message::Message;

use codec::message::{
    CurrentConfiguration, SetConfiguration, SupervisorySupportedFeatures, SupportedFeatures,
};

use std::time::Duration;

/// First downstream lane port; lane `n` listens on `50100 + n` unless
/// configured otherwise.
pub const BASE_PORT: u16 = 50100;

/// Dedicated port of the remote-configuration channel.
pub const CONFIGURATION_PORT: u16 = 1248;

/// Monotonic per-supervisor connection counter, wrapping back to 1.
/// Zero never names a live session; traces use it for the supervisor
/// itself.
pub type SessionId = u32;

/// The peer endpoint of a session as far as it is known: the remote
/// address, the configured port and a best-effort reverse lookup of the
/// remote name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: String,
    pub port: u16,
    pub host_name: String,
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)?;
        if !self.host_name.is_empty() {
            write!(f, " ({})", self.host_name)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ImplementationError,
    PeerError,
    ClientError,
    NetworkError,
    Timeout,
}

/// The reason a session ended, as reported by the exactly-once
/// `on_disconnected` event. A clean close carries no error at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub text: String,
}

impl SessionError {
    pub fn new(kind: ErrorKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

impl std::error::Error for SessionError {}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.text)
    }
}

/// Category of an advisory trace line. Traces are not part of the
/// error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Sent,
    Received,
    Debug,
    Info,
    Warning,
    Error,
}

/// Whether the engine answers an incoming CheckAlive ping by itself or
/// leaves that to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckAliveResponseMode {
    #[default]
    Application,
    Auto,
}

/// Lane session state. The handover cycle lives between
/// `NotAvailableNotReady` and the transport tail states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotConnected,
    SocketConnected,
    ServiceDescriptionDownstream,
    ServiceDescriptionUpstream,
    NotAvailableNotReady,
    BoardAvailable,
    MachineReady,
    AvailableAndReady,
    Transporting,
    TransportStopped,
    TransportFinished,
    Disconnected,
}

/// Supervisory session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerticalState {
    NotConnected,
    SocketConnected,
    ServiceDescription,
    Connected,
    Disconnected,
}

/// Events of a lane endpoint, delivered from the endpoint's own tasks.
/// Messages arrive as the full sum type; the state passed alongside is
/// the state after any transition the message caused.
pub trait LaneObserver: Send + Sync + 'static {
    #[allow(unused_variables)]
    fn on_connected(&self, session: SessionId, state: State, peer: &PeerInfo) {}

    #[allow(unused_variables)]
    fn on_message(&self, session: SessionId, state: State, message: &Message) {}

    #[allow(unused_variables)]
    fn on_state(&self, session: SessionId, state: State) {}

    /// Exactly once per session; no event for this session follows it.
    /// `error` is `None` for a clean close.
    #[allow(unused_variables)]
    fn on_disconnected(&self, session: SessionId, error: Option<SessionError>) {}

    #[allow(unused_variables)]
    fn on_trace(&self, session: SessionId, kind: TraceKind, text: &str) {}
}

/// Events of a supervisory endpoint (vertical service or client).
pub trait VerticalObserver: Send + Sync + 'static {
    #[allow(unused_variables)]
    fn on_connected(&self, session: SessionId, state: VerticalState, peer: &PeerInfo) {}

    #[allow(unused_variables)]
    fn on_message(&self, session: SessionId, state: VerticalState, message: &Message) {}

    #[allow(unused_variables)]
    fn on_state(&self, session: SessionId, state: VerticalState) {}

    #[allow(unused_variables)]
    fn on_disconnected(&self, session: SessionId, error: Option<SessionError>) {}

    #[allow(unused_variables)]
    fn on_trace(&self, session: SessionId, kind: TraceKind, text: &str) {}
}

/// The embedder side of the configuration channel: it owns the actual
/// settings and synthesises the answers.
pub trait ConfigurationHandler: Send + Sync + 'static {
    /// Answer to GetConfiguration, and to every SetConfiguration after
    /// it was applied (or rejected).
    fn get_configuration(&self, peer: &PeerInfo) -> CurrentConfiguration;

    /// Apply a SetConfiguration. An `Err` text is lifted into a
    /// CONFIGURATION_ERROR notification to the client; the current
    /// configuration is sent either way.
    fn set_configuration(
        &self,
        peer: &PeerInfo,
        configuration: SetConfiguration,
    ) -> Result<(), String>;

    #[allow(unused_variables)]
    fn on_trace(&self, session: SessionId, kind: TraceKind, text: &str) {}
}

/// Settings of the board-sending lane endpoint: the TCP server on
/// `BASE_PORT + lane_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamSettings {
    pub machine_id: String,
    pub lane_id: u32,
    /// Listen port override; the lane port convention applies when
    /// absent.
    pub port: Option<u16>,
    /// When set, the only host connections are accepted from.
    pub allowed_client: Option<String>,
    pub check_alive_period_secs: f64,
    pub check_alive_response_mode: CheckAliveResponseMode,
    pub reconnect_wait_secs: f64,
    /// Disables state gating; conformance tooling drives the wire
    /// directly.
    pub check_state: bool,
    pub supported_features: SupportedFeatures,
}

impl DownstreamSettings {
    pub fn new(machine_id: impl Into<String>, lane_id: u32) -> Self {
        Self {
            machine_id: machine_id.into(),
            lane_id,
            port: None,
            allowed_client: None,
            check_alive_period_secs: 60.0,
            check_alive_response_mode: CheckAliveResponseMode::default(),
            reconnect_wait_secs: 10.0,
            check_state: true,
            supported_features: SupportedFeatures::default(),
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(BASE_PORT + self.lane_id as u16)
    }
}

/// Settings of the board-receiving lane endpoint: the TCP client
/// connecting to the upstream neighbour.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSettings {
    pub machine_id: String,
    pub lane_id: u32,
    pub host: String,
    pub port: Option<u16>,
    pub check_alive_period_secs: f64,
    pub check_alive_response_mode: CheckAliveResponseMode,
    pub reconnect_wait_secs: f64,
    pub check_state: bool,
    pub supported_features: SupportedFeatures,
}

impl UpstreamSettings {
    pub fn new(machine_id: impl Into<String>, lane_id: u32, host: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            lane_id,
            host: host.into(),
            port: None,
            check_alive_period_secs: 60.0,
            check_alive_response_mode: CheckAliveResponseMode::default(),
            reconnect_wait_secs: 10.0,
            check_state: true,
            supported_features: SupportedFeatures::default(),
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(BASE_PORT + self.lane_id as u16)
    }
}

/// Settings of the supervisory acceptor a station runs for its
/// supervisory systems.
#[derive(Debug, Clone, PartialEq)]
pub struct VerticalServiceSettings {
    pub system_id: String,
    pub port: Option<u16>,
    pub check_alive_period_secs: f64,
    pub check_alive_response_mode: CheckAliveResponseMode,
    pub reconnect_wait_secs: f64,
    pub supported_features: SupervisorySupportedFeatures,
}

impl VerticalServiceSettings {
    pub fn new(system_id: impl Into<String>) -> Self {
        Self {
            system_id: system_id.into(),
            port: None,
            check_alive_period_secs: 60.0,
            check_alive_response_mode: CheckAliveResponseMode::default(),
            reconnect_wait_secs: 10.0,
            supported_features: SupervisorySupportedFeatures::default(),
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(CONFIGURATION_PORT)
    }
}

/// Settings of a supervisory system connecting to a station.
#[derive(Debug, Clone, PartialEq)]
pub struct VerticalClientSettings {
    pub system_id: String,
    pub host: String,
    pub port: Option<u16>,
    pub check_alive_period_secs: f64,
    pub check_alive_response_mode: CheckAliveResponseMode,
    pub reconnect_wait_secs: f64,
    pub supported_features: SupervisorySupportedFeatures,
}

impl VerticalClientSettings {
    pub fn new(system_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            system_id: system_id.into(),
            host: host.into(),
            port: None,
            check_alive_period_secs: 60.0,
            check_alive_response_mode: CheckAliveResponseMode::default(),
            reconnect_wait_secs: 10.0,
            supported_features: SupervisorySupportedFeatures::default(),
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(CONFIGURATION_PORT)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationServiceSettings {
    pub port: Option<u16>,
    pub check_alive_period_secs: f64,
    pub reconnect_wait_secs: f64,
}

impl Default for ConfigurationServiceSettings {
    fn default() -> Self {
        Self {
            port: None,
            check_alive_period_secs: 0.0,
            reconnect_wait_secs: 10.0,
        }
    }
}

impl ConfigurationServiceSettings {
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(CONFIGURATION_PORT)
    }
}

pub(crate) fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}
