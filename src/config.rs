use std::{fs::read_to_string, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};

use service::{
    CheckAliveResponseMode, ConfigurationServiceSettings, DownstreamSettings, UpstreamSettings,
    VerticalServiceSettings,
};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Application,
    Auto,
}

impl Default for ResponseMode {
    fn default() -> Self {
        Self::Application
    }
}

impl From<ResponseMode> for CheckAliveResponseMode {
    fn from(value: ResponseMode) -> Self {
        match value {
            ResponseMode::Application => Self::Application,
            ResponseMode::Auto => Self::Auto,
        }
    }
}

/// The board-sending side of a lane: a listening socket the downstream
/// neighbour connects to.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct DownstreamLane {
    ///
    /// Listen port override.
    ///
    /// The lane convention of 50100 + lane id applies when absent.
    ///
    #[serde(default)]
    pub port: Option<u16>,
    ///
    /// Allowed peer host.
    ///
    /// When set, only connections from this host are accepted; any
    /// other peer is refused with a configuration-error notification.
    ///
    #[serde(default)]
    pub allowed_client: Option<String>,
    #[serde(default = "defaults::check_alive_period")]
    pub check_alive_period: f64,
    #[serde(default)]
    pub check_alive_response_mode: ResponseMode,
    #[serde(default = "defaults::reconnect_wait")]
    pub reconnect_wait: f64,
}

impl DownstreamLane {
    pub fn settings(&self, machine_id: &str, lane_id: u32) -> DownstreamSettings {
        let mut settings = DownstreamSettings::new(machine_id, lane_id);
        settings.port = self.port;
        settings.allowed_client = self.allowed_client.clone();
        settings.check_alive_period_secs = self.check_alive_period;
        settings.check_alive_response_mode = self.check_alive_response_mode.into();
        settings.reconnect_wait_secs = self.reconnect_wait;
        settings
    }
}

/// The board-receiving side of a lane: connects to the upstream
/// neighbour and keeps reconnecting while enabled.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamLane {
    ///
    /// Host of the upstream neighbour.
    ///
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "defaults::check_alive_period")]
    pub check_alive_period: f64,
    #[serde(default)]
    pub check_alive_response_mode: ResponseMode,
    #[serde(default = "defaults::reconnect_wait")]
    pub reconnect_wait: f64,
}

impl UpstreamLane {
    pub fn settings(&self, machine_id: &str, lane_id: u32) -> UpstreamSettings {
        let mut settings = UpstreamSettings::new(machine_id, lane_id, self.host.clone());
        settings.port = self.port;
        settings.check_alive_period_secs = self.check_alive_period;
        settings.check_alive_response_mode = self.check_alive_response_mode.into();
        settings.reconnect_wait_secs = self.reconnect_wait;
        settings
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Lane {
    ///
    /// Lane id, also selecting the default lane port.
    ///
    pub id: u32,
    #[serde(default)]
    pub downstream: Option<DownstreamLane>,
    #[serde(default)]
    pub upstream: Option<UpstreamLane>,
}

/// Supervisory acceptor of the station.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct VerticalService {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "defaults::check_alive_period")]
    pub check_alive_period: f64,
    #[serde(default)]
    pub check_alive_response_mode: ResponseMode,
    #[serde(default = "defaults::reconnect_wait")]
    pub reconnect_wait: f64,
    ///
    /// Advertise board tracking to connecting supervisory systems.
    ///
    #[serde(default)]
    pub board_tracking: bool,
}

impl VerticalService {
    pub fn settings(&self, machine_id: &str) -> VerticalServiceSettings {
        let mut settings = VerticalServiceSettings::new(machine_id);
        settings.port = self.port;
        settings.check_alive_period_secs = self.check_alive_period;
        settings.check_alive_response_mode = self.check_alive_response_mode.into();
        settings.reconnect_wait_secs = self.reconnect_wait;
        settings.supported_features.board_tracking = self.board_tracking;
        settings.supported_features.configuration = true;
        settings
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigurationServiceConfig {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "defaults::reconnect_wait")]
    pub reconnect_wait: f64,
}

impl ConfigurationServiceConfig {
    pub fn settings(&self) -> ConfigurationServiceSettings {
        ConfigurationServiceSettings {
            port: self.port,
            reconnect_wait_secs: self.reconnect_wait,
            ..Default::default()
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    ///
    /// Machine id announced in every service description.
    ///
    pub machine_id: String,
    #[serde(default)]
    pub lanes: Vec<Lane>,
    #[serde(default)]
    pub vertical_service: Option<VerticalService>,
    #[serde(default)]
    pub configuration_service: Option<ConfigurationServiceConfig>,
    #[serde(default)]
    pub log: Log,
}

mod defaults {
    pub fn check_alive_period() -> f64 {
        60.0
    }

    pub fn reconnect_wait() -> f64 {
        10.0
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: hermes-server --config /etc/hermes/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(
            &Cli::parse().config,
        )?)?)
    }
}
