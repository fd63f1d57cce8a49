//! Messages of the lane (horizontal) channel: the handshake, the
//! handover coordination set and the out-of-band helpers.

use super::enums::{
    BoardQuality, CheckAliveType, FlippedBoard, NotificationCode, Severity, TransferState,
};

pub const HERMES_VERSION: &str = "1.3";

/// Optional features a lane endpoint advertises inside its
/// ServiceDescription. Rendered as empty child elements of
/// `<SupportedFeatures>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupportedFeatures {
    pub board_forecast: bool,
    pub check_alive_response: bool,
    pub query_board_info: bool,
    pub send_board_info: bool,
    pub command: bool,
}

impl SupportedFeatures {
    pub fn any(&self) -> bool {
        self.board_forecast
            || self.check_alive_response
            || self.query_board_info
            || self.send_board_info
            || self.command
    }
}

/// Mandatory first message of every lane connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescription {
    pub machine_id: String,
    pub lane_id: u32,
    pub interface_id: Option<String>,
    pub version: String,
    pub supported_features: SupportedFeatures,
}

impl ServiceDescription {
    pub fn new(machine_id: impl Into<String>, lane_id: u32) -> Self {
        Self {
            machine_id: machine_id.into(),
            lane_id,
            interface_id: None,
            version: HERMES_VERSION.to_string(),
            supported_features: SupportedFeatures::default(),
        }
    }
}

/// The board description block shared by BoardAvailable, BoardForecast
/// and SendBoardInfo. Dimensions are millimetres, the conveyor speed
/// mm/s, the weight grams.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoardDescription {
    pub product_type_id: Option<String>,
    pub top_barcode: Option<String>,
    pub bottom_barcode: Option<String>,
    pub length: Option<f64>,
    pub width: Option<f64>,
    pub thickness: Option<f64>,
    pub conveyor_speed: Option<f64>,
    pub top_clearance_height: Option<f64>,
    pub bottom_clearance_height: Option<f64>,
    pub weight: Option<f64>,
    pub work_order_id: Option<String>,
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardAvailable {
    pub board_id: String,
    pub board_id_created_by: String,
    pub failed_board: BoardQuality,
    pub flipped_board: FlippedBoard,
    pub board: BoardDescription,
}

impl BoardAvailable {
    pub fn new(board_id: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            board_id: board_id.into(),
            board_id_created_by: created_by.into(),
            failed_board: BoardQuality::default(),
            flipped_board: FlippedBoard::default(),
            board: BoardDescription::default(),
        }
    }
}

/// Readiness of the receiving side, optionally constraining what it
/// will accept.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MachineReady {
    pub failed_board: BoardQuality,
    pub forecast_id: Option<String>,
    pub board_id: Option<String>,
    pub flipped_board: Option<FlippedBoard>,
    pub board: BoardDescription,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartTransport {
    pub board_id: String,
    pub conveyor_speed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopTransport {
    pub transfer_state: TransferState,
    pub board_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportFinished {
    pub transfer_state: TransferState,
    pub board_id: String,
}

/// Announces a board before it becomes available, so the next station
/// can prepare tooling.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoardForecast {
    pub forecast_id: Option<String>,
    pub time_until_available_seconds: Option<f64>,
    pub board_id: Option<String>,
    pub board_id_created_by: Option<String>,
    pub failed_board: BoardQuality,
    pub flipped_board: FlippedBoard,
    pub board: BoardDescription,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryBoardInfo {
    pub top_barcode: Option<String>,
    pub bottom_barcode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SendBoardInfo {
    pub board_id: Option<String>,
    pub board_id_created_by: Option<String>,
    pub failed_board: Option<BoardQuality>,
    pub flipped_board: Option<FlippedBoard>,
    pub board: BoardDescription,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub code: NotificationCode,
    pub severity: Severity,
    pub description: String,
}

impl Notification {
    pub fn new(code: NotificationCode, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            description: description.into(),
        }
    }
}

/// Keep-alive probe. A bare CheckAlive is a heartbeat; with
/// `Type=Ping` it requests a matching `Type=Pong` echoing the id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CheckAlive {
    pub r#type: Option<CheckAliveType>,
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub command: u32,
}
