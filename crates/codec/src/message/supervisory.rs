//! Messages of the vertical channel between a station and a
//! supervisory system: board tracking, work orders and capability
//! discovery.

use super::{
    enums::{BoardQuality, BoardTransfer, FlippedBoard},
    handover::BoardDescription,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupervisorySupportedFeatures {
    pub configuration: bool,
    pub check_alive_response: bool,
    pub board_tracking: bool,
    pub query_work_order_info: bool,
    pub send_work_order_info: bool,
}

/// Vertical counterpart of the lane ServiceDescription; first message
/// each way on a supervisory connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisoryServiceDescription {
    pub system_id: String,
    pub version: String,
    pub supported_features: SupervisorySupportedFeatures,
}

impl SupervisoryServiceDescription {
    pub fn new(system_id: impl Into<String>) -> Self {
        Self {
            system_id: system_id.into(),
            version: super::handover::HERMES_VERSION.to_string(),
            supported_features: SupervisorySupportedFeatures::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardArrived {
    pub machine_id: String,
    pub upstream_lane_id: u32,
    pub upstream_interface_id: Option<String>,
    pub magazine_id: Option<String>,
    pub slot_id: Option<u32>,
    pub board_transfer: BoardTransfer,
    pub board_id: String,
    pub board_id_created_by: String,
    pub failed_board: BoardQuality,
    pub flipped_board: FlippedBoard,
    pub board: BoardDescription,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardDeparted {
    pub machine_id: String,
    pub downstream_lane_id: u32,
    pub downstream_interface_id: Option<String>,
    pub magazine_id: Option<String>,
    pub slot_id: Option<u32>,
    pub board_transfer: BoardTransfer,
    pub board_id: String,
    pub board_id_created_by: String,
    pub failed_board: BoardQuality,
    pub flipped_board: FlippedBoard,
    pub board: BoardDescription,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryWorkOrderInfo {
    pub query_id: Option<String>,
    pub machine_id: String,
    pub magazine_id: Option<String>,
    pub slot_id: Option<u32>,
    pub barcode: Option<String>,
    pub work_order_id: Option<String>,
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SendWorkOrderInfo {
    pub query_id: Option<String>,
    pub work_order_id: Option<String>,
    pub batch_id: Option<String>,
    pub board_id: Option<String>,
    pub board_id_created_by: Option<String>,
    pub failed_board: Option<BoardQuality>,
    pub flipped_board: Option<FlippedBoard>,
    pub board: BoardDescription,
}

/// Station answer to SendWorkOrderInfo. `status` carries the numeric
/// schema value verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyWorkOrderInfo {
    pub work_order_id: Option<String>,
    pub batch_id: Option<String>,
    pub status: u32,
}

/// Answer to QueryHermesCapabilities, listing the protocol versions the
/// endpoint implements as `<SupportedHermesVersions>` children.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SendHermesCapabilities {
    pub versions: Vec<String>,
}
