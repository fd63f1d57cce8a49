pub mod configuration;
pub mod enums;
pub mod handover;
pub mod supervisory;

pub use self::{
    configuration::{
        CurrentConfiguration, DownstreamConfiguration, SetConfiguration, UpstreamConfiguration,
    },
    enums::{
        BoardQuality, BoardTransfer, CheckAliveType, FlippedBoard, NotificationCode, Severity,
        TransferState,
    },
    handover::{
        BoardAvailable, BoardForecast, CheckAlive, Command, MachineReady, Notification,
        QueryBoardInfo, SendBoardInfo, ServiceDescription, StartTransport, StopTransport,
        SupportedFeatures, TransportFinished,
    },
    supervisory::{
        BoardArrived, BoardDeparted, QueryWorkOrderInfo, ReplyWorkOrderInfo,
        SendHermesCapabilities, SendWorkOrderInfo, SupervisorySupportedFeatures,
        SupervisoryServiceDescription,
    },
};

/// The complete Hermes message set, one variant per message element the
/// schema defines. Messages with no attributes and no children are unit
/// variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ServiceDescription(ServiceDescription),
    BoardAvailable(BoardAvailable),
    RevokeBoardAvailable,
    MachineReady(MachineReady),
    RevokeMachineReady,
    StartTransport(StartTransport),
    StopTransport(StopTransport),
    TransportFinished(TransportFinished),
    BoardForecast(BoardForecast),
    QueryBoardInfo(QueryBoardInfo),
    SendBoardInfo(SendBoardInfo),
    Notification(Notification),
    CheckAlive(CheckAlive),
    Command(Command),
    SupervisoryServiceDescription(SupervisoryServiceDescription),
    BoardArrived(BoardArrived),
    BoardDeparted(BoardDeparted),
    QueryWorkOrderInfo(QueryWorkOrderInfo),
    SendWorkOrderInfo(SendWorkOrderInfo),
    ReplyWorkOrderInfo(ReplyWorkOrderInfo),
    QueryHermesCapabilities,
    SendHermesCapabilities(SendHermesCapabilities),
    GetConfiguration,
    SetConfiguration(SetConfiguration),
    CurrentConfiguration(CurrentConfiguration),
}

impl Message {
    /// The message element name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServiceDescription(_) => "ServiceDescription",
            Self::BoardAvailable(_) => "BoardAvailable",
            Self::RevokeBoardAvailable => "RevokeBoardAvailable",
            Self::MachineReady(_) => "MachineReady",
            Self::RevokeMachineReady => "RevokeMachineReady",
            Self::StartTransport(_) => "StartTransport",
            Self::StopTransport(_) => "StopTransport",
            Self::TransportFinished(_) => "TransportFinished",
            Self::BoardForecast(_) => "BoardForecast",
            Self::QueryBoardInfo(_) => "QueryBoardInfo",
            Self::SendBoardInfo(_) => "SendBoardInfo",
            Self::Notification(_) => "Notification",
            Self::CheckAlive(_) => "CheckAlive",
            Self::Command(_) => "Command",
            Self::SupervisoryServiceDescription(_) => "SupervisoryServiceDescription",
            Self::BoardArrived(_) => "BoardArrived",
            Self::BoardDeparted(_) => "BoardDeparted",
            Self::QueryWorkOrderInfo(_) => "QueryWorkOrderInfo",
            Self::SendWorkOrderInfo(_) => "SendWorkOrderInfo",
            Self::ReplyWorkOrderInfo(_) => "ReplyWorkOrderInfo",
            Self::QueryHermesCapabilities => "QueryHermesCapabilities",
            Self::SendHermesCapabilities(_) => "SendHermesCapabilities",
            Self::GetConfiguration => "GetConfiguration",
            Self::SetConfiguration(_) => "SetConfiguration",
            Self::CurrentConfiguration(_) => "CurrentConfiguration",
        }
    }
}
