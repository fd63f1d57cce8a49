//! Numeric enumerations of the schema. Attribute values on the wire
//! are the bare integers, so every enumeration converts both ways
//! through its primitive representation.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum NotificationCode {
    Unspecific = 0,
    ProtocolError = 1,
    ConnectionRefusedBecauseOfEstablishedConnection = 2,
    ConnectionResetBecauseOfChangedConfiguration = 3,
    ConfigurationError = 4,
    MachineShutdown = 5,
    BoardForecastError = 6,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum Severity {
    Unknown = 0,
    Fatal = 1,
    Error = 2,
    Warning = 3,
    Info = 4,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum CheckAliveType {
    Ping = 1,
    Pong = 2,
}

/// `TransferState` of StopTransport and TransportFinished.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum TransferState {
    NotStarted = 1,
    Incomplete = 2,
    Complete = 3,
}

/// `FailedBoard` attribute of the board description block.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive, IntoPrimitive)]
pub enum BoardQuality {
    #[default]
    Unknown = 0,
    Good = 1,
    Failed = 2,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive, IntoPrimitive)]
pub enum FlippedBoard {
    #[default]
    Unknown = 0,
    TopSideUp = 1,
    BottomSideUp = 2,
}

/// How a board entered or left a machine, carried by BoardArrived and
/// BoardDeparted.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive, IntoPrimitive)]
pub enum BoardTransfer {
    #[default]
    Unspecified = 0,
    Transferred = 1,
    Loaded = 2,
    Inserted = 3,
}
