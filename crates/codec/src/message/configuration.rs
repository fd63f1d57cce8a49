//! Remote-configuration messages. A configuration client reads or
//! rewrites a station's Hermes wiring over the dedicated configuration
//! port; the station answers with its effective configuration.

/// One upstream (board-receiving) lane endpoint of the machine.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfiguration {
    pub upstream_lane_id: u32,
    pub upstream_interface_id: Option<String>,
    pub host_address: String,
    pub port: u16,
}

/// One downstream (board-sending) lane endpoint. `client_address`, when
/// set, is the only peer the listening socket accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamConfiguration {
    pub downstream_lane_id: u32,
    pub downstream_interface_id: Option<String>,
    pub client_address: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SetConfiguration {
    pub machine_id: String,
    pub supervisory_system_port: Option<u16>,
    pub upstream_configurations: Vec<UpstreamConfiguration>,
    pub downstream_configurations: Vec<DownstreamConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CurrentConfiguration {
    pub machine_id: Option<String>,
    pub supervisory_system_port: Option<u16>,
    pub upstream_configurations: Vec<UpstreamConfiguration>,
    pub downstream_configurations: Vec<DownstreamConfiguration>,
}
