//! Message to XML rendering. Attributes are emitted in schema order,
//! absent optionals are omitted rather than written empty.

use crate::{
    Error,
    message::{
        BoardArrived, BoardDeparted, CurrentConfiguration, Message, SetConfiguration,
        SupervisorySupportedFeatures, SupportedFeatures,
        handover::BoardDescription,
    },
};

use std::fmt::Display;

use quick_xml::{
    Writer,
    events::{BytesDecl, BytesEnd, BytesStart, Event},
};

type Sink = Writer<Vec<u8>>;

pub(crate) fn document(message: &Message, timestamp: &str) -> Result<String, Error> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut envelope = BytesStart::new("Hermes");
    envelope.push_attribute(("Timestamp", timestamp));
    writer.write_event(Event::Start(envelope))?;

    write_message(&mut writer, message)?;

    writer.write_event(Event::End(BytesEnd::new("Hermes")))?;
    Ok(String::from_utf8(writer.into_inner())?)
}

/// A message element under construction.
struct El(BytesStart<'static>);

impl El {
    fn new(name: &'static str) -> Self {
        Self(BytesStart::new(name))
    }

    fn attr(&mut self, name: &str, value: impl Display) -> &mut Self {
        self.0.push_attribute((name, value.to_string().as_str()));
        self
    }

    fn attr_str(&mut self, name: &str, value: &str) -> &mut Self {
        self.0.push_attribute((name, value));
        self
    }

    fn attr_opt(&mut self, name: &str, value: &Option<impl Display>) -> &mut Self {
        if let Some(value) = value {
            self.attr(name, value);
        }

        self
    }

    fn enumeration(&mut self, name: &str, value: impl Into<u32>) -> &mut Self {
        self.attr(name, value.into())
    }

    fn enumeration_opt(&mut self, name: &str, value: Option<impl Into<u32>>) -> &mut Self {
        if let Some(value) = value {
            self.enumeration(name, value);
        }

        self
    }

    fn board(&mut self, board: &BoardDescription) -> &mut Self {
        self.attr_opt("ProductTypeId", &board.product_type_id)
            .attr_opt("TopBarcode", &board.top_barcode)
            .attr_opt("BottomBarcode", &board.bottom_barcode)
            .attr_opt("Length", &board.length)
            .attr_opt("Width", &board.width)
            .attr_opt("Thickness", &board.thickness)
            .attr_opt("ConveyorSpeed", &board.conveyor_speed)
            .attr_opt("TopClearanceHeight", &board.top_clearance_height)
            .attr_opt("BottomClearanceHeight", &board.bottom_clearance_height)
            .attr_opt("Weight", &board.weight)
            .attr_opt("WorkOrderId", &board.work_order_id)
            .attr_opt("BatchId", &board.batch_id)
    }

    fn empty(self, writer: &mut Sink) -> Result<(), Error> {
        writer.write_event(Event::Empty(self.0))?;
        Ok(())
    }

    /// Writes the element with nested content produced by `children`.
    fn wrap(
        self,
        writer: &mut Sink,
        children: impl FnOnce(&mut Sink) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let name = self.0.name().as_ref().to_vec();
        writer.write_event(Event::Start(self.0))?;
        children(writer)?;
        writer.write_event(Event::End(BytesEnd::new(String::from_utf8(name)?)))?;
        Ok(())
    }
}

fn write_message(writer: &mut Sink, message: &Message) -> Result<(), Error> {
    match message {
        Message::ServiceDescription(it) => {
            let mut el = El::new("ServiceDescription");
            el.attr_str("MachineId", &it.machine_id)
                .attr("LaneId", it.lane_id)
                .attr_opt("InterfaceId", &it.interface_id)
                .attr_str("Version", &it.version);

            if it.supported_features.any() {
                el.wrap(writer, |writer| features(writer, &it.supported_features))
            } else {
                el.empty(writer)
            }
        }
        Message::BoardAvailable(it) => {
            let mut el = El::new("BoardAvailable");
            el.attr_str("BoardId", &it.board_id)
                .attr_str("BoardIdCreatedBy", &it.board_id_created_by)
                .enumeration("FailedBoard", it.failed_board)
                .enumeration("FlippedBoard", it.flipped_board)
                .board(&it.board);
            el.empty(writer)
        }
        Message::RevokeBoardAvailable => El::new("RevokeBoardAvailable").empty(writer),
        Message::MachineReady(it) => {
            let mut el = El::new("MachineReady");
            el.enumeration("FailedBoard", it.failed_board)
                .attr_opt("ForecastId", &it.forecast_id)
                .attr_opt("BoardId", &it.board_id)
                .enumeration_opt("FlippedBoard", it.flipped_board)
                .board(&it.board);
            el.empty(writer)
        }
        Message::RevokeMachineReady => El::new("RevokeMachineReady").empty(writer),
        Message::StartTransport(it) => {
            let mut el = El::new("StartTransport");
            el.attr_str("BoardId", &it.board_id)
                .attr_opt("ConveyorSpeed", &it.conveyor_speed);
            el.empty(writer)
        }
        Message::StopTransport(it) => {
            let mut el = El::new("StopTransport");
            el.enumeration("TransferState", it.transfer_state)
                .attr_str("BoardId", &it.board_id);
            el.empty(writer)
        }
        Message::TransportFinished(it) => {
            let mut el = El::new("TransportFinished");
            el.enumeration("TransferState", it.transfer_state)
                .attr_str("BoardId", &it.board_id);
            el.empty(writer)
        }
        Message::BoardForecast(it) => {
            let mut el = El::new("BoardForecast");
            el.attr_opt("ForecastId", &it.forecast_id)
                .attr_opt(
                    "TimeUntilAvailableInSeconds",
                    &it.time_until_available_seconds,
                )
                .attr_opt("BoardId", &it.board_id)
                .attr_opt("BoardIdCreatedBy", &it.board_id_created_by)
                .enumeration("FailedBoard", it.failed_board)
                .enumeration("FlippedBoard", it.flipped_board)
                .board(&it.board);
            el.empty(writer)
        }
        Message::QueryBoardInfo(it) => {
            let mut el = El::new("QueryBoardInfo");
            el.attr_opt("TopBarcode", &it.top_barcode)
                .attr_opt("BottomBarcode", &it.bottom_barcode);
            el.empty(writer)
        }
        Message::SendBoardInfo(it) => {
            let mut el = El::new("SendBoardInfo");
            el.attr_opt("BoardId", &it.board_id)
                .attr_opt("BoardIdCreatedBy", &it.board_id_created_by)
                .enumeration_opt("FailedBoard", it.failed_board)
                .enumeration_opt("FlippedBoard", it.flipped_board)
                .board(&it.board);
            el.empty(writer)
        }
        Message::Notification(it) => {
            let mut el = El::new("Notification");
            el.enumeration("NotificationCode", it.code)
                .enumeration("Severity", it.severity)
                .attr_str("Description", &it.description);
            el.empty(writer)
        }
        Message::CheckAlive(it) => {
            let mut el = El::new("CheckAlive");
            el.enumeration_opt("Type", it.r#type)
                .attr_opt("Id", &it.id);
            el.empty(writer)
        }
        Message::Command(it) => {
            let mut el = El::new("Command");
            el.attr("Command", it.command);
            el.empty(writer)
        }
        Message::SupervisoryServiceDescription(it) => {
            let mut el = El::new("SupervisoryServiceDescription");
            el.attr_str("SystemId", &it.system_id)
                .attr_str("Version", &it.version);

            let supported = it.supported_features;
            if supervisory_features_any(&supported) {
                el.wrap(writer, |writer| supervisory_features(writer, &supported))
            } else {
                el.empty(writer)
            }
        }
        Message::BoardArrived(it) => board_arrived(writer, it),
        Message::BoardDeparted(it) => board_departed(writer, it),
        Message::QueryWorkOrderInfo(it) => {
            let mut el = El::new("QueryWorkOrderInfo");
            el.attr_opt("QueryId", &it.query_id)
                .attr_str("MachineId", &it.machine_id)
                .attr_opt("MagazineId", &it.magazine_id)
                .attr_opt("SlotId", &it.slot_id)
                .attr_opt("Barcode", &it.barcode)
                .attr_opt("WorkOrderId", &it.work_order_id)
                .attr_opt("BatchId", &it.batch_id);
            el.empty(writer)
        }
        Message::SendWorkOrderInfo(it) => {
            let mut el = El::new("SendWorkOrderInfo");
            el.attr_opt("QueryId", &it.query_id)
                .attr_opt("WorkOrderId", &it.work_order_id)
                .attr_opt("BatchId", &it.batch_id)
                .attr_opt("BoardId", &it.board_id)
                .attr_opt("BoardIdCreatedBy", &it.board_id_created_by)
                .enumeration_opt("FailedBoard", it.failed_board)
                .enumeration_opt("FlippedBoard", it.flipped_board)
                .board(&it.board);
            el.empty(writer)
        }
        Message::ReplyWorkOrderInfo(it) => {
            let mut el = El::new("ReplyWorkOrderInfo");
            el.attr_opt("WorkOrderId", &it.work_order_id)
                .attr_opt("BatchId", &it.batch_id)
                .attr("Status", it.status);
            el.empty(writer)
        }
        Message::QueryHermesCapabilities => El::new("QueryHermesCapabilities").empty(writer),
        Message::SendHermesCapabilities(it) => {
            let el = El::new("SendHermesCapabilities");
            if it.versions.is_empty() {
                el.empty(writer)
            } else {
                el.wrap(writer, |writer| {
                    El::new("SupportedHermesVersions").wrap(writer, |writer| {
                        for version in &it.versions {
                            let mut el = El::new("HermesVersion");
                            el.attr_str("Version", version);
                            el.empty(writer)?;
                        }

                        Ok(())
                    })
                })
            }
        }
        Message::GetConfiguration => El::new("GetConfiguration").empty(writer),
        Message::SetConfiguration(it) => set_configuration(writer, it),
        Message::CurrentConfiguration(it) => current_configuration(writer, it),
    }
}

fn features(writer: &mut Sink, features: &SupportedFeatures) -> Result<(), Error> {
    El::new("SupportedFeatures").wrap(writer, |writer| {
        for (name, enabled) in [
            ("FeatureBoardForecast", features.board_forecast),
            ("FeatureCheckAliveResponse", features.check_alive_response),
            ("FeatureQueryBoardInfo", features.query_board_info),
            ("FeatureSendBoardInfo", features.send_board_info),
            ("FeatureCommand", features.command),
        ] {
            if enabled {
                writer.write_event(Event::Empty(BytesStart::new(name)))?;
            }
        }

        Ok(())
    })
}

fn supervisory_features_any(features: &SupervisorySupportedFeatures) -> bool {
    features.configuration
        || features.check_alive_response
        || features.board_tracking
        || features.query_work_order_info
        || features.send_work_order_info
}

fn supervisory_features(
    writer: &mut Sink,
    features: &SupervisorySupportedFeatures,
) -> Result<(), Error> {
    El::new("SupportedFeatures").wrap(writer, |writer| {
        for (name, enabled) in [
            ("FeatureConfiguration", features.configuration),
            ("FeatureCheckAliveResponse", features.check_alive_response),
            ("FeatureBoardTracking", features.board_tracking),
            ("FeatureQueryWorkOrderInfo", features.query_work_order_info),
            ("FeatureSendWorkOrderInfo", features.send_work_order_info),
        ] {
            if enabled {
                writer.write_event(Event::Empty(BytesStart::new(name)))?;
            }
        }

        Ok(())
    })
}

fn board_arrived(writer: &mut Sink, it: &BoardArrived) -> Result<(), Error> {
    let mut el = El::new("BoardArrived");
    el.attr_str("MachineId", &it.machine_id)
        .attr("UpstreamLaneId", it.upstream_lane_id)
        .attr_opt("UpstreamInterfaceId", &it.upstream_interface_id)
        .attr_opt("MagazineId", &it.magazine_id)
        .attr_opt("SlotId", &it.slot_id)
        .enumeration("BoardTransfer", it.board_transfer)
        .attr_str("BoardId", &it.board_id)
        .attr_str("BoardIdCreatedBy", &it.board_id_created_by)
        .enumeration("FailedBoard", it.failed_board)
        .enumeration("FlippedBoard", it.flipped_board)
        .board(&it.board);
    el.empty(writer)
}

fn board_departed(writer: &mut Sink, it: &BoardDeparted) -> Result<(), Error> {
    let mut el = El::new("BoardDeparted");
    el.attr_str("MachineId", &it.machine_id)
        .attr("DownstreamLaneId", it.downstream_lane_id)
        .attr_opt("DownstreamInterfaceId", &it.downstream_interface_id)
        .attr_opt("MagazineId", &it.magazine_id)
        .attr_opt("SlotId", &it.slot_id)
        .enumeration("BoardTransfer", it.board_transfer)
        .attr_str("BoardId", &it.board_id)
        .attr_str("BoardIdCreatedBy", &it.board_id_created_by)
        .enumeration("FailedBoard", it.failed_board)
        .enumeration("FlippedBoard", it.flipped_board)
        .board(&it.board);
    el.empty(writer)
}

fn set_configuration(writer: &mut Sink, it: &SetConfiguration) -> Result<(), Error> {
    let mut el = El::new("SetConfiguration");
    el.attr_str("MachineId", &it.machine_id)
        .attr_opt("SupervisorySystemPort", &it.supervisory_system_port);

    if it.upstream_configurations.is_empty() && it.downstream_configurations.is_empty() {
        return el.empty(writer);
    }

    el.wrap(writer, |writer| {
        lane_configurations(
            writer,
            &it.upstream_configurations,
            &it.downstream_configurations,
        )
    })
}

fn current_configuration(writer: &mut Sink, it: &CurrentConfiguration) -> Result<(), Error> {
    let mut el = El::new("CurrentConfiguration");
    el.attr_opt("MachineId", &it.machine_id)
        .attr_opt("SupervisorySystemPort", &it.supervisory_system_port);

    if it.upstream_configurations.is_empty() && it.downstream_configurations.is_empty() {
        return el.empty(writer);
    }

    el.wrap(writer, |writer| {
        lane_configurations(
            writer,
            &it.upstream_configurations,
            &it.downstream_configurations,
        )
    })
}

fn lane_configurations(
    writer: &mut Sink,
    upstream: &[crate::message::UpstreamConfiguration],
    downstream: &[crate::message::DownstreamConfiguration],
) -> Result<(), Error> {
    if !upstream.is_empty() {
        El::new("UpstreamConfigurations").wrap(writer, |writer| {
            for it in upstream {
                let mut el = El::new("UpstreamConfiguration");
                el.attr("UpstreamLaneId", it.upstream_lane_id)
                    .attr_opt("UpstreamInterfaceId", &it.upstream_interface_id)
                    .attr_str("HostAddress", &it.host_address)
                    .attr("Port", it.port);
                el.empty(writer)?;
            }

            Ok(())
        })?;
    }

    if !downstream.is_empty() {
        El::new("DownstreamConfigurations").wrap(writer, |writer| {
            for it in downstream {
                let mut el = El::new("DownstreamConfiguration");
                el.attr("DownstreamLaneId", it.downstream_lane_id)
                    .attr_opt("DownstreamInterfaceId", &it.downstream_interface_id)
                    .attr_opt("ClientAddress", &it.client_address)
                    .attr("Port", it.port);
                el.empty(writer)?;
            }

            Ok(())
        })?;
    }

    Ok(())
}
