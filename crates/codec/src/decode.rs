//! XML to message parsing. The splitter hands over one envelope per
//! call; everything here works on a complete document.

use crate::{
    Error,
    message::{
        BoardArrived, BoardAvailable, BoardDeparted, BoardForecast, CheckAlive, Command,
        CurrentConfiguration, DownstreamConfiguration, MachineReady, Message, Notification,
        QueryBoardInfo, QueryWorkOrderInfo, ReplyWorkOrderInfo, SendBoardInfo,
        SendHermesCapabilities, SendWorkOrderInfo, ServiceDescription, SetConfiguration,
        StartTransport, StopTransport, SupervisoryServiceDescription,
        SupervisorySupportedFeatures, SupportedFeatures, TransportFinished,
        UpstreamConfiguration,
        handover::BoardDescription,
    },
};

use std::str::FromStr;

use num_enum::TryFromPrimitive;
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};

/// Reader failures mean the peer did not send XML; they surface as
/// [`Error::Malformed`] so the session can close with a peer error.
fn next<'a>(reader: &mut Reader<&'a [u8]>) -> Result<Event<'a>, Error> {
    reader
        .read_event()
        .map_err(|it| Error::Malformed(it.to_string()))
}

pub(crate) fn document(doc: &str) -> Result<Message, Error> {
    let mut reader = Reader::from_str(doc);
    reader.config_mut().trim_text(true);

    // Walk to the envelope first. Anything other than a <Hermes> root
    // is not ours.
    loop {
        match next(&mut reader)? {
            Event::Decl(_) | Event::Comment(_) | Event::Text(_) | Event::PI(_) => continue,
            Event::Start(el) if el.local_name().as_ref() == b"Hermes" => break,
            Event::Eof => return Err(Error::Malformed("missing envelope".to_string())),
            _ => return Err(Error::Malformed("document is not a Hermes envelope".to_string())),
        }
    }

    let (el, empty) = loop {
        match next(&mut reader)? {
            Event::Comment(_) | Event::Text(_) => continue,
            Event::Start(el) => break (el.into_owned(), false),
            Event::Empty(el) => break (el.into_owned(), true),
            _ => return Err(Error::Malformed("envelope without message".to_string())),
        }
    };

    dispatch(&mut reader, &el, empty)
}

fn dispatch(reader: &mut Reader<&[u8]>, el: &BytesStart, empty: bool) -> Result<Message, Error> {
    let name = el.local_name().as_ref().to_vec();

    Ok(match name.as_slice() {
        b"ServiceDescription" => service_description(reader, el, empty)?,
        b"BoardAvailable" => {
            let attrs = Attrs::read("BoardAvailable", el)?;
            Message::BoardAvailable(BoardAvailable {
                board_id: attrs.require("BoardId")?,
                board_id_created_by: attrs.require("BoardIdCreatedBy")?,
                failed_board: attrs.require_enumeration("FailedBoard")?,
                flipped_board: attrs.require_enumeration("FlippedBoard")?,
                board: attrs.board()?,
            })
        }
        b"RevokeBoardAvailable" => Message::RevokeBoardAvailable,
        b"MachineReady" => {
            let attrs = Attrs::read("MachineReady", el)?;
            Message::MachineReady(MachineReady {
                failed_board: attrs.require_enumeration("FailedBoard")?,
                forecast_id: attrs.string("ForecastId"),
                board_id: attrs.string("BoardId"),
                flipped_board: attrs.enumeration("FlippedBoard")?,
                board: attrs.board()?,
            })
        }
        b"RevokeMachineReady" => Message::RevokeMachineReady,
        b"StartTransport" => {
            let attrs = Attrs::read("StartTransport", el)?;
            Message::StartTransport(StartTransport {
                board_id: attrs.require("BoardId")?,
                conveyor_speed: attrs.parse("ConveyorSpeed")?,
            })
        }
        b"StopTransport" => {
            let attrs = Attrs::read("StopTransport", el)?;
            Message::StopTransport(StopTransport {
                transfer_state: attrs.require_enumeration("TransferState")?,
                board_id: attrs.require("BoardId")?,
            })
        }
        b"TransportFinished" => {
            let attrs = Attrs::read("TransportFinished", el)?;
            Message::TransportFinished(TransportFinished {
                transfer_state: attrs.require_enumeration("TransferState")?,
                board_id: attrs.require("BoardId")?,
            })
        }
        b"BoardForecast" => {
            let attrs = Attrs::read("BoardForecast", el)?;
            Message::BoardForecast(BoardForecast {
                forecast_id: attrs.string("ForecastId"),
                time_until_available_seconds: attrs.parse("TimeUntilAvailableInSeconds")?,
                board_id: attrs.string("BoardId"),
                board_id_created_by: attrs.string("BoardIdCreatedBy"),
                failed_board: attrs.require_enumeration("FailedBoard")?,
                flipped_board: attrs.require_enumeration("FlippedBoard")?,
                board: attrs.board()?,
            })
        }
        b"QueryBoardInfo" => {
            let attrs = Attrs::read("QueryBoardInfo", el)?;
            Message::QueryBoardInfo(QueryBoardInfo {
                top_barcode: attrs.string("TopBarcode"),
                bottom_barcode: attrs.string("BottomBarcode"),
            })
        }
        b"SendBoardInfo" => {
            let attrs = Attrs::read("SendBoardInfo", el)?;
            Message::SendBoardInfo(SendBoardInfo {
                board_id: attrs.string("BoardId"),
                board_id_created_by: attrs.string("BoardIdCreatedBy"),
                failed_board: attrs.enumeration("FailedBoard")?,
                flipped_board: attrs.enumeration("FlippedBoard")?,
                board: attrs.board()?,
            })
        }
        b"Notification" => {
            let attrs = Attrs::read("Notification", el)?;
            Message::Notification(Notification {
                code: attrs.require_enumeration("NotificationCode")?,
                severity: attrs.require_enumeration("Severity")?,
                description: attrs.string("Description").unwrap_or_default(),
            })
        }
        b"CheckAlive" => {
            let attrs = Attrs::read("CheckAlive", el)?;
            Message::CheckAlive(CheckAlive {
                r#type: attrs.enumeration("Type")?,
                id: attrs.string("Id"),
            })
        }
        b"Command" => {
            let attrs = Attrs::read("Command", el)?;
            Message::Command(Command {
                command: attrs.require_parse("Command")?,
            })
        }
        b"SupervisoryServiceDescription" => supervisory_service_description(reader, el, empty)?,
        b"BoardArrived" => {
            let attrs = Attrs::read("BoardArrived", el)?;
            Message::BoardArrived(BoardArrived {
                machine_id: attrs.require("MachineId")?,
                upstream_lane_id: attrs.require_parse("UpstreamLaneId")?,
                upstream_interface_id: attrs.string("UpstreamInterfaceId"),
                magazine_id: attrs.string("MagazineId"),
                slot_id: attrs.parse("SlotId")?,
                board_transfer: attrs.require_enumeration("BoardTransfer")?,
                board_id: attrs.require("BoardId")?,
                board_id_created_by: attrs.require("BoardIdCreatedBy")?,
                failed_board: attrs.require_enumeration("FailedBoard")?,
                flipped_board: attrs.require_enumeration("FlippedBoard")?,
                board: attrs.board()?,
            })
        }
        b"BoardDeparted" => {
            let attrs = Attrs::read("BoardDeparted", el)?;
            Message::BoardDeparted(BoardDeparted {
                machine_id: attrs.require("MachineId")?,
                downstream_lane_id: attrs.require_parse("DownstreamLaneId")?,
                downstream_interface_id: attrs.string("DownstreamInterfaceId"),
                magazine_id: attrs.string("MagazineId"),
                slot_id: attrs.parse("SlotId")?,
                board_transfer: attrs.require_enumeration("BoardTransfer")?,
                board_id: attrs.require("BoardId")?,
                board_id_created_by: attrs.require("BoardIdCreatedBy")?,
                failed_board: attrs.require_enumeration("FailedBoard")?,
                flipped_board: attrs.require_enumeration("FlippedBoard")?,
                board: attrs.board()?,
            })
        }
        b"QueryWorkOrderInfo" => {
            let attrs = Attrs::read("QueryWorkOrderInfo", el)?;
            Message::QueryWorkOrderInfo(QueryWorkOrderInfo {
                query_id: attrs.string("QueryId"),
                machine_id: attrs.require("MachineId")?,
                magazine_id: attrs.string("MagazineId"),
                slot_id: attrs.parse("SlotId")?,
                barcode: attrs.string("Barcode"),
                work_order_id: attrs.string("WorkOrderId"),
                batch_id: attrs.string("BatchId"),
            })
        }
        b"SendWorkOrderInfo" => {
            let attrs = Attrs::read("SendWorkOrderInfo", el)?;
            Message::SendWorkOrderInfo(SendWorkOrderInfo {
                query_id: attrs.string("QueryId"),
                work_order_id: attrs.string("WorkOrderId"),
                batch_id: attrs.string("BatchId"),
                board_id: attrs.string("BoardId"),
                board_id_created_by: attrs.string("BoardIdCreatedBy"),
                failed_board: attrs.enumeration("FailedBoard")?,
                flipped_board: attrs.enumeration("FlippedBoard")?,
                board: attrs.board()?,
            })
        }
        b"ReplyWorkOrderInfo" => {
            let attrs = Attrs::read("ReplyWorkOrderInfo", el)?;
            Message::ReplyWorkOrderInfo(ReplyWorkOrderInfo {
                work_order_id: attrs.string("WorkOrderId"),
                batch_id: attrs.string("BatchId"),
                status: attrs.require_parse("Status")?,
            })
        }
        b"QueryHermesCapabilities" => Message::QueryHermesCapabilities,
        b"SendHermesCapabilities" => send_hermes_capabilities(reader, empty)?,
        b"GetConfiguration" => Message::GetConfiguration,
        b"SetConfiguration" => {
            let attrs = Attrs::read("SetConfiguration", el)?;
            let (upstream, downstream) = lane_configurations(reader, b"SetConfiguration", empty)?;
            Message::SetConfiguration(SetConfiguration {
                machine_id: attrs.require("MachineId")?,
                supervisory_system_port: attrs.parse("SupervisorySystemPort")?,
                upstream_configurations: upstream,
                downstream_configurations: downstream,
            })
        }
        b"CurrentConfiguration" => {
            let attrs = Attrs::read("CurrentConfiguration", el)?;
            let (upstream, downstream) =
                lane_configurations(reader, b"CurrentConfiguration", empty)?;
            Message::CurrentConfiguration(CurrentConfiguration {
                machine_id: attrs.string("MachineId"),
                supervisory_system_port: attrs.parse("SupervisorySystemPort")?,
                upstream_configurations: upstream,
                downstream_configurations: downstream,
            })
        }
        _ => return Err(Error::UnknownMessage(String::from_utf8(name)?)),
    })
}

fn service_description(
    reader: &mut Reader<&[u8]>,
    el: &BytesStart,
    empty: bool,
) -> Result<Message, Error> {
    let attrs = Attrs::read("ServiceDescription", el)?;
    let mut features = SupportedFeatures::default();

    if !empty {
        walk_children(reader, b"ServiceDescription", |reader, child, child_empty| {
            if child.local_name().as_ref() != b"SupportedFeatures" || child_empty {
                return Ok(());
            }

            walk_children(reader, b"SupportedFeatures", |_, feature, _| {
                match feature.local_name().as_ref() {
                    b"FeatureBoardForecast" => features.board_forecast = true,
                    b"FeatureCheckAliveResponse" => features.check_alive_response = true,
                    b"FeatureQueryBoardInfo" => features.query_board_info = true,
                    b"FeatureSendBoardInfo" => features.send_board_info = true,
                    b"FeatureCommand" => features.command = true,
                    _ => {}
                }

                Ok(())
            })
        })?;
    }

    Ok(Message::ServiceDescription(ServiceDescription {
        machine_id: attrs.require("MachineId")?,
        lane_id: attrs.require_parse("LaneId")?,
        interface_id: attrs.string("InterfaceId"),
        version: attrs.require("Version")?,
        supported_features: features,
    }))
}

fn supervisory_service_description(
    reader: &mut Reader<&[u8]>,
    el: &BytesStart,
    empty: bool,
) -> Result<Message, Error> {
    let attrs = Attrs::read("SupervisoryServiceDescription", el)?;
    let mut features = SupervisorySupportedFeatures::default();

    if !empty {
        walk_children(
            reader,
            b"SupervisoryServiceDescription",
            |reader, child, child_empty| {
                if child.local_name().as_ref() != b"SupportedFeatures" || child_empty {
                    return Ok(());
                }

                walk_children(reader, b"SupportedFeatures", |_, feature, _| {
                    match feature.local_name().as_ref() {
                        b"FeatureConfiguration" => features.configuration = true,
                        b"FeatureCheckAliveResponse" => features.check_alive_response = true,
                        b"FeatureBoardTracking" => features.board_tracking = true,
                        b"FeatureQueryWorkOrderInfo" => features.query_work_order_info = true,
                        b"FeatureSendWorkOrderInfo" => features.send_work_order_info = true,
                        _ => {}
                    }

                    Ok(())
                })
            },
        )?;
    }

    Ok(Message::SupervisoryServiceDescription(
        SupervisoryServiceDescription {
            system_id: attrs.require("SystemId")?,
            version: attrs.require("Version")?,
            supported_features: features,
        },
    ))
}

fn send_hermes_capabilities(reader: &mut Reader<&[u8]>, empty: bool) -> Result<Message, Error> {
    let mut versions = Vec::new();

    if !empty {
        walk_children(
            reader,
            b"SendHermesCapabilities",
            |reader, child, child_empty| {
                if child.local_name().as_ref() != b"SupportedHermesVersions" || child_empty {
                    return Ok(());
                }

                walk_children(reader, b"SupportedHermesVersions", |_, version, _| {
                    if version.local_name().as_ref() == b"HermesVersion" {
                        let attrs = Attrs::read("HermesVersion", version)?;
                        versions.push(attrs.require("Version")?);
                    }

                    Ok(())
                })
            },
        )?;
    }

    Ok(Message::SendHermesCapabilities(SendHermesCapabilities {
        versions,
    }))
}

type LaneConfigurations = (Vec<UpstreamConfiguration>, Vec<DownstreamConfiguration>);

fn lane_configurations(
    reader: &mut Reader<&[u8]>,
    parent: &'static [u8],
    empty: bool,
) -> Result<LaneConfigurations, Error> {
    let mut upstream = Vec::new();
    let mut downstream = Vec::new();

    if empty {
        return Ok((upstream, downstream));
    }

    walk_children(reader, parent, |reader, child, child_empty| {
        match child.local_name().as_ref() {
            b"UpstreamConfigurations" if !child_empty => {
                walk_children(reader, b"UpstreamConfigurations", |_, item, _| {
                    if item.local_name().as_ref() == b"UpstreamConfiguration" {
                        let attrs = Attrs::read("UpstreamConfiguration", item)?;
                        upstream.push(UpstreamConfiguration {
                            upstream_lane_id: attrs.require_parse("UpstreamLaneId")?,
                            upstream_interface_id: attrs.string("UpstreamInterfaceId"),
                            host_address: attrs.require("HostAddress")?,
                            port: attrs.require_parse("Port")?,
                        });
                    }

                    Ok(())
                })
            }
            b"DownstreamConfigurations" if !child_empty => {
                walk_children(reader, b"DownstreamConfigurations", |_, item, _| {
                    if item.local_name().as_ref() == b"DownstreamConfiguration" {
                        let attrs = Attrs::read("DownstreamConfiguration", item)?;
                        downstream.push(DownstreamConfiguration {
                            downstream_lane_id: attrs.require_parse("DownstreamLaneId")?,
                            downstream_interface_id: attrs.string("DownstreamInterfaceId"),
                            client_address: attrs.string("ClientAddress"),
                            port: attrs.require_parse("Port")?,
                        });
                    }

                    Ok(())
                })
            }
            _ => Ok(()),
        }
    })?;

    Ok((upstream, downstream))
}

/// Iterates the direct children of the element named `parent`, calling
/// back with each child element and whether it was self-closing.
/// Children the callback does not descend into are skipped whole.
fn walk_children(
    reader: &mut Reader<&[u8]>,
    parent: &'static [u8],
    mut on_child: impl FnMut(&mut Reader<&[u8]>, &BytesStart, bool) -> Result<(), Error>,
) -> Result<(), Error> {
    loop {
        match next(reader)? {
            Event::Comment(_) | Event::Text(_) => continue,
            Event::Empty(child) => on_child(reader, &child.into_owned(), true)?,
            Event::Start(child) => {
                let child = child.into_owned();
                let before = reader.buffer_position();
                on_child(reader, &child, false)?;

                // A callback that did not consume the child leaves its
                // subtree pending; skip it to stay aligned.
                if reader.buffer_position() == before {
                    reader
                        .read_to_end(child.name())
                        .map_err(|it| Error::Malformed(it.to_string()))?;
                }
            }
            Event::End(el) if el.local_name().as_ref() == parent => return Ok(()),
            Event::End(_) => continue,
            Event::Eof => {
                return Err(Error::Malformed(format!(
                    "unterminated element: {}",
                    String::from_utf8_lossy(parent)
                )));
            }
            _ => continue,
        }
    }
}

struct Attrs {
    message: &'static str,
    values: Vec<(String, String)>,
}

impl Attrs {
    fn read(message: &'static str, el: &BytesStart) -> Result<Self, Error> {
        let mut values = Vec::new();

        for attr in el.attributes() {
            let attr = attr?;
            let key = String::from_utf8(attr.key.as_ref().to_vec())?;
            let value = attr
                .unescape_value()
                .map_err(|it| Error::Malformed(it.to_string()))?
                .into_owned();
            values.push((key, value));
        }

        Ok(Self { message, values })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn string(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_string)
    }

    fn require(&self, attribute: &'static str) -> Result<String, Error> {
        self.get(attribute)
            .map(str::to_string)
            .ok_or(Error::InvalidAttribute {
                message: self.message,
                attribute,
            })
    }

    fn parse<T: FromStr>(&self, attribute: &'static str) -> Result<Option<T>, Error> {
        match self.get(attribute) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| Error::InvalidAttribute {
                message: self.message,
                attribute,
            }),
        }
    }

    fn require_parse<T: FromStr>(&self, attribute: &'static str) -> Result<T, Error> {
        self.parse(attribute)?.ok_or(Error::InvalidAttribute {
            message: self.message,
            attribute,
        })
    }

    fn enumeration<T>(&self, attribute: &'static str) -> Result<Option<T>, Error>
    where
        T: TryFromPrimitive<Primitive = u32>,
    {
        match self.parse::<u32>(attribute)? {
            None => Ok(None),
            Some(value) => T::try_from_primitive(value)
                .map(Some)
                .map_err(|_| Error::InvalidAttribute {
                    message: self.message,
                    attribute,
                }),
        }
    }

    fn require_enumeration<T>(&self, attribute: &'static str) -> Result<T, Error>
    where
        T: TryFromPrimitive<Primitive = u32>,
    {
        self.enumeration(attribute)?.ok_or(Error::InvalidAttribute {
            message: self.message,
            attribute,
        })
    }

    fn board(&self) -> Result<BoardDescription, Error> {
        Ok(BoardDescription {
            product_type_id: self.string("ProductTypeId"),
            top_barcode: self.string("TopBarcode"),
            bottom_barcode: self.string("BottomBarcode"),
            length: self.parse("Length")?,
            width: self.parse("Width")?,
            thickness: self.parse("Thickness")?,
            conveyor_speed: self.parse("ConveyorSpeed")?,
            top_clearance_height: self.parse("TopClearanceHeight")?,
            bottom_clearance_height: self.parse("BottomClearanceHeight")?,
            weight: self.parse("Weight")?,
            work_order_id: self.string("WorkOrderId"),
            batch_id: self.string("BatchId"),
        })
    }
}
