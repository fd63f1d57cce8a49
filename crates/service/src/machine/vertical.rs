//! The supervisory state machine, shared by both ends of the vertical
//! channel. The handshake mirrors the lane roles (service description
//! first, each way); once CONNECTED, the full supervisory message set
//! is open.

use crate::{
    CheckAliveResponseMode, ErrorKind, PeerInfo, SessionError, SessionId, TraceKind,
    VerticalClientSettings, VerticalObserver, VerticalServiceSettings, VerticalState,
    machine::{Actions, Machine},
    session::Lifecycle,
};

use codec::message::{
    CheckAlive, CheckAliveType, Message, Notification, NotificationCode, Severity,
    SupervisoryServiceDescription, SupervisorySupportedFeatures,
};

use std::sync::Arc;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerticalRole {
    /// Station side: accepts supervisors, waits for their description.
    Service,
    /// Supervisor side: connects and describes itself first.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Accept(Option<VerticalState>),
    Reject,
}

use Verdict::{Accept, Reject};

/// Whether a message belongs to the vertical channel at all.
fn vertical_channel(message: &Message) -> bool {
    matches!(
        message,
        Message::SupervisoryServiceDescription(_)
            | Message::BoardArrived(_)
            | Message::BoardDeparted(_)
            | Message::QueryWorkOrderInfo(_)
            | Message::SendWorkOrderInfo(_)
            | Message::ReplyWorkOrderInfo(_)
            | Message::QueryHermesCapabilities
            | Message::SendHermesCapabilities(_)
            | Message::GetConfiguration
            | Message::SetConfiguration(_)
            | Message::CurrentConfiguration(_)
            | Message::Notification(_)
            | Message::CheckAlive(_)
    )
}

pub(crate) fn incoming(role: VerticalRole, state: VerticalState, message: &Message) -> Verdict {
    match message {
        Message::Notification(_) | Message::CheckAlive(_) => Accept(None),
        Message::SupervisoryServiceDescription(_) => match state {
            // The peer described itself; on the service side our own
            // description is still outstanding.
            VerticalState::SocketConnected => Accept(Some(match role {
                VerticalRole::Service => VerticalState::ServiceDescription,
                VerticalRole::Client => VerticalState::Connected,
            })),
            VerticalState::ServiceDescription if role == VerticalRole::Client => {
                Accept(Some(VerticalState::Connected))
            }
            _ => Reject,
        },
        // Supervisor-originated traffic, received by the station.
        Message::SendWorkOrderInfo(_)
        | Message::GetConfiguration
        | Message::SetConfiguration(_)
        | Message::QueryHermesCapabilities => match (role, state) {
            (VerticalRole::Service, VerticalState::Connected) => Accept(None),
            _ => Reject,
        },
        // Station-originated traffic, received by the supervisor.
        Message::BoardArrived(_)
        | Message::BoardDeparted(_)
        | Message::QueryWorkOrderInfo(_)
        | Message::ReplyWorkOrderInfo(_)
        | Message::SendHermesCapabilities(_)
        | Message::CurrentConfiguration(_) => match (role, state) {
            (VerticalRole::Client, VerticalState::Connected) => Accept(None),
            _ => Reject,
        },
        _ => Reject,
    }
}

pub(crate) fn outgoing(role: VerticalRole, state: VerticalState, message: &Message) -> Verdict {
    match message {
        Message::Notification(_) | Message::CheckAlive(_) => Accept(None),
        Message::SupervisoryServiceDescription(_) => match (role, state) {
            (VerticalRole::Client, VerticalState::SocketConnected) => {
                Accept(Some(VerticalState::ServiceDescription))
            }
            // The service answers once the peer has described itself.
            (VerticalRole::Service, VerticalState::ServiceDescription) => {
                Accept(Some(VerticalState::Connected))
            }
            _ => Reject,
        },
        Message::BoardArrived(_)
        | Message::BoardDeparted(_)
        | Message::QueryWorkOrderInfo(_)
        | Message::ReplyWorkOrderInfo(_)
        | Message::SendHermesCapabilities(_)
        | Message::CurrentConfiguration(_) => match (role, state) {
            (VerticalRole::Service, VerticalState::Connected) => Accept(None),
            _ => Reject,
        },
        Message::SendWorkOrderInfo(_)
        | Message::GetConfiguration
        | Message::SetConfiguration(_)
        | Message::QueryHermesCapabilities => match (role, state) {
            (VerticalRole::Client, VerticalState::Connected) => Accept(None),
            _ => Reject,
        },
        _ => Reject,
    }
}

pub(crate) struct VerticalMachine {
    role: VerticalRole,
    state: VerticalState,
    system_id: String,
    supported_features: SupervisorySupportedFeatures,
    response_mode: CheckAliveResponseMode,
    observer: Arc<dyn VerticalObserver>,
    peer_description: Option<SupervisoryServiceDescription>,
    /// Service side only: tells the supervisor which sessions take
    /// board-tracking broadcasts.
    lifecycle: Option<mpsc::UnboundedSender<Lifecycle>>,
}

impl VerticalMachine {
    pub fn service(
        settings: &VerticalServiceSettings,
        observer: Arc<dyn VerticalObserver>,
        lifecycle: mpsc::UnboundedSender<Lifecycle>,
    ) -> Self {
        Self {
            role: VerticalRole::Service,
            state: VerticalState::NotConnected,
            system_id: settings.system_id.clone(),
            supported_features: settings.supported_features,
            response_mode: settings.check_alive_response_mode,
            observer,
            peer_description: None,
            lifecycle: Some(lifecycle),
        }
    }

    pub fn client(settings: &VerticalClientSettings, observer: Arc<dyn VerticalObserver>) -> Self {
        Self {
            role: VerticalRole::Client,
            state: VerticalState::NotConnected,
            system_id: settings.system_id.clone(),
            supported_features: settings.supported_features,
            response_mode: settings.check_alive_response_mode,
            observer,
            peer_description: None,
            lifecycle: None,
        }
    }

    fn set_state(&mut self, id: SessionId, state: VerticalState) {
        if self.state != state {
            self.state = state;
            self.observer.on_state(id, state);
        }
    }

    fn description(&self) -> Message {
        Message::SupervisoryServiceDescription(SupervisoryServiceDescription {
            system_id: self.system_id.clone(),
            version: codec::message::handover::HERMES_VERSION.to_string(),
            supported_features: self.supported_features,
        })
    }
}

impl Machine for VerticalMachine {
    fn connected(&mut self, id: SessionId, peer: &PeerInfo, actions: &mut Actions) {
        self.state = VerticalState::SocketConnected;
        self.observer.on_connected(id, self.state, peer);

        if self.role == VerticalRole::Client {
            actions.send(self.description());
        }
    }

    fn incoming(&mut self, id: SessionId, message: Message, actions: &mut Actions) {
        if !vertical_channel(&message) {
            let text = format!("unhandled message: {}", message.name());
            self.observer.on_trace(id, TraceKind::Warning, &text);
            actions.send(Message::Notification(Notification::new(
                NotificationCode::ProtocolError,
                Severity::Warning,
                text,
            )));
            return;
        }

        if let Message::CheckAlive(it) = &message
            && it.r#type == Some(CheckAliveType::Ping)
            && self.response_mode == CheckAliveResponseMode::Auto
        {
            actions.send(Message::CheckAlive(CheckAlive {
                r#type: Some(CheckAliveType::Pong),
                id: it.id.clone(),
            }));
        }

        match incoming(self.role, self.state, &message) {
            Accept(next) => {
                if let Message::SupervisoryServiceDescription(it) = &message {
                    self.peer_description = Some(it.clone());

                    if let Some(lifecycle) = &self.lifecycle {
                        let _ = lifecycle.send(Lifecycle::Described {
                            id,
                            board_tracking: it.supported_features.board_tracking,
                        });

                        // The station acknowledges with its own
                        // description right away.
                        actions.send(self.description());
                    }
                }

                if let Some(next) = next {
                    self.set_state(id, next);
                }

                self.observer.on_message(id, self.state, &message);
            }
            Reject => {
                let text = format!("{} not allowed in {:?}", message.name(), self.state);
                self.observer.on_trace(id, TraceKind::Warning, &text);

                actions.send(Message::Notification(Notification::new(
                    NotificationCode::ProtocolError,
                    Severity::Error,
                    text.clone(),
                )));
                actions.close_error(SessionError::new(ErrorKind::PeerError, text));
            }
        }
    }

    fn outgoing(&mut self, id: SessionId, message: &Message) -> bool {
        match outgoing(self.role, self.state, message) {
            Accept(_) => true,
            Reject => {
                self.observer.on_trace(
                    id,
                    TraceKind::Warning,
                    &format!("{} not legal in {:?}, dropped", message.name(), self.state),
                );
                false
            }
        }
    }

    fn sent(&mut self, id: SessionId, message: &Message) {
        if let Accept(Some(next)) = outgoing(self.role, self.state, message) {
            self.set_state(id, next);
        }
    }

    fn corrupt(&mut self, id: SessionId, error: &codec::Error, actions: &mut Actions) {
        match error {
            codec::Error::UnknownMessage(name) => {
                let text = format!("unhandled message: {name}");
                self.observer.on_trace(id, TraceKind::Warning, &text);
                actions.send(Message::Notification(Notification::new(
                    NotificationCode::ProtocolError,
                    Severity::Warning,
                    text,
                )));
            }
            _ => {
                let text = format!("peer data does not parse: {error}");
                self.observer.on_trace(id, TraceKind::Error, &text);
                actions.send(Message::Notification(Notification::new(
                    NotificationCode::ProtocolError,
                    Severity::Error,
                    text.clone(),
                )));
                actions.close_error(SessionError::new(ErrorKind::PeerError, text));
            }
        }
    }

    fn disconnected(&mut self, id: SessionId, error: Option<SessionError>) {
        self.state = VerticalState::Disconnected;
        self.observer.on_disconnected(id, error);
    }

    fn trace(&self, id: SessionId, kind: TraceKind, text: &str) {
        self.observer.on_trace(id, kind, text);
    }

    fn peer_described(&self) -> bool {
        self.peer_description.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> Message {
        Message::SupervisoryServiceDescription(SupervisoryServiceDescription::new("SYSTEM"))
    }

    #[test]
    fn test_handshake() {
        // Client: send ours, then the peer's answer connects us.
        assert_eq!(
            outgoing(VerticalRole::Client, VerticalState::SocketConnected, &description()),
            Accept(Some(VerticalState::ServiceDescription))
        );
        assert_eq!(
            incoming(VerticalRole::Client, VerticalState::ServiceDescription, &description()),
            Accept(Some(VerticalState::Connected))
        );

        // Service: peer describes first, our answer connects.
        assert_eq!(
            incoming(VerticalRole::Service, VerticalState::SocketConnected, &description()),
            Accept(Some(VerticalState::ServiceDescription))
        );
        assert_eq!(
            outgoing(VerticalRole::Service, VerticalState::ServiceDescription, &description()),
            Accept(Some(VerticalState::Connected))
        );
    }

    #[test]
    fn test_supervisory_traffic_requires_connected() {
        let board_arrived = Message::BoardArrived(codec::message::BoardArrived {
            machine_id: "M".to_string(),
            upstream_lane_id: 1,
            upstream_interface_id: None,
            magazine_id: None,
            slot_id: None,
            board_transfer: codec::message::BoardTransfer::Transferred,
            board_id: "B1".to_string(),
            board_id_created_by: "M".to_string(),
            failed_board: codec::message::BoardQuality::Good,
            flipped_board: codec::message::FlippedBoard::TopSideUp,
            board: Default::default(),
        });

        assert_eq!(
            incoming(VerticalRole::Client, VerticalState::SocketConnected, &board_arrived),
            Reject
        );
        assert_eq!(
            incoming(VerticalRole::Client, VerticalState::Connected, &board_arrived),
            Accept(None)
        );

        // Direction matters: a station never accepts board events.
        assert_eq!(
            incoming(VerticalRole::Service, VerticalState::Connected, &board_arrived),
            Reject
        );
        assert_eq!(
            outgoing(VerticalRole::Service, VerticalState::Connected, &board_arrived),
            Accept(None)
        );

        assert_eq!(
            incoming(VerticalRole::Service, VerticalState::Connected, &Message::GetConfiguration),
            Accept(None)
        );
        assert_eq!(
            incoming(VerticalRole::Client, VerticalState::Connected, &Message::GetConfiguration),
            Reject
        );
    }
}
