//! The two lane state machines. Downstream is the board-sending side
//! (it originates BoardAvailable and TransportFinished), upstream the
//! board-receiving side (MachineReady, StartTransport, StopTransport).
//! The transition rules live in pure functions over (state, message) so
//! they can be tested without any IO.

use crate::{
    CheckAliveResponseMode, DownstreamSettings, ErrorKind, LaneObserver, PeerInfo, SessionError,
    SessionId, State, TraceKind, UpstreamSettings,
    machine::{Actions, Machine},
};

use codec::message::{
    CheckAlive, CheckAliveType, Message, Notification, NotificationCode, ServiceDescription,
    Severity, SupportedFeatures, TransferState,
};

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LaneRole {
    Downstream,
    Upstream,
}

/// Outcome of one (state, message) lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Legal; transition if a target state is given.
    Accept(Option<State>),
    /// Illegal in this state.
    Reject,
}

use Verdict::{Accept, Reject};

fn past_handshake(state: State) -> bool {
    !matches!(
        state,
        State::NotConnected
            | State::SocketConnected
            | State::ServiceDescriptionDownstream
            | State::ServiceDescriptionUpstream
            | State::Disconnected
    )
}

/// TransportFinished ends the cycle outright when the transfer
/// completed; an incomplete transfer parks in TransportFinished until
/// the peer stops its conveyor.
fn finished_target(state: State, transfer_state: TransferState) -> Verdict {
    match state {
        State::Transporting => Accept(Some(match transfer_state {
            TransferState::Complete => State::NotAvailableNotReady,
            _ => State::TransportFinished,
        })),
        State::TransportStopped => Accept(Some(State::NotAvailableNotReady)),
        _ => Reject,
    }
}

/// Incoming table of the downstream (board-sending) role.
pub(crate) fn incoming_downstream(state: State, message: &Message) -> Verdict {
    match message {
        // Out-of-band at any time.
        Message::Notification(_) | Message::CheckAlive(_) => Accept(None),
        Message::ServiceDescription(_) => match state {
            State::SocketConnected | State::ServiceDescriptionDownstream => {
                Accept(Some(State::NotAvailableNotReady))
            }
            _ => Reject,
        },
        Message::MachineReady(_) => match state {
            State::NotAvailableNotReady => Accept(Some(State::MachineReady)),
            State::BoardAvailable => Accept(Some(State::AvailableAndReady)),
            State::MachineReady | State::AvailableAndReady => Accept(None),
            _ => Reject,
        },
        Message::RevokeMachineReady => match state {
            State::MachineReady => Accept(Some(State::NotAvailableNotReady)),
            State::AvailableAndReady => Accept(Some(State::BoardAvailable)),
            State::SocketConnected
            | State::ServiceDescriptionDownstream
            | State::NotAvailableNotReady
            | State::BoardAvailable => Accept(None),
            _ => Reject,
        },
        Message::StartTransport(_) => match state {
            State::AvailableAndReady => Accept(Some(State::Transporting)),
            _ => Reject,
        },
        Message::StopTransport(_) => match state {
            State::AvailableAndReady | State::Transporting => Accept(Some(State::TransportStopped)),
            State::TransportFinished => Accept(Some(State::NotAvailableNotReady)),
            _ => Reject,
        },
        Message::QueryBoardInfo(_) | Message::Command(_) if past_handshake(state) => Accept(None),
        _ => Reject,
    }
}

/// Incoming table of the upstream (board-receiving) role.
pub(crate) fn incoming_upstream(state: State, message: &Message) -> Verdict {
    match message {
        Message::Notification(_) | Message::CheckAlive(_) => Accept(None),
        Message::ServiceDescription(_) => match state {
            State::SocketConnected | State::ServiceDescriptionUpstream => {
                Accept(Some(State::NotAvailableNotReady))
            }
            _ => Reject,
        },
        Message::BoardAvailable(_) => match state {
            State::NotAvailableNotReady => Accept(Some(State::BoardAvailable)),
            State::MachineReady => Accept(Some(State::AvailableAndReady)),
            State::BoardAvailable | State::AvailableAndReady => Accept(None),
            _ => Reject,
        },
        Message::RevokeBoardAvailable => match state {
            State::BoardAvailable => Accept(Some(State::NotAvailableNotReady)),
            State::AvailableAndReady => Accept(Some(State::MachineReady)),
            State::SocketConnected
            | State::ServiceDescriptionUpstream
            | State::NotAvailableNotReady
            | State::MachineReady => Accept(None),
            _ => Reject,
        },
        Message::TransportFinished(it) => finished_target(state, it.transfer_state),
        Message::BoardForecast(_) | Message::SendBoardInfo(_) | Message::Command(_)
            if past_handshake(state) =>
        {
            Accept(None)
        }
        _ => Reject,
    }
}

/// Outgoing table of the downstream role; also yields the transition
/// applied once the message hit the wire.
pub(crate) fn outgoing_downstream(state: State, message: &Message) -> Verdict {
    match message {
        Message::Notification(_) | Message::CheckAlive(_) => Accept(None),
        Message::ServiceDescription(_) => match state {
            State::SocketConnected => Accept(Some(State::ServiceDescriptionDownstream)),
            _ => Reject,
        },
        Message::BoardAvailable(_) => match state {
            State::NotAvailableNotReady => Accept(Some(State::BoardAvailable)),
            State::MachineReady => Accept(Some(State::AvailableAndReady)),
            _ => Reject,
        },
        Message::RevokeBoardAvailable => match state {
            State::BoardAvailable => Accept(Some(State::NotAvailableNotReady)),
            State::AvailableAndReady => Accept(Some(State::MachineReady)),
            _ => Reject,
        },
        Message::TransportFinished(it) => finished_target(state, it.transfer_state),
        Message::BoardForecast(_) | Message::SendBoardInfo(_) | Message::Command(_)
            if past_handshake(state) =>
        {
            Accept(None)
        }
        _ => Reject,
    }
}

/// Outgoing table of the upstream role.
pub(crate) fn outgoing_upstream(state: State, message: &Message) -> Verdict {
    match message {
        Message::Notification(_) | Message::CheckAlive(_) => Accept(None),
        Message::ServiceDescription(_) => match state {
            State::SocketConnected => Accept(Some(State::ServiceDescriptionUpstream)),
            _ => Reject,
        },
        Message::MachineReady(_) => match state {
            State::NotAvailableNotReady => Accept(Some(State::MachineReady)),
            State::BoardAvailable => Accept(Some(State::AvailableAndReady)),
            _ => Reject,
        },
        Message::RevokeMachineReady => match state {
            State::MachineReady => Accept(Some(State::NotAvailableNotReady)),
            State::AvailableAndReady => Accept(Some(State::BoardAvailable)),
            _ => Reject,
        },
        Message::StartTransport(_) => match state {
            State::AvailableAndReady => Accept(Some(State::Transporting)),
            _ => Reject,
        },
        Message::StopTransport(_) => match state {
            State::AvailableAndReady | State::Transporting => Accept(Some(State::TransportStopped)),
            State::TransportFinished => Accept(Some(State::NotAvailableNotReady)),
            _ => Reject,
        },
        Message::QueryBoardInfo(_) | Message::Command(_) if past_handshake(state) => Accept(None),
        _ => Reject,
    }
}

/// Whether a message belongs to the lane channel at all. Messages of
/// the vertical or configuration channels are not state-machine input;
/// they are answered with an unhandled-message notification and the
/// session stays up.
fn lane_channel(message: &Message) -> bool {
    matches!(
        message,
        Message::ServiceDescription(_)
            | Message::BoardAvailable(_)
            | Message::RevokeBoardAvailable
            | Message::MachineReady(_)
            | Message::RevokeMachineReady
            | Message::StartTransport(_)
            | Message::StopTransport(_)
            | Message::TransportFinished(_)
            | Message::BoardForecast(_)
            | Message::QueryBoardInfo(_)
            | Message::SendBoardInfo(_)
            | Message::Notification(_)
            | Message::CheckAlive(_)
            | Message::Command(_)
    )
}

/// The message families a role may originate at all. Handing the
/// engine a message of the opposite role is an embedding bug, not a
/// state question.
fn role_allows(role: LaneRole, message: &Message) -> bool {
    match message {
        Message::ServiceDescription(_)
        | Message::Notification(_)
        | Message::CheckAlive(_)
        | Message::Command(_) => true,
        Message::BoardAvailable(_)
        | Message::RevokeBoardAvailable
        | Message::TransportFinished(_)
        | Message::BoardForecast(_)
        | Message::SendBoardInfo(_) => role == LaneRole::Downstream,
        Message::MachineReady(_)
        | Message::RevokeMachineReady
        | Message::StartTransport(_)
        | Message::StopTransport(_)
        | Message::QueryBoardInfo(_) => role == LaneRole::Upstream,
        _ => false,
    }
}

pub(crate) struct LaneMachine {
    role: LaneRole,
    state: State,
    machine_id: String,
    lane_id: u32,
    supported_features: SupportedFeatures,
    check_state: bool,
    response_mode: CheckAliveResponseMode,
    observer: Arc<dyn LaneObserver>,
    peer_description: Option<ServiceDescription>,
}

impl LaneMachine {
    pub fn downstream(settings: &DownstreamSettings, observer: Arc<dyn LaneObserver>) -> Self {
        Self {
            role: LaneRole::Downstream,
            state: State::NotConnected,
            machine_id: settings.machine_id.clone(),
            lane_id: settings.lane_id,
            supported_features: settings.supported_features,
            check_state: settings.check_state,
            response_mode: settings.check_alive_response_mode,
            observer,
            peer_description: None,
        }
    }

    pub fn upstream(settings: &UpstreamSettings, observer: Arc<dyn LaneObserver>) -> Self {
        Self {
            role: LaneRole::Upstream,
            state: State::NotConnected,
            machine_id: settings.machine_id.clone(),
            lane_id: settings.lane_id,
            supported_features: settings.supported_features,
            check_state: settings.check_state,
            response_mode: settings.check_alive_response_mode,
            observer,
            peer_description: None,
        }
    }

    fn set_state(&mut self, id: SessionId, state: State) {
        if self.state != state {
            self.state = state;
            self.observer.on_state(id, state);
        }
    }

    fn incoming_verdict(&self, message: &Message) -> Verdict {
        match self.role {
            LaneRole::Downstream => incoming_downstream(self.state, message),
            LaneRole::Upstream => incoming_upstream(self.state, message),
        }
    }

    fn outgoing_verdict(&self, message: &Message) -> Verdict {
        match self.role {
            LaneRole::Downstream => outgoing_downstream(self.state, message),
            LaneRole::Upstream => outgoing_upstream(self.state, message),
        }
    }
}

impl Machine for LaneMachine {
    fn connected(&mut self, id: SessionId, peer: &PeerInfo, actions: &mut Actions) {
        self.state = State::SocketConnected;
        self.observer.on_connected(id, self.state, peer);

        // The very first message on the wire is our service
        // description.
        actions.send(Message::ServiceDescription(ServiceDescription {
            machine_id: self.machine_id.clone(),
            lane_id: self.lane_id,
            interface_id: None,
            version: codec::message::handover::HERMES_VERSION.to_string(),
            supported_features: self.supported_features,
        }));
    }

    fn incoming(&mut self, id: SessionId, message: Message, actions: &mut Actions) {
        if !lane_channel(&message) {
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

        match self.incoming_verdict(&message) {
            Accept(next) => {
                if let Message::ServiceDescription(it) = &message {
                    self.peer_description = Some(it.clone());
                }

                if let Some(next) = next {
                    self.set_state(id, next);
                }

                self.observer.on_message(id, self.state, &message);
            }
            Reject if !self.check_state => {
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
        if !role_allows(self.role, message) {
            self.observer.on_trace(
                id,
                TraceKind::Warning,
                &format!(
                    "{} is not part of this role's message set, dropped",
                    message.name()
                ),
            );
            return false;
        }

        if !self.check_state {
            return true;
        }

        match self.outgoing_verdict(message) {
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
        if let Accept(Some(next)) = self.outgoing_verdict(message) {
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
        self.state = State::Disconnected;
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

    use codec::message::{BoardAvailable, MachineReady, StartTransport, TransportFinished};

    fn board_available() -> Message {
        Message::BoardAvailable(BoardAvailable::new("B1", "MACHINE-1"))
    }

    fn machine_ready() -> Message {
        Message::MachineReady(MachineReady::default())
    }

    fn start_transport() -> Message {
        Message::StartTransport(StartTransport {
            board_id: "B1".to_string(),
            conveyor_speed: None,
        })
    }

    fn transport_finished(transfer_state: TransferState) -> Message {
        Message::TransportFinished(TransportFinished {
            transfer_state,
            board_id: "B1".to_string(),
        })
    }

    #[test]
    fn test_happy_path_tables() {
        // Downstream walks the sender half of the handover.
        let mut state = State::SocketConnected;
        for (verdict, expected) in [
            (
                outgoing_downstream(
                    state,
                    &Message::ServiceDescription(ServiceDescription::new("M", 0)),
                ),
                State::ServiceDescriptionDownstream,
            ),
            (
                incoming_downstream(
                    State::ServiceDescriptionDownstream,
                    &Message::ServiceDescription(ServiceDescription::new("P", 0)),
                ),
                State::NotAvailableNotReady,
            ),
        ] {
            let Accept(Some(next)) = verdict else {
                panic!("expected transition from {state:?}");
            };
            assert_eq!(next, expected);
            state = next;
        }

        assert_eq!(
            outgoing_downstream(State::NotAvailableNotReady, &board_available()),
            Accept(Some(State::BoardAvailable))
        );
        assert_eq!(
            incoming_downstream(State::BoardAvailable, &machine_ready()),
            Accept(Some(State::AvailableAndReady))
        );
        assert_eq!(
            incoming_downstream(State::AvailableAndReady, &start_transport()),
            Accept(Some(State::Transporting))
        );
        assert_eq!(
            outgoing_downstream(
                State::Transporting,
                &transport_finished(TransferState::Complete)
            ),
            Accept(Some(State::NotAvailableNotReady))
        );

        // Upstream mirrors it on the receiving half.
        assert_eq!(
            incoming_upstream(State::NotAvailableNotReady, &board_available()),
            Accept(Some(State::BoardAvailable))
        );
        assert_eq!(
            outgoing_upstream(State::BoardAvailable, &machine_ready()),
            Accept(Some(State::AvailableAndReady))
        );
        assert_eq!(
            outgoing_upstream(State::AvailableAndReady, &start_transport()),
            Accept(Some(State::Transporting))
        );
        assert_eq!(
            incoming_upstream(
                State::Transporting,
                &transport_finished(TransferState::Complete)
            ),
            Accept(Some(State::NotAvailableNotReady))
        );
    }

    #[test]
    fn test_incomplete_transfer_waits_for_stop() {
        assert_eq!(
            incoming_upstream(
                State::Transporting,
                &transport_finished(TransferState::Incomplete)
            ),
            Accept(Some(State::TransportFinished))
        );
        assert_eq!(
            outgoing_upstream(
                State::TransportFinished,
                &Message::StopTransport(codec::message::StopTransport {
                    transfer_state: TransferState::Incomplete,
                    board_id: "B1".to_string(),
                })
            ),
            Accept(Some(State::NotAvailableNotReady))
        );
    }

    #[test]
    fn test_rejects_out_of_state_messages() {
        // The handshake admits nothing but the service description.
        assert_eq!(
            incoming_downstream(State::SocketConnected, &machine_ready()),
            Reject
        );
        assert_eq!(
            incoming_downstream(State::SocketConnected, &start_transport()),
            Reject
        );
        assert_eq!(
            incoming_upstream(State::SocketConnected, &board_available()),
            Reject
        );

        // A second service description is a violation.
        assert_eq!(
            incoming_downstream(
                State::NotAvailableNotReady,
                &Message::ServiceDescription(ServiceDescription::new("P", 0)),
            ),
            Reject
        );

        // Nothing but stop/finish moves while transporting.
        assert_eq!(
            incoming_downstream(State::Transporting, &machine_ready()),
            Reject
        );
        assert_eq!(
            incoming_upstream(State::Transporting, &board_available()),
            Reject
        );
    }

    #[test]
    fn test_benign_revokes_are_ignored() {
        assert_eq!(
            incoming_downstream(State::NotAvailableNotReady, &Message::RevokeMachineReady),
            Accept(None)
        );
        assert_eq!(
            incoming_downstream(State::AvailableAndReady, &Message::RevokeMachineReady),
            Accept(Some(State::BoardAvailable))
        );
        assert_eq!(
            incoming_upstream(State::AvailableAndReady, &Message::RevokeBoardAvailable),
            Accept(Some(State::MachineReady))
        );
    }

    #[test]
    fn test_role_gating() {
        // A downstream endpoint never originates MachineReady, no
        // matter the state.
        assert!(!role_allows(LaneRole::Downstream, &machine_ready()));
        assert!(!role_allows(LaneRole::Downstream, &start_transport()));
        assert!(!role_allows(LaneRole::Upstream, &board_available()));
        assert!(role_allows(LaneRole::Downstream, &board_available()));
        assert!(role_allows(
            LaneRole::Upstream,
            &Message::CheckAlive(CheckAlive::default())
        ));

        // Messages of other channels are not lane messages at all.
        assert!(!role_allows(LaneRole::Downstream, &Message::GetConfiguration));
    }

    #[test]
    fn test_check_alive_any_state() {
        for state in [
            State::SocketConnected,
            State::NotAvailableNotReady,
            State::Transporting,
        ] {
            assert_eq!(
                incoming_downstream(state, &Message::CheckAlive(CheckAlive::default())),
                Accept(None)
            );
        }
    }
}
