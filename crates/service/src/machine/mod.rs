//! Role state machines. A machine decides, for every inbound and
//! outbound message, whether it passes, what state it leads to and
//! which events the application sees. Machines run strictly inside
//! their session task and hold no locks.

pub(crate) mod configuration;
pub(crate) mod lane;
pub(crate) mod vertical;

use crate::{PeerInfo, SessionError, SessionId, TraceKind};

use codec::message::Message;

/// What a machine wants done on the wire as the result of one input.
/// The session task drains `send` in order, then honours `close`.
#[derive(Default)]
pub(crate) struct Actions {
    pub send: Vec<Message>,
    pub close: Option<Close>,
}

pub(crate) enum Close {
    /// Orderly shutdown; the peer sees a clean end of stream and the
    /// application an empty error.
    Clean,
    /// Shutdown caused by a fault; reported through `on_disconnected`.
    Error(SessionError),
}

impl Actions {
    pub fn send(&mut self, message: Message) {
        self.send.push(message);
    }

    pub fn close_clean(&mut self) {
        self.close.get_or_insert(Close::Clean);
    }

    pub fn close_error(&mut self, error: SessionError) {
        self.close.get_or_insert(Close::Error(error));
    }
}

pub(crate) trait Machine: Send + 'static {
    /// Invoked once when the socket is up, before any IO happens.
    fn connected(&mut self, id: SessionId, peer: &PeerInfo, actions: &mut Actions);

    /// One parsed inbound document.
    fn incoming(&mut self, id: SessionId, message: Message, actions: &mut Actions);

    /// Gate for application-originated messages; `false` drops the
    /// message with a trace instead of sending it.
    fn outgoing(&mut self, id: SessionId, message: &Message) -> bool;

    /// Invoked after a message was written, for transitions keyed on
    /// our own sends.
    #[allow(unused_variables)]
    fn sent(&mut self, id: SessionId, message: &Message) {}

    /// Inbound bytes that did not yield a message.
    fn corrupt(&mut self, id: SessionId, error: &codec::Error, actions: &mut Actions);

    /// The single end-of-session event. The session task guarantees
    /// exactly one call, after which the machine is dropped.
    fn disconnected(&mut self, id: SessionId, error: Option<SessionError>);

    /// Advisory trace fan-out.
    fn trace(&self, id: SessionId, kind: TraceKind, text: &str);

    /// Whether the peer completed its service description; supervisors
    /// pick the reconnect delay from it.
    fn peer_described(&self) -> bool {
        false
    }
}
