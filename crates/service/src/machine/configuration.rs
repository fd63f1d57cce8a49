//! Session behaviour of the configuration service. The channel is
//! trusted and stateless: no handshake, no gating, requests answered in
//! place from the embedder's handler.

use crate::{
    ConfigurationHandler, ErrorKind, PeerInfo, SessionError, SessionId, TraceKind,
    machine::{Actions, Machine},
};

use codec::message::{
    CheckAlive, CheckAliveType, Message, Notification, NotificationCode, Severity,
};

use std::sync::Arc;

pub(crate) struct ConfigurationMachine<H> {
    handler: Arc<H>,
    peer: PeerInfo,
}

impl<H: ConfigurationHandler> ConfigurationMachine<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            peer: PeerInfo::default(),
        }
    }
}

impl<H: ConfigurationHandler> Machine for ConfigurationMachine<H> {
    fn connected(&mut self, _: SessionId, peer: &PeerInfo, _: &mut Actions) {
        self.peer = peer.clone();
    }

    fn incoming(&mut self, id: SessionId, message: Message, actions: &mut Actions) {
        match message {
            Message::GetConfiguration => {
                let configuration = self.handler.get_configuration(&self.peer);
                actions.send(Message::CurrentConfiguration(configuration));
            }
            Message::SetConfiguration(configuration) => {
                // A rejection surfaces to the client as a notification;
                // the effective configuration follows either way.
                if let Err(text) = self.handler.set_configuration(&self.peer, configuration) {
                    self.handler.on_trace(id, TraceKind::Warning, &text);
                    actions.send(Message::Notification(Notification::new(
                        NotificationCode::ConfigurationError,
                        Severity::Error,
                        text,
                    )));
                }

                let configuration = self.handler.get_configuration(&self.peer);
                actions.send(Message::CurrentConfiguration(configuration));
            }
            Message::CheckAlive(it) => {
                if it.r#type == Some(CheckAliveType::Ping) {
                    actions.send(Message::CheckAlive(CheckAlive {
                        r#type: Some(CheckAliveType::Pong),
                        id: it.id,
                    }));
                }
            }
            Message::Notification(it) => {
                self.handler.on_trace(
                    id,
                    TraceKind::Info,
                    &format!("notification from configuration client: {}", it.description),
                );
            }
            other => {
                let text = format!("{} is not a configuration request", other.name());
                self.handler.on_trace(id, TraceKind::Warning, &text);
                actions.send(Message::Notification(Notification::new(
                    NotificationCode::ProtocolError,
                    Severity::Warning,
                    text,
                )));
            }
        }
    }

    fn outgoing(&mut self, _: SessionId, _: &Message) -> bool {
        true
    }

    fn corrupt(&mut self, id: SessionId, error: &codec::Error, actions: &mut Actions) {
        let text = format!("configuration request does not parse: {error}");
        self.handler.on_trace(id, TraceKind::Error, &text);
        actions.send(Message::Notification(Notification::new(
            NotificationCode::ProtocolError,
            Severity::Error,
            text.clone(),
        )));
        actions.close_error(SessionError::new(ErrorKind::PeerError, text));
    }

    fn disconnected(&mut self, id: SessionId, error: Option<SessionError>) {
        if let Some(error) = error {
            self.handler
                .on_trace(id, TraceKind::Error, &format!("session ended: {error}"));
        }
    }

    fn trace(&self, id: SessionId, kind: TraceKind, text: &str) {
        self.handler.on_trace(id, kind, text);
    }
}
