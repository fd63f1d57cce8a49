//! The upstream lane endpoint: the board-receiving side of a lane,
//! actively connecting to its upstream neighbour and reconnecting for
//! as long as it stays enabled. Recovery is fast (one second) when the
//! vanished peer had completed its handshake, and patient otherwise.

use crate::{
    PeerInfo, SessionId, TraceKind, UpstreamSettings,
    machine::lane::LaneMachine,
    net, secs,
    session::{self, Lifecycle, Outbound, SessionHandle},
};

use codec::message::{Message, Notification, NotificationCode, Severity};

use std::sync::Arc;

use tokio::{net::TcpStream, sync::mpsc, time::Instant};

const QUICK_RECONNECT_SECS: f64 = 1.0;

enum Command {
    Enable(UpstreamSettings),
    Disable(Notification),
    Reset(Option<Notification>),
    Signal(SessionId, Message),
    #[cfg(feature = "raw-xml")]
    SignalRaw(SessionId, String),
    #[cfg(feature = "raw-xml")]
    ResetRaw(String),
    Post(Box<dyn FnOnce() + Send>),
    Stop,
}

enum Attempt {
    Connected {
        id: SessionId,
        stream: TcpStream,
        peer: PeerInfo,
    },
    Failed {
        id: SessionId,
    },
}

#[derive(Clone)]
pub struct Upstream {
    sender: mpsc::UnboundedSender<Command>,
}

impl Upstream {
    pub fn spawn(observer: impl crate::LaneObserver) -> Self {
        let (sender, commands) = mpsc::unbounded_channel();
        tokio::spawn(Supervisor::new(Arc::new(observer), commands).run());
        Self { sender }
    }

    fn command(&self, command: Command) {
        if self.sender.send(command).is_err() {
            log::warn!("upstream endpoint already stopped");
        }
    }

    pub fn enable(&self, settings: UpstreamSettings) {
        self.command(Command::Enable(settings));
    }

    pub fn disable(&self, notification: Notification) {
        self.command(Command::Disable(notification));
    }

    /// Drops the current session (after an optional farewell) and
    /// reconnects shortly after.
    pub fn reset(&self, notification: Option<Notification>) {
        self.command(Command::Reset(notification));
    }

    pub fn signal(&self, session: SessionId, message: Message) {
        self.command(Command::Signal(session, message));
    }

    #[cfg(feature = "raw-xml")]
    pub fn signal_raw(&self, session: SessionId, document: String) {
        self.command(Command::SignalRaw(session, document));
    }

    #[cfg(feature = "raw-xml")]
    pub fn reset_raw(&self, document: String) {
        self.command(Command::ResetRaw(document));
    }

    pub fn post(&self, work: impl FnOnce() + Send + 'static) {
        self.command(Command::Post(Box::new(work)));
    }

    pub fn stop(&self) {
        self.command(Command::Stop);
    }
}

struct Supervisor {
    observer: Arc<dyn crate::LaneObserver>,
    commands: mpsc::UnboundedReceiver<Command>,
    lifecycle_tx: mpsc::UnboundedSender<Lifecycle>,
    lifecycle_rx: mpsc::UnboundedReceiver<Lifecycle>,
    attempts_tx: mpsc::UnboundedSender<Attempt>,
    attempts_rx: mpsc::UnboundedReceiver<Attempt>,
    settings: Option<UpstreamSettings>,
    enabled: bool,
    session: Option<SessionHandle>,
    pending_attempt: Option<SessionId>,
    connect_at: Option<Instant>,
    session_id: SessionId,
}

impl Supervisor {
    fn new(
        observer: Arc<dyn crate::LaneObserver>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
        Self {
            observer,
            commands,
            lifecycle_tx,
            lifecycle_rx,
            attempts_tx,
            attempts_rx,
            settings: None,
            enabled: false,
            session: None,
            pending_attempt: None,
            connect_at: None,
            session_id: 1,
        }
    }

    async fn run(mut self) {
        self.observer.on_trace(0, TraceKind::Info, "created");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        self.teardown(None);
                        break;
                    }
                    Some(Command::Stop) => {
                        self.teardown(Some(Notification::new(
                            NotificationCode::MachineShutdown,
                            Severity::Info,
                            "upstream endpoint stopped by application",
                        )));
                        break;
                    }
                    Some(command) => self.handle(command),
                },
                notice = self.lifecycle_rx.recv() => {
                    if let Some(Lifecycle::Ended { id, peer_described }) = notice {
                        self.session_ended(id, peer_described);
                    }
                },
                attempt = self.attempts_rx.recv() => {
                    if let Some(attempt) = attempt {
                        self.attempt_finished(attempt);
                    }
                },
                _ = net::sleep_until_opt(self.connect_at) => {
                    self.connect_at = None;
                    self.connect();
                },
            }
        }

        self.observer.on_trace(0, TraceKind::Info, "stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enable(settings) => self.enable(settings),
            Command::Disable(notification) => {
                if self.enabled {
                    self.enabled = false;
                    self.connect_at = None;
                    self.pending_attempt = None;
                    self.teardown(Some(notification));
                }
            }
            Command::Reset(notification) => {
                self.teardown(notification);
                self.reconnect_after(QUICK_RECONNECT_SECS);
            }
            Command::Signal(id, message) => self.signal(id, Outbound::Message(message)),
            #[cfg(feature = "raw-xml")]
            Command::SignalRaw(id, document) => {
                let gate = crate::downstream::raw_gate(&document);
                self.signal(id, Outbound::Raw { gate, document });
            }
            #[cfg(feature = "raw-xml")]
            Command::ResetRaw(document) => {
                if let Some(session) = &self.session
                    && !document.is_empty()
                {
                    session.signal(Outbound::Raw {
                        gate: crate::downstream::raw_gate(&document),
                        document,
                    });
                }

                self.teardown(None);
                self.reconnect_after(QUICK_RECONNECT_SECS);
            }
            Command::Post(work) => work(),
            Command::Stop => {}
        }
    }

    fn enable(&mut self, settings: UpstreamSettings) {
        if self.enabled && self.settings.as_ref() == Some(&settings) {
            log::info!("upstream enable with unchanged settings: lane={}", settings.lane_id);
            return;
        }

        self.teardown(Some(Notification::new(
            NotificationCode::ConnectionResetBecauseOfChangedConfiguration,
            Severity::Info,
            "configuration changed",
        )));

        self.enabled = true;
        self.settings = Some(settings);
        self.pending_attempt = None;
        self.connect_at = None;
        self.connect();
    }

    /// Launches one connect attempt with a fresh session id; failure
    /// comes back through the attempt channel.
    fn connect(&mut self) {
        if !self.enabled || self.session.is_some() || self.pending_attempt.is_some() {
            return;
        }

        let Some(settings) = &self.settings else {
            return;
        };

        let host = settings.host.clone();
        let port = settings.effective_port();
        let id = self.take_session_id();
        self.pending_attempt = Some(id);

        let observer = self.observer.clone();
        let attempts = self.attempts_tx.clone();
        tokio::spawn(async move {
            observer.on_trace(id, TraceKind::Debug, &format!("connecting to {host}:{port}"));

            let attempt = match net::connect(&host, port).await {
                Ok((stream, peer)) => Attempt::Connected { id, stream, peer },
                Err(error) => {
                    log::warn!("lane connect failed: session={id}, err={error}");
                    observer.on_trace(id, TraceKind::Error, &error.text);
                    Attempt::Failed { id }
                }
            };

            let _ = attempts.send(attempt);
        });
    }

    fn attempt_finished(&mut self, attempt: Attempt) {
        match attempt {
            Attempt::Connected { id, stream, peer } => {
                if self.pending_attempt != Some(id) {
                    return;
                }

                self.pending_attempt = None;

                let Some(settings) = &self.settings else {
                    return;
                };

                // Disabled while the attempt was in flight; dropping
                // the stream closes it.
                if !self.enabled || self.session.is_some() {
                    return;
                }

                let machine = LaneMachine::upstream(settings, self.observer.clone());
                self.session = Some(session::spawn(
                    id,
                    stream,
                    peer,
                    secs(settings.check_alive_period_secs),
                    machine,
                    self.lifecycle_tx.clone(),
                ));
            }
            Attempt::Failed { id } => {
                if self.pending_attempt != Some(id) {
                    return;
                }

                self.pending_attempt = None;

                if let Some(settings) = &self.settings {
                    self.reconnect_after(settings.reconnect_wait_secs);
                }
            }
        }
    }

    fn session_ended(&mut self, id: SessionId, peer_described: bool) {
        if !self.session.as_ref().is_some_and(|it| it.id == id) {
            return;
        }

        self.session = None;

        // A peer that had completed its handshake is a known-good
        // partner; try again quickly.
        self.reconnect_after(if peer_described {
            QUICK_RECONNECT_SECS
        } else {
            self.settings
                .as_ref()
                .map(|it| it.reconnect_wait_secs)
                .unwrap_or(QUICK_RECONNECT_SECS)
        });
    }

    fn reconnect_after(&mut self, delay_secs: f64) {
        if self.enabled {
            self.connect_at = Some(Instant::now() + secs(delay_secs));
        }
    }

    fn teardown(&mut self, notification: Option<Notification>) {
        if let Some(session) = self.session.take() {
            session.farewell(notification);
        }
    }

    fn signal(&mut self, id: SessionId, outbound: Outbound) {
        match &self.session {
            Some(session) if session.id == id => session.signal(outbound),
            _ => {
                log::warn!("session id no longer valid: session={id}");
                self.observer
                    .on_trace(id, TraceKind::Warning, "session id no longer valid");
            }
        }
    }

    fn take_session_id(&mut self) -> SessionId {
        let id = self.session_id;
        self.session_id = self.session_id.checked_add(1).unwrap_or(1);
        id
    }
}
