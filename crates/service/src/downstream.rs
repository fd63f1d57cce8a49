//! The downstream lane endpoint: the board-sending side of a lane,
//! accepting its downstream neighbour on `BASE_PORT + lane_id`. At
//! most one session is live; later connection attempts are refused
//! while it stands.

use crate::{
    DownstreamSettings, LaneObserver, SessionId, TraceKind,
    machine::lane::LaneMachine,
    net::{self, PeerCheck},
    secs,
    session::{self, Lifecycle, Outbound, SessionHandle},
};

use codec::message::{CheckAlive, Message, Notification, NotificationCode, Severity};

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::Instant,
};

enum Command {
    Enable(DownstreamSettings),
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

/// Cheap handle onto the endpoint task. Dropping it does not stop the
/// endpoint; call [`Downstream::stop`] for an orderly shutdown with
/// farewell.
#[derive(Clone)]
pub struct Downstream {
    sender: mpsc::UnboundedSender<Command>,
}

impl Downstream {
    /// Spawns the endpoint task. It sits idle until enabled.
    pub fn spawn(observer: impl LaneObserver) -> Self {
        let (sender, commands) = mpsc::unbounded_channel();
        tokio::spawn(Supervisor::new(Arc::new(observer), commands).run());
        Self { sender }
    }

    fn command(&self, command: Command) {
        if self.sender.send(command).is_err() {
            log::warn!("downstream endpoint already stopped");
        }
    }

    /// Arms the endpoint. Re-enabling with identical settings is a
    /// no-op; changed settings reset the current session.
    pub fn enable(&self, settings: DownstreamSettings) {
        self.command(Command::Enable(settings));
    }

    /// Sends the notification on the current session and stops
    /// listening until the next enable.
    pub fn disable(&self, notification: Notification) {
        self.command(Command::Disable(notification));
    }

    /// Drops the current session (after an optional farewell) and
    /// keeps accepting.
    pub fn reset(&self, notification: Option<Notification>) {
        self.command(Command::Reset(notification));
    }

    /// Hands a message to the session, subject to role and state
    /// gating. A stale session id is traced and dropped.
    pub fn signal(&self, session: SessionId, message: Message) {
        self.command(Command::Signal(session, message));
    }

    /// Sends a pre-rendered document, gated as whatever it parses to.
    #[cfg(feature = "raw-xml")]
    pub fn signal_raw(&self, session: SessionId, document: String) {
        self.command(Command::SignalRaw(session, document));
    }

    /// Sends a pre-rendered farewell, then resets the session.
    #[cfg(feature = "raw-xml")]
    pub fn reset_raw(&self, document: String) {
        self.command(Command::ResetRaw(document));
    }

    /// Runs a closure on the endpoint task, after everything queued
    /// before it.
    pub fn post(&self, work: impl FnOnce() + Send + 'static) {
        self.command(Command::Post(Box::new(work)));
    }

    /// Farewells the session with MACHINE_SHUTDOWN and ends the
    /// endpoint task.
    pub fn stop(&self) {
        self.command(Command::Stop);
    }
}

struct Supervisor {
    observer: Arc<dyn LaneObserver>,
    commands: mpsc::UnboundedReceiver<Command>,
    lifecycle_tx: mpsc::UnboundedSender<Lifecycle>,
    lifecycle_rx: mpsc::UnboundedReceiver<Lifecycle>,
    settings: Option<DownstreamSettings>,
    enabled: bool,
    listener: Option<TcpListener>,
    rebind_at: Option<Instant>,
    session: Option<SessionHandle>,
    session_id: SessionId,
}

impl Supervisor {
    fn new(observer: Arc<dyn LaneObserver>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        Self {
            observer,
            commands,
            lifecycle_tx,
            lifecycle_rx,
            settings: None,
            enabled: false,
            listener: None,
            rebind_at: None,
            session: None,
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
                            "downstream endpoint stopped by application",
                        )));
                        break;
                    }
                    Some(command) => self.handle(command).await,
                },
                notice = self.lifecycle_rx.recv() => {
                    if let Some(Lifecycle::Ended { id, .. }) = notice
                        && self.session.as_ref().is_some_and(|it| it.id == id)
                    {
                        self.session = None;
                    }
                },
                accepted = net::accept_next(&self.listener) => match accepted {
                    Ok((stream, remote)) => self.accept(stream, remote).await,
                    Err(error) => {
                        log::error!("lane accept failed: err={error}");
                        self.observer.on_trace(0, TraceKind::Error, &format!("accept failed: {error}"));
                        self.listener = None;
                        self.schedule_rebind();
                    }
                },
                _ = net::sleep_until_opt(self.rebind_at) => {
                    self.rebind_at = None;
                    self.bind().await;
                },
            }
        }

        self.observer.on_trace(0, TraceKind::Info, "stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Enable(settings) => self.enable(settings).await,
            Command::Disable(notification) => self.disable(notification),
            Command::Reset(notification) => self.teardown(notification),
            Command::Signal(id, message) => self.signal(id, Outbound::Message(message)),
            #[cfg(feature = "raw-xml")]
            Command::SignalRaw(id, document) => {
                let gate = raw_gate(&document);
                self.signal(id, Outbound::Raw { gate, document });
            }
            #[cfg(feature = "raw-xml")]
            Command::ResetRaw(document) => {
                if let Some(session) = &self.session
                    && !document.is_empty()
                {
                    session.signal(Outbound::Raw {
                        gate: raw_gate(&document),
                        document,
                    });
                }

                self.teardown(None);
            }
            Command::Post(work) => work(),
            Command::Stop => {}
        }
    }

    async fn enable(&mut self, settings: DownstreamSettings) {
        if self.enabled && self.settings.as_ref() == Some(&settings) {
            log::info!("downstream enable with unchanged settings: lane={}", settings.lane_id);
            return;
        }

        self.teardown(Some(Notification::new(
            NotificationCode::ConnectionResetBecauseOfChangedConfiguration,
            Severity::Info,
            "configuration changed",
        )));

        let rebind = self.listener.is_none()
            || self.settings.as_ref().map(DownstreamSettings::effective_port)
                != Some(settings.effective_port());

        self.enabled = true;
        self.settings = Some(settings);

        if rebind {
            self.listener = None;
            self.rebind_at = None;
            self.bind().await;
        }
    }

    fn disable(&mut self, notification: Notification) {
        if !self.enabled {
            return;
        }

        self.enabled = false;
        self.listener = None;
        self.rebind_at = None;
        self.teardown(Some(notification));
    }

    async fn bind(&mut self) {
        let Some(settings) = &self.settings else {
            return;
        };

        if !self.enabled {
            return;
        }

        let port = settings.effective_port();
        match net::bind(port).await {
            Ok(listener) => {
                log::info!("lane endpoint listening: lane={}, port={port}", settings.lane_id);
                self.observer
                    .on_trace(0, TraceKind::Info, &format!("listening on port {port}"));
                self.listener = Some(listener);
            }
            Err(error) => {
                log::error!("lane bind failed: lane={}, err={error}", settings.lane_id);
                self.observer.on_trace(0, TraceKind::Error, &error.text);
                self.schedule_rebind();
            }
        }
    }

    fn schedule_rebind(&mut self) {
        if let Some(settings) = &self.settings
            && self.enabled
        {
            self.rebind_at = Some(Instant::now() + secs(settings.reconnect_wait_secs));
        }
    }

    async fn accept(&mut self, stream: TcpStream, remote: SocketAddr) {
        let Some(settings) = self.settings.clone() else {
            return;
        };

        let id = self.take_session_id();

        if let Err(error) = stream.set_nodelay(true) {
            log::error!("socket set nodelay failed: addr={remote}, err={error}");
        }

        let peer = net::adopt(remote, settings.effective_port()).await;
        self.observer
            .on_trace(id, TraceKind::Info, &format!("accepted {peer}"));

        // Single-peer rule: an established session wins; the newcomer
        // gets a refusal, the survivor a probe to flush out a stale
        // link.
        if let Some(existing) = &self.session {
            let text = format!(
                "refusing connection from {peer} due to established connection to {}",
                existing.peer
            );
            self.observer.on_trace(existing.id, TraceKind::Warning, &text);

            net::send_and_close(
                stream,
                Notification::new(
                    NotificationCode::ConnectionRefusedBecauseOfEstablishedConnection,
                    Severity::Error,
                    text,
                ),
            );
            existing.signal(Outbound::Message(Message::CheckAlive(CheckAlive::default())));
            return;
        }

        match net::check_allowed_peer(settings.allowed_client.as_deref(), remote.ip(), &peer).await
        {
            PeerCheck::Allowed => {}
            PeerCheck::Refused(notification) => {
                self.observer
                    .on_trace(id, TraceKind::Warning, &notification.description);
                net::send_and_close(stream, notification);
                return;
            }
        }

        let machine = LaneMachine::downstream(&settings, self.observer.clone());
        self.session = Some(session::spawn(
            id,
            stream,
            peer,
            secs(settings.check_alive_period_secs),
            machine,
            self.lifecycle_tx.clone(),
        ));
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

/// What the state gate should treat a raw document as. An unparsable
/// document rides as a notification, which is legal everywhere.
#[cfg(feature = "raw-xml")]
pub(crate) fn raw_gate(document: &str) -> Message {
    let mut decoder = codec::Decoder::default();
    decoder.extend(document.as_bytes());

    match decoder.try_next() {
        Ok(Some(frame)) => frame.message,
        _ => Message::Notification(Notification::new(
            NotificationCode::Unspecific,
            Severity::Info,
            String::new(),
        )),
    }
}
