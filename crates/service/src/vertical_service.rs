//! The supervisory acceptor a station runs: any number of supervisory
//! systems may connect at once. Board-tracking broadcasts go only to
//! sessions whose peer advertised the feature in its service
//! description.

use crate::{
    SessionId, TraceKind, VerticalObserver, VerticalServiceSettings,
    machine::vertical::VerticalMachine,
    net, secs,
    session::{self, Lifecycle, Outbound, SessionHandle},
};

use codec::message::{Message, Notification, NotificationCode, Severity};

use std::{net::SocketAddr, sync::Arc};

use ahash::{HashMap, HashMapExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::Instant,
};

enum Command {
    Enable(VerticalServiceSettings),
    Disable(Notification),
    ResetSession(SessionId, Notification),
    Signal(SessionId, Message),
    /// Board-tracking broadcast to every interested session.
    SignalAll(Message),
    Post(Box<dyn FnOnce() + Send>),
    Stop,
}

#[derive(Clone)]
pub struct VerticalService {
    sender: mpsc::UnboundedSender<Command>,
}

impl VerticalService {
    pub fn spawn(observer: impl VerticalObserver) -> Self {
        let (sender, commands) = mpsc::unbounded_channel();
        tokio::spawn(Supervisor::new(Arc::new(observer), commands).run());
        Self { sender }
    }

    fn command(&self, command: Command) {
        if self.sender.send(command).is_err() {
            log::warn!("vertical service already stopped");
        }
    }

    pub fn enable(&self, settings: VerticalServiceSettings) {
        self.command(Command::Enable(settings));
    }

    pub fn disable(&self, notification: Notification) {
        self.command(Command::Disable(notification));
    }

    /// Farewells and drops one session; the peer is free to reconnect.
    pub fn reset_session(&self, session: SessionId, notification: Notification) {
        self.command(Command::ResetSession(session, notification));
    }

    pub fn signal(&self, session: SessionId, message: Message) {
        self.command(Command::Signal(session, message));
    }

    /// Delivers a board event to every session whose peer asked for
    /// board tracking.
    pub fn signal_all(&self, message: Message) {
        self.command(Command::SignalAll(message));
    }

    pub fn post(&self, work: impl FnOnce() + Send + 'static) {
        self.command(Command::Post(Box::new(work)));
    }

    pub fn stop(&self) {
        self.command(Command::Stop);
    }
}

struct Entry {
    handle: SessionHandle,
    board_tracking: bool,
}

struct Supervisor {
    observer: Arc<dyn VerticalObserver>,
    commands: mpsc::UnboundedReceiver<Command>,
    lifecycle_tx: mpsc::UnboundedSender<Lifecycle>,
    lifecycle_rx: mpsc::UnboundedReceiver<Lifecycle>,
    settings: Option<VerticalServiceSettings>,
    enabled: bool,
    listener: Option<TcpListener>,
    rebind_at: Option<Instant>,
    sessions: HashMap<SessionId, Entry>,
    session_id: SessionId,
}

impl Supervisor {
    fn new(
        observer: Arc<dyn VerticalObserver>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
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
            sessions: HashMap::new(),
            session_id: 1,
        }
    }

    async fn run(mut self) {
        self.observer.on_trace(0, TraceKind::Info, "created");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        for (_, entry) in self.sessions.drain() {
                            entry.handle.farewell(None);
                        }
                        break;
                    }
                    Some(Command::Stop) => {
                        self.teardown_all(Notification::new(
                            NotificationCode::MachineShutdown,
                            Severity::Info,
                            "vertical service stopped by application",
                        ));
                        break;
                    }
                    Some(command) => self.handle(command).await,
                },
                notice = self.lifecycle_rx.recv() => match notice {
                    Some(Lifecycle::Described { id, board_tracking }) => {
                        if let Some(entry) = self.sessions.get_mut(&id) {
                            entry.board_tracking = board_tracking;
                        }
                    }
                    Some(Lifecycle::Ended { id, .. }) => {
                        self.sessions.remove(&id);
                    }
                    None => {}
                },
                accepted = net::accept_next(&self.listener) => match accepted {
                    Ok((stream, remote)) => self.accept(stream, remote).await,
                    Err(error) => {
                        log::error!("vertical accept failed: err={error}");
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
            Command::Disable(notification) => {
                if self.enabled {
                    self.enabled = false;
                    self.listener = None;
                    self.rebind_at = None;
                    self.teardown_all(notification);
                }
            }
            Command::ResetSession(id, notification) => {
                if let Some(entry) = self.sessions.remove(&id) {
                    entry.handle.farewell(Some(notification));
                }
            }
            Command::Signal(id, message) => match self.sessions.get(&id) {
                Some(entry) => entry.handle.signal(Outbound::Message(message)),
                None => {
                    log::warn!("session id no longer valid: session={id}");
                    self.observer
                        .on_trace(id, TraceKind::Warning, "session id no longer valid");
                }
            },
            Command::SignalAll(message) => {
                for entry in self.sessions.values().filter(|it| it.board_tracking) {
                    entry.handle.signal(Outbound::Message(message.clone()));
                }
            }
            Command::Post(work) => work(),
            Command::Stop => {}
        }
    }

    async fn enable(&mut self, settings: VerticalServiceSettings) {
        if self.enabled && self.settings.as_ref() == Some(&settings) {
            return;
        }

        self.teardown_all(Notification::new(
            NotificationCode::ConnectionResetBecauseOfChangedConfiguration,
            Severity::Info,
            "configuration changed",
        ));

        let rebind = self.listener.is_none()
            || self.settings.as_ref().map(VerticalServiceSettings::effective_port)
                != Some(settings.effective_port());

        self.enabled = true;
        self.settings = Some(settings);

        if rebind {
            self.listener = None;
            self.rebind_at = None;
            self.bind().await;
        }
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
                log::info!("vertical service listening: port={port}");
                self.observer
                    .on_trace(0, TraceKind::Info, &format!("listening on port {port}"));
                self.listener = Some(listener);
            }
            Err(error) => {
                log::error!("vertical bind failed: err={error}");
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

        // Only possible after an id wraparound ran into a session that
        // never went away.
        if self.sessions.contains_key(&id) {
            log::warn!("duplicate session id, dropping connection: session={id}");
            return;
        }

        if let Err(error) = stream.set_nodelay(true) {
            log::error!("socket set nodelay failed: addr={remote}, err={error}");
        }

        let peer = net::adopt(remote, settings.effective_port()).await;
        self.observer
            .on_trace(id, TraceKind::Info, &format!("accepted {peer}"));

        let machine =
            VerticalMachine::service(&settings, self.observer.clone(), self.lifecycle_tx.clone());
        let handle = session::spawn(
            id,
            stream,
            peer,
            secs(settings.check_alive_period_secs),
            machine,
            self.lifecycle_tx.clone(),
        );

        self.sessions.insert(
            id,
            Entry {
                handle,
                board_tracking: false,
            },
        );
    }

    fn teardown_all(&mut self, notification: Notification) {
        for (_, entry) in self.sessions.drain() {
            entry.handle.farewell(Some(notification.clone()));
        }
    }

    fn take_session_id(&mut self) -> SessionId {
        let id = self.session_id;
        self.session_id = self.session_id.checked_add(1).unwrap_or(1);
        id
    }
}
