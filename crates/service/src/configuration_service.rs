//! The remote-configuration acceptor, answering GetConfiguration and
//! SetConfiguration on the dedicated configuration port. Requests are
//! answered from the embedder's [`ConfigurationHandler`]; any number of
//! clients may be connected.

use crate::{
    ConfigurationHandler, ConfigurationServiceSettings, SessionId, TraceKind,
    machine::configuration::ConfigurationMachine,
    net, secs,
    session::{self, Lifecycle, SessionHandle},
};

use codec::message::{Notification, NotificationCode, Severity};

use std::{net::SocketAddr, sync::Arc};

use ahash::{HashMap, HashMapExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::Instant,
};

enum Command {
    Enable(ConfigurationServiceSettings),
    Disable(Notification),
    Post(Box<dyn FnOnce() + Send>),
    Stop,
}

#[derive(Clone)]
pub struct ConfigurationService {
    sender: mpsc::UnboundedSender<Command>,
}

impl ConfigurationService {
    pub fn spawn(handler: impl ConfigurationHandler) -> Self {
        let (sender, commands) = mpsc::unbounded_channel();
        tokio::spawn(Supervisor::new(Arc::new(handler), commands).run());
        Self { sender }
    }

    fn command(&self, command: Command) {
        if self.sender.send(command).is_err() {
            log::warn!("configuration service already stopped");
        }
    }

    pub fn enable(&self, settings: ConfigurationServiceSettings) {
        self.command(Command::Enable(settings));
    }

    pub fn disable(&self, notification: Notification) {
        self.command(Command::Disable(notification));
    }

    pub fn post(&self, work: impl FnOnce() + Send + 'static) {
        self.command(Command::Post(Box::new(work)));
    }

    pub fn stop(&self) {
        self.command(Command::Stop);
    }
}

struct Supervisor<H> {
    handler: Arc<H>,
    commands: mpsc::UnboundedReceiver<Command>,
    lifecycle_tx: mpsc::UnboundedSender<Lifecycle>,
    lifecycle_rx: mpsc::UnboundedReceiver<Lifecycle>,
    settings: Option<ConfigurationServiceSettings>,
    enabled: bool,
    listener: Option<TcpListener>,
    rebind_at: Option<Instant>,
    sessions: HashMap<SessionId, SessionHandle>,
    session_id: SessionId,
}

impl<H: ConfigurationHandler> Supervisor<H> {
    fn new(handler: Arc<H>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        Self {
            handler,
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
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        for (_, handle) in self.sessions.drain() {
                            handle.farewell(None);
                        }
                        break;
                    }
                    Some(Command::Stop) => {
                        self.teardown_all(Notification::new(
                            NotificationCode::MachineShutdown,
                            Severity::Info,
                            "configuration service stopped by application",
                        ));
                        break;
                    }
                    Some(Command::Enable(settings)) => self.enable(settings).await,
                    Some(Command::Disable(notification)) => {
                        if self.enabled {
                            self.enabled = false;
                            self.listener = None;
                            self.rebind_at = None;
                            self.teardown_all(notification);
                        }
                    }
                    Some(Command::Post(work)) => work(),
                },
                notice = self.lifecycle_rx.recv() => {
                    if let Some(Lifecycle::Ended { id, .. }) = notice {
                        self.sessions.remove(&id);
                    }
                },
                accepted = net::accept_next(&self.listener) => match accepted {
                    Ok((stream, remote)) => self.accept(stream, remote).await,
                    Err(error) => {
                        log::error!("configuration accept failed: err={error}");
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
    }

    async fn enable(&mut self, settings: ConfigurationServiceSettings) {
        if self.enabled && self.settings.as_ref() == Some(&settings) {
            return;
        }

        self.teardown_all(Notification::new(
            NotificationCode::ConnectionResetBecauseOfChangedConfiguration,
            Severity::Info,
            "configuration changed",
        ));

        let rebind = self.listener.is_none()
            || self
                .settings
                .as_ref()
                .map(ConfigurationServiceSettings::effective_port)
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
                log::info!("configuration service listening: port={port}");
                self.listener = Some(listener);
            }
            Err(error) => {
                log::error!("configuration bind failed: err={error}");
                self.handler.on_trace(0, TraceKind::Error, &error.text);
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

        if self.sessions.contains_key(&id) {
            log::warn!("duplicate session id, dropping connection: session={id}");
            return;
        }

        if let Err(error) = stream.set_nodelay(true) {
            log::error!("socket set nodelay failed: addr={remote}, err={error}");
        }

        let peer = net::adopt(remote, settings.effective_port()).await;
        self.handler
            .on_trace(id, TraceKind::Info, &format!("accepted {peer}"));

        let machine = ConfigurationMachine::new(self.handler.clone());
        let handle = session::spawn(
            id,
            stream,
            peer,
            secs(settings.check_alive_period_secs),
            machine,
            self.lifecycle_tx.clone(),
        );

        self.sessions.insert(id, handle);
    }

    fn teardown_all(&mut self, notification: Notification) {
        for (_, handle) in self.sessions.drain() {
            handle.farewell(Some(notification.clone()));
        }
    }

    fn take_session_id(&mut self) -> SessionId {
        let id = self.session_id;
        self.session_id = self.session_id.checked_add(1).unwrap_or(1);
        id
    }
}
