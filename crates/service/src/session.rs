//! The per-session engine: one task owning the socket, the frame
//! decoder, the keep-alive deadline and the role machine. All writes
//! happen on this task, so wire order equals queue order, and the
//! end-of-session event fires exactly once from the single exit path.

use crate::{
    ErrorKind, PeerInfo, SessionError, SessionId, TraceKind,
    machine::{Actions, Close, Machine},
};

use codec::message::{CheckAlive, Message, Notification};

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{Notify, mpsc},
    time::Instant,
};

/// Bounded frame backlog per session. Producers never block; a full
/// queue is a dead or stalled link and tears the session down.
pub(crate) const SEND_QUEUE_DEPTH: usize = 64;

const RECEIVE_CHUNK_SIZE: usize = 1024;

/// Notices a session task (or its machine) sends back to the
/// supervisor that owns it.
pub(crate) enum Lifecycle {
    /// The peer completed its service description. The vertical
    /// service uses the flag to route board-tracking broadcasts.
    Described { id: SessionId, board_tracking: bool },
    /// The session task finished; the slot can be reused.
    Ended { id: SessionId, peer_described: bool },
}

/// Work items accepted by a session task.
pub(crate) enum Outbound {
    Message(Message),
    /// Pre-rendered document; the accompanying message is what the
    /// state gate sees.
    #[cfg(feature = "raw-xml")]
    Raw { gate: Message, document: String },
    /// Optional farewell notification, then an orderly close.
    Farewell(Option<Notification>),
}

/// Out-of-band teardown switch. Needed where the queue cannot be used:
/// on queue overflow and when a supervisor abandons a session without
/// draining it.
#[derive(Clone, Default)]
pub(crate) struct Kill(Arc<KillInner>);

#[derive(Default)]
struct KillInner {
    fired: AtomicBool,
    reason: Mutex<Option<SessionError>>,
    notify: Notify,
}

impl Kill {
    pub fn fire(&self, error: Option<SessionError>) {
        if !self.0.fired.swap(true, Ordering::AcqRel)
            && let Some(error) = error
        {
            *self.0.reason.lock() = Some(error);
        }

        self.0.notify.notify_waiters();
    }

    pub async fn fired(&self) {
        let notified = self.0.notify.notified();
        tokio::pin!(notified);

        if self.0.fired.load(Ordering::Acquire) {
            return;
        }

        notified.await;
    }

    fn reason(&self) -> Option<SessionError> {
        self.0.reason.lock().take()
    }
}

/// The supervisor's grip on a running session.
pub(crate) struct SessionHandle {
    pub id: SessionId,
    pub peer: PeerInfo,
    pub sender: mpsc::Sender<Outbound>,
    pub kill: Kill,
}

impl SessionHandle {
    pub fn signal(&self, outbound: Outbound) {
        match self.sender.try_send(outbound) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::error!("session send queue overflow: session={}", self.id);
                self.kill.fire(Some(SessionError::new(
                    ErrorKind::NetworkError,
                    "no buffer space in send queue",
                )));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("signal to closed session dropped: session={}", self.id);
            }
        }
    }

    pub fn farewell(&self, notification: Option<Notification>) {
        self.signal(Outbound::Farewell(notification));
    }
}

/// Wires up the channels, spawns the session task and hands the
/// supervisor its grip on it. The task reports back on the lifecycle
/// channel when it is gone.
pub(crate) fn spawn<M: Machine>(
    id: SessionId,
    stream: TcpStream,
    peer: PeerInfo,
    check_alive_period: Duration,
    machine: M,
    lifecycle: mpsc::UnboundedSender<Lifecycle>,
) -> SessionHandle {
    let (sender, outbound) = mpsc::channel(SEND_QUEUE_DEPTH);
    let kill = Kill::default();

    let handle = SessionHandle {
        id,
        peer: peer.clone(),
        sender,
        kill: kill.clone(),
    };

    tokio::spawn(async move {
        let machine = run(Engine {
            id,
            stream,
            peer,
            check_alive_period,
            kill,
            outbound,
            machine,
        })
        .await;

        let _ = lifecycle.send(Lifecycle::Ended {
            id,
            peer_described: machine.peer_described(),
        });
    });

    handle
}

pub(crate) struct Engine<M> {
    pub id: SessionId,
    pub stream: TcpStream,
    pub peer: PeerInfo,
    pub check_alive_period: Duration,
    pub kill: Kill,
    pub outbound: mpsc::Receiver<Outbound>,
    pub machine: M,
}

/// Runs a session to completion and hands the machine back so the
/// spawner can inspect it for the reconnect decision.
pub(crate) async fn run<M: Machine>(engine: Engine<M>) -> M {
    let Engine {
        id,
        mut stream,
        peer,
        check_alive_period,
        kill,
        mut outbound,
        mut machine,
    } = engine;

    let error = drive(
        id,
        &mut stream,
        &peer,
        check_alive_period,
        &kill,
        &mut outbound,
        &mut machine,
    )
    .await;

    outbound.close();
    let _ = stream.shutdown().await;

    machine.trace(id, TraceKind::Info, "disconnected");
    machine.disconnected(id, error);
    machine
}

async fn drive<M: Machine>(
    id: SessionId,
    stream: &mut TcpStream,
    peer: &PeerInfo,
    check_alive_period: Duration,
    kill: &Kill,
    outbound: &mut mpsc::Receiver<Outbound>,
    machine: &mut M,
) -> Option<SessionError> {
    let keep_alive = !check_alive_period.is_zero();
    let mut deadline = Instant::now() + check_alive_period;
    let mut decoder = codec::Decoder::default();
    let mut scratch = [0u8; RECEIVE_CHUNK_SIZE];

    let mut actions = Actions::default();
    machine.connected(id, peer, &mut actions);

    loop {
        match flush(id, stream, machine, &mut actions, &mut deadline, check_alive_period).await {
            FlushOutcome::Continue => {}
            FlushOutcome::Close(error) => return error,
        }

        tokio::select! {
            received = stream.read(&mut scratch) => match received {
                // A read of zero means the peer shut the stream down.
                Ok(0) => {
                    machine.trace(id, TraceKind::Info, "disconnected by peer");
                    return None;
                }
                Ok(size) => {
                    machine.trace(id, TraceKind::Received, &String::from_utf8_lossy(&scratch[..size]));
                    decoder.extend(&scratch[..size]);

                    loop {
                        match decoder.try_next() {
                            Ok(Some(frame)) => machine.incoming(id, frame.message, &mut actions),
                            Ok(None) => break,
                            Err(error) => {
                                // Unknown messages are consumed frames;
                                // everything else poisons the stream.
                                let recoverable = matches!(error, codec::Error::UnknownMessage(_));
                                machine.corrupt(id, &error, &mut actions);
                                if !recoverable {
                                    break;
                                }
                            }
                        }

                        if actions.close.is_some() {
                            break;
                        }
                    }
                }
                Err(error) => {
                    return match error.kind() {
                        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::UnexpectedEof => {
                            machine.trace(id, TraceKind::Info, &format!("disconnected: {error}"));
                            None
                        }
                        _ => Some(SessionError::new(
                            ErrorKind::NetworkError,
                            format!("receive failed: {error}"),
                        )),
                    };
                }
            },
            command = outbound.recv() => match command {
                // Every handle is gone; nobody is left to drive this
                // session.
                None => return None,
                Some(Outbound::Message(message)) => {
                    if machine.outgoing(id, &message) {
                        actions.send(message);
                    }
                }
                #[cfg(feature = "raw-xml")]
                Some(Outbound::Raw { gate, document }) => {
                    if machine.outgoing(id, &gate) {
                        if let Err(error) = stream.write_all(document.as_bytes()).await {
                            return Some(SessionError::new(
                                ErrorKind::NetworkError,
                                format!("cannot write raw document: {error}"),
                            ));
                        }

                        machine.trace(id, TraceKind::Sent, &document);
                        machine.sent(id, &gate);
                        if keep_alive {
                            deadline = Instant::now() + check_alive_period;
                        }
                    }
                }
                Some(Outbound::Farewell(notification)) => {
                    if let Some(notification) = notification {
                        actions.send(Message::Notification(notification));
                    }

                    actions.close_clean();
                }
            },
            _ = kill.fired() => return kill.reason(),
            _ = tokio::time::sleep_until(deadline), if keep_alive => {
                actions.send(Message::CheckAlive(CheckAlive::default()));
                deadline = Instant::now() + check_alive_period;
            }
        }
    }
}

enum FlushOutcome {
    Continue,
    Close(Option<SessionError>),
}

/// Writes everything the machine queued, in order, then honours a
/// pending close. Every successful write pushes the keep-alive
/// deadline out.
async fn flush<M: Machine>(
    id: SessionId,
    stream: &mut TcpStream,
    machine: &mut M,
    actions: &mut Actions,
    deadline: &mut Instant,
    check_alive_period: Duration,
) -> FlushOutcome {
    for message in std::mem::take(&mut actions.send) {
        let document = match codec::serialize(&message) {
            Ok(document) => document,
            Err(error) => {
                machine.trace(
                    id,
                    TraceKind::Error,
                    &format!("unable to render {}: {error}", message.name()),
                );
                continue;
            }
        };

        if let Err(error) = stream.write_all(document.as_bytes()).await {
            return FlushOutcome::Close(Some(SessionError::new(
                ErrorKind::NetworkError,
                format!("cannot write {}: {error}", message.name()),
            )));
        }

        machine.trace(id, TraceKind::Sent, &document);
        machine.sent(id, &message);

        if !check_alive_period.is_zero() {
            *deadline = Instant::now() + check_alive_period;
        }
    }

    match actions.close.take() {
        None => FlushOutcome::Continue,
        Some(Close::Clean) => FlushOutcome::Close(None),
        Some(Close::Error(error)) => FlushOutcome::Close(Some(error)),
    }
}
