//! One-shot configuration client: connect, ask, collect the answer,
//! close. No state machine is involved; the configuration channel is
//! trusted. Every phase races a deadline, and expiry surfaces as a
//! timeout error rather than a hung call.

use crate::{CONFIGURATION_PORT, ErrorKind, SessionError, net};

use codec::message::{CurrentConfiguration, Message, Notification, SetConfiguration};

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{Instant, timeout_at},
};

/// Everything the service said before (and including) its
/// configuration answer.
#[derive(Debug, Clone)]
pub struct ConfigurationReply {
    pub configuration: CurrentConfiguration,
    pub notifications: Vec<Notification>,
}

pub struct ConfigurationClient {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl ConfigurationClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: CONFIGURATION_PORT,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reads the station's effective configuration.
    pub async fn get(&self) -> Result<ConfigurationReply, SessionError> {
        let mut stream = self.connect().await?;
        self.request(&mut stream, &Message::GetConfiguration).await?;
        self.collect(&mut stream).await
    }

    /// Rewrites the station's configuration. Rejections come back as
    /// notifications in the reply, next to the unchanged
    /// configuration.
    pub async fn set(
        &self,
        configuration: SetConfiguration,
    ) -> Result<ConfigurationReply, SessionError> {
        let mut stream = self.connect().await?;
        self.request(&mut stream, &Message::SetConfiguration(configuration))
            .await?;
        self.collect(&mut stream).await
    }

    async fn connect(&self) -> Result<TcpStream, SessionError> {
        let deadline = Instant::now() + self.timeout;

        match timeout_at(deadline, net::connect(&self.host, self.port)).await {
            Err(_) => Err(timeout_error("connect")),
            Ok(Err(error)) => Err(error),
            Ok(Ok((stream, _))) => Ok(stream),
        }
    }

    async fn request(&self, stream: &mut TcpStream, message: &Message) -> Result<(), SessionError> {
        let document = codec::serialize(message).map_err(|it| {
            SessionError::new(
                ErrorKind::ImplementationError,
                format!("unable to render request: {it}"),
            )
        })?;

        stream.write_all(document.as_bytes()).await.map_err(|it| {
            SessionError::new(ErrorKind::NetworkError, format!("cannot write request: {it}"))
        })
    }

    /// Reads until the CurrentConfiguration document arrives; the
    /// whole exchange shares one deadline.
    async fn collect(&self, stream: &mut TcpStream) -> Result<ConfigurationReply, SessionError> {
        let deadline = Instant::now() + self.timeout;
        let mut decoder = codec::Decoder::default();
        let mut scratch = [0u8; 4096];
        let mut notifications = Vec::new();

        loop {
            let received = match timeout_at(deadline, stream.read(&mut scratch)).await {
                Err(_) => return Err(timeout_error("receive")),
                Ok(Err(error)) => {
                    return Err(SessionError::new(
                        ErrorKind::NetworkError,
                        format!("receive failed: {error}"),
                    ));
                }
                Ok(Ok(0)) => {
                    return Err(SessionError::new(
                        ErrorKind::PeerError,
                        "service closed before answering",
                    ));
                }
                Ok(Ok(size)) => size,
            };

            decoder.extend(&scratch[..received]);

            loop {
                match decoder.try_next() {
                    Ok(None) => break,
                    Ok(Some(frame)) => match frame.message {
                        Message::CurrentConfiguration(configuration) => {
                            let _ = stream.shutdown().await;
                            return Ok(ConfigurationReply {
                                configuration,
                                notifications,
                            });
                        }
                        Message::Notification(notification) => notifications.push(notification),
                        other => {
                            log::debug!(
                                "unexpected configuration answer ignored: message={}",
                                other.name()
                            );
                        }
                    },
                    Err(codec::Error::UnknownMessage(name)) => {
                        log::debug!("unknown configuration answer ignored: message={name}");
                    }
                    Err(error) => {
                        return Err(SessionError::new(
                            ErrorKind::PeerError,
                            format!("service answer does not parse: {error}"),
                        ));
                    }
                }
            }
        }
    }
}

fn timeout_error(phase: &str) -> SessionError {
    SessionError::new(
        ErrorKind::Timeout,
        format!("{phase} timed out"),
    )
}
