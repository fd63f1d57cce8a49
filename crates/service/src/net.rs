//! Socket plumbing shared by the supervisors: IPv4 resolution, the
//! allowed-peer check of listening endpoints, best-effort reverse DNS
//! and the fire-and-forget refusal path.

use crate::{ErrorKind, PeerInfo, SessionError};

use codec::message::{Message, Notification, NotificationCode, Severity};

use std::net::{IpAddr, SocketAddr};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, lookup_host},
};

/// Resolves a host name to its IPv4 addresses.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, SessionError> {
    let addresses: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|it| {
            SessionError::new(ErrorKind::NetworkError, format!("unable to resolve {host}: {it}"))
        })?
        .filter(SocketAddr::is_ipv4)
        .collect();

    if addresses.is_empty() {
        return Err(SessionError::new(
            ErrorKind::NetworkError,
            format!("no ipv4 address for {host}"),
        ));
    }

    Ok(addresses)
}

/// Active connect of the client roles: first resolved IPv4 endpoint,
/// Nagle disabled.
pub(crate) async fn connect(host: &str, port: u16) -> Result<(TcpStream, PeerInfo), SessionError> {
    let endpoint = resolve(host, port).await?[0];

    let stream = TcpStream::connect(endpoint).await.map_err(|it| {
        SessionError::new(
            ErrorKind::NetworkError,
            format!("unable to connect to {endpoint}: {it}"),
        )
    })?;

    if let Err(it) = stream.set_nodelay(true) {
        log::error!("socket set nodelay failed: endpoint={endpoint}, err={it}");
    }

    let peer = PeerInfo {
        address: endpoint.ip().to_string(),
        port: endpoint.port(),
        host_name: host.to_string(),
    };

    Ok((stream, peer))
}

pub(crate) async fn bind(port: u16) -> Result<TcpListener, SessionError> {
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
        .await
        .map_err(|it| {
            SessionError::new(
                ErrorKind::NetworkError,
                format!("unable to listen on port {port}: {it}"),
            )
        })
}

/// Accept helper usable inside `select!` without a precondition: a
/// supervisor with no listener just never completes this arm.
pub(crate) async fn accept_next(listener: &Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Peer identity of an accepted socket. The reverse lookup runs on the
/// blocking pool and may come back empty; the port recorded is the
/// local listen port, which is what operators recognise a lane by.
pub(crate) async fn adopt(remote: SocketAddr, listen_port: u16) -> PeerInfo {
    let host_name = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&remote.ip()).ok())
        .await
        .ok()
        .flatten()
        .unwrap_or_default();

    PeerInfo {
        address: remote.ip().to_string(),
        port: listen_port,
        host_name,
    }
}

/// Outcome of the allowed-peer check on a freshly accepted socket.
pub(crate) enum PeerCheck {
    Allowed,
    /// Refuse with this notification; the text doubles as the local
    /// warning.
    Refused(Notification),
}

/// If the listening endpoint is restricted to one host, the accepted
/// remote address must be one of that host's resolved addresses.
pub(crate) async fn check_allowed_peer(
    allowed: Option<&str>,
    remote: IpAddr,
    peer: &PeerInfo,
) -> PeerCheck {
    let Some(allowed) = allowed.filter(|it| !it.is_empty()) else {
        return PeerCheck::Allowed;
    };

    let resolved = match resolve(allowed, 0).await {
        Ok(it) => it,
        Err(_) => {
            return PeerCheck::Refused(Notification::new(
                NotificationCode::ConfigurationError,
                Severity::Error,
                format!("connection only allowed from a hostname which cannot be resolved: {allowed}"),
            ));
        }
    };

    if resolved.iter().any(|it| it.ip() == remote) {
        return PeerCheck::Allowed;
    }

    let addresses = resolved
        .iter()
        .map(|it| it.ip().to_string())
        .collect::<Vec<_>>()
        .join(", ");

    PeerCheck::Refused(Notification::new(
        NotificationCode::ConfigurationError,
        Severity::Warning,
        format!(
            "remote host does not match allowed host {allowed}, allowed addresses=[{addresses}], \
             remote resolved hostname={}, remote address={}",
            peer.host_name, peer.address
        ),
    ))
}

/// Sends one farewell document on a socket the supervisor is not going
/// to keep, then lets it drop. Runs detached so the accept loop never
/// waits on a misbehaving peer.
pub(crate) fn send_and_close(mut stream: TcpStream, notification: Notification) {
    tokio::spawn(async move {
        if let Ok(document) = codec::serialize(&Message::Notification(notification)) {
            let _ = stream.write_all(document.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
}

/// Timer arm usable inside `select!` without a precondition.
pub(crate) async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
