//! Connection lifecycle: one stream per session, torn down exactly once.
//!
//! The hosting side binds the well-known port, accepts a single peer and
//! stops listening. The joining side connects out. Either way the live
//! stream is registered with a [`TeardownHandle`], which any task can use to
//! shut the socket down and wake a read or write blocked on it.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::events::{EventSink, StatusEvent};
use crate::handshake::Role;

/// Platform family of the peer device, as reported by pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPlatform {
    /// Can bring up a hotspot and accept connections.
    Android,
    /// Never hosts; always joins a hotspot offered by the other side.
    Apple,
}

/// Whether this side accepts the connection or initiates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostingStatus {
    Host,
    Join,
}

impl HostingStatus {
    /// Apple peers cannot host, so we do. Between two hosting-capable peers
    /// the receiving side hosts.
    pub fn derive(peer: PeerPlatform, role: Role) -> Self {
        match (peer, role) {
            (PeerPlatform::Apple, _) => HostingStatus::Host,
            (PeerPlatform::Android, Role::Receiving) => HostingStatus::Host,
            (PeerPlatform::Android, Role::Sending) => HostingStatus::Join,
        }
    }
}

#[derive(Default)]
struct Resources {
    // Duplicate of the session socket, kept only so it can be shut down.
    stream: Option<std::net::TcpStream>,
    listening: bool,
}

struct TeardownInner {
    resources: Mutex<Resources>,
    closed: watch::Sender<bool>,
}

/// Cloneable handle that releases a session's sockets from any context.
#[derive(Clone)]
pub struct TeardownHandle {
    inner: Arc<TeardownInner>,
}

impl Default for TeardownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TeardownHandle {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        TeardownHandle {
            inner: Arc::new(TeardownInner {
                resources: Mutex::new(Resources::default()),
                closed,
            }),
        }
    }

    fn resources(&self) -> MutexGuard<'_, Resources> {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// True once teardown ran and nothing is left registered.
    pub fn is_released(&self) -> bool {
        let resources = self.resources();
        self.is_closed() && resources.stream.is_none() && !resources.listening
    }

    /// Resolves when teardown has been requested.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Shut down input, then output, then drop the socket handle and wake
    /// any pending accept. Safe to call repeatedly and from any thread.
    ///
    /// A pending listener is closed by the accepting task once it wakes, so
    /// `is_released` may briefly stay false after this returns.
    pub fn teardown(&self) {
        let already_closed = self.inner.closed.send_replace(true);

        let stream = self.resources().stream.take();

        if let Some(stream) = stream {
            let _ = stream.shutdown(Shutdown::Read);
            let _ = stream.shutdown(Shutdown::Write);
            drop(stream);
            debug!("Connection socket closed");
        }

        if !already_closed {
            debug!("Connection torn down");
        }
    }

    fn set_listening(&self, listening: bool) {
        self.resources().listening = listening;
    }

    /// Keep a shutdown handle for `stream`; refuses if teardown already ran.
    fn track(&self, stream: TcpStream) -> Result<TcpStream> {
        let std_stream = stream.into_std().map_err(TransferError::Connection)?;
        let duplicate = std_stream.try_clone().map_err(TransferError::Connection)?;

        {
            let mut resources = self.resources();
            if self.is_closed() {
                let _ = duplicate.shutdown(Shutdown::Both);
                return Err(TransferError::Cancelled);
            }
            resources.stream = Some(duplicate);
        }

        TcpStream::from_std(std_stream).map_err(TransferError::Connection)
    }
}

/// Open a socket for `addr` with buffers sized for bulk chunks.
pub fn create_transfer_socket(addr: SocketAddr, chunk_size: usize) -> io::Result<TcpSocket> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;

    let buffer_size = u32::try_from(chunk_size.saturating_mul(2)).unwrap_or(u32::MAX);
    socket.set_send_buffer_size(buffer_size)?;
    socket.set_recv_buffer_size(buffer_size)?;
    debug!(
        "Socket buffers: send={} recv={} (requested {})",
        socket.send_buffer_size().unwrap_or(0),
        socket.recv_buffer_size().unwrap_or(0),
        buffer_size
    );

    Ok(socket)
}

/// Produce the session's single duplex stream.
pub async fn establish(
    hosting: HostingStatus,
    peer_addr: Option<IpAddr>,
    config: &TransferConfig,
    teardown: &TeardownHandle,
    sink: &dyn EventSink,
) -> Result<TcpStream> {
    if teardown.is_closed() {
        return Err(TransferError::Cancelled);
    }

    let stream = match hosting {
        HostingStatus::Host => accept_one(config, teardown, sink).await?,
        HostingStatus::Join => {
            let ip = peer_addr.ok_or_else(|| {
                TransferError::Connection(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "joining side needs the peer address",
                ))
            })?;
            connect_to(SocketAddr::new(ip, config.port), config, teardown, sink).await?
        }
    };

    if let Ok(peer) = stream.peer_addr() {
        sink.status(&StatusEvent::Connected { peer });
    }
    teardown.track(stream)
}

async fn accept_one(
    config: &TransferConfig,
    teardown: &TeardownHandle,
    sink: &dyn EventSink,
) -> Result<TcpStream> {
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
    let socket = create_transfer_socket(bind_addr, config.chunk_size).map_err(TransferError::Connection)?;
    socket.bind(bind_addr).map_err(TransferError::Connection)?;
    let listener = Listening::new(socket.listen(1).map_err(TransferError::Connection)?, teardown);

    let port = listener.port().unwrap_or(config.port);
    info!("Listening for peer on port {}", port);
    sink.status(&StatusEvent::AwaitingPeer { port });

    let accepted = tokio::select! {
        accepted = with_deadline(config.accept_timeout(), listener.accept()) => accepted,
        _ = teardown.closed() => Err(TransferError::Cancelled),
    };

    // One peer only.
    drop(listener);

    let (stream, addr) = accepted?;
    info!("Accepted peer {}", addr);
    Ok(stream)
}

/// A registered listener. It counts as live until the socket itself is closed.
struct Listening<'a> {
    listener: Option<TcpListener>,
    teardown: &'a TeardownHandle,
}

impl<'a> Listening<'a> {
    fn new(listener: TcpListener, teardown: &'a TeardownHandle) -> Self {
        teardown.set_listening(true);
        Listening {
            listener: Some(listener),
            teardown,
        }
    }

    fn port(&self) -> Option<u16> {
        self.listener.as_ref()?.local_addr().ok().map(|a| a.port())
    }

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match &self.listener {
            Some(listener) => listener.accept().await,
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

impl Drop for Listening<'_> {
    fn drop(&mut self) {
        drop(self.listener.take());
        self.teardown.set_listening(false);
        debug!("Listener closed");
    }
}

async fn connect_to(
    addr: SocketAddr,
    config: &TransferConfig,
    teardown: &TeardownHandle,
    sink: &dyn EventSink,
) -> Result<TcpStream> {
    sink.status(&StatusEvent::Connecting { addr });
    let socket = create_transfer_socket(addr, config.chunk_size).map_err(TransferError::Connection)?;

    debug!("Connecting to {}", addr);
    let stream = tokio::select! {
        connected = with_deadline(config.connect_timeout(), socket.connect(addr)) => connected?,
        _ = teardown.closed() => return Err(TransferError::Cancelled),
    };
    info!("Connected to {}", addr);
    Ok(stream)
}

async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    let result = match deadline {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Gave up after {:?}", limit);
                Err(io::Error::from(io::ErrorKind::TimedOut))
            }
        },
        None => fut.await,
    };
    result.map_err(TransferError::Connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopSink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_config(port: u16) -> TransferConfig {
        TransferConfig {
            port,
            chunk_size: 64 * 1024,
            ..TransferConfig::default()
        }
    }

    async fn connected_pair(
        port: u16,
    ) -> (TcpStream, TcpStream, TeardownHandle, TeardownHandle) {
        let config = test_config(port);
        let host_td = TeardownHandle::new();
        let join_td = TeardownHandle::new();

        let host = {
            let config = config.clone();
            let td = host_td.clone();
            tokio::spawn(async move {
                establish(HostingStatus::Host, None, &config, &td, &NoopSink).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let joined = establish(
            HostingStatus::Join,
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            &config,
            &join_td,
            &NoopSink,
        )
        .await
        .unwrap();
        let hosted = host.await.unwrap().unwrap();
        (hosted, joined, host_td, join_td)
    }

    // ============================================================================
    // Hosting Status Tests
    // ============================================================================

    #[test]
    fn test_hosting_status_derivation() {
        assert_eq!(HostingStatus::derive(PeerPlatform::Apple, Role::Sending), HostingStatus::Host);
        assert_eq!(HostingStatus::derive(PeerPlatform::Apple, Role::Receiving), HostingStatus::Host);
        assert_eq!(HostingStatus::derive(PeerPlatform::Android, Role::Receiving), HostingStatus::Host);
        assert_eq!(HostingStatus::derive(PeerPlatform::Android, Role::Sending), HostingStatus::Join);
    }

    // ============================================================================
    // Establish Tests
    // ============================================================================

    #[tokio::test]
    async fn test_host_and_join_exchange_bytes() {
        let (mut hosted, mut joined, _, _) = connected_pair(free_port()).await;

        joined.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        hosted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_join_without_address_fails() {
        let err = establish(
            HostingStatus::Join,
            None,
            &test_config(free_port()),
            &TeardownHandle::new(),
            &NoopSink,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Connection(_)));
    }

    #[tokio::test]
    async fn test_join_refused_is_connection_error() {
        let err = establish(
            HostingStatus::Join,
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            &test_config(free_port()),
            &TeardownHandle::new(),
            &NoopSink,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Connection(_)));
    }

    #[tokio::test]
    async fn test_only_one_peer_accepted() {
        let port = free_port();
        let (_hosted, _joined, _, _) = connected_pair(port).await;

        let second = TcpStream::connect(("127.0.0.1", port)).await;
        assert!(second.is_err(), "listener must be gone after the first peer");
    }

    #[tokio::test]
    async fn test_accept_timeout() {
        let config = TransferConfig {
            accept_timeout_secs: 1,
            ..test_config(free_port())
        };
        let td = TeardownHandle::new();
        let err = establish(HostingStatus::Host, None, &config, &td, &NoopSink)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Connection(e) if e.kind() == io::ErrorKind::TimedOut));
        assert!(!td.is_released());
    }

    // ============================================================================
    // Teardown Tests
    // ============================================================================

    #[tokio::test]
    async fn test_teardown_interrupts_pending_accept() {
        let td = TeardownHandle::new();
        let config = test_config(free_port());
        let accept = {
            let td = td.clone();
            tokio::spawn(async move {
                establish(HostingStatus::Host, None, &config, &td, &NoopSink).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        td.teardown();
        let result = accept.await.unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(td.is_released());
    }

    #[tokio::test]
    async fn test_listener_released_only_after_close() {
        let port = free_port();
        let td = TeardownHandle::new();
        let config = test_config(port);
        let accept = {
            let td = td.clone();
            tokio::spawn(async move {
                establish(HostingStatus::Host, None, &config, &td, &NoopSink).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The accepting task has not run since teardown, so its socket is still open.
        td.teardown();
        assert!(td.is_closed());
        assert!(!td.is_released());

        let result = accept.await.unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(td.is_released());
        std::net::TcpListener::bind(("0.0.0.0", port)).expect("port must be free once released");
    }

    #[tokio::test]
    async fn test_teardown_wakes_blocked_read_from_other_task() {
        let (mut hosted, _joined, host_td, _) = connected_pair(free_port()).await;

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            hosted.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        host_td.teardown();
        let read = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("blocked read must be interrupted")
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(host_td.is_released());
    }

    #[tokio::test]
    async fn test_teardown_closes_connection_for_peer() {
        let (_hosted, mut joined, host_td, _) = connected_pair(free_port()).await;
        host_td.teardown();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), joined.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (_hosted, _joined, host_td, join_td) = connected_pair(free_port()).await;
        for _ in 0..3 {
            host_td.teardown();
            join_td.teardown();
        }
        assert!(host_td.is_released());
        assert!(join_td.is_released());
    }

    #[tokio::test]
    async fn test_establish_after_teardown_is_cancelled() {
        let td = TeardownHandle::new();
        td.teardown();
        let err = establish(HostingStatus::Host, None, &test_config(free_port()), &td, &NoopSink)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }
}
