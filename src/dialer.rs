//! Upstream dialer whose sockets carry the bypass mark.
//!
//! On Linux the mark is set with `SO_MARK` right after the socket is created,
//! before connect, so every packet it sends matches the installer's `RETURN`
//! rules. Other platforms have no equivalent and get [`NoMark`]: upstream
//! queries from there are redirected like any other DNS traffic and will loop
//! back into the proxy. That mode exists for development and is logged loudly.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, SockRef, Socket, Type};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::warn;

/// Default bound on establishing an upstream connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Applies the bypass mark to a freshly created socket.
pub trait SocketMarker: fmt::Debug + Send + Sync {
    fn mark(&self, socket: SockRef<'_>) -> io::Result<()>;

    /// Whether sockets leaving this marker are exempt from the redirect.
    fn is_marking(&self) -> bool;
}

/// `SO_MARK` based marker. Needs `CAP_NET_ADMIN`.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
pub struct SoMark {
    mark: u32,
}

#[cfg(target_os = "linux")]
impl SoMark {
    pub fn new() -> Self {
        Self {
            mark: crate::mark::BYPASS_MARK,
        }
    }
}

#[cfg(target_os = "linux")]
impl Default for SoMark {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl SocketMarker for SoMark {
    fn mark(&self, socket: SockRef<'_>) -> io::Result<()> {
        socket.set_mark(self.mark)
    }

    fn is_marking(&self) -> bool {
        true
    }
}

/// Leaves sockets unmarked. Upstream traffic is NOT exempt from the redirect.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMark;

impl SocketMarker for NoMark {
    fn mark(&self, _socket: SockRef<'_>) -> io::Result<()> {
        Ok(())
    }

    fn is_marking(&self) -> bool {
        false
    }
}

/// Opens upstream UDP/TCP sockets through a [`SocketMarker`].
#[derive(Debug, Clone)]
pub struct MarkedDialer {
    marker: Arc<dyn SocketMarker>,
    timeout: Duration,
}

impl MarkedDialer {
    pub fn new(marker: Arc<dyn SocketMarker>, timeout: Duration) -> Self {
        if !marker.is_marking() {
            warn!(
                "upstream sockets are not marked; redirected DNS will loop back into the proxy"
            );
        }

        Self { marker, timeout }
    }

    /// `SO_MARK` on Linux, [`NoMark`] everywhere else.
    pub fn platform_default(timeout: Duration) -> Self {
        #[cfg(target_os = "linux")]
        let marker: Arc<dyn SocketMarker> = Arc::new(SoMark::new());
        #[cfg(not(target_os = "linux"))]
        let marker: Arc<dyn SocketMarker> = Arc::new(NoMark);

        Self::new(marker, timeout)
    }

    /// A dialer that never marks, regardless of platform.
    pub fn unmarked(timeout: Duration) -> Self {
        Self::new(Arc::new(NoMark), timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_marking(&self) -> bool {
        self.marker.is_marking()
    }

    /// Mark a throwaway socket, surfacing a missing capability up front.
    pub fn probe(&self) -> io::Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        self.marker.mark(SockRef::from(&socket))
    }

    /// Connect a marked TCP stream to `addr` within the dial timeout.
    pub async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        self.marker.mark(SockRef::from(&socket))?;

        match tokio::time::timeout(self.timeout, socket.connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", addr, self.timeout),
            )),
        }
    }

    /// Bind a marked UDP socket and connect it to `addr`.
    ///
    /// A connected socket only accepts datagrams from `addr`.
    pub async fn connect_udp(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        self.marker.mark(SockRef::from(&socket))?;
        socket.connect(addr).await?;

        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    #[test]
    fn unmarked_dialer_reports_no_marking() {
        let dialer = MarkedDialer::unmarked(DEFAULT_DIAL_TIMEOUT);

        assert!(!dialer.is_marking());
        assert!(dialer.probe().is_ok());
        assert_eq!(dialer.timeout(), Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn platform_default_marks_on_linux() {
        assert!(MarkedDialer::platform_default(DEFAULT_DIAL_TIMEOUT).is_marking());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn tcp_socket_carries_bypass_mark() {
        let dialer = MarkedDialer::platform_default(DEFAULT_DIAL_TIMEOUT);
        if let Err(e) = dialer.probe() {
            assert_eq!(e.kind(), io::ErrorKind::PermissionDenied, "{e}");
            eprintln!("skipping: SO_MARK requires CAP_NET_ADMIN");
            return;
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stream, accepted) = tokio::join!(dialer.connect_tcp(addr), listener.accept());
        let stream = stream.unwrap();
        accepted.unwrap();

        assert_eq!(
            SockRef::from(&stream).mark().unwrap(),
            crate::mark::BYPASS_MARK
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn udp_socket_carries_bypass_mark() {
        let dialer = MarkedDialer::platform_default(DEFAULT_DIAL_TIMEOUT);
        if dialer.probe().is_err() {
            eprintln!("skipping: SO_MARK requires CAP_NET_ADMIN");
            return;
        }

        let socket = dialer.connect_udp("127.0.0.1:53".parse().unwrap()).await.unwrap();

        assert_eq!(SockRef::from(&socket).mark().unwrap(), 0x1);
    }

    #[tokio::test]
    async fn connect_udp_is_connected_to_upstream() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();
        let dialer = MarkedDialer::unmarked(DEFAULT_DIAL_TIMEOUT);

        let socket = dialer.connect_udp(addr).await.unwrap();
        socket.send(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = upstream.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(socket.peer_addr().unwrap(), addr);
        assert_eq!(from.port(), socket.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn connect_tcp_fails_within_timeout() {
        let timeout = Duration::from_millis(200);
        let dialer = MarkedDialer::unmarked(timeout);

        // Unroutable test-net address: either times out or fails fast.
        let start = Instant::now();
        let result = dialer.connect_tcp("192.0.2.1:53".parse().unwrap()).await;

        assert!(result.is_err());
        assert!(start.elapsed() < timeout + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn connect_tcp_refused_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = MarkedDialer::unmarked(DEFAULT_DIAL_TIMEOUT);

        assert!(dialer.connect_tcp(addr).await.is_err());
    }
}
