//! Upstream forwarding.
//!
//! Every upstream socket comes from the [`MarkedDialer`] so the redirect rules
//! let it out. Upstreams are tried in the configured order and the first one
//! that answers wins; each attempt is bounded by the query timeout.
//!
//! UDP uses a fresh connected socket per query, so a reply can only belong to
//! that query. TCP keeps one upstream stream per client connection and runs
//! queries on it strictly one after another.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::dialer::MarkedDialer;
use crate::dns::{self, HEADER_LEN};
use crate::error::{ForwardError, FrameError};
use crate::transport::MAX_UDP_MESSAGE_SIZE;
use crate::transport::tcp::{read_frame, write_frame};

/// Default bound on one upstream round trip.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// An upstream reply.
#[derive(Debug)]
pub struct Forwarded {
    pub response: Vec<u8>,
    pub upstream: SocketAddr,
    pub upstream_ms: f64,
}

/// Sends intercepted queries to the real resolvers.
#[derive(Debug)]
pub struct Forwarder {
    upstreams: Vec<SocketAddr>,
    dialer: MarkedDialer,
    query_timeout: Duration,
}

impl Forwarder {
    pub fn new(upstreams: Vec<SocketAddr>, dialer: MarkedDialer, query_timeout: Duration) -> Self {
        Self {
            upstreams,
            dialer,
            query_timeout,
        }
    }

    pub fn upstreams(&self) -> &[SocketAddr] {
        &self.upstreams
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Forward one datagram query. `query` must hold at least a DNS header.
    pub async fn forward_udp(&self, query: &[u8]) -> Result<Forwarded, ForwardError> {
        let mut last = None;

        for &upstream in &self.upstreams {
            let start = Instant::now();
            match self.udp_exchange(upstream, query).await {
                Ok(response) => {
                    return Ok(Forwarded {
                        response,
                        upstream,
                        upstream_ms: elapsed_ms(start),
                    });
                }
                Err(e) => {
                    debug!("UDP upstream {} failed: {}", upstream, e);
                    last = Some(e);
                }
            }
        }

        Err(self.exhausted(last))
    }

    /// Start a sequential TCP session for one client connection.
    pub fn tcp_session(&self) -> TcpSession<'_> {
        TcpSession {
            forwarder: self,
            upstream: None,
        }
    }

    async fn udp_exchange(
        &self,
        upstream: SocketAddr,
        query: &[u8],
    ) -> Result<Vec<u8>, ForwardError> {
        let socket = self
            .dialer
            .connect_udp(upstream)
            .await
            .map_err(|source| ForwardError::Dial { upstream, source })?;

        let exchange = udp_round_trip(&socket, query);

        match tokio::time::timeout(self.query_timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(ForwardError::Io { upstream, source }),
            Err(_) => Err(ForwardError::Timeout {
                upstream,
                after: self.query_timeout,
            }),
        }
    }

    async fn tcp_exchange(
        &self,
        stream: &mut TcpStream,
        upstream: SocketAddr,
        query: &[u8],
    ) -> Result<Vec<u8>, ForwardError> {
        let exchange = tcp_round_trip(stream, query);

        match tokio::time::timeout(self.query_timeout, exchange).await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(ForwardError::Closed { upstream }),
            Ok(Err(FrameError::Io(source))) => Err(ForwardError::Io { upstream, source }),
            Ok(Err(source)) => Err(ForwardError::Frame { upstream, source }),
            Err(_) => Err(ForwardError::Timeout {
                upstream,
                after: self.query_timeout,
            }),
        }
    }

    fn exhausted(&self, last: Option<ForwardError>) -> ForwardError {
        match last {
            None => ForwardError::NoUpstreams,
            Some(e) if self.upstreams.len() == 1 => e,
            Some(e) => ForwardError::Exhausted {
                attempts: self.upstreams.len(),
                last: Box::new(e),
            },
        }
    }
}

/// Send `query` on a connected socket and wait for the reply with its ID.
async fn udp_round_trip(socket: &UdpSocket, query: &[u8]) -> io::Result<Vec<u8>> {
    let id = dns::message_id(query);
    socket.send(query).await?;

    let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];
    loop {
        let len = socket.recv(&mut buf).await?;
        if len < HEADER_LEN || dns::message_id(&buf[..len]) != id {
            debug!("discarding UDP reply with mismatched ID ({} bytes)", len);
            continue;
        }
        buf.truncate(len);
        return Ok(buf);
    }
}

/// Write one framed query and read framed replies until one carries its ID.
/// `None` if the upstream closed the stream cleanly first.
async fn tcp_round_trip(
    stream: &mut TcpStream,
    query: &[u8],
) -> Result<Option<Vec<u8>>, FrameError> {
    let id = dns::message_id(query);
    write_frame(stream, query).await?;

    loop {
        match read_frame(stream).await? {
            None => return Ok(None),
            Some(response) if dns::message_id(&response) == id => return Ok(Some(response)),
            Some(_) => debug!("discarding TCP reply with mismatched ID"),
        }
    }
}

/// Upstream side of one client TCP connection.
///
/// The stream is dialed on the first query and reused for the following
/// ones. If a reused stream fails for any reason other than a timeout, one
/// fresh stream is dialed before the query is given up.
pub struct TcpSession<'a> {
    forwarder: &'a Forwarder,
    upstream: Option<(TcpStream, SocketAddr)>,
}

impl TcpSession<'_> {
    pub async fn exchange(&mut self, query: &[u8]) -> Result<Forwarded, ForwardError> {
        if let Some((stream, upstream)) = self.upstream.as_mut() {
            let upstream = *upstream;
            let start = Instant::now();
            match self.forwarder.tcp_exchange(stream, upstream, query).await {
                Ok(response) => {
                    return Ok(Forwarded {
                        response,
                        upstream,
                        upstream_ms: elapsed_ms(start),
                    });
                }
                Err(e @ ForwardError::Timeout { .. }) => {
                    self.upstream = None;
                    return Err(e);
                }
                Err(e) => {
                    debug!("reused TCP stream to {} failed ({}), redialing", upstream, e);
                    self.upstream = None;
                }
            }
        }

        let mut last = None;

        for &upstream in self.forwarder.upstreams() {
            let start = Instant::now();
            let mut stream = match self.forwarder.dialer.connect_tcp(upstream).await {
                Ok(stream) => stream,
                Err(source) => {
                    debug!("TCP dial to {} failed: {}", upstream, source);
                    last = Some(ForwardError::Dial { upstream, source });
                    continue;
                }
            };

            match self.forwarder.tcp_exchange(&mut stream, upstream, query).await {
                Ok(response) => {
                    self.upstream = Some((stream, upstream));
                    return Ok(Forwarded {
                        response,
                        upstream,
                        upstream_ms: elapsed_ms(start),
                    });
                }
                Err(e) => {
                    debug!("TCP upstream {} failed: {}", upstream, e);
                    last = Some(e);
                }
            }
        }

        Err(self.forwarder.exhausted(last))
    }

    /// Whether an upstream stream is currently held open.
    pub fn is_connected(&self) -> bool {
        self.upstream.is_some()
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
