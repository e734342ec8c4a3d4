//! TCP transport for intercepted DNS queries.
//!
//! Each client connection is handled independently. A connection may carry
//! any number of sequential queries; it is kept open until the client closes
//! it, a frame is malformed, an unrecoverable upstream failure occurs, no
//! new query arrives within the idle timeout, or the proxy shuts down. TCP DNS messages are prefixed
//! with a 2-byte big-endian length.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::dns::{self, HEADER_LEN};
use crate::error::FrameError;

use super::{Protocol, Relay, drain};

/// Default time a client connection may sit between queries.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP listener for the interception proxy.
///
/// Each connection is handled in a separate task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the accept loop.
    ///
    /// When `shutdown` changes the listener is closed, open connections stop
    /// taking new queries, and queries already being relayed get up to
    /// `grace` to finish.
    pub fn start(
        self,
        relay: Arc<Relay>,
        idle_timeout: Duration,
        grace: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(
            self.listener,
            relay,
            idle_timeout,
            grace,
            shutdown,
        ))
    }
}

/// Accept loop - spawns a tracked handler task for each incoming connection.
async fn run_accept_loop(
    listener: TcpListener,
    relay: Arc<Relay>,
    idle_timeout: Duration,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        while connections.try_join_next().is_some() {}

        tokio::select! {
            _ = shutdown.changed() => break,
            result = listener.accept() => match result {
                Ok((client, peer)) => {
                    connections.spawn(handle_connection(
                        client,
                        peer,
                        relay.clone(),
                        idle_timeout,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("TCP accept error: {}", e);
                }
            },
        }
    }

    drop(listener);
    drain(&mut connections, grace, Protocol::Tcp).await;
    debug!("TCP listener stopped");
}

/// Relay queries on one client connection until it ends or shutdown begins.
async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    relay: Arc<Relay>,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let logger = relay.logger(Protocol::Tcp);
    let mut session = relay.forwarder.tcp_session();

    loop {
        let next = tokio::select! {
            _ = stopping(&mut shutdown) => {
                debug!("[TCP] closing connection from {} for shutdown", peer);
                break;
            }
            next = tokio::time::timeout(idle_timeout, read_frame(&mut client)) => next,
        };

        let query = match next {
            Ok(Ok(Some(query))) => query,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                relay.stats.record_dropped();
                logger.malformed(peer, &e);
                break;
            }
            Err(_) => {
                debug!("[TCP] closing idle connection from {}", peer);
                break;
            }
        };

        if query.len() < HEADER_LEN {
            relay.stats.record_dropped();
            logger.malformed(peer, &format!("{} byte message", query.len()));
            break;
        }

        let start_time = Instant::now();

        let response = match session.exchange(&query).await {
            Ok(reply) => {
                let total_ms = start_time.elapsed().as_secs_f64() * 1000.0;
                relay.stats.record_forwarded(total_ms);
                logger.forwarded(
                    &dns::query_label(&query),
                    total_ms,
                    reply.upstream_ms,
                    reply.upstream,
                    peer,
                );
                reply.response
            }
            Err(e) => {
                let fallback = if relay.servfail {
                    dns::servfail_response(&query)
                } else {
                    None
                };

                let total_ms = start_time.elapsed().as_secs_f64() * 1000.0;
                relay.stats.record_failed(total_ms, fallback.is_some());
                logger.failed(
                    &dns::query_label(&query),
                    total_ms,
                    peer,
                    &e,
                    fallback.is_some(),
                );

                match fallback {
                    Some(response) => response,
                    None => break,
                }
            }
        };

        if let Err(e) = write_frame_within(&mut client, &response, idle_timeout).await {
            debug!("[TCP] write to {} failed: {}", peer, e);
            break;
        }
    }
}

/// Resolves once shutdown has been signalled, including before this call.
async fn stopping(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Read one length-prefixed DNS message, without its prefix.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new frame, and
/// [`FrameError::Truncated`] when it ends inside one.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    let mut got = 0;

    while got < prefix.len() {
        match reader.read(&mut prefix[got..]).await? {
            0 if got == 0 => return Ok(None),
            0 => return Err(FrameError::Truncated { expected: 2, got }),
            n => got += n,
        }
    }

    let msg_len = u16::from_be_bytes(prefix) as usize;
    let mut msg = vec![0u8; msg_len];
    let mut got = 0;

    while got < msg_len {
        match reader.read(&mut msg[got..]).await? {
            0 => {
                return Err(FrameError::Truncated {
                    expected: msg_len,
                    got,
                });
            }
            n => got += n,
        }
    }

    Ok(Some(msg))
}

/// Write `msg` with its 2-byte length prefix in a single write.
pub async fn write_frame<W>(writer: &mut W, msg: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(msg.len()).map_err(|_| FrameError::TooLarge(msg.len()))?;

    let mut frame = Vec::with_capacity(2 + msg.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(msg);

    writer.write_all(&frame).await?;
    writer.flush().await?;

    Ok(())
}

/// [`write_frame`] bounded by `limit`, for peers that stop reading.
pub async fn write_frame_within<W>(
    writer: &mut W,
    msg: &[u8],
    limit: Duration,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(limit, write_frame(writer, msg)).await {
        Ok(result) => result,
        Err(_) => Err(FrameError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("peer did not accept the reply within {:?}", limit),
        ))),
    }
}
