//! UDP transport for intercepted DNS queries.
//!
//! Each datagram is one complete query. Every query gets its own task and its
//! own upstream socket, so replies are matched by socket rather than by a
//! shared ID table, and the reply goes back to the sender through the
//! listening socket. Query tasks are tracked so the socket is only released
//! once they are done.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::dns::{self, HEADER_LEN};

use super::{MAX_UDP_MESSAGE_SIZE, Protocol, Relay, drain};

/// Default cap on concurrently relayed UDP queries.
pub const DEFAULT_MAX_INFLIGHT: usize = 1024;

/// UDP listener for the interception proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the receive loop.
    ///
    /// At most `max_inflight` queries are relayed at once; beyond that the
    /// loop stops reading until one finishes. When `shutdown` changes the
    /// loop stops reading, gives in-flight queries up to `grace` to reply,
    /// and then closes the listening socket.
    pub fn start(
        self,
        relay: Arc<Relay>,
        max_inflight: usize,
        grace: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let limit = Arc::new(Semaphore::new(max_inflight.max(1)));
        tokio::spawn(run(self.socket, relay, limit, grace, shutdown))
    }
}

/// Receive loop: one tracked task per datagram.
async fn run(
    socket: Arc<UdpSocket>,
    relay: Arc<Relay>,
    limit: Arc<Semaphore>,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let logger = relay.logger(Protocol::Udp);
    let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];
    let mut handlers = JoinSet::new();

    loop {
        while handlers.try_join_next().is_some() {}

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (len, src) = tokio::select! {
            _ = shutdown.changed() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(r) => r,
                Err(e) => {
                    warn!("UDP recv error: {}", e);
                    continue;
                }
            },
        };

        if len < HEADER_LEN {
            relay.stats.record_dropped();
            logger.malformed(src, &format!("{} byte datagram", len));
            continue;
        }

        handlers.spawn(handle_query(
            socket.clone(),
            relay.clone(),
            buf[..len].to_vec(),
            src,
            permit,
        ));
    }

    drain(&mut handlers, grace, Protocol::Udp).await;
    debug!("UDP listener stopped");
}

/// Forward one query and send the reply (or SERVFAIL) back to `src`.
async fn handle_query(
    socket: Arc<UdpSocket>,
    relay: Arc<Relay>,
    query: Vec<u8>,
    src: SocketAddr,
    _permit: OwnedSemaphorePermit,
) {
    let start_time = Instant::now();
    let logger = relay.logger(Protocol::Udp);

    match relay.forwarder.forward_udp(&query).await {
        Ok(reply) => {
            if let Err(e) = socket.send_to(&reply.response, src).await {
                warn!("UDP response error: {}", e);
            }

            let total_ms = start_time.elapsed().as_secs_f64() * 1000.0;
            relay.stats.record_forwarded(total_ms);
            logger.forwarded(
                &dns::query_label(&query),
                total_ms,
                reply.upstream_ms,
                reply.upstream,
                src,
            );
        }
        Err(e) => {
            let mut answered = false;
            if relay.servfail {
                if let Some(response) = dns::servfail_response(&query) {
                    answered = socket.send_to(&response, src).await.is_ok();
                }
            }

            let total_ms = start_time.elapsed().as_secs_f64() * 1000.0;
            relay.stats.record_failed(total_ms, answered);
            logger.failed(&dns::query_label(&query), total_ms, src, &e, answered);
        }
    }
}
