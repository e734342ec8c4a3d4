//! DNS interception proxy orchestration.
//!
//! Binds the UDP and TCP listeners on the same port and runs them until
//! shutdown.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::dialer::{DEFAULT_DIAL_TIMEOUT, MarkedDialer};
use crate::forwarder::{DEFAULT_QUERY_TIMEOUT, Forwarder};
use crate::transport::Relay;
use crate::transport::tcp::{DEFAULT_IDLE_TIMEOUT, TcpTransport};
use crate::transport::udp::{DEFAULT_MAX_INFLIGHT, UdpTransport};

/// Port the proxy listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 15353;

/// Configuration for the DNS proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 127.0.0.1:15353). Must use the port the
    /// redirect rules point at.
    pub bind_addr: SocketAddr,
    /// Upstream resolvers, tried in order.
    pub upstreams: Vec<SocketAddr>,
    pub dial_timeout: Duration,
    /// Bound on one upstream round trip.
    pub query_timeout: Duration,
    /// How long a client TCP connection may idle between queries.
    pub idle_timeout: Duration,
    /// Reply SERVFAIL when forwarding fails.
    pub servfail: bool,
    /// Cap on concurrently relayed UDP queries.
    pub max_inflight: usize,
    /// Mark upstream sockets. Off only for unprivileged runs.
    pub mark: bool,
    /// `None` disables the periodic stats line.
    pub stats_interval: Option<Duration>,
    /// Log every forwarded query at `info`.
    pub verbose: bool,
}

impl ProxyConfig {
    pub fn new(bind_addr: SocketAddr, upstreams: Vec<SocketAddr>) -> Self {
        Self {
            bind_addr,
            upstreams,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            servfail: true,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            mark: true,
            stats_interval: Some(Duration::from_secs(60)),
            verbose: false,
        }
    }

    /// Longest one query can legitimately take: every upstream dialed and
    /// waited on in turn. Shutdown waits this long for in-flight queries.
    pub fn drain_timeout(&self) -> Duration {
        let attempts = self.upstreams.len().clamp(1, u32::MAX as usize) as u32;
        (self.dial_timeout + self.query_timeout) * attempts
    }

    /// The upstream dialer this configuration asks for.
    pub fn dialer(&self) -> MarkedDialer {
        if self.mark {
            MarkedDialer::platform_default(self.dial_timeout)
        } else {
            MarkedDialer::unmarked(self.dial_timeout)
        }
    }
}

/// Bound but not yet serving proxy.
pub struct Proxy {
    config: ProxyConfig,
    udp: UdpTransport,
    tcp: TcpTransport,
    relay: Arc<Relay>,
    local_addr: SocketAddr,
}

impl Proxy {
    /// Bind both listeners, using the dialer `config` asks for.
    pub async fn bind(config: ProxyConfig) -> io::Result<Self> {
        let dialer = config.dialer();
        Self::bind_with_dialer(config, dialer).await
    }

    pub async fn bind_with_dialer(config: ProxyConfig, dialer: MarkedDialer) -> io::Result<Self> {
        let udp = UdpTransport::bind(config.bind_addr).await?;
        let local_addr = udp.local_addr()?;
        // An ephemeral port is resolved by the UDP bind; TCP reuses it.
        let tcp = TcpTransport::bind(local_addr).await?;

        let forwarder = Forwarder::new(config.upstreams.clone(), dialer, config.query_timeout);
        let relay = Arc::new(Relay::new(forwarder, config.servfail, config.verbose));

        Ok(Self {
            config,
            udp,
            tcp,
            relay,
            local_addr,
        })
    }

    /// Address both listeners are bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` resolves, then close the listeners.
    ///
    /// Returns once queries already in flight have been answered, or after
    /// [`ProxyConfig::drain_timeout`] at the latest. Both listening sockets
    /// are released by then.
    pub async fn serve<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("DNS proxy listening on {} (UDP+TCP)", self.local_addr);
        let upstream_strs: Vec<_> = self
            .config
            .upstreams
            .iter()
            .map(|a| a.to_string())
            .collect();
        info!("Forwarding to upstreams: {}", upstream_strs.join(", "));

        let (stop_tx, stop_rx) = watch::channel(false);
        let grace = self.config.drain_timeout();

        let udp = self.udp.start(
            self.relay.clone(),
            self.config.max_inflight,
            grace,
            stop_rx.clone(),
        );
        let tcp = self.tcp.start(
            self.relay.clone(),
            self.config.idle_timeout,
            grace,
            stop_rx.clone(),
        );
        let stats = self.config.stats_interval.map(|every| {
            tokio::spawn(report_stats(self.relay.clone(), every, stop_rx.clone()))
        });

        shutdown.await;
        info!("shutting down DNS proxy");
        let _ = stop_tx.send(true);

        for (name, task) in [("UDP", udp), ("TCP", tcp)] {
            if let Err(e) = task.await {
                error!("{} listener task failed: {}", name, e);
            }
        }
        if let Some(stats) = stats {
            let _ = stats.await;
        }

        Ok(())
    }
}

/// Print a stats line every `every` until shutdown.
async fn report_stats(relay: Arc<Relay>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let stats = relay.stats.snapshot_and_reset();
                info!(
                    "[stats] requests={} forwarded={} failed={} servfail={} dropped={} avg_response={:.2}ms",
                    stats.requests,
                    stats.forwarded,
                    stats.failed,
                    stats.servfail,
                    stats.dropped,
                    stats.avg_response_ms
                );
            }
        }
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
