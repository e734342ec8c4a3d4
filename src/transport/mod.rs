//! Transport layer for intercepted DNS traffic.
//!
//! Provides UDP and TCP listeners that receive redirected queries from
//! clients and relay them through the [`Forwarder`].

pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::ForwardError;
use crate::forwarder::Forwarder;
use crate::stats::Stats;

/// Largest DNS message a UDP datagram can carry.
pub const MAX_UDP_MESSAGE_SIZE: usize = 65_535;

/// Transport protocol identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Upper-case name for log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }

    /// Lower-case name as iptables spells it.
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Wait up to `grace` for in-flight handlers, then abort the rest.
async fn drain(tasks: &mut JoinSet<()>, grace: Duration, protocol: Protocol) {
    if tasks.is_empty() {
        return;
    }

    debug!(
        "[{}] waiting for {} in-flight handlers",
        protocol.as_str(),
        tasks.len()
    );
    let finished = tokio::time::timeout(grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        warn!(
            "[{}] aborting {} handlers still running after {:?}",
            protocol.as_str(),
            tasks.len(),
            grace
        );
        tasks.shutdown().await;
    }
}

/// Everything a query handler needs, shared across all handlers.
pub struct Relay {
    pub forwarder: Forwarder,
    pub stats: Stats,
    /// Answer failed queries with SERVFAIL instead of dropping them.
    pub servfail: bool,
    pub verbose: bool,
}

impl Relay {
    pub fn new(forwarder: Forwarder, servfail: bool, verbose: bool) -> Self {
        Self {
            forwarder,
            stats: Stats::new(),
            servfail,
            verbose,
        }
    }

    pub fn logger(&self, protocol: Protocol) -> QueryLogger {
        QueryLogger::new(protocol, self.verbose)
    }
}

/// Logger for DNS query events.
///
/// Successful queries log at `info` when verbose and `debug` otherwise.
pub struct QueryLogger {
    protocol: Protocol,
    verbose: bool,
}

impl QueryLogger {
    pub fn new(protocol: Protocol, verbose: bool) -> Self {
        Self { protocol, verbose }
    }

    pub fn forwarded(
        &self,
        domain: &str,
        total_ms: f64,
        upstream_ms: f64,
        upstream: SocketAddr,
        from: SocketAddr,
    ) {
        if self.verbose {
            info!(
                "[{}] {} FORWARDED total={:.3}ms upstream={:.3}ms via {} (from {})",
                self.protocol.as_str(),
                domain,
                total_ms,
                upstream_ms,
                upstream,
                from
            );
        } else {
            debug!(
                "[{}] {} FORWARDED total={:.3}ms upstream={:.3}ms via {} (from {})",
                self.protocol.as_str(),
                domain,
                total_ms,
                upstream_ms,
                upstream,
                from
            );
        }
    }

    pub fn failed(
        &self,
        domain: &str,
        total_ms: f64,
        from: SocketAddr,
        error: &ForwardError,
        servfail: bool,
    ) {
        let outcome = if servfail { "SERVFAIL" } else { "DROPPED" };
        warn!(
            "[{}] {} {} total={:.3}ms (from {}): {}",
            self.protocol.as_str(),
            domain,
            outcome,
            total_ms,
            from,
            error
        );
    }

    pub fn malformed(&self, from: SocketAddr, reason: &dyn std::fmt::Display) {
        debug!(
            "[{}] malformed message from {}: {}",
            self.protocol.as_str(),
            from,
            reason
        );
    }
}
