//! Error types for the installer, the forward path and configuration.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure while installing the DNS redirect rules.
///
/// Any of these aborts the installation; rules appended before the failing
/// step are left in place.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Port 0 cannot be a redirect target.
    #[error("invalid redirect port {0}: must be in 1-65535")]
    InvalidPort(u16),

    /// The firewall binary could not be started at all.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The firewall command ran and exited unsuccessfully.
    #[error("iptables command failed: `{command}` exited with {status} (output: {output})")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },
}

/// Errors reading a length-prefixed DNS message from a stream.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended inside a frame.
    #[error("connection closed mid-message: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    /// The message does not fit in a 16-bit length prefix.
    #[error("message of {0} bytes exceeds the 65535 byte TCP frame limit")]
    TooLarge(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure forwarding one query upstream. Always scoped to that query.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no upstream resolvers configured")]
    NoUpstreams,

    #[error("failed to connect to upstream {upstream}: {source}")]
    Dial {
        upstream: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("upstream {upstream} did not answer within {after:?}")]
    Timeout { upstream: SocketAddr, after: Duration },

    #[error("i/o error talking to upstream {upstream}: {source}")]
    Io {
        upstream: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("upstream {upstream} sent a malformed frame: {source}")]
    Frame {
        upstream: SocketAddr,
        #[source]
        source: FrameError,
    },

    #[error("upstream {upstream} closed the connection")]
    Closed { upstream: SocketAddr },

    /// Every upstream was tried; `last` is the error from the final attempt.
    #[error("all {attempts} upstreams failed, last error: {last}")]
    Exhausted {
        attempts: usize,
        #[source]
        last: Box<ForwardError>,
    },
}

impl ForwardError {
    /// The upstream this error is about, if any.
    pub fn upstream(&self) -> Option<SocketAddr> {
        match self {
            ForwardError::Dial { upstream, .. }
            | ForwardError::Timeout { upstream, .. }
            | ForwardError::Io { upstream, .. }
            | ForwardError::Frame { upstream, .. }
            | ForwardError::Closed { upstream } => Some(*upstream),
            ForwardError::Exhausted { last, .. } => last.upstream(),
            ForwardError::NoUpstreams => None,
        }
    }
}

/// Invalid proxy configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid upstream address `{0}`")]
    InvalidUpstream(String),

    #[error("failed to read {path}: {source}")]
    ResolvConf {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
