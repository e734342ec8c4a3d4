//! Upstream resolver addresses.
//!
//! Upstreams come from the command line or, failing that, from the
//! `nameserver` lines of resolv.conf. Loopback nameservers are skipped: a stub
//! such as systemd-resolved on 127.0.0.53 is not reachable from inside the
//! sandbox namespace.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use tracing::debug;

use crate::error::ConfigError;

pub const DNS_PORT: u16 = 53;

/// Used when nothing else is configured.
pub const FALLBACK_UPSTREAM: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), DNS_PORT);

/// Parse `ip`, `ip:port`, or `[ipv6]:port`. A bare address gets port 53.
pub fn parse_upstream(s: &str) -> Result<SocketAddr, ConfigError> {
    let s = s.trim();

    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }

    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| ConfigError::InvalidUpstream(s.to_string()))
}

/// Nameservers listed in resolv.conf `contents`, in file order.
pub fn parse_resolv_conf(contents: &str) -> Vec<SocketAddr> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                return None;
            }

            let mut fields = line.split_whitespace();
            if fields.next()? != "nameserver" {
                return None;
            }

            let ip: IpAddr = match fields.next()?.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    debug!("ignoring unparsable nameserver line: {}", line);
                    return None;
                }
            };

            if ip.is_loopback() {
                debug!("ignoring loopback nameserver {}", ip);
                return None;
            }

            Some(SocketAddr::new(ip, DNS_PORT))
        })
        .collect()
}

/// Read `path` and return its usable nameservers.
pub fn upstreams_from_resolv_conf(path: &Path) -> Result<Vec<SocketAddr>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ResolvConf {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(parse_resolv_conf(&contents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_upstream_defaults_port() {
        assert_eq!(
            parse_upstream("1.1.1.1").unwrap(),
            "1.1.1.1:53".parse().unwrap()
        );
        assert_eq!(
            parse_upstream("2001:4860:4860::8888").unwrap(),
            "[2001:4860:4860::8888]:53".parse().unwrap()
        );
    }

    #[test]
    fn parse_upstream_keeps_explicit_port() {
        assert_eq!(
            parse_upstream(" 10.0.0.2:5353 ").unwrap(),
            "10.0.0.2:5353".parse().unwrap()
        );
        assert_eq!(
            parse_upstream("[::1]:5353").unwrap(),
            "[::1]:5353".parse().unwrap()
        );
    }

    #[test]
    fn parse_upstream_rejects_hostnames() {
        assert!(matches!(
            parse_upstream("dns.google"),
            Err(ConfigError::InvalidUpstream(_))
        ));
    }

    #[test]
    fn resolv_conf_skips_loopback_and_comments() {
        let contents = "\
# generated
nameserver 127.0.0.53
; nameserver 9.9.9.9
search cluster.local
nameserver 10.96.0.10
nameserver ::1
nameserver fe80::1%eth0
nameserver 2606:4700:4700::1111
options ndots:5
";

        let upstreams = parse_resolv_conf(contents);

        assert_eq!(
            upstreams,
            vec![
                "10.96.0.10:53".parse().unwrap(),
                "[2606:4700:4700::1111]:53".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn missing_resolv_conf_is_an_error() {
        let err = upstreams_from_resolv_conf(Path::new("/nonexistent/resolv.conf")).unwrap_err();

        assert!(matches!(err, ConfigError::ResolvConf { .. }));
    }
}
