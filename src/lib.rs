//! egress-dns - transparent DNS interception for sandbox network namespaces.
//!
//! Outbound port-53 traffic is redirected by NAT rules ([`iptables`]) to a
//! local proxy ([`proxy`]) that forwards it to a real resolver through sockets
//! carrying the bypass mark ([`dialer`], [`mark`]), so the proxy's own
//! queries are not redirected back into it.

pub mod dialer;
pub mod dns;
pub mod error;
pub mod forwarder;
pub mod iptables;
pub mod mark;
pub mod proxy;
pub mod resolv;
pub mod stats;
pub mod transport;
