//! Bypass marker shared by the redirect installer and the upstream dialer.
//!
//! The installer's `RETURN` rules match on this value and the dialer stamps it
//! on every upstream socket. Both sides read it from here and nowhere else.

/// Packet mark carried by the proxy's own upstream sockets.
pub const BYPASS_MARK: u32 = 0x1;

/// The mark as iptables expects it on the command line (`0x1`).
pub fn bypass_mark_arg() -> String {
    format!("{BYPASS_MARK:#x}")
}
