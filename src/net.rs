//! Address classification for the embedded broker and discovery responder.
//!
//! Both subsystems only run when the configured broker host is something
//! this machine could plausibly serve itself: loopback, the unspecified
//! address, or a private LAN range. Pointing the app at a public broker
//! must never start a local listener.

use std::net::{IpAddr, ToSocketAddrs, UdpSocket};

use tracing::debug;

/// Returns true when `host` names this machine or a private LAN address.
///
/// Blank hosts count as local: the settings default is loopback and an
/// empty field falls back to it. Hostnames are resolved; resolution
/// failure only passes for the literal `localhost`.
pub fn is_local_host(host: &str) -> bool {
    let host = host.trim();
    if host.is_empty() {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_local_ip(&ip);
    }
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match (host, 0u16).to_socket_addrs() {
        Ok(mut addrs) => addrs.any(|addr| is_local_ip(&addr.ip())),
        Err(e) => {
            debug!("could not resolve host {}: {}", host, e);
            false
        }
    }
}

/// Loopback, unspecified, or private/site-local.
pub fn is_local_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_unspecified() || v4.is_private() || v4.is_link_local()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// Best-effort LAN address of this machine.
///
/// Opens a UDP socket and "connects" it to a public address, which makes
/// the OS pick the outbound interface without sending a single packet.
/// Returns None when the route resolves to loopback (no LAN connectivity).
pub fn lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}
