//! Network exposure: public DNS records and tunnel ingress routes.
//!
//! Both sides are best-effort from the session lifecycle's point of view: a
//! sandbox is still reachable via raw IP:port when DNS or the tunnel daemon
//! is unavailable.

mod dns;
mod tunnel;

pub use dns::{CloudflareDns, DnsApi, DnsConfig, RecordOutcome};
pub use tunnel::{IngressRule, Reloader, TunnelApi, TunnelIngress, TunnelRoutingConfig};

/// Exposure prefix for the SSH route of a session.
pub const SSH_PREFIX: &str = "ssh";
/// Exposure prefix for the HTTP route of a session.
pub const HTTP_PREFIX: &str = "http";

/// Synthesize the public hostname for one exposed service of a session.
///
/// The DNS plan tier only supports single-level subdomains, so the sandbox
/// root label is folded into the leftmost label: with domain
/// `sandbox.example.com`, user `alice` and prefix `ssh` this yields
/// `alice-ssh-sandbox.example.com`.
pub fn exposure_hostname(domain: &str, username: &str, prefix: &str) -> String {
    match domain.split_once('.') {
        Some((root_label, zone)) => format!("{username}-{prefix}-{root_label}.{zone}"),
        None => format!("{username}-{prefix}-{domain}"),
    }
}
