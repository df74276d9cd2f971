//! Candidate Endpoint Resolution
//!
//! Single responsibility: produce the ordered list of gateway URLs to try.
//!
//! Order:
//! 1. Explicitly configured URL
//! 2. The host's default route gateway (containers reach the host this way)
//! 3. Fixed fallback (the configured URL, else the usual bridge address)
//! 4. Well-known docker bridge addresses
//!
//! Resolution never fails. When nothing can be discovered the static
//! fallbacks are still returned.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;

/// Port the gateway listens on.
pub const GATEWAY_PORT: u16 = 47100;

/// Fallback used when no URL is configured.
pub const DEFAULT_GATEWAY_URL: &str = "ws://172.18.0.1:47100";

/// Private bridge addresses a containerised gateway is commonly reachable on.
pub const BRIDGE_FALLBACK_URLS: [&str; 3] = [
    "ws://172.17.0.1:47100",
    "ws://172.18.0.1:47100",
    "ws://172.19.0.1:47100",
];

/// Build the ordered, de-duplicated candidate list.
pub fn resolve_candidates(configured: Option<&str>, default_gateway: Option<Ipv4Addr>) -> Vec<String> {
    let configured = configured.map(str::trim).filter(|url| !url.is_empty());

    if default_gateway.is_none() {
        debug!("No default gateway discovered, using static candidates");
    }

    let discovered = default_gateway.map(|ip| format!("ws://{}:{}", ip, GATEWAY_PORT));
    let fallback = configured.unwrap_or(DEFAULT_GATEWAY_URL).to_string();

    let ordered = configured
        .map(str::to_string)
        .into_iter()
        .chain(discovered)
        .chain(std::iter::once(fallback))
        .chain(BRIDGE_FALLBACK_URLS.iter().map(|url| url.to_string()));

    let mut seen = HashSet::new();
    ordered.filter(|url| seen.insert(url.clone())).collect()
}

/// Read the routing table at `path` and return the default route gateway.
///
/// Best effort: an unreadable file yields `None`.
pub fn discover_default_gateway(path: &Path) -> Option<Ipv4Addr> {
    match std::fs::read_to_string(path) {
        Ok(table) => parse_default_gateway(&table),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Routing table not readable");
            None
        }
    }
}

/// Find the default route (destination `00000000`) in `/proc/net/route` text.
///
/// Addresses in that file are little-endian hex, so `0100A8C0` is 192.168.0.1.
pub fn parse_default_gateway(table: &str) -> Option<Ipv4Addr> {
    table.lines().skip(1).find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 3 || cols[1] != "00000000" {
            return None;
        }
        let gateway_hex = cols[2];
        if gateway_hex.len() != 8 || !gateway_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let raw = u32::from_str_radix(gateway_hex, 16).ok()?;
        Some(Ipv4Addr::from(raw.to_le_bytes()))
    })
}
