//! Stable node identity derivation
//!
//! A node's ID must survive restarts so that a reconnecting client reclaims
//! its registry entry instead of appearing as a new node. The ID is derived
//! from the first non-loopback MAC address prefix plus the hostname, with
//! fallbacks to the machine-id and finally the bare hostname.

use std::path::Path;

/// Derive the stable node ID for this machine
///
/// Priority: MAC prefix + hostname, then machine-id + hostname, then
/// hostname alone. Always lowercase.
pub fn derive_node_id() -> String {
    let host = local_hostname();

    if let Some(mac) = first_mac_address() {
        return id_from_mac(&mac, &host);
    }

    if let Some(machine_id) = read_machine_id() {
        return sanitize(&format!("{}-{}", &machine_id[..machine_id.len().min(8)], host));
    }

    sanitize(&host)
}

/// Build a node ID from a MAC address and hostname
///
/// Uses the first three octets of the MAC (the vendor prefix) to keep IDs
/// short while remaining stable per interface.
pub fn id_from_mac(mac: &str, hostname: &str) -> String {
    let prefix: String = mac
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(6)
        .collect();
    sanitize(&format!("{}-{}", prefix, hostname))
}

/// Lowercase and strip characters that are unsafe in IDs and URLs
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// The local hostname, or "node" when it cannot be determined
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node".to_string())
}

/// First non-loopback MAC address from /sys/class/net
fn first_mac_address() -> Option<String> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;

    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n != "lo")
        .collect();
    names.sort();

    for name in names {
        let path = Path::new("/sys/class/net").join(&name).join("address");
        if let Ok(mac) = std::fs::read_to_string(&path) {
            let mac = mac.trim().to_string();
            if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                return Some(mac);
            }
        }
    }
    None
}

/// Contents of /etc/machine-id, if present
fn read_machine_id() -> Option<String> {
    std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
