//! Identifiers, size constants, and epoch-time helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// A node is identified by its fully qualified domain name.
pub type NodeName = String;

/// Object identifiers (instances, networks, interfaces, blobs).
pub type ObjectUuid = String;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Name of the queue shared by whichever node holds the network role.
pub const NETWORK_NODE_QUEUE: &str = "networknode";

/// Seconds since the unix epoch, with sub-second precision.
pub fn epoch_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Whole seconds since the unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Best-effort host name lookup used as the default node name.
pub fn local_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_helpers_agree() {
        let whole = epoch_secs();
        let fractional = epoch_secs_f64();
        assert!(fractional >= whole as f64);
        assert!(fractional - (whole as f64) < 2.0);
    }

    #[test]
    fn hostname_is_never_empty() {
        assert!(!local_hostname().is_empty());
    }
}
