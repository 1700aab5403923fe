//! MAC → IP lookup from the kernel ARP table
//!
//! Reads `/proc/net/arp`:
//!   IP address  HW type  Flags  HW address  Mask  Device
//! Incomplete entries (flags 0x0) and all-zero addresses are skipped.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use super::IpResolver;
use crate::config::format_mac;

const PROC_NET_ARP: &str = "/proc/net/arp";

#[derive(Debug, Clone)]
pub struct ArpTableResolver {
    path: PathBuf,
}

impl Default for ArpTableResolver {
    fn default() -> Self {
        Self::new(PROC_NET_ARP)
    }
}

impl ArpTableResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn table(&self) -> Vec<ArpEntry> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => parse_arp_table(&content),
            Err(e) => {
                debug!("Cannot read ARP table {:?}: {}", self.path, e);
                Vec::new()
            }
        }
    }

    /// Reverse lookup, used to derive a device id when no MAC is configured
    pub async fn lookup_mac(&self, ip: &str) -> Option<String> {
        self.table()
            .await
            .into_iter()
            .find(|entry| entry.ip == ip)
            .map(|entry| entry.mac)
    }
}

#[async_trait]
impl IpResolver for ArpTableResolver {
    async fn resolve_ip(&self, mac: &str) -> Option<String> {
        let wanted = format_mac(mac);
        self.table()
            .await
            .into_iter()
            .find(|entry| entry.mac == wanted)
            .map(|entry| entry.ip)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ArpEntry {
    ip: String,
    mac: String,
}

fn parse_arp_table(content: &str) -> Vec<ArpEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || fields[2] == "0x0" || fields[3] == "00:00:00:00:00:00" {
                return None;
            }
            Some(ArpEntry {
                ip: fields[0].to_string(),
                mac: format_mac(fields[3]),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TABLE: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.20     0x1         0x2         00:1c:c2:aa:bb:cc     *        eth0
192.168.1.21     0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.1      0x1         0x2         F4:12:FA:00:11:22     *        eth0
";

    #[test]
    fn test_parse_skips_incomplete() {
        let entries = parse_arp_table(TABLE);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].mac, "f4:12:fa:00:11:22");
    }

    #[tokio::test]
    async fn test_resolve_ip_by_mac() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TABLE.as_bytes()).unwrap();
        let resolver = ArpTableResolver::new(file.path());

        assert_eq!(
            resolver.resolve_ip("00-1C-C2-AA-BB-CC").await.as_deref(),
            Some("192.168.1.20")
        );
        assert_eq!(resolver.resolve_ip("00:1c:c2:00:00:01").await, None);
        assert_eq!(
            resolver.lookup_mac("192.168.1.1").await.as_deref(),
            Some("f4:12:fa:00:11:22")
        );
    }

    #[tokio::test]
    async fn test_missing_table_resolves_nothing() {
        let resolver = ArpTableResolver::new("/nonexistent/arp");
        assert_eq!(resolver.resolve_ip("00:1c:c2:aa:bb:cc").await, None);
    }
}
