//! DNS cache for the SOCKS5 overlay passthrough path (spec §4.13): a
//! host→ip cache with a 5 minute TTL, records the first A/AAAA result.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry {
    ip: IpAddr,
    expires_at: Instant,
}

pub struct DnsCache {
    ttl: Duration,
    entries: DashMap<String, Entry>,
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        DnsCache {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, host: &str) -> Option<IpAddr> {
        let entry = self.entries.get(host)?;
        if entry.expires_at > Instant::now() {
            Some(entry.ip)
        } else {
            None
        }
    }

    pub fn insert(&self, host: &str, ip: IpAddr) {
        self.entries.insert(
            host.to_string(),
            Entry {
                ip,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Resolve via the cache, falling back to a standard lookup and
    /// recording the first A/AAAA record on success (spec §4.13).
    pub async fn resolve(&self, host: &str, port: u16) -> std::io::Result<IpAddr> {
        if let Some(ip) = self.get(host) {
            return Ok(ip);
        }
        let mut addrs = tokio::net::lookup_host((host, port)).await?;
        let addr = addrs
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no DNS records"))?;
        self.insert(host, addr.ip());
        Ok(addr.ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_returns_stored_ip_before_expiry() {
        let cache = DnsCache::new(Duration::from_secs(60));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        cache.insert("example.test", ip);
        assert_eq!(cache.get("example.test"), Some(ip));
    }

    #[test]
    fn cache_miss_for_unknown_host() {
        let cache = DnsCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("unknown.test"), None);
    }

    #[test]
    fn expired_entry_is_treated_as_a_miss() {
        let cache = DnsCache::new(Duration::from_millis(0));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        cache.insert("example.test", ip);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("example.test"), None);
    }
}
