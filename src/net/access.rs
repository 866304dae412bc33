//! Access control: allow/deny rules, CIDR matching and a cached resolver.
//!
//! Evaluation is deny-first: any matching deny rule rejects the peer before
//! allow rules are consulted. An empty allow list accepts everything not
//! denied. Hostname rules are resolved through a TTL cache and are
//! inherently DNS-dependent; prefer address or CIDR rules where the access
//! decision is security-critical.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use crate::types::now_secs;
use tracing::{debug, warn};

/// Default TTL for cached resolutions, seconds.
pub const DNS_CACHE_TTL_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("invalid access rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("cannot read rule file {path}: {source}")]
    RuleFile { path: String, source: io::Error },

    #[error("peer {0} denied by access list")]
    Denied(IpAddr),
}

/// A single access rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessRule {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Cidr4 { net: Ipv4Addr, prefix: u8 },
    Cidr6 { net: Ipv6Addr, prefix: u8 },
    Hostname(String),
}

impl AccessRule {
    /// Address-only match (port is never part of the decision). Hostname
    /// rules are matched by the list, which owns the resolver cache.
    fn matches_ip(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (AccessRule::Ipv4(a), IpAddr::V4(b)) => *a == b,
            (AccessRule::Ipv6(a), IpAddr::V6(b)) => *a == b,
            (AccessRule::Cidr4 { net, prefix }, IpAddr::V4(b)) => {
                cidr4_match(*net, *prefix, b)
            }
            (AccessRule::Cidr6 { net, prefix }, IpAddr::V6(b)) => {
                cidr6_match(*net, *prefix, b)
            }
            _ => false,
        }
    }

    pub fn is_hostname(&self) -> bool {
        matches!(self, AccessRule::Hostname(_))
    }
}

/// Top `prefix` bits equal, family-matched. Prefix 0 matches everything.
fn cidr4_match(net: Ipv4Addr, prefix: u8, addr: Ipv4Addr) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = 32 - prefix as u32;
    (u32::from(net) >> shift) == (u32::from(addr) >> shift)
}

fn cidr6_match(net: Ipv6Addr, prefix: u8, addr: Ipv6Addr) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = 128 - prefix as u32;
    (u128::from(net) >> shift) == (u128::from(addr) >> shift)
}

fn valid_hostname(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'_')
}

impl FromStr for AccessRule {
    type Err = AccessError;

    /// Greedy parse with fallback: a slash means CIDR (v4 tried first),
    /// then literal IP, then hostname.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| AccessError::InvalidRule {
            rule: s.to_string(),
            reason: reason.to_string(),
        };

        if let Some((addr_part, prefix_part)) = s.split_once('/') {
            let prefix: u8 = prefix_part
                .parse()
                .map_err(|_| invalid("prefix is not a number"))?;
            if let Ok(v4) = addr_part.parse::<Ipv4Addr>() {
                if prefix > 32 {
                    return Err(invalid("IPv4 prefix exceeds 32"));
                }
                return Ok(AccessRule::Cidr4 { net: v4, prefix });
            }
            if let Ok(v6) = addr_part.parse::<Ipv6Addr>() {
                if prefix > 128 {
                    return Err(invalid("IPv6 prefix exceeds 128"));
                }
                return Ok(AccessRule::Cidr6 { net: v6, prefix });
            }
            return Err(invalid("CIDR base is not an IP address"));
        }

        if let Ok(v4) = s.parse::<Ipv4Addr>() {
            return Ok(AccessRule::Ipv4(v4));
        }
        if let Ok(v6) = s.parse::<Ipv6Addr>() {
            return Ok(AccessRule::Ipv6(v6));
        }
        if valid_hostname(s) {
            return Ok(AccessRule::Hostname(s.to_string()));
        }
        Err(invalid("neither IP, CIDR nor hostname"))
    }
}

impl std::fmt::Display for AccessRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessRule::Ipv4(a) => write!(f, "{a}"),
            AccessRule::Ipv6(a) => write!(f, "{a}"),
            AccessRule::Cidr4 { net, prefix } => write!(f, "{net}/{prefix}"),
            AccessRule::Cidr6 { net, prefix } => write!(f, "{net}/{prefix}"),
            AccessRule::Hostname(h) => write!(f, "{h}"),
        }
    }
}

struct DnsEntry {
    addrs: Vec<IpAddr>,
    expires_at: u64,
}

type LookupFn = dyn Fn(&str) -> io::Result<Vec<IpAddr>> + Send + Sync;

/// TTL-bound resolver cache. Entries are immutable once inserted; expired
/// entries are evicted lazily on access. Failed resolutions are cached as
/// empty sets so a dead name does not trigger a lookup per connection.
pub struct DnsCache {
    ttl_secs: u64,
    entries: Mutex<HashMap<String, DnsEntry>>,
    lookup: Arc<LookupFn>,
}

impl DnsCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self::with_lookup(ttl_secs, Arc::new(system_lookup))
    }

    /// Inject the resolver; tests use a counting stub.
    pub fn with_lookup(ttl_secs: u64, lookup: Arc<LookupFn>) -> Self {
        Self {
            ttl_secs,
            entries: Mutex::new(HashMap::new()),
            lookup,
        }
    }

    /// Resolve through the cache. Never fails: resolution errors come back
    /// as an empty set (and get negative-cached).
    pub async fn resolve(&self, host: &str) -> Vec<IpAddr> {
        {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(host) {
                Some(entry) if entry.expires_at > now_secs() => {
                    return entry.addrs.clone();
                }
                Some(_) => {
                    entries.remove(host);
                }
                None => {}
            }
        }

        let lookup = self.lookup.clone();
        let name = host.to_string();
        let addrs = tokio::task::spawn_blocking(move || lookup(&name))
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e.to_string())))
            .unwrap_or_else(|e| {
                debug!("resolution of {} failed: {}", host, e);
                Vec::new()
            });

        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            host.to_string(),
            DnsEntry {
                addrs: addrs.clone(),
                expires_at: now_secs() + self.ttl_secs,
            },
        );
        addrs
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn system_lookup(host: &str) -> io::Result<Vec<IpAddr>> {
    let addrs: Vec<IpAddr> = format!("{host}:0")
        .to_socket_addrs()?
        .map(|a| a.ip())
        .collect();
    Ok(addrs)
}

/// Ordered allow and deny rule sequences plus the shared resolver cache.
pub struct AccessList {
    allow: Vec<AccessRule>,
    deny: Vec<AccessRule>,
    cache: DnsCache,
}

impl AccessList {
    pub fn new(allow: Vec<AccessRule>, deny: Vec<AccessRule>) -> Self {
        Self {
            allow,
            deny,
            cache: DnsCache::new(DNS_CACHE_TTL_SECS),
        }
    }

    pub fn with_cache(allow: Vec<AccessRule>, deny: Vec<AccessRule>, cache: DnsCache) -> Self {
        Self { allow, deny, cache }
    }

    /// Build from in-memory rule strings plus optional rule files
    /// (one rule per line, `#` comments).
    pub fn from_sources(
        allow_rules: &[String],
        deny_rules: &[String],
        allow_file: Option<&Path>,
        deny_file: Option<&Path>,
    ) -> Result<Self, AccessError> {
        let mut allow = parse_rules(allow_rules)?;
        let mut deny = parse_rules(deny_rules)?;
        if let Some(path) = allow_file {
            allow.extend(load_rule_file(path)?);
        }
        if let Some(path) = deny_file {
            deny.extend(load_rule_file(path)?);
        }
        for rule in allow.iter().chain(deny.iter()) {
            if rule.is_hostname() {
                warn!(
                    "hostname rule '{}' depends on DNS; prefer IP or CIDR rules \
                     for security-critical filtering",
                    rule
                );
            }
        }
        Ok(Self::new(allow, deny))
    }

    pub fn allow_is_empty(&self) -> bool {
        self.allow.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Deny-first evaluation; ports are ignored throughout.
    pub async fn evaluate(&self, peer: IpAddr) -> bool {
        for rule in &self.deny {
            if self.rule_matches(rule, peer).await {
                return false;
            }
        }
        if self.allow.is_empty() {
            return true;
        }
        for rule in &self.allow {
            if self.rule_matches(rule, peer).await {
                return true;
            }
        }
        false
    }

    /// Evaluate and surface a typed denial.
    pub async fn check(&self, peer: IpAddr) -> Result<(), AccessError> {
        if self.evaluate(peer).await {
            Ok(())
        } else {
            Err(AccessError::Denied(peer))
        }
    }

    async fn rule_matches(&self, rule: &AccessRule, peer: IpAddr) -> bool {
        match rule {
            AccessRule::Hostname(host) => {
                // Resolution failure means "no match", never "match".
                self.cache.resolve(host).await.contains(&peer)
            }
            other => other.matches_ip(peer),
        }
    }
}

pub fn parse_rules(rules: &[String]) -> Result<Vec<AccessRule>, AccessError> {
    rules.iter().map(|r| r.trim().parse()).collect()
}

fn load_rule_file(path: &Path) -> Result<Vec<AccessRule>, AccessError> {
    let text = std::fs::read_to_string(path).map_err(|source| AccessError::RuleFile {
        path: path.display().to_string(),
        source,
    })?;
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.parse())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rules(v: &[&str]) -> Vec<AccessRule> {
        v.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!(
            "10.0.0.1".parse::<AccessRule>().unwrap(),
            AccessRule::Ipv4(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert!(matches!(
            "::1".parse::<AccessRule>().unwrap(),
            AccessRule::Ipv6(_)
        ));
        assert_eq!(
            "192.168.0.0/24".parse::<AccessRule>().unwrap(),
            AccessRule::Cidr4 {
                net: Ipv4Addr::new(192, 168, 0, 0),
                prefix: 24
            }
        );
        assert!(matches!(
            "2001:db8::/32".parse::<AccessRule>().unwrap(),
            AccessRule::Cidr6 { prefix: 32, .. }
        ));
        assert_eq!(
            "example.com".parse::<AccessRule>().unwrap(),
            AccessRule::Hostname("example.com".into())
        );
    }

    #[test]
    fn test_parse_rejects_bad_prefix() {
        assert!("10.0.0.0/33".parse::<AccessRule>().is_err());
        assert!("::/129".parse::<AccessRule>().is_err());
        assert!("foo/24".parse::<AccessRule>().is_err());
        assert!("not a host!".parse::<AccessRule>().is_err());
    }

    #[test]
    fn test_display_parse_roundtrip() {
        for s in ["10.0.0.1", "::1", "192.168.0.0/24", "2001:db8::/32", "0.0.0.0/0"] {
            let rule: AccessRule = s.parse().unwrap();
            let again: AccessRule = rule.to_string().parse().unwrap();
            assert_eq!(rule, again, "roundtrip failed for {s}");
        }
    }

    #[test]
    fn test_cidr_boundaries() {
        // /31 covers exactly two addresses.
        let net = Ipv4Addr::new(10, 0, 0, 0);
        assert!(cidr4_match(net, 31, Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!cidr4_match(net, 31, Ipv4Addr::new(10, 0, 0, 2)));
        // /32 is a single host.
        assert!(cidr4_match(net, 32, net));
        assert!(!cidr4_match(net, 32, Ipv4Addr::new(10, 0, 0, 1)));
        // /0 matches anything.
        assert!(cidr4_match(net, 0, Ipv4Addr::new(255, 255, 255, 255)));
        // v6 prefix boundary.
        let net6: Ipv6Addr = "2001:db8::".parse().unwrap();
        assert!(cidr6_match(net6, 32, "2001:db8:ffff::1".parse().unwrap()));
        assert!(!cidr6_match(net6, 32, "2001:db9::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_deny_wins_over_allow() {
        let list = AccessList::new(rules(&["10.0.0.0/8"]), rules(&["10.1.2.3"]));
        assert!(!list.evaluate("10.1.2.3".parse().unwrap()).await);
        assert!(list.evaluate("10.9.9.9".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn test_empty_allow_accepts_unless_denied() {
        let list = AccessList::new(vec![], rules(&["192.168.1.0/24"]));
        assert!(list.evaluate("8.8.8.8".parse().unwrap()).await);
        assert!(!list.evaluate("192.168.1.77".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn test_nonempty_allow_requires_match() {
        let list = AccessList::new(rules(&["127.0.0.1"]), vec![]);
        assert!(list.evaluate("127.0.0.1".parse().unwrap()).await);
        assert!(!list.evaluate("127.0.0.2".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn test_dns_cache_single_lookup_within_ttl() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cache = DnsCache::with_lookup(
            300,
            Arc::new(move |_h: &str| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(vec!["1.2.3.4".parse().unwrap()])
            }),
        );
        let a = cache.resolve("example.com").await;
        let b = cache.resolve("example.com").await;
        assert_eq!(a, b);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dns_negative_caching() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cache = DnsCache::with_lookup(
            300,
            Arc::new(move |_h: &str| {
                c.fetch_add(1, Ordering::SeqCst);
                Err(io::Error::new(io::ErrorKind::NotFound, "nxdomain"))
            }),
        );
        assert!(cache.resolve("dead.invalid").await.is_empty());
        assert!(cache.resolve("dead.invalid").await.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hostname_rule_matches_via_cache() {
        let cache = DnsCache::with_lookup(
            300,
            Arc::new(|_h: &str| Ok(vec!["10.5.5.5".parse().unwrap()])),
        );
        let list = AccessList::with_cache(rules(&["trusted.example"]), vec![], cache);
        assert!(list.evaluate("10.5.5.5".parse().unwrap()).await);
        assert!(!list.evaluate("10.5.5.6".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn test_hostname_resolution_failure_never_matches() {
        let cache = DnsCache::with_lookup(
            300,
            Arc::new(|_h: &str| Err(io::Error::new(io::ErrorKind::NotFound, "nxdomain"))),
        );
        let list = AccessList::with_cache(rules(&["ghost.example"]), vec![], cache);
        assert!(!list.evaluate("10.5.5.5".parse().unwrap()).await);
    }

    #[test]
    fn test_rule_file_loading() {
        let path = std::env::temp_dir().join(format!("rcat_rules_{}.txt", std::process::id()));
        std::fs::write(&path, "# comment\n10.0.0.0/8\n\nexample.org\n").unwrap();
        let rules = load_rule_file(&path).unwrap();
        assert_eq!(rules.len(), 2);
        std::fs::remove_file(&path).ok();
    }
}
