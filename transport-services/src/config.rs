//! Tunable knobs the original hardcodes as literals. `Config::default()`
//! reproduces the original's behavior exactly; every field is documented
//! with the spec section it covers.

use std::net::SocketAddr;
use std::time::Duration;

use crate::address::Family;
use crate::resolver::{
    DEFAULT_DNS_LITERAL_TIMEOUT, DEFAULT_DNS_RESOLVED_TIMEOUT, DEFAULT_DNS_TIMEOUT,
    DEFAULT_MAX_NUM_RESOLVED,
};

/// The subset of [`Config`] the `Resolver` core needs, so it doesn't have to
/// carry knobs (listen backlog, address tick interval) that are none of its
/// business.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// `# 4.2`: how long the literal-address fast path waits before
    /// completing, with no network traffic at all.
    pub dns_literal_timeout: Duration,
    /// `# 4.2`: restarted on every newly recorded answer; fires the lookup
    /// once no pair has produced a new address for this long.
    pub dns_resolved_timeout: Duration,
    /// `# 4.2`: absolute ceiling from the first query sent, regardless of
    /// whether any answers have arrived.
    pub dns_timeout: Duration,
    /// `# 6`: upper bound on addresses recorded per `(src, server)` pair.
    pub max_num_resolved: usize,
    upstream_v4: Vec<SocketAddr>,
    upstream_v6: Vec<SocketAddr>,
}

impl ResolverConfig {
    pub fn upstream_servers(&self, family: Family) -> &[SocketAddr] {
        match family {
            Family::V4 => &self.upstream_v4,
            Family::V6 => &self.upstream_v6,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            dns_literal_timeout: DEFAULT_DNS_LITERAL_TIMEOUT,
            dns_resolved_timeout: DEFAULT_DNS_RESOLVED_TIMEOUT,
            dns_timeout: DEFAULT_DNS_TIMEOUT,
            max_num_resolved: DEFAULT_MAX_NUM_RESOLVED,
            // Google and OpenDNS public resolvers, the first two entries of
            // `neat_resolver.h`'s INET_DNS_SERVERS/INET6_DNS_SERVERS lists.
            upstream_v4: vec![
                SocketAddr::from(([8, 8, 8, 8], 53)),
                SocketAddr::from(([208, 67, 222, 222], 53)),
            ],
            upstream_v6: vec![
                SocketAddr::from(("2001:4860:4860::8888".parse::<std::net::Ipv6Addr>().unwrap(), 53)),
                SocketAddr::from(("2620:0:ccc::2".parse::<std::net::Ipv6Addr>().unwrap(), 53)),
            ],
        }
    }
}

/// Top-level configuration for a [`crate::context::Context`].
#[derive(Debug, Clone)]
pub struct Config {
    pub resolver: ResolverConfig,
    /// `# 4.4`: backlog passed to `listen()` for passive flows.
    pub listen_backlog: i32,
    /// `# 4.1`: how often `AddressCache::tick` is driven by the `Context`.
    pub address_lifetime_tick: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolver: ResolverConfig::default(),
            listen_backlog: 100,
            address_lifetime_tick: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_upstream_servers_match_the_documented_pairs() {
        let config = ResolverConfig::default();
        assert_eq!(config.upstream_servers(Family::V4).len(), 2);
        assert_eq!(config.upstream_servers(Family::V6).len(), 2);
    }

    #[test]
    fn default_timeouts_match_spec_constants() {
        let config = ResolverConfig::default();
        assert_eq!(config.dns_literal_timeout, Duration::from_millis(100));
        assert_eq!(config.dns_resolved_timeout, Duration::from_secs(1));
        assert_eq!(config.dns_timeout, Duration::from_secs(30));
    }
}
