//! Address records: the unit the `AddressCache` stores and the `Resolver`
//! consumes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Family {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// `0` means "infinite"; see `# 3 DATA MODEL`.
pub const INFINITE_LIFETIME: u32 = 0;

/// A usable source address on the host, as maintained by the `AddressCache`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub family: Family,
    pub addr: IpAddr,
    pub ifindex: u32,
    pub scope: AddressScope,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScope {
    Universe,
    Site,
    Link,
    Host,
    Nowhere,
}

impl AddressRecord {
    /// Identity used to match an `ADD` against an existing record, and to
    /// match a `DEL` against the record it should remove.
    pub fn key(&self) -> (Family, IpAddr, u32) {
        (self.family, self.addr, self.ifindex)
    }

    pub fn is_infinite(&self) -> bool {
        self.valid_lifetime == INFINITE_LIFETIME
    }

    /// Decrements both lifetimes by one tick (floor zero). Infinite
    /// lifetimes are never decremented. Returns `true` if the record has
    /// now expired (`valid_lifetime` reached zero from a finite value).
    pub fn tick(&mut self) -> bool {
        if self.is_infinite() {
            return false;
        }

        self.preferred_lifetime = self.preferred_lifetime.saturating_sub(1);
        self.valid_lifetime = self.valid_lifetime.saturating_sub(1);

        self.valid_lifetime == 0
    }
}

/// IPv6 Unique Local Address prefix `fc00::/7`: top 7 bits are `1111_110`.
pub fn is_ula(addr: Ipv6Addr) -> bool {
    addr.octets()[0] & 0b1111_1110 == 0b1111_1100
}

/// A loopback interface entry is excluded per `# 3 DATA MODEL`; this checks
/// the address itself, which is how the original distinguishes a loopback
/// entry (the interface carries no information the cache retains otherwise).
pub fn is_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Whether an address record is eligible to enter the cache at all, per the
/// invariants in `# 3 DATA MODEL`:
/// - loopback entries are excluded
/// - an IPv6 record is excluded unless its scope is *universe* or it is ULA
pub fn is_admissible(family: Family, addr: IpAddr, scope: AddressScope) -> bool {
    if is_loopback(addr) {
        return false;
    }

    if family == Family::V6 {
        let IpAddr::V6(v6) = addr else {
            unreachable!("family tag must match address variant")
        };

        // Open Question (a) in `# 9`: the original's actual filter also lets
        // through a ULA address at a non-universe scope, i.e. the exclusion
        // is `scope != universe && !is_ula`. We keep the ambiguity resolved
        // the same way here: ULA addresses are admitted regardless of scope.
        if scope != AddressScope::Universe && !is_ula(v6) {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ula_prefix_is_detected() {
        assert!(is_ula("fc00::1".parse().unwrap()));
        assert!(is_ula("fdff:ffff::1".parse().unwrap()));
        assert!(!is_ula("fe80::1".parse().unwrap()));
        assert!(!is_ula("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn loopback_addresses_are_inadmissible() {
        assert!(!is_admissible(
            Family::V4,
            "127.0.0.1".parse().unwrap(),
            AddressScope::Universe
        ));
        assert!(!is_admissible(
            Family::V6,
            "::1".parse().unwrap(),
            AddressScope::Universe
        ));
    }

    #[test]
    fn non_universe_non_ula_v6_is_excluded() {
        assert!(!is_admissible(
            Family::V6,
            "fe80::1".parse().unwrap(),
            AddressScope::Link
        ));
    }

    #[test]
    fn ula_is_admitted_even_at_link_scope() {
        assert!(is_admissible(
            Family::V6,
            "fc00::1".parse().unwrap(),
            AddressScope::Link
        ));
    }

    #[test]
    fn universe_scope_v6_is_admitted() {
        assert!(is_admissible(
            Family::V6,
            "2001:db8::1".parse().unwrap(),
            AddressScope::Universe
        ));
    }

    #[test]
    fn finite_lifetime_ticks_down_to_expiry() {
        let mut record = AddressRecord {
            family: Family::V6,
            addr: "fc00::1".parse().unwrap(),
            ifindex: 1,
            scope: AddressScope::Universe,
            preferred_lifetime: 1,
            valid_lifetime: 2,
        };

        assert!(!record.tick());
        assert_eq!(record.valid_lifetime, 1);
        assert_eq!(record.preferred_lifetime, 0);

        assert!(record.tick());
        assert_eq!(record.valid_lifetime, 0);
    }

    #[test]
    fn infinite_lifetime_never_ticks_down() {
        let mut record = AddressRecord {
            family: Family::V4,
            addr: "10.0.0.1".parse().unwrap(),
            ifindex: 1,
            scope: AddressScope::Universe,
            preferred_lifetime: INFINITE_LIFETIME,
            valid_lifetime: INFINITE_LIFETIME,
        };

        assert!(!record.tick());
        assert_eq!(record.valid_lifetime, INFINITE_LIFETIME);
    }
}
