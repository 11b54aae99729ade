use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use itertools::iproduct;
use transport_sockets::{SocketKind, TransportProtocol};

/// A `(src, dst, family, socktype, protocol)` tuple eligible for racing in
/// the happy-eyeballs engine. Uniqueness is `(protocol, dst, src)` per
/// `# 3 DATA MODEL`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub src: IpAddr,
    pub dst: SocketAddr,
    pub protocol: TransportProtocol,
}

impl Candidate {
    pub fn socket_type(&self) -> SocketKind {
        self.protocol.socket_type()
    }

    fn dedup_key(&self) -> (TransportProtocol, SocketAddr, IpAddr) {
        (self.protocol, self.dst, self.src)
    }
}

/// Builds the candidate set for a resolved set of destinations: the cross
/// product of `(dst, protocol, src)` restricted to matching families,
/// deduplicated on `(protocol, dst, src)`.
pub fn build_candidates<'a>(
    destinations: impl IntoIterator<Item = &'a SocketAddr>,
    protocols: &[TransportProtocol],
    sources: impl Iterator<Item = IpAddr> + Clone,
) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let sources: Vec<IpAddr> = sources.collect();

    for (dst, &protocol, src) in iproduct!(destinations, protocols, sources) {
        if crate::address::Family::of(src) != crate::address::Family::of(dst.ip()) {
            continue;
        }

        let candidate = Candidate {
            src,
            dst: *dst,
            protocol,
        };

        if seen.insert(candidate.dedup_key()) {
            out.push(candidate);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_on_protocol_dst_src() {
        let dsts: Vec<SocketAddr> = vec!["192.0.2.1:80".parse().unwrap()];
        let srcs = vec!["10.0.0.1".parse().unwrap(), "10.0.0.1".parse().unwrap()];

        let candidates = build_candidates(
            dsts.iter(),
            &[TransportProtocol::Tcp],
            srcs.into_iter(),
        );

        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn mismatched_families_are_skipped() {
        let dsts: Vec<SocketAddr> = vec!["[2001:db8::1]:80".parse().unwrap()];
        let srcs = vec!["10.0.0.1".parse().unwrap()];

        let candidates = build_candidates(dsts.iter(), &[TransportProtocol::Tcp], srcs.into_iter());

        assert!(candidates.is_empty());
    }

    #[test]
    fn cross_product_of_protocols_and_sources() {
        let dsts: Vec<SocketAddr> = vec!["192.0.2.1:80".parse().unwrap()];
        let srcs = vec![
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        ];

        let candidates = build_candidates(
            dsts.iter(),
            &[TransportProtocol::Tcp, TransportProtocol::Sctp],
            srcs.into_iter(),
        );

        assert_eq!(candidates.len(), 4);
    }
}
