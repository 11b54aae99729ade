//! The property mask: a bit-set over the finite enumeration of transport
//! requirements an application can express, and its translation into a
//! concrete `(family_filter, protocols[])` pair.

use smallvec::SmallVec;
use transport_sockets::TransportProtocol;

use crate::error::{Error, Result};

/// At most four protocols (TCP/UDP/UDP-Lite/SCTP) ever survive translation;
/// a `SmallVec` avoids a heap allocation for the overwhelmingly common case.
pub type ProtocolList = SmallVec<[TransportProtocol; 4]>;

/// One bit of the property mask. Each flag is either present (REQUIRED or
/// BANNED, depending on which flag of a pair it is) or absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PropertyFlag {
    OptionalSecurity = 1 << 0,
    RequiredSecurity = 1 << 1,
    Message = 1 << 2,
    Ipv4Required = 1 << 3,
    Ipv4Banned = 1 << 4,
    Ipv6Required = 1 << 5,
    Ipv6Banned = 1 << 6,
    SctpRequired = 1 << 7,
    SctpBanned = 1 << 8,
    TcpRequired = 1 << 9,
    TcpBanned = 1 << 10,
    UdpRequired = 1 << 11,
    UdpBanned = 1 << 12,
    UdpLiteRequired = 1 << 13,
    UdpLiteBanned = 1 << 14,
    CongestionControlRequired = 1 << 15,
    CongestionControlBanned = 1 << 16,
    RetransmissionsRequired = 1 << 17,
    RetransmissionsBanned = 1 << 18,
}

/// A bit-set of [`PropertyFlag`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PropertyMask(u32);

impl PropertyMask {
    pub const EMPTY: PropertyMask = PropertyMask(0);

    pub fn set(&mut self, flag: PropertyFlag) {
        self.0 |= flag as u32;
    }

    pub fn clear(&mut self, flag: PropertyFlag) {
        self.0 &= !(flag as u32);
    }

    pub fn has(&self, flag: PropertyFlag) -> bool {
        self.0 & (flag as u32) != 0
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl FromIterator<PropertyFlag> for PropertyMask {
    fn from_iter<I: IntoIterator<Item = PropertyFlag>>(iter: I) -> Self {
        let mut mask = PropertyMask::EMPTY;
        for flag in iter {
            mask.set(flag);
        }
        mask
    }
}

/// Which IP family a lookup is restricted to, derived from the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyFilter {
    Any,
    V4Only,
    V6Only,
}

/// The result of translating a [`PropertyMask`]: a family restriction plus
/// the ordered, deduplicated set of protocols a resolution may produce
/// candidates for.
#[derive(Debug, Clone)]
pub struct TranslatedProperties {
    pub family: FamilyFilter,
    pub protocols: ProtocolList,
}

/// Translates a property mask into `(family_filter, protocols[])`, per
/// `# 6 EXTERNAL INTERFACES` of the specification.
///
/// Returns [`Error::Unable`] for conflicting REQUIRED/BANNED pairs on the
/// same feature, and for a mask that would produce an empty protocol set.
pub fn translate(mask: PropertyMask) -> Result<TranslatedProperties> {
    use PropertyFlag::*;

    if mask.has(Ipv4Required) && mask.has(Ipv4Banned) {
        return Err(Error::Unable("IPV4_REQUIRED conflicts with IPV4_BANNED"));
    }
    if mask.has(Ipv6Required) && mask.has(Ipv6Banned) {
        return Err(Error::Unable("IPV6_REQUIRED conflicts with IPV6_BANNED"));
    }
    if mask.has(Ipv4Banned) && mask.has(Ipv6Banned) {
        return Err(Error::Unable("IPV4_BANNED and IPV6_BANNED together ban every family"));
    }

    let family = if mask.has(Ipv4Required) && mask.has(Ipv6Banned) {
        FamilyFilter::V4Only
    } else if mask.has(Ipv6Required) && mask.has(Ipv4Banned) {
        FamilyFilter::V6Only
    } else {
        FamilyFilter::Any
    };

    for (required, banned, name) in [
        (SctpRequired, SctpBanned, "SCTP"),
        (TcpRequired, TcpBanned, "TCP"),
        (UdpRequired, UdpBanned, "UDP"),
        (UdpLiteRequired, UdpLiteBanned, "UDP-Lite"),
    ] {
        if mask.has(required) && mask.has(banned) {
            return Err(Error::Unable(protocol_conflict_message(name)));
        }
    }

    let mut protocols = ProtocolList::new();

    let tcp_excluded = mask.has(TcpBanned) || mask.has(Message);
    if mask.has(TcpRequired) || !tcp_excluded {
        protocols.push(TransportProtocol::Tcp);
    }

    let udp_excluded = mask.has(UdpBanned)
        || mask.has(CongestionControlRequired)
        || mask.has(RetransmissionsRequired);
    if mask.has(UdpRequired) || !udp_excluded {
        protocols.push(TransportProtocol::Udp);
    }

    let udplite_excluded = mask.has(UdpLiteBanned)
        || mask.has(CongestionControlRequired)
        || mask.has(RetransmissionsRequired);
    if mask.has(UdpLiteRequired) || !udplite_excluded {
        protocols.push(TransportProtocol::UdpLite);
    }

    let sctp_excluded = mask.has(SctpBanned);
    if mask.has(SctpRequired) || !sctp_excluded {
        protocols.push(TransportProtocol::Sctp);
    }

    // If a protocol is REQUIRED, only that protocol survives: a REQUIRED
    // flag means "only this one", not "include this one in addition".
    let required_only: ProtocolList = [
        (TcpRequired, TransportProtocol::Tcp),
        (UdpRequired, TransportProtocol::Udp),
        (UdpLiteRequired, TransportProtocol::UdpLite),
        (SctpRequired, TransportProtocol::Sctp),
    ]
    .into_iter()
    .filter(|(flag, _)| mask.has(*flag))
    .map(|(_, proto)| proto)
    .collect();

    let protocols = if !required_only.is_empty() {
        required_only
    } else {
        protocols
    };

    if protocols.is_empty() {
        return Err(Error::Unable("no protocol survives the property mask"));
    }

    if mask.has(RequiredSecurity) {
        // Security stages are not wired in (`# 9` Open Question (c)); a
        // caller that requires them must be told the request is unable to
        // proceed rather than silently dropped.
        return Err(Error::Unable(
            "REQUIRED_SECURITY is accepted but not implemented by this core",
        ));
    }

    Ok(TranslatedProperties { family, protocols })
}

fn protocol_conflict_message(name: &str) -> &'static str {
    match name {
        "SCTP" => "SCTP_REQUIRED conflicts with SCTP_BANNED",
        "TCP" => "TCP_REQUIRED conflicts with TCP_BANNED",
        "UDP" => "UDP_REQUIRED conflicts with UDP_BANNED",
        _ => "UDPLITE_REQUIRED conflicts with UDPLITE_BANNED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_set_and_get() {
        let mut mask = PropertyMask::EMPTY;
        mask.set(PropertyFlag::TcpRequired);
        assert!(mask.has(PropertyFlag::TcpRequired));
        assert!(!mask.has(PropertyFlag::UdpRequired));
    }

    #[test]
    fn conflicting_ipv4_required_and_banned_is_unable() {
        let mask: PropertyMask = [PropertyFlag::Ipv4Required, PropertyFlag::Ipv4Banned]
            .into_iter()
            .collect();

        assert!(matches!(translate(mask), Err(Error::Unable(_))));
    }

    #[test]
    fn both_families_banned_is_unable() {
        let mask: PropertyMask = [PropertyFlag::Ipv4Banned, PropertyFlag::Ipv6Banned]
            .into_iter()
            .collect();

        assert!(matches!(translate(mask), Err(Error::Unable(_))));
    }

    #[test]
    fn default_mask_includes_every_protocol() {
        let translated = translate(PropertyMask::EMPTY).unwrap();
        assert_eq!(translated.protocols.len(), 4);
        assert_eq!(translated.family, FamilyFilter::Any);
    }

    #[test]
    fn message_excludes_tcp() {
        let mask: PropertyMask = [PropertyFlag::Message].into_iter().collect();
        let translated = translate(mask).unwrap();
        assert!(!translated.protocols.contains(&TransportProtocol::Tcp));
    }

    #[test]
    fn congestion_control_required_excludes_udp_and_udplite() {
        let mask: PropertyMask = [PropertyFlag::CongestionControlRequired]
            .into_iter()
            .collect();
        let translated = translate(mask).unwrap();
        assert!(!translated.protocols.contains(&TransportProtocol::Udp));
        assert!(!translated.protocols.contains(&TransportProtocol::UdpLite));
        assert!(translated.protocols.contains(&TransportProtocol::Tcp));
    }

    #[test]
    fn ipv4_required_and_ipv6_banned_pins_family_to_v4() {
        let mask: PropertyMask = [PropertyFlag::Ipv4Required, PropertyFlag::Ipv6Banned]
            .into_iter()
            .collect();
        let translated = translate(mask).unwrap();
        assert_eq!(translated.family, FamilyFilter::V4Only);
    }

    #[test]
    fn tcp_required_excludes_every_other_protocol() {
        let mask: PropertyMask = [PropertyFlag::TcpRequired].into_iter().collect();
        let translated = translate(mask).unwrap();
        assert_eq!(translated.protocols.as_slice(), [TransportProtocol::Tcp]);
    }

    #[test]
    fn required_security_is_unable_until_wired_in() {
        let mask: PropertyMask = [PropertyFlag::RequiredSecurity].into_iter().collect();
        assert!(matches!(translate(mask), Err(Error::Unable(_))));
    }
}
