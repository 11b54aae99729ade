//! Minimal DNS wire encoding/decoding for the stub resolver: one question
//! per query (`A` or `AAAA`), and just enough answer parsing to pull
//! addresses back out. Built on the `domain` crate the way this corpus's
//! own DNS interception code (`connlib/tunnel/src/dns.rs`) builds and reads
//! messages, rather than hand-rolling the wire format.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use domain::base::iana::Rtype;
use domain::base::name::Name;
use domain::base::{Message, MessageBuilder};
use domain::rdata::{A, Aaaa};

use crate::address::Family;

/// Builds a single-question `A` or `AAAA` query with the recursion-desired
/// bit set, as the stub resolver of `# 4.2` issues per `(src, server)` pair.
pub fn build_query(id: u16, name: &str, family: Family) -> Option<Vec<u8>> {
    let qname = Name::<Vec<u8>>::from_str(name).ok()?;
    let qtype = match family {
        Family::V4 => Rtype::A,
        Family::V6 => Rtype::AAAA,
    };

    let target = Vec::with_capacity(512);
    let mut builder = MessageBuilder::from_target(target).ok()?;
    builder.header_mut().set_id(id);
    builder.header_mut().set_rd(true);

    let mut question = builder.question();
    question.push((&qname, qtype)).ok()?;

    Some(question.finish())
}

/// Parses a DNS response, returning the query id and whatever `A`/`AAAA`
/// addresses it carries. Per `# 4.2`: truncated answers are accepted as
/// long as at least one address parses; a fully unparseable message yields
/// `None` rather than a hard error (the pair simply contributes nothing).
pub fn parse_response(buf: &[u8]) -> Option<(u16, Vec<IpAddr>)> {
    let message = Message::from_slice(buf).ok()?;
    if !message.header().qr() {
        return None;
    }

    let id = message.header().id();
    let mut addrs = Vec::new();

    let answer = message.answer().ok()?;

    if let Ok(records) = answer.clone().limit_to::<A>() {
        for record in records.flatten() {
            let addr: Ipv4Addr = record.data().addr();
            addrs.push(IpAddr::V4(addr));
        }
    }

    if let Ok(records) = answer.limit_to::<Aaaa>() {
        for record in records.flatten() {
            let addr: Ipv6Addr = record.data().addr();
            addrs.push(IpAddr::V6(addr));
        }
    }

    Some((id, addrs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_well_formed_a_query() {
        let query = build_query(0x1234, "example.com", Family::V4).expect("query should build");

        assert!(query.len() >= 12, "must at least contain a DNS header");
        // Header ID is the first two bytes, big-endian.
        assert_eq!(u16::from_be_bytes([query[0], query[1]]), 0x1234);
    }

    #[test]
    fn rejects_response_without_qr_bit() {
        let query = build_query(1, "example.com", Family::V4).unwrap();
        assert!(parse_response(&query).is_none());
    }
}
