//! Drives the sans-IO cores together the way `Context` does internally,
//! but with synthetic readiness instead of a real NIC/DNS server: a literal
//! lookup feeds a happy-eyeballs race, and the race is settled by hand.

use std::time::Instant;

use transport_services::address::{AddressRecord, AddressScope, Family};
use transport_services::address_cache::{AddressCache, AddressEvent};
use transport_services::happy_eyeballs::HappyEyeballs;
use transport_services::property::{translate, PropertyFlag, PropertyMask};
use transport_services::resolver::{LookupOutcome, Resolver};
use transport_services::Config;

fn cache_with(addr: &str) -> AddressCache {
    let mut cache = AddressCache::new();
    let addr: std::net::IpAddr = addr.parse().unwrap();
    cache.apply(AddressEvent::Added(AddressRecord {
        family: Family::of(addr),
        addr,
        ifindex: 1,
        scope: AddressScope::Universe,
        preferred_lifetime: 0,
        valid_lifetime: 0,
    }));
    cache
}

#[test]
fn literal_lookup_feeds_a_happy_eyeballs_race_to_a_winner() {
    let config = Config::default();
    let cache = cache_with("192.0.2.10");
    let now = Instant::now();

    let mut mask = PropertyMask::EMPTY;
    mask.set(PropertyFlag::TcpRequired);
    let translated = translate(mask).expect("TCP-only mask always translates");

    let mut resolver = Resolver::new(config.resolver.clone());
    resolver.lookup(
        "203.0.113.5",
        443,
        translated.family,
        translated.protocols,
        &cache,
        now,
    );

    // Literal addresses never emit a command; they just need the timer to
    // fire once the literal timeout has elapsed.
    assert!(resolver.poll_command().is_none());
    resolver.handle_timeout(now + config.resolver.dns_literal_timeout);

    let event = resolver.poll_event().expect("literal lookup completes");
    let candidates = match event.outcome {
        LookupOutcome::Success(candidates) => candidates,
        LookupOutcome::Failure(e) => panic!("expected success, got {e:?}"),
    };
    assert_eq!(candidates.len(), 1);

    let mut happy_eyeballs = HappyEyeballs::new();
    let race = happy_eyeballs.race(candidates);

    // Exactly one candidate, so exactly one connect command.
    let command = happy_eyeballs
        .poll_command()
        .expect("race emits a connect command per candidate");
    let (race_from_command, candidate_id) = match command {
        transport_services::happy_eyeballs::HappyEyeballsCommand::Connect {
            race, id, ..
        } => (race, id),
        other => panic!("expected a Connect command, got {other:?}"),
    };
    assert!(happy_eyeballs.poll_command().is_none());

    happy_eyeballs.handle_writable(
        race_from_command,
        candidate_id,
        Ok(()),
        transport_sockets::SocketOptions::default(),
    );

    let winner = happy_eyeballs.poll_winner().expect("a clean writable wins");
    assert_eq!(winner.race, race);
    assert_eq!(winner.candidate_id, candidate_id);
}

#[test]
fn race_with_every_candidate_failing_reports_failure() {
    let cache = cache_with("10.1.1.1");
    let now = Instant::now();

    let mut mask = PropertyMask::EMPTY;
    mask.set(PropertyFlag::UdpRequired);
    let translated = translate(mask).unwrap();

    let mut resolver = Resolver::new(Config::default().resolver);
    resolver.lookup(
        "10.1.1.2",
        9,
        translated.family,
        translated.protocols,
        &cache,
        now,
    );
    resolver.handle_timeout(now + Config::default().resolver.dns_literal_timeout);
    let event = resolver.poll_event().unwrap();
    let candidates = match event.outcome {
        LookupOutcome::Success(c) => c,
        LookupOutcome::Failure(e) => panic!("expected success, got {e:?}"),
    };

    let mut happy_eyeballs = HappyEyeballs::new();
    let race = happy_eyeballs.race(candidates);

    let mut candidate_ids = Vec::new();
    while let Some(transport_services::happy_eyeballs::HappyEyeballsCommand::Connect {
        id,
        ..
    }) = happy_eyeballs.poll_command()
    {
        candidate_ids.push(id);
    }

    for id in candidate_ids {
        happy_eyeballs.handle_connect_error(race, id);
    }

    assert_eq!(happy_eyeballs.poll_failure(), Some(race));
    assert!(happy_eyeballs.poll_winner().is_none());
}
