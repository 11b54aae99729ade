//! Concurrent candidate racing: allocate a socket per candidate, start a
//! non-blocking connect, commit to the first candidate whose writable
//! readiness arrives with a clean `SO_ERROR`, and tear down the losers.
//!
//! Sans-IO like the rest of the core: this module never touches a socket.
//! It emits [`HappyEyeballsCommand`]s for the `Context` to execute (socket
//! allocation, `connect()`, the `SO_ERROR` check) and consumes the results
//! via [`HappyEyeballs::handle_writable`].

use std::collections::{HashMap, VecDeque};
use std::io;

use transport_sockets::SocketOptions;

use crate::resolver::Candidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RaceId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CandidateId(u64);

impl CandidateId {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }
}

/// An instruction for the `Context` to carry out against real sockets.
#[derive(Debug)]
pub enum HappyEyeballsCommand {
    /// Allocate a candidate socket, apply its protocol options, and start a
    /// non-blocking `connect()` towards `candidate.dst`. The `Context`
    /// registers the resulting socket for writable readiness and reports
    /// back via [`HappyEyeballs::handle_writable`].
    Connect {
        race: RaceId,
        id: CandidateId,
        candidate: Candidate,
    },
    /// A non-winning candidate: stop polling its socket and close it.
    Abandon { race: RaceId, id: CandidateId },
}

#[derive(Debug)]
pub struct Winner {
    pub race: RaceId,
    pub candidate: Candidate,
    pub candidate_id: CandidateId,
}

enum CandidateState {
    Connecting,
    Failed,
}

struct Race {
    candidates: HashMap<CandidateId, (Candidate, CandidateState)>,
    /// Set once a winner has been chosen; per `# 4.3`'s `hefirstConnect`
    /// guard, any later arrival for this race is ignored.
    settled: bool,
}

/// The sans-IO happy-eyeballs core. One instance races exactly one
/// candidate set per [`Self::race`] call; the `Context` may drive several
/// concurrently, each under its own [`RaceId`].
pub struct HappyEyeballs {
    next_race_id: u64,
    next_candidate_id: u64,
    races: HashMap<RaceId, Race>,
    pending_commands: VecDeque<HappyEyeballsCommand>,
    pending_winners: VecDeque<Winner>,
    pending_failures: VecDeque<RaceId>,
}

impl Default for HappyEyeballs {
    fn default() -> Self {
        Self::new()
    }
}

impl HappyEyeballs {
    pub fn new() -> Self {
        Self {
            next_race_id: 0,
            next_candidate_id: 0,
            races: HashMap::new(),
            pending_commands: VecDeque::new(),
            pending_winners: VecDeque::new(),
            pending_failures: VecDeque::new(),
        }
    }

    /// Starts racing a non-empty candidate list. `candidates` must not be
    /// empty; the caller (`Context::open`) is responsible for turning an
    /// empty resolved set into a `ResolverPolicy`/`Unable` error before it
    /// ever reaches here.
    pub fn race(&mut self, candidates: Vec<Candidate>) -> RaceId {
        debug_assert!(!candidates.is_empty(), "race() requires at least one candidate");

        let race_id = RaceId(self.next_race_id);
        self.next_race_id += 1;

        let mut entries = HashMap::new();
        for candidate in candidates {
            let id = CandidateId(self.next_candidate_id);
            self.next_candidate_id += 1;
            entries.insert(id, (candidate.clone(), CandidateState::Connecting));
            self.pending_commands.push_back(HappyEyeballsCommand::Connect {
                race: race_id,
                id,
                candidate,
            });
        }

        self.races.insert(
            race_id,
            Race {
                candidates: entries,
                settled: false,
            },
        );

        race_id
    }

    /// Reports that `id`'s socket became writable; `so_error` is the result
    /// of the `Context`'s `SO_ERROR` check (per Open Question (b), this
    /// must be consulted explicitly rather than trusting bare writability).
    pub fn handle_writable(
        &mut self,
        race: RaceId,
        id: CandidateId,
        so_error: io::Result<()>,
        _options: SocketOptions,
    ) {
        let Some(race_state) = self.races.get_mut(&race) else {
            return;
        };
        if race_state.settled {
            return;
        }

        match so_error {
            Ok(()) => {
                let Some((candidate, state)) = race_state.candidates.get_mut(&id) else {
                    return;
                };
                *state = CandidateState::Connecting;
                race_state.settled = true;

                let winner_candidate = candidate.clone();
                let losers: Vec<CandidateId> = race_state
                    .candidates
                    .keys()
                    .copied()
                    .filter(|&other| other != id)
                    .collect();

                for loser in losers {
                    self.pending_commands
                        .push_back(HappyEyeballsCommand::Abandon { race, id: loser });
                }

                self.pending_winners.push_back(Winner {
                    race,
                    candidate: winner_candidate,
                    candidate_id: id,
                });
            }
            Err(e) => {
                tracing::debug!(?id, error = %e, "candidate failed its SO_ERROR check");
                if let Some((_, state)) = race_state.candidates.get_mut(&id) {
                    *state = CandidateState::Failed;
                }

                if race_state
                    .candidates
                    .values()
                    .all(|(_, state)| matches!(state, CandidateState::Failed))
                {
                    self.pending_failures.push_back(race);
                }
            }
        }
    }

    /// Reports that `id`'s non-blocking connect failed outright (e.g. the
    /// `connect()` call itself returned an unrecoverable error rather than
    /// `EINPROGRESS`), without ever reaching writable readiness.
    pub fn handle_connect_error(&mut self, race: RaceId, id: CandidateId) {
        self.handle_writable(
            race,
            id,
            Err(io::Error::other("connect failed before readiness")),
            SocketOptions::default(),
        );
    }

    pub fn poll_command(&mut self) -> Option<HappyEyeballsCommand> {
        self.pending_commands.pop_front()
    }

    pub fn poll_winner(&mut self) -> Option<Winner> {
        if let Some(winner) = self.pending_winners.pop_front() {
            self.races.remove(&winner.race);
            return Some(winner);
        }
        None
    }

    /// A race whose every candidate failed its `SO_ERROR` check, per the
    /// `# 4.3` failure path: no writable-and-clean candidate ever arrived.
    pub fn poll_failure(&mut self) -> Option<RaceId> {
        if let Some(race) = self.pending_failures.pop_front() {
            self.races.remove(&race);
            return Some(race);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, SocketAddr};
    use transport_sockets::TransportProtocol;

    fn candidate(src: &str, dst: &str) -> Candidate {
        Candidate {
            src: src.parse::<IpAddr>().unwrap(),
            dst: dst.parse::<SocketAddr>().unwrap(),
            protocol: TransportProtocol::Tcp,
        }
    }

    #[test]
    fn race_emits_one_connect_command_per_candidate() {
        let mut he = HappyEyeballs::new();
        let candidates = vec![
            candidate("10.0.0.1", "192.0.2.1:80"),
            candidate("10.0.0.1", "192.0.2.2:80"),
        ];

        he.race(candidates);

        let mut count = 0;
        while he.poll_command().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn first_clean_writable_wins_and_abandons_the_rest() {
        let mut he = HappyEyeballs::new();
        let candidates = vec![
            candidate("10.0.0.1", "192.0.2.1:80"),
            candidate("10.0.0.1", "192.0.2.2:80"),
        ];
        let race = he.race(candidates);

        let mut ids = Vec::new();
        while let Some(HappyEyeballsCommand::Connect { id, .. }) = he.poll_command() {
            ids.push(id);
        }

        he.handle_writable(race, ids[0], Ok(()), SocketOptions::default());

        let winner = he.poll_winner().expect("a winner must be produced");
        assert_eq!(winner.candidate_id, ids[0]);

        let abandon = he.poll_command().expect("the loser must be abandoned");
        assert!(matches!(
            abandon,
            HappyEyeballsCommand::Abandon { id, .. } if id == ids[1]
        ));
    }

    #[test]
    fn so_error_check_rejects_a_dirty_writable_candidate() {
        let mut he = HappyEyeballs::new();
        let candidates = vec![candidate("10.0.0.1", "192.0.2.1:80")];
        let race = he.race(candidates);

        let HappyEyeballsCommand::Connect { id, .. } = he.poll_command().unwrap() else {
            panic!("expected a connect command");
        };

        he.handle_writable(
            race,
            id,
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
            SocketOptions::default(),
        );

        assert!(he.poll_winner().is_none());
        let failure = he.poll_failure().expect("the only candidate failed");
        assert_eq!(failure, race);
    }

    #[test]
    fn late_arrival_after_settling_is_ignored() {
        let mut he = HappyEyeballs::new();
        let candidates = vec![
            candidate("10.0.0.1", "192.0.2.1:80"),
            candidate("10.0.0.1", "192.0.2.2:80"),
        ];
        let race = he.race(candidates);

        let mut ids = Vec::new();
        while let Some(HappyEyeballsCommand::Connect { id, .. }) = he.poll_command() {
            ids.push(id);
        }

        he.handle_writable(race, ids[0], Ok(()), SocketOptions::default());
        he.poll_winner();

        // The race is already gone; a second arrival must not panic or
        // produce a second winner.
        he.handle_writable(race, ids[1], Ok(()), SocketOptions::default());
        assert!(he.poll_winner().is_none());
    }
}
