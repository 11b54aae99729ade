//! `Context`: owns the reactor handle, the `AddressCache`, the lazily
//! instantiated `Resolver`, and every live flow/listener/race/DNS-pair
//! socket. This is the IO-driving shell of [`CORE-ARCHITECTURE`]: it is
//! the only place in the crate that touches a reactor or issues a raw
//! socket syscall.
//!
//! User-facing API note: the original dispatches via stored C function
//! pointers invoked synchronously from inside the reactor loop. This
//! port instead collects a batch of [`ContextEvent`]s per `run_once` and
//! hands them back to the caller, the way this corpus's own event loops
//! (`mio::Poll::poll` returning `Events`, the sans-IO cores' own
//! `poll_event`) already expose readiness — a self-referential
//! `FnMut(&mut Context, ...)` callback would fight the borrow checker for
//! no behavioral gain. A lighter per-kind subscription list is still
//! offered via [`Context::on_event`] for callers that want the original's
//! callback shape; `run_once` fires both the queued events and any
//! matching subscription.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use socket2::Socket;
use transport_sockets::{SocketOptions, TransportProtocol};

use crate::address_cache::{AddressCache, AddressEvent, AddressMonitor};
use crate::callback::{CallbackRegistry, EventKind};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowEvent as CoreFlowEvent, Listener};
use crate::happy_eyeballs::{HappyEyeballs, HappyEyeballsCommand, RaceId};
use crate::property::{translate, PropertyMask, ProtocolList};
use crate::reactor::{Events, Interest, Reactor, Token};
use crate::resolver::{
    candidate::Candidate, LookupId, LookupOutcome, PairId, Resolver, ResolverCommand,
};

#[cfg(feature = "mio-reactor")]
use crate::reactor::mio_reactor::MioReactor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(u64);

/// One batch-delivered result of driving the context forward.
#[derive(Debug)]
pub enum ContextEvent {
    Flow { flow: FlowId, event: FlowOutcome },
    OpenFailed { flow: FlowId, error: Error },
}

#[derive(Debug)]
pub enum FlowOutcome {
    Connected,
    Readable,
    Writable,
    AllWritten,
    Error(Error),
    Closed,
    Accepted { flow: FlowId, peer: SocketAddr },
}

enum Source {
    Flow(FlowId),
    Listener(FlowId),
    ResolverPair(PairId),
    Candidate(RaceId, u64),
}

enum PendingFlow {
    AwaitingResolve {
        lookup: LookupId,
        protocols: ProtocolList,
    },
    Racing {
        race: RaceId,
    },
}

struct FlowEntry {
    flow: Flow,
    token: Token,
    /// Whether `token`'s fd is currently registered with the reactor. An
    /// empty interest set means polling is stopped (`# 4.4`'s "If
    /// interest = 0, polling is stopped"), so this tracks whether the next
    /// non-empty interest must `register` again rather than `reregister`.
    registered: bool,
    callbacks: CallbackRegistry<Box<dyn FnMut(&FlowOutcome) + Send>>,
}

struct ListenerEntry {
    listener: Listener,
    token: Token,
}

/// Ties the sans-IO cores to real sockets and a real reactor.
pub struct Context<R: Reactor> {
    reactor: R,
    config: Config,
    address_cache: AddressCache,
    address_monitor: Option<Box<dyn AddressMonitor>>,
    resolver: Option<Resolver>,
    happy_eyeballs: HappyEyeballs,
    flows: HashMap<FlowId, FlowEntry>,
    listeners: HashMap<FlowId, ListenerEntry>,
    pending: HashMap<FlowId, PendingFlow>,
    resolver_sockets: HashMap<PairId, Socket>,
    candidate_sockets: HashMap<(RaceId, u64), (Socket, TransportProtocol, SocketOptions)>,
    lookup_to_flow: HashMap<LookupId, FlowId>,
    race_to_flow: HashMap<RaceId, FlowId>,
    tokens: HashMap<u64, Source>,
    next_token: u64,
    next_flow_id: u64,
    last_tick: Instant,
    pending_events: Vec<ContextEvent>,
}

#[cfg(feature = "mio-reactor")]
impl Context<MioReactor> {
    /// Builds a context with the default `mio`-backed reactor and no
    /// address monitor (the caller installs one with
    /// [`Context::bootstrap_addresses`] if it wants live address tracking).
    pub fn new(config: Config) -> io::Result<Self> {
        Ok(Self::with_reactor(MioReactor::new()?, config))
    }
}

impl<R: Reactor> Context<R> {
    pub fn with_reactor(reactor: R, config: Config) -> Self {
        Self {
            reactor,
            config,
            address_cache: AddressCache::new(),
            address_monitor: None,
            resolver: None,
            happy_eyeballs: HappyEyeballs::new(),
            flows: HashMap::new(),
            listeners: HashMap::new(),
            pending: HashMap::new(),
            resolver_sockets: HashMap::new(),
            candidate_sockets: HashMap::new(),
            lookup_to_flow: HashMap::new(),
            race_to_flow: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 0,
            next_flow_id: 0,
            last_tick: Instant::now(),
            pending_events: Vec::new(),
        }
    }

    /// Seeds the address cache from `monitor`'s snapshot and keeps it for
    /// live deltas on every `run_*` call.
    pub fn bootstrap_addresses(&mut self, mut monitor: Box<dyn AddressMonitor>) {
        self.address_cache.bootstrap(monitor.as_mut());
        self.address_monitor = Some(monitor);
    }

    fn resolver(&mut self) -> &mut Resolver {
        self.resolver
            .get_or_insert_with(|| Resolver::new(self.config.resolver.clone()))
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn alloc_flow_id(&mut self) -> FlowId {
        let id = FlowId(self.next_flow_id);
        self.next_flow_id += 1;
        id
    }

    /// `open(name, port, properties)` of `# 4.4`: translates the property
    /// mask, kicks off resolution, and returns a `FlowId` immediately in
    /// `OPENING`. The eventual winner (or failure) surfaces through
    /// [`Self::run_once`].
    pub fn open(&mut self, name: &str, port: u16, properties: PropertyMask) -> Result<FlowId> {
        if name.is_empty() {
            return Err(Error::BadArgument("open requires a non-empty name"));
        }

        let translated = translate(properties)?;
        let now = Instant::now();
        let lookup = self
            .resolver()
            .lookup(name, port, translated.family, translated.protocols.clone(), &self.address_cache, now);

        let flow_id = self.alloc_flow_id();
        self.lookup_to_flow.insert(lookup, flow_id);
        self.pending.insert(
            flow_id,
            PendingFlow::AwaitingResolve {
                lookup,
                protocols: translated.protocols,
            },
        );

        Ok(flow_id)
    }

    /// `accept(name, port)` of `# 4.4`'s Listen/Accept section. `"*"`
    /// translates to the unspecified address.
    pub fn accept(&mut self, name: &str, port: u16, protocol: TransportProtocol) -> Result<FlowId> {
        let host = if name == "*" { "0.0.0.0" } else { name };
        let ip: IpAddr = host
            .parse()
            .map_err(|_| Error::BadArgument("accept requires a literal listen address or \"*\""))?;
        let addr = SocketAddr::new(ip, port);

        let listener = Listener::bind(protocol, addr, self.config.listen_backlog).map_err(Error::Io)?;
        let token = self.alloc_token();
        let flow_id = self.alloc_flow_id();
        self.tokens.insert(token.0, Source::Listener(flow_id));
        self.reactor
            .register(listener.socket().as_raw_fd(), token, listener.interest())
            .map_err(Error::Io)?;

        self.listeners.insert(flow_id, ListenerEntry { listener, token });
        Ok(flow_id)
    }

    /// Registers a callback for one event kind on `flow`, rejecting a
    /// second registration for the same kind per `# 6`/`# 8`. Per `# 4.4`,
    /// registering `Readable`/`Writable` recomputes the flow's interest
    /// mask so the reactor actually polls for it.
    pub fn on_event(
        &mut self,
        flow: FlowId,
        kind: EventKind,
        callback: Box<dyn FnMut(&FlowOutcome) + Send>,
    ) -> Result<()> {
        {
            let entry = self
                .flows
                .get_mut(&flow)
                .ok_or(Error::BadArgument("unknown flow"))?;
            entry.callbacks.add(kind, callback)?;

            match kind {
                EventKind::Readable => entry.flow.set_wants_readable(true),
                EventKind::Writable => entry.flow.set_wants_writable(true),
                _ => {}
            }
        }

        if matches!(kind, EventKind::Readable | EventKind::Writable) {
            self.reconcile_flow_interest(flow)?;
        }

        Ok(())
    }

    pub fn write(&mut self, flow: FlowId, buf: &[u8]) -> Result<()> {
        let entry = self.flows.get_mut(&flow).ok_or(Error::BadArgument("unknown flow"))?;
        let result = entry.flow.write(buf);
        self.reconcile_flow_interest(flow)?;
        result
    }

    pub fn read(&mut self, flow: FlowId, buf: &mut [u8]) -> Result<usize> {
        let entry = self.flows.get_mut(&flow).ok_or(Error::BadArgument("unknown flow"))?;
        entry.flow.read(buf)
    }

    /// Frees a flow: stops its poller, closes its socket (the `Socket`'s
    /// `Drop` does the actual `close`), and forgets its callbacks. A
    /// registered `Closed` callback fires once, synchronously, before the
    /// flow is torn down.
    pub fn close(&mut self, flow: FlowId) -> Result<()> {
        if let Some(mut entry) = self.flows.remove(&flow) {
            if let Some(callback) = entry.callbacks.get_mut(EventKind::Closed) {
                callback(&FlowOutcome::Closed);
            }
            self.pending_events.push(ContextEvent::Flow { flow, event: FlowOutcome::Closed });

            if entry.registered {
                let _ = self.reactor.deregister(entry.flow.socket.as_raw_fd());
            }
            self.tokens.remove(&entry.token.0);
        }
        if let Some(entry) = self.listeners.remove(&flow) {
            let _ = self.reactor.deregister(entry.listener.socket().as_raw_fd());
            self.tokens.remove(&entry.token.0);
        }
        Ok(())
    }

    /// Recomputes a flow's interest mask and applies it to the reactor
    /// registration, per `# 4.4`: "If interest = 0, polling is stopped;
    /// otherwise restarted with the new mask." A flow whose polling was
    /// stopped must be `register`ed again, not `reregister`ed, once a
    /// non-empty interest returns.
    fn reconcile_flow_interest(&mut self, flow: FlowId) -> Result<()> {
        let entry = self.flows.get_mut(&flow).ok_or(Error::BadArgument("unknown flow"))?;
        let interest = entry.flow.interest();
        let fd = entry.flow.socket.as_raw_fd();

        if interest.is_empty() {
            if entry.registered {
                self.reactor.deregister(fd).map_err(Error::Io)?;
                entry.registered = false;
            }
            return Ok(());
        }

        if entry.registered {
            self.reactor.reregister(fd, entry.token, interest).map_err(Error::Io)
        } else {
            self.reactor.register(fd, entry.token, interest).map_err(Error::Io)?;
            entry.registered = true;
            Ok(())
        }
    }

    /// Drives the reactor for at most `timeout`, advances every sans-IO
    /// core's timers, and returns the batch of events produced. `None`
    /// blocks indefinitely (`run_default`); `Some(Duration::ZERO)` never
    /// blocks (`run_nowait`).
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ContextEvent>> {
        self.tick_address_cache();
        self.drain_resolver_commands();
        self.drain_happy_eyeballs_commands();

        let poll_timeout = self.clamp_timeout(timeout);
        let events = self.reactor.poll(poll_timeout)?;

        let tokens: Vec<_> = events.iter().collect();
        for event in tokens {
            self.dispatch_token(event.token, event.readable, event.writable);
        }

        let now = Instant::now();
        self.resolver().handle_timeout(now);
        self.drain_resolver_events(now);
        self.drain_resolver_commands();
        self.drain_happy_eyeballs_commands();
        self.drain_happy_eyeballs_winners();
        self.drain_happy_eyeballs_failures();

        Ok(std::mem::take(&mut self.pending_events))
    }

    pub fn run_default(&mut self) -> io::Result<Vec<ContextEvent>> {
        self.run_once(None)
    }

    pub fn run_nowait(&mut self) -> io::Result<Vec<ContextEvent>> {
        self.run_once(Some(Duration::ZERO))
    }

    fn clamp_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        let next_deadline = self.resolver.as_ref().and_then(Resolver::next_deadline);
        let Some(deadline) = next_deadline else {
            return requested;
        };
        let until = deadline.saturating_duration_since(Instant::now());
        match requested {
            Some(d) => Some(d.min(until)),
            None => Some(until),
        }
    }

    fn tick_address_cache(&mut self) {
        if self.last_tick.elapsed() < self.config.address_lifetime_tick {
            return;
        }
        self.last_tick = Instant::now();
        self.address_cache.tick();

        if let Some(monitor) = &mut self.address_monitor {
            match monitor.poll_events() {
                Ok(events) => {
                    for event in events {
                        self.address_cache.apply(event);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "address monitor poll failed"),
            }
        }
    }

    fn dispatch_token(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(source) = self.tokens.get(&token.0) else {
            return;
        };

        match *source {
            Source::Flow(flow_id) => self.dispatch_flow(flow_id, readable, writable),
            Source::Listener(flow_id) => {
                if readable {
                    self.dispatch_accept(flow_id);
                }
            }
            Source::ResolverPair(pair) => {
                if readable {
                    self.dispatch_resolver_pair(pair);
                }
            }
            Source::Candidate(race, candidate) => {
                if writable {
                    self.dispatch_candidate_writable(race, candidate);
                }
            }
        }
    }

    fn dispatch_flow(&mut self, flow_id: FlowId, readable: bool, writable: bool) {
        let Some(entry) = self.flows.get_mut(&flow_id) else {
            return;
        };

        if writable {
            entry.flow.on_writable();
        }
        if readable {
            entry.flow.on_readable();
        }

        let mut outcomes = Vec::new();
        while let Some(event) = entry.flow.poll_event() {
            outcomes.push(event);
        }

        for event in outcomes {
            let (kind, outcome) = match event {
                CoreFlowEvent::Connected => (EventKind::Connected, FlowOutcome::Connected),
                CoreFlowEvent::Readable => (EventKind::Readable, FlowOutcome::Readable),
                CoreFlowEvent::Writable => (EventKind::Writable, FlowOutcome::Writable),
                CoreFlowEvent::AllWritten => (EventKind::AllWritten, FlowOutcome::AllWritten),
                CoreFlowEvent::Error(e) => (EventKind::Error, FlowOutcome::Error(e)),
            };

            if let Some(entry) = self.flows.get_mut(&flow_id) {
                if let Some(callback) = entry.callbacks.get_mut(kind) {
                    callback(&outcome);
                }
            }

            self.pending_events.push(ContextEvent::Flow { flow: flow_id, event: outcome });
        }

        let _ = self.reconcile_flow_interest(flow_id);
    }

    fn dispatch_accept(&mut self, listener_id: FlowId) {
        let Some(entry) = self.listeners.get(&listener_id) else {
            return;
        };

        match entry.listener.accept() {
            Ok((flow, peer)) => {
                let token = self.alloc_token();
                let fd = flow.socket.as_raw_fd();
                let interest = flow.interest();

                let new_flow_id = self.alloc_flow_id();
                self.tokens.insert(token.0, Source::Flow(new_flow_id));
                if let Err(e) = self.reactor.register(fd, token, interest) {
                    tracing::warn!(error = %e, "failed to register accepted flow");
                    return;
                }

                self.flows.insert(
                    new_flow_id,
                    FlowEntry {
                        flow,
                        token,
                        registered: true,
                        callbacks: CallbackRegistry::new(),
                    },
                );

                self.pending_events.push(ContextEvent::Flow {
                    flow: listener_id,
                    event: FlowOutcome::Accepted { flow: new_flow_id, peer },
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }

    fn drain_resolver_commands(&mut self) {
        let Some(resolver) = self.resolver.as_mut() else { return };
        while let Some((_lookup, command)) = resolver.poll_command() {
            match command {
                ResolverCommand::SendQuery { pair, src, server, payload } => {
                    self.issue_resolver_query(pair, src, server, &payload);
                }
                ResolverCommand::CloseSocket { pair } => {
                    if let Some(socket) = self.resolver_sockets.remove(&pair) {
                        let _ = self.reactor.deregister(socket.as_raw_fd());
                    }
                }
            }
        }
    }

    fn issue_resolver_query(&mut self, pair: PairId, src: IpAddr, server: SocketAddr, payload: &[u8]) {
        let bind_addr = SocketAddr::new(src, 0);
        let prepared = match transport_sockets::candidate_socket(TransportProtocol::Udp, bind_addr) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to allocate DNS query socket");
                return;
            }
        };

        if let Err(e) = prepared.socket.bind(&socket2::SockAddr::from(bind_addr)) {
            tracing::warn!(error = %e, "failed to bind DNS query socket");
            return;
        }

        if let Err(e) = prepared.socket.send_to(payload, &socket2::SockAddr::from(server)) {
            if e.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(error = %e, "failed to send DNS query");
                return;
            }
        }

        let token = self.alloc_token();
        self.tokens.insert(token.0, Source::ResolverPair(pair));
        if let Err(e) = self.reactor.register(prepared.socket.as_raw_fd(), token, Interest::READABLE) {
            tracing::warn!(error = %e, "failed to register DNS query socket");
            return;
        }

        self.resolver_sockets.insert(pair, prepared.socket);
    }

    fn dispatch_resolver_pair(&mut self, pair: PairId) {
        let Some(socket) = self.resolver_sockets.get(&pair) else { return };
        let mut buf = [0u8; 1500];
        // SAFETY: plain initialized stack buffer, immediately overwritten.
        let uninit = unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast(), buf.len()) };
        match socket.recv(uninit) {
            Ok(n) => {
                let now = Instant::now();
                if let Some(resolver) = self.resolver.as_mut() {
                    resolver.handle_response(pair, &buf[..n], now);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::debug!(error = %e, "DNS query socket read failed"),
        }
    }

    fn drain_resolver_events(&mut self, _now: Instant) {
        let Some(resolver) = self.resolver.as_mut() else { return };
        while let Some(event) = resolver.poll_event() {
            let Some(flow_id) = self.lookup_to_flow.remove(&event.lookup) else { continue };
            let Some(pending) = self.pending.remove(&flow_id) else { continue };
            let PendingFlow::AwaitingResolve { .. } = pending else { continue };

            match event.outcome {
                LookupOutcome::Success(candidates) => {
                    self.start_race(flow_id, candidates);
                }
                LookupOutcome::Failure(error) => {
                    self.pending_events.push(ContextEvent::OpenFailed { flow: flow_id, error });
                }
            }
        }
    }

    fn start_race(&mut self, flow_id: FlowId, candidates: Vec<Candidate>) {
        if candidates.is_empty() {
            self.pending_events.push(ContextEvent::OpenFailed {
                flow: flow_id,
                error: Error::ResolverPolicy("no candidate survived resolution"),
            });
            return;
        }
        let race = self.happy_eyeballs.race(candidates);
        self.race_to_flow.insert(race, flow_id);
        self.pending.insert(flow_id, PendingFlow::Racing { race });
    }

    fn drain_happy_eyeballs_commands(&mut self) {
        while let Some(command) = self.happy_eyeballs.poll_command() {
            match command {
                HappyEyeballsCommand::Connect { race, id, candidate } => {
                    self.start_candidate_connect(race, id, candidate);
                }
                HappyEyeballsCommand::Abandon { race, id } => {
                    if let Some((socket, _proto, _options)) =
                        self.candidate_sockets.remove(&(race, id.as_u64()))
                    {
                        let _ = self.reactor.deregister(socket.as_raw_fd());
                    }
                }
            }
        }
    }

    fn start_candidate_connect(&mut self, race: RaceId, id: crate::happy_eyeballs::CandidateId, candidate: Candidate) {
        let prepared = match transport_sockets::candidate_socket(candidate.protocol, SocketAddr::new(candidate.src, 0)) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "candidate socket allocation failed");
                self.happy_eyeballs.handle_connect_error(race, id);
                return;
            }
        };

        if let Err(e) = prepared.socket.bind(&socket2::SockAddr::from(SocketAddr::new(candidate.src, 0))) {
            tracing::debug!(error = %e, "candidate bind failed");
            self.happy_eyeballs.handle_connect_error(race, id);
            return;
        }

        if let Err(e) = transport_sockets::begin_connect(&prepared.socket, candidate.dst) {
            tracing::debug!(error = %e, "candidate connect failed");
            self.happy_eyeballs.handle_connect_error(race, id);
            return;
        }

        let token = self.alloc_token();
        self.tokens.insert(token.0, Source::Candidate(race, id.as_u64()));
        if let Err(e) = self.reactor.register(prepared.socket.as_raw_fd(), token, Interest::WRITABLE) {
            tracing::debug!(error = %e, "candidate registration failed");
            self.happy_eyeballs.handle_connect_error(race, id);
            return;
        }

        self.candidate_sockets.insert(
            (race, id.as_u64()),
            (prepared.socket, candidate.protocol, prepared.options),
        );
    }

    fn dispatch_candidate_writable(&mut self, race: RaceId, candidate_id: u64) {
        let Some((socket, _proto, options)) = self.candidate_sockets.get(&(race, candidate_id))
        else {
            return;
        };
        let so_error = transport_sockets::take_pending_error(socket);
        let options = *options;
        self.happy_eyeballs.handle_writable(
            race,
            crate::happy_eyeballs::CandidateId::from_u64(candidate_id),
            so_error,
            options,
        );
    }

    fn drain_happy_eyeballs_winners(&mut self) {
        while let Some(winner) = self.happy_eyeballs.poll_winner() {
            let Some(flow_id) = self.race_to_flow.remove(&winner.race) else { continue };
            self.pending.remove(&flow_id);

            let Some((socket, protocol, options)) = self
                .candidate_sockets
                .remove(&(winner.race, winner.candidate_id.as_u64()))
            else {
                continue;
            };

            let flow = Flow::from_connecting(socket, protocol, options);
            let token = self.alloc_token();
            let fd = flow.socket.as_raw_fd();
            let interest = flow.interest();

            self.tokens.insert(token.0, Source::Flow(flow_id));
            if let Err(e) = self.reactor.register(fd, token, interest) {
                tracing::warn!(error = %e, "failed to register winning flow");
                continue;
            }

            self.flows.insert(
                flow_id,
                FlowEntry {
                    flow,
                    token,
                    registered: true,
                    callbacks: CallbackRegistry::new(),
                },
            );
        }
    }

    /// A race where every candidate's `SO_ERROR` check failed: no winner
    /// will ever arrive for it, so surface `OpenFailed` and drop the
    /// pending flow rather than leaving it stuck in `Racing` forever.
    fn drain_happy_eyeballs_failures(&mut self) {
        while let Some(race) = self.happy_eyeballs.poll_failure() {
            let Some(flow_id) = self.race_to_flow.remove(&race) else { continue };
            self.pending.remove(&flow_id);
            self.pending_events.push(ContextEvent::OpenFailed {
                flow: flow_id,
                error: Error::Unable("every candidate failed to connect"),
            });
        }
    }
}
