use std::net::{IpAddr, SocketAddr};

/// One independent UDP conversation of the stub resolver: a single
/// `(src_addr, dst_server)` pair, per `# 3 DATA MODEL`.
#[derive(Debug, Clone)]
pub struct QueryPair {
    pub src: IpAddr,
    pub server: SocketAddr,
    /// The id of the query this pair sent; a response carrying a different
    /// id is a different conversation (or a spoofed/stray packet) and is
    /// silently dropped, not recorded.
    pub query_id: u16,
    pub resolved: Vec<IpAddr>,
    pub closed: bool,
}

impl QueryPair {
    pub fn new(src: IpAddr, server: SocketAddr, query_id: u16) -> Self {
        Self {
            src,
            server,
            query_id,
            resolved: Vec::new(),
            closed: false,
        }
    }

    /// Records up to `max` addresses from a parsed response; returns
    /// `true` if at least one new address was recorded (the signal the
    /// resolver uses to (re)start `DNS_RESOLVED_TIMEOUT`).
    pub fn record(&mut self, addrs: impl IntoIterator<Item = IpAddr>, max: usize) -> bool {
        let mut recorded_any = false;

        for addr in addrs {
            if self.resolved.len() >= max {
                break;
            }
            if !self.resolved.contains(&addr) {
                self.resolved.push(addr);
                recorded_any = true;
            }
        }

        recorded_any
    }
}
