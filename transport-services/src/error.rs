use std::io;

/// The user-visible error kinds of the transport-services core.
///
/// This is the complete taxonomy; there is intentionally no catch-all
/// variant, so a new failure mode must be classified rather than smuggled
/// in as `Internal`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The operation would have blocked; not a real error, a control signal.
    /// Recovered locally by remaining registered for readiness.
    #[error("operation would block")]
    WouldBlock,

    /// A caller-supplied argument is invalid, e.g. `open` called on a flow
    /// that already has a name, or a `0`-length candidate list.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    /// The request cannot be satisfied at all, e.g. conflicting
    /// REQUIRED/BANNED property flags or an empty protocol set.
    #[error("unable to satisfy request: {0}")]
    Unable(&'static str),

    /// An OS-level I/O error not covered by a more specific variant.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A single write or a single reassembled message exceeded the
    /// protocol's atomic size limit.
    #[error("message too big")]
    MessageTooBig,

    /// Allocation failure of a core context/flow structure, or an invariant
    /// violation that indicates a bug in this crate.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// The resolver gave up without a single successful answer
    /// (`DNS_TIMEOUT` fired with zero answers).
    #[error("resolver timed out with no answers")]
    ResolverTimeout,

    /// The request could not be translated into a non-empty
    /// `(family_filter, protocols[])` pair, or no candidate survived policy.
    #[error("resolver policy violation: {0}")]
    ResolverPolicy(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// `true` for the one non-error control-flow signal in this enum.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }
}
