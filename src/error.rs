use std::io;

use crate::address::Address;

/// Errors surfaced by [`crate::Server`].
///
/// Errors raised before a worker exists propagate to the embedder through
/// [`crate::Server::run`]; once a worker is serving traffic, the failures this
/// type models are logged instead (see `SPEC_FULL.md` §7) and availability is
/// preferred over error surfacing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// [`crate::Server::run`] was called without registering any address.
    #[error("no listen addresses registered")]
    NoServers,

    /// Opening a listener failed (in use, permission denied, bad address).
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: Address,
        #[source]
        source: io::Error,
    },

    /// `fork`+exec of a worker failed.
    #[error("failed to fork worker: {0}")]
    Fork(#[source] io::Error),

    /// A `GRACEFUL_*` environment variable a worker expects was not set.
    #[error("missing environment variable {0} (is this process actually a worker?)")]
    MissingEnv(&'static str),

    /// A `GRACEFUL_*` environment variable had a value that does not parse.
    #[error("invalid value for environment variable {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    /// `GRACEFUL_NUMFD` disagreed with the number of registered handlers.
    #[error(
        "fd count mismatch: {expected} handler(s) registered but GRACEFUL_NUMFD={got}; \
         was this worker started from a different build of the binary?"
    )]
    FdCountMismatch { expected: usize, got: usize },

    /// Sending a signal (handoff, reload, stop) failed.
    #[error("signal delivery failed: {0}")]
    Signal(#[source] nix::Error),

    /// An accept loop for one listener returned with an error.
    #[error("serve error on {address}: {source}")]
    Serve {
        address: Address,
        #[source]
        source: io::Error,
    },

    /// Catch-all for failures that do not warrant their own variant.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
