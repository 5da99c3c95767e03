use thiserror::Error;

/// Engine-level failures surfaced to the request handler.
///
/// `Overloaded` and `NotFound` are expected control-flow outcomes; anything
/// below the engine (pool exhaustion, rolled-back transaction, malformed row)
/// travels through `Internal` and is never shown to clients verbatim.
#[derive(Error, Debug)]
pub enum AllocError {
    /// No node's remaining satisfies the request, or an atomic reserve lost
    /// its race. Safe to retry: no partial state persists.
    #[error("no node can satisfy the request")]
    Overloaded,

    /// No `allocated` row exists for the given request id.
    #[error("allocation not found")]
    NotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
