//! Git wire protocol implementation.
//!
//! This crate implements the remote synchronization core: pkt-line
//! framing and sideband demultiplexing, capability negotiation, ref and
//! refspec handling, shallow bookkeeping, the commit negotiator, the
//! v0/v1 and v2 protocol exchanges, the fetch and push drivers, and the
//! transport vtable spanning smart connections, bundles, external
//! helpers, the dumb-HTTP walker, and local-filesystem clones.
//!
//! The object and ref stores are external collaborators, reached through
//! the traits in [`store`].

pub mod bundle;
pub mod capability;
pub mod connectivity;
pub mod fetch;
pub mod helper;
pub mod localcopy;
pub mod negotiate;
pub mod pktline;
pub mod push;
pub mod refs;
pub mod refspec;
pub mod shallow;
pub mod sideband;
pub mod store;
pub mod testing;
pub mod transport;
pub mod v1;
pub mod v2;
pub mod walker;

use git_transport::TransportError;

use crate::store::StoreError;

/// Errors surfaced by the protocol core.
///
/// Per-ref outcomes (non-fast-forward, remote rejections) are not errors;
/// they are recorded on each [`refs::Ref`]'s status. These variants are
/// the fatal kinds that abort an operation.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unexpected EOF on remote connection")]
    UnexpectedEof,

    #[error("no matching remote ref: {0}")]
    RefNotMatched(String),

    #[error("invalid refspec: {0}")]
    InvalidRefSpec(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("pack receive failed: {0}")]
    Pack(String),

    #[error("shallow update not allowed: {0}")]
    Shallow(String),

    #[error("push rejected: {0}")]
    PushRejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Util(#[from] git_utils::UtilError),

    #[error(transparent)]
    Hash(#[from] git_hash::HashError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
