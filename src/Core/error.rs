//! Error types for the shuffle layer.
//!
//! `ShuffleError::Config`, `Routing` and `Topology` are configuration-class
//! errors: they are raised by init and are fatal for the handle being built.
//! Saturated queues never surface here; they block the caller instead.

use crate::Core::Topology::Rank;

/// Failures reported by (or on behalf of) the transport collaborator.
///
/// Cloneable so that a failed batch can be remembered by its output queue and
/// reported again to the flush call that covers it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No route to the peer at the transport level.
    #[error("peer {peer} is unreachable")]
    Unreachable {
        /// The peer that could not be reached.
        peer: Rank,
    },

    /// The transport refused to issue the RPC.
    #[error("rpc to {peer} rejected: {message}")]
    Rejected {
        /// Destination of the refused RPC.
        peer: Rank,
        /// Details from the transport.
        message: String,
    },

    /// The RPC was issued but its completion reported failure.
    #[error("rpc to {peer} failed: {message}")]
    Failed {
        /// Destination of the failed RPC.
        peer: Rank,
        /// Details from the transport.
        message: String,
    },

    /// The receiving side has no handler registered under this RPC name.
    #[error("no handler registered for rpc '{rpc}'")]
    NoHandler {
        /// The RPC name that was looked up.
        rpc: String,
    },

    /// The receiver could not decode the batch.
    #[error("peer rejected malformed batch: {message}")]
    Malformed {
        /// Details about the decode failure.
        message: String,
    },

    /// The transport (or the receiving shuffle) is shutting down.
    #[error("transport closed")]
    Closed,
}

/// Errors returned by the shuffle handle.
#[derive(Debug, thiserror::Error)]
pub enum ShuffleError {
    /// Invalid option value or combination.
    #[error("invalid configuration: {message}")]
    Config {
        /// What was wrong.
        message: String,
    },

    /// A rank could not be resolved to a hop path.
    #[error("cannot route to rank {rank}: {message}")]
    Routing {
        /// The rank that failed to resolve.
        rank: Rank,
        /// Why it failed.
        message: String,
    },

    /// The topology layer failed (bootstrap or barrier).
    #[error("topology error: {message}")]
    Topology {
        /// Details from the topology layer.
        message: String,
    },

    /// A transport failure on a batch covered by this call.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The caller passed a message the shuffle cannot carry.
    #[error("invalid message: {message}")]
    InvalidMessage {
        /// What was wrong.
        message: String,
    },

    /// An incoming batch failed to decode.
    #[error("malformed batch: {message}")]
    Malformed {
        /// Details about the decode failure.
        message: String,
    },

    /// The shuffle has been shut down.
    #[error("shuffle is shut down")]
    Shutdown,

    /// The delivery callback panicked and took the delivery thread with it.
    #[error("delivery thread on rank {rank} panicked")]
    DeliveryPanicked {
        /// Rank whose delivery thread died.
        rank: Rank,
    },
}

impl ShuffleError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        ShuffleError::Config {
            message: message.into(),
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        ShuffleError::Malformed {
            message: message.into(),
        }
    }

    /// True for the error kinds that are fatal at init.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ShuffleError::Config { .. } | ShuffleError::Routing { .. } | ShuffleError::Topology { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type ShuffleResult<T> = Result<T, ShuffleError>;
