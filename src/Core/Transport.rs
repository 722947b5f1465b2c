// Transport collaborator contract.
// The shuffle hands serialized batches to a Transport and gets told, through a
// callback, when the peer acknowledged them. It never touches sockets itself.

use std::sync::Arc;

use crate::Core::error::{ShuffleResult, TransportError};
use crate::Core::Topology::{Rank, Topology};

/// Completion callback for an issued RPC. Runs on a transport progress thread.
pub type RpcCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Acknowledgement for a received RPC. The sender's completion fires only once
/// this has been called, so holding on to it applies backpressure.
pub type Responder = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Which physical path a hop travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Link {
    /// Same-node hop (shared-memory class transport).
    Local,
    /// Inter-node hop.
    Network,
}

/// Receives RPCs addressed to a registered name.
pub trait IncomingHandler: Send + Sync {
    /// Handle one RPC payload from `from`. `reply` may be invoked after this
    /// returns.
    fn on_rpc(&self, from: Rank, payload: Vec<u8>, reply: Responder);
}

/// RPC issue/receive service.
pub trait Transport: Send + Sync {
    /// Issue an RPC carrying `payload` to `dst`.
    ///
    /// Ownership of the payload moves into the transport. On `Ok`, `done` is
    /// invoked exactly once when the peer acknowledges (or the RPC fails). On
    /// `Err`, `done` is dropped without being called.
    fn send(
        &self,
        rpc: &str,
        dst: Rank,
        link: Link,
        payload: Vec<u8>,
        done: RpcCallback,
    ) -> Result<(), TransportError>;

    /// Install the handler for incoming RPCs named `rpc`.
    fn register(&self, rpc: &str, handler: Arc<dyn IncomingHandler>) -> Result<(), TransportError>;

    /// Remove the handler for `rpc`. Later RPCs under that name fail.
    fn deregister(&self, rpc: &str);

    /// Tear down a transport the shuffle bootstrapped itself.
    fn finalize(&self) {}
}

/// A topology/transport pair established on behalf of the shuffle.
pub struct Fabric {
    pub topology: Arc<dyn Topology>,
    pub transport: Arc<dyn Transport>,
}

/// Self-bootstrap hook for the init form that does not receive a fabric.
pub trait Bootstrap {
    fn establish(&self) -> ShuffleResult<Fabric>;
}
