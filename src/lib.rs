//! Three-hop message shuffle for HPC jobs.
//!
//! Application messages are batched per next-hop peer and carried over at
//! most three RPC hops: a same-node hop to the representative for the
//! destination node, one inter-node hop between representatives, and a
//! same-node relay to the destination. Topology and transport are
//! collaborators supplied through the traits in [`Core`].

// Module naming follows project convention (Core = contracts and plumbing,
// Shuffler = the engine)
#[allow(non_snake_case)]
pub mod Core;

#[allow(non_snake_case)]
pub mod Shuffler;

#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
    pub use StructDebug::{LimitDump, QueueDump, StateDump}; // re-export for stable path
}

pub mod ffi;

pub use Core::config::ShuffleConfig;
pub use Core::error::{ShuffleError, ShuffleResult, TransportError};
pub use Core::Topology::{NodeId, Rank, Topology};
pub use Core::Transport::{Bootstrap, Fabric, IncomingHandler, Link, Responder, RpcCallback, Transport};
pub use Shuffler::Structs::{Message, QueueClass, BROADCAST_BIT};
pub use Shuffler::{BroadcastFlags, DeliveryHandler, FlushScope, Shuffle, ShuffleBuilder, StatsSnapshot};
