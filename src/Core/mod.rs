pub mod Loopback;
pub mod Topology;
pub mod Transport;
pub mod config;
pub mod error;

pub use Loopback::{Fault, LinkCounters, LoopbackEndpoint, LoopbackFabric}; // re-export for stable path
