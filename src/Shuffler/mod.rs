mod broadcast;
mod builder;
mod dispatch;
mod flush;
mod incoming;
mod shuffle;

pub(crate) mod deliverq;
pub(crate) mod outq;
pub(crate) mod senderlimit;
pub mod routing;
pub mod stats;

pub use broadcast::BroadcastFlags;
pub use builder::ShuffleBuilder;
pub use deliverq::{DeliveryHandler, DeliverySnapshot};
pub use flush::FlushScope;
pub use routing::{Hop, NextHop, Router};
pub use shuffle::Shuffle;
pub use stats::{StatsSnapshot, TrafficCounters};

pub(crate) use shuffle::Inner;

pub mod Batch {
    pub mod Batch;
    pub mod Batch_impl;
    pub mod layout;
    pub use Batch::{BatchBuffer, SealedBatch}; // re-export for stable path
    pub use Batch_impl::BatchReader;
    pub use layout::BatchHeader;
}

pub mod Structs {
    pub mod Message_Structs;
    pub use Message_Structs::*; // re-export for stable path
}
