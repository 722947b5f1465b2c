#![allow(dead_code)]

use hop_shuffle::Core::LoopbackFabric;
use hop_shuffle::{Message, Rank, Shuffle, ShuffleBuilder, ShuffleResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub type Inbox = Arc<Mutex<Vec<Message>>>;

/// A loopback job with one shuffle per rank, each collecting what it
/// receives.
pub struct Cluster {
    // Shuffles go first so they shut down before the fabric stops.
    pub shuffles: Vec<Shuffle>,
    pub inboxes: Vec<Inbox>,
    pub fabric: LoopbackFabric,
}

impl Cluster {
    pub fn new(nodes: usize, ppn: usize) -> Self {
        Self::with_builder(nodes, ppn, |_| ShuffleBuilder::new())
    }

    pub fn with_builder(nodes: usize, ppn: usize, builder: impl Fn(Rank) -> ShuffleBuilder) -> Self {
        init_tracing();
        let fabric = LoopbackFabric::new(nodes, ppn).unwrap();
        let mut shuffles = Vec::new();
        let mut inboxes = Vec::new();
        for rank in 0..fabric.size() as Rank {
            let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
            let sink = inbox.clone();
            let endpoint = fabric.fabric(rank);
            let shuffle = builder(rank)
                .build(endpoint.topology, endpoint.transport, move |m: Message| sink.lock().push(m))
                .unwrap();
            shuffles.push(shuffle);
            inboxes.push(inbox);
        }
        Self {
            shuffles,
            inboxes,
            fabric,
        }
    }

    pub fn size(&self) -> usize {
        self.shuffles.len()
    }

    pub fn inbox(&self, rank: Rank) -> Vec<Message> {
        self.inboxes[rank as usize].lock().clone()
    }

    /// Run `f` on every rank concurrently (needed for anything with a
    /// barrier) and collect the results in rank order.
    pub fn on_every_rank<T: Send>(&self, f: impl Fn(&Shuffle) -> T + Sync) -> Vec<T> {
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .shuffles
                .iter()
                .map(|shuffle| {
                    let f = &f;
                    scope.spawn(move || f(shuffle))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    pub fn quiesce(&self) -> Vec<ShuffleResult<()>> {
        self.on_every_rank(Shuffle::quiesce)
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// A latch a delivery handler can block on.
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn wait(&self) {
        let (open, cvar) = &*self.state;
        let mut open = open.lock();
        while !*open {
            cvar.wait(&mut open);
        }
    }

    pub fn open(&self) {
        let (open, cvar) = &*self.state;
        *open.lock() = true;
        cvar.notify_all();
    }
}
