//! In-process fabric: a topology of `nodes x procs_per_node` ranks and an RPC
//! transport between them, all inside one OS process.
//!
//! Every endpoint has its own progress thread. Incoming RPCs run their handler
//! on the receiver's progress thread; completions run on the sender's, the
//! same split a real RPC library gives. Representatives follow the usual
//! nexus layout: on node `A`, traffic for node `N` goes through local rank
//! `N mod procs_per_node`.
//!
//! Test hooks: per-link RPC counters, fault injection and per-endpoint holds
//! that park incoming RPCs until released.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::Core::error::{ShuffleError, ShuffleResult, TransportError};
use crate::Core::Topology::{NodeId, Rank, Topology};
use crate::Core::Transport::{Bootstrap, Fabric, IncomingHandler, Link, Responder, RpcCallback, Transport};

/// How an injected fault breaks matching RPCs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// `send` itself fails; the completion is never called.
    Reject,
    /// `send` succeeds but the completion reports failure. The receiver never
    /// sees the RPC.
    Fail,
}

/// RPC counters for one directed (src, dst) pair.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkCounters {
    pub rpcs_issued: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub local: u64,
    pub network: u64,
}

struct Rpc {
    from: Rank,
    to: Rank,
    name: String,
    payload: Vec<u8>,
    done: RpcCallback,
}

enum Job {
    Rpc(Rpc),
    Complete {
        src: Rank,
        dst: Rank,
        done: RpcCallback,
        result: Result<(), TransportError>,
    },
    Stop,
}

struct FaultRule {
    src: Option<Rank>,
    dst: Option<Rank>,
    fault: Fault,
}

#[derive(Default)]
struct EndpointState {
    handlers: HashMap<String, Arc<dyn IncomingHandler>>,
    /// Incoming RPCs parked by `hold`.
    held: Option<Vec<Rpc>>,
    finalized: bool,
}

struct Shared {
    nodes: usize,
    ppn: usize,
    queues: Vec<Sender<Job>>,
    endpoints: Vec<Mutex<EndpointState>>,
    links: Mutex<HashMap<(Rank, Rank), LinkCounters>>,
    faults: Mutex<Vec<FaultRule>>,
    global: Barrier,
    node_barriers: Vec<Barrier>,
}

impl Shared {
    fn size(&self) -> usize {
        self.nodes * self.ppn
    }

    fn fault_for(&self, src: Rank, dst: Rank) -> Option<Fault> {
        self.faults
            .lock()
            .iter()
            .find(|rule| rule.src.map_or(true, |s| s == src) && rule.dst.map_or(true, |d| d == dst))
            .map(|rule| rule.fault)
    }

    fn post(&self, rank: Rank, job: Job) -> Result<(), Job> {
        match self.queues.get(rank as usize) {
            Some(queue) => queue.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    /// Hand a completion to the sender's progress thread.
    fn post_completion(&self, src: Rank, dst: Rank, done: RpcCallback, result: Result<(), TransportError>) {
        let job = Job::Complete {
            src,
            dst,
            done,
            result,
        };
        if self.post(src, job).is_err() {
            // Sender already stopped; nobody is left to tell.
            self.finish(src, dst);
        }
    }

    fn finish(&self, src: Rank, dst: Rank) {
        if let Some(link) = self.links.lock().get_mut(&(src, dst)) {
            link.in_flight = link.in_flight.saturating_sub(1);
        }
    }

    fn receive(self: &Arc<Self>, rank: Rank, rpc: Rpc) {
        let handler = {
            let mut state = self.endpoints[rank as usize].lock();
            if let Some(parked) = state.held.as_mut() {
                parked.push(rpc);
                return;
            }
            state.handlers.get(&rpc.name).cloned()
        };

        let Rpc {
            from,
            to,
            name,
            payload,
            done,
        } = rpc;
        match handler {
            Some(handler) => {
                let shared = self.clone();
                let reply: Responder = Box::new(move |result| shared.post_completion(from, to, done, result));
                handler.on_rpc(from, payload, reply);
            }
            None => self.post_completion(from, to, done, Err(TransportError::NoHandler { rpc: name })),
        }
    }
}

fn progress(rank: Rank, shared: Arc<Shared>, jobs: Receiver<Job>) {
    tracing::trace!(rank, "loopback progress thread started");
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Rpc(rpc) => shared.receive(rank, rpc),
            Job::Complete {
                src,
                dst,
                done,
                result,
            } => {
                shared.finish(src, dst);
                done(result);
            }
            Job::Stop => break,
        }
    }
    tracing::trace!(rank, "loopback progress thread stopped");
}

/// Owner of the in-process fabric and its progress threads.
pub struct LoopbackFabric {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl LoopbackFabric {
    pub fn new(nodes: usize, procs_per_node: usize) -> ShuffleResult<Self> {
        if nodes == 0 || procs_per_node == 0 {
            return Err(ShuffleError::Topology {
                message: format!("loopback fabric needs at least one rank ({nodes} x {procs_per_node})"),
            });
        }
        let size = nodes * procs_per_node;

        let (queues, receivers): (Vec<Sender<Job>>, Vec<Receiver<Job>>) = (0..size).map(|_| mpsc::channel()).unzip();
        let shared = Arc::new(Shared {
            nodes,
            ppn: procs_per_node,
            queues,
            endpoints: (0..size).map(|_| Mutex::new(EndpointState::default())).collect(),
            links: Mutex::new(HashMap::new()),
            faults: Mutex::new(Vec::new()),
            global: Barrier::new(size),
            node_barriers: (0..nodes).map(|_| Barrier::new(procs_per_node)).collect(),
        });

        let mut fabric = Self {
            shared: shared.clone(),
            threads: Vec::with_capacity(size),
        };
        for (rank, jobs) in receivers.into_iter().enumerate() {
            let shared = shared.clone();
            let rank = rank as Rank;
            let handle = std::thread::Builder::new()
                .name(format!("loopback-progress-{rank}"))
                .spawn(move || progress(rank, shared, jobs))
                .map_err(|e| ShuffleError::Topology {
                    message: format!("cannot start progress thread for rank {rank}: {e}"),
                })?;
            fabric.threads.push(handle);
        }

        tracing::debug!(nodes, procs_per_node, "loopback fabric up");
        Ok(fabric)
    }

    pub fn size(&self) -> usize {
        self.shared.size()
    }

    pub fn nodes(&self) -> usize {
        self.shared.nodes
    }

    pub fn procs_per_node(&self) -> usize {
        self.shared.ppn
    }

    /// The topology/transport view of `rank`.
    pub fn endpoint(&self, rank: Rank) -> LoopbackEndpoint {
        LoopbackEndpoint {
            rank,
            shared: self.shared.clone(),
        }
    }

    /// `endpoint(rank)` as a fabric pair.
    pub fn fabric(&self, rank: Rank) -> Fabric {
        let endpoint = Arc::new(self.endpoint(rank));
        Fabric {
            topology: endpoint.clone(),
            transport: endpoint,
        }
    }

    /// Break RPCs matching `src`/`dst` (`None` matches any rank) until
    /// `clear_faults`.
    pub fn inject(&self, src: Option<Rank>, dst: Option<Rank>, fault: Fault) {
        tracing::debug!(?src, ?dst, ?fault, "loopback fault injected");
        self.shared.faults.lock().push(FaultRule { src, dst, fault });
    }

    pub fn clear_faults(&self) {
        self.shared.faults.lock().clear();
    }

    /// Park every RPC arriving at `rank` until `release`.
    pub fn hold(&self, rank: Rank) {
        if let Some(endpoint) = self.shared.endpoints.get(rank as usize) {
            endpoint.lock().held.get_or_insert_with(Vec::new);
        }
    }

    /// Re-deliver RPCs parked by `hold`, in arrival order.
    pub fn release(&self, rank: Rank) {
        let Some(endpoint) = self.shared.endpoints.get(rank as usize) else {
            return;
        };
        let parked = endpoint.lock().held.take().unwrap_or_default();
        for rpc in parked {
            if let Err(Job::Rpc(rpc)) = self.shared.post(rank, Job::Rpc(rpc)) {
                self.shared
                    .post_completion(rpc.from, rpc.to, rpc.done, Err(TransportError::Closed));
            }
        }
    }

    /// Number of RPCs currently parked at `rank`.
    pub fn held_count(&self, rank: Rank) -> usize {
        self.shared
            .endpoints
            .get(rank as usize)
            .and_then(|endpoint| endpoint.lock().held.as_ref().map(Vec::len))
            .unwrap_or(0)
    }

    pub fn link(&self, src: Rank, dst: Rank) -> LinkCounters {
        self.shared
            .links
            .lock()
            .get(&(src, dst))
            .copied()
            .unwrap_or_default()
    }

    /// RPCs issued on every link.
    pub fn total_rpcs(&self) -> u64 {
        self.shared.links.lock().values().map(|l| l.rpcs_issued).sum()
    }

    /// RPCs issued from `src` to anyone.
    pub fn rpcs_from(&self, src: Rank) -> u64 {
        self.shared
            .links
            .lock()
            .iter()
            .filter(|((s, _), _)| *s == src)
            .map(|(_, l)| l.rpcs_issued)
            .sum()
    }

    pub fn is_finalized(&self, rank: Rank) -> bool {
        self.shared
            .endpoints
            .get(rank as usize)
            .map_or(false, |endpoint| endpoint.lock().finalized)
    }
}

impl Drop for LoopbackFabric {
    fn drop(&mut self) {
        for rank in 0..self.shared.size() as Rank {
            let _ = self.shared.post(rank, Job::Stop);
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("loopback progress thread panicked");
            }
        }
    }
}

/// One rank's view of a [`LoopbackFabric`].
#[derive(Clone)]
pub struct LoopbackEndpoint {
    rank: Rank,
    shared: Arc<Shared>,
}

impl LoopbackEndpoint {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    fn node(&self) -> NodeId {
        (self.rank as usize / self.shared.ppn) as NodeId
    }

    fn state(&self) -> Result<&Mutex<EndpointState>, TransportError> {
        self.shared
            .endpoints
            .get(self.rank as usize)
            .ok_or(TransportError::Unreachable { peer: self.rank })
    }
}

impl Topology for LoopbackEndpoint {
    fn global_rank(&self) -> Rank {
        self.rank
    }

    fn global_size(&self) -> usize {
        self.shared.size()
    }

    fn local_rank(&self) -> usize {
        self.rank as usize % self.shared.ppn
    }

    fn local_size(&self) -> usize {
        self.shared.ppn
    }

    fn node_of(&self, rank: Rank) -> Option<NodeId> {
        ((rank as usize) < self.shared.size()).then(|| (rank as usize / self.shared.ppn) as NodeId)
    }

    fn representative(&self, on_node: NodeId, for_node: NodeId) -> Option<Rank> {
        let ppn = self.shared.ppn;
        ((on_node as usize) < self.shared.nodes && (for_node as usize) < self.shared.nodes)
            .then(|| (on_node as usize * ppn + for_node as usize % ppn) as Rank)
    }

    fn local_barrier(&self) -> ShuffleResult<()> {
        let barrier = self
            .shared
            .node_barriers
            .get(self.node() as usize)
            .ok_or_else(|| ShuffleError::Topology {
                message: format!("rank {} has no node barrier", self.rank),
            })?;
        barrier.wait();
        Ok(())
    }

    fn global_barrier(&self) -> ShuffleResult<()> {
        self.shared.global.wait();
        Ok(())
    }
}

impl Transport for LoopbackEndpoint {
    fn send(&self, rpc: &str, dst: Rank, link: Link, payload: Vec<u8>, done: RpcCallback) -> Result<(), TransportError> {
        if dst as usize >= self.shared.size() {
            return Err(TransportError::Unreachable { peer: dst });
        }
        let fault = self.shared.fault_for(self.rank, dst);
        if fault == Some(Fault::Reject) {
            return Err(TransportError::Rejected {
                peer: dst,
                message: "injected fault".to_string(),
            });
        }

        {
            let mut links = self.shared.links.lock();
            let counters = links.entry((self.rank, dst)).or_default();
            counters.rpcs_issued += 1;
            counters.in_flight += 1;
            counters.peak_in_flight = counters.peak_in_flight.max(counters.in_flight);
            match link {
                Link::Local => counters.local += 1,
                Link::Network => counters.network += 1,
            }
        }

        if fault == Some(Fault::Fail) {
            self.shared.post_completion(
                self.rank,
                dst,
                done,
                Err(TransportError::Failed {
                    peer: dst,
                    message: "injected fault".to_string(),
                }),
            );
            return Ok(());
        }

        let job = Job::Rpc(Rpc {
            from: self.rank,
            to: dst,
            name: rpc.to_string(),
            payload,
            done,
        });
        if self.shared.post(dst, job).is_err() {
            self.shared.finish(self.rank, dst);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn register(&self, rpc: &str, handler: Arc<dyn IncomingHandler>) -> Result<(), TransportError> {
        let mut state = self.state()?.lock();
        if state.finalized {
            return Err(TransportError::Closed);
        }
        state.handlers.insert(rpc.to_string(), handler);
        Ok(())
    }

    fn deregister(&self, rpc: &str) {
        if let Ok(state) = self.state() {
            state.lock().handlers.remove(rpc);
        }
    }

    fn finalize(&self) {
        if let Ok(state) = self.state() {
            let mut state = state.lock();
            state.handlers.clear();
            state.finalized = true;
            tracing::debug!(rank = self.rank, "loopback endpoint finalized");
        }
    }
}

impl Bootstrap for LoopbackEndpoint {
    fn establish(&self) -> ShuffleResult<Fabric> {
        if self.state()?.lock().finalized {
            return Err(ShuffleError::Topology {
                message: format!("loopback endpoint {} was finalized", self.rank),
            });
        }
        let endpoint = Arc::new(self.clone());
        Ok(Fabric {
            topology: endpoint.clone(),
            transport: endpoint,
        })
    }
}
