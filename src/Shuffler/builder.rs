use std::sync::Arc;

use crate::Core::config::{QueueLimits, ShuffleConfig};
use crate::Core::error::{ShuffleError, ShuffleResult};
use crate::Core::Topology::Topology;
use crate::Core::Transport::{Bootstrap, IncomingHandler, Transport};
use crate::Shuffler::deliverq::DeliveryHandler;
use crate::Shuffler::incoming::RpcEndpoint;
use crate::Shuffler::routing::Router;
use crate::Shuffler::shuffle::{Inner, Shuffle};

/// Builds a [`Shuffle`] over a topology and a transport.
///
/// ```ignore
/// let shuffle = ShuffleBuilder::new()
///     .with_remote_queues(4, 64 * 1024)
///     .with_delivery_queue(256, 16)
///     .build(topology, transport, |msg: Message| consume(msg))?;
/// ```
pub struct ShuffleBuilder {
    config: ShuffleConfig,
}

impl Default for ShuffleBuilder {
    fn default() -> Self {
        Self {
            config: ShuffleConfig::default(),
        }
    }
}

impl ShuffleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from defaults overridden by `SHUFFLE_*` environment variables.
    pub fn from_env() -> ShuffleResult<Self> {
        Ok(Self::new().with_config(ShuffleConfig::from_env()?))
    }

    pub fn with_config(mut self, config: ShuffleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_rpc_name(mut self, name: impl Into<String>) -> Self {
        self.config.rpc_name = name.into();
        self
    }

    pub fn with_sender_limits(mut self, local: usize, remote: usize) -> Self {
        self.config.local_sender_limit = local;
        self.config.remote_sender_limit = remote;
        self
    }

    pub fn with_origin_queues(mut self, max_rpc: usize, buf_target: usize) -> Self {
        self.config.origin = QueueLimits::new(max_rpc, buf_target);
        self
    }

    pub fn with_relay_queues(mut self, max_rpc: usize, buf_target: usize) -> Self {
        self.config.relay = QueueLimits::new(max_rpc, buf_target);
        self
    }

    pub fn with_remote_queues(mut self, max_rpc: usize, buf_target: usize) -> Self {
        self.config.remote = QueueLimits::new(max_rpc, buf_target);
        self
    }

    pub fn with_delivery_queue(mut self, max: usize, threshold: usize) -> Self {
        self.config.deliverq_max = max;
        self.config.deliverq_threshold = threshold;
        self
    }

    /// Set one option by name, as `ShuffleConfig::set` does.
    pub fn with_option(mut self, key: &str, value: &str) -> ShuffleResult<Self> {
        self.config.set(key, value)?;
        Ok(self)
    }

    pub fn config(&self) -> &ShuffleConfig {
        &self.config
    }

    /// Build over a caller-supplied fabric. Shutdown leaves the fabric
    /// running.
    pub fn build<H: DeliveryHandler>(
        self,
        topology: Arc<dyn Topology>,
        transport: Arc<dyn Transport>,
        handler: H,
    ) -> ShuffleResult<Shuffle> {
        self.start(topology, transport, Box::new(handler), false)
    }

    /// Establish the fabric through `bootstrap` and build over it. The fabric
    /// is finalized at shutdown.
    pub fn bootstrap<H: DeliveryHandler>(self, bootstrap: &dyn Bootstrap, handler: H) -> ShuffleResult<Shuffle> {
        let fabric = bootstrap.establish()?;
        let transport = fabric.transport.clone();
        self.start(fabric.topology, fabric.transport, Box::new(handler), true)
            .inspect_err(|_| transport.finalize())
    }

    fn start(
        self,
        topology: Arc<dyn Topology>,
        transport: Arc<dyn Transport>,
        handler: Box<dyn DeliveryHandler>,
        owns_fabric: bool,
    ) -> ShuffleResult<Shuffle> {
        self.config.validate()?;
        let router = Router::build(topology.as_ref())?;
        let rank = router.me();

        let inner = Arc::new(Inner::new(self.config, topology, transport, router, owns_fabric));

        let worker = inner.clone();
        let deliverer = std::thread::Builder::new()
            .name(format!("shuffle-deliver-{rank}"))
            .spawn(move || worker.deliverq.run(handler.as_ref(), &worker.stats))
            .map_err(|e| ShuffleError::config(format!("cannot start delivery thread: {e}")))?;

        let endpoint: Arc<dyn IncomingHandler> = Arc::new(RpcEndpoint {
            inner: Arc::downgrade(&inner),
        });
        if let Err(err) = inner.transport.register(&inner.config.rpc_name, endpoint) {
            // A self-bootstrapped fabric is finalized by `bootstrap`.
            inner.close();
            if deliverer.join().is_err() {
                tracing::warn!(rank, "delivery thread panicked");
            }
            return Err(err.into());
        }

        let config = &inner.config;
        tracing::info!(
            rank,
            size = inner.router.global_size(),
            node = inner.router.my_node(),
            local_peers = inner.router.local_peers().len(),
            represented = inner.router.represented_nodes().count(),
            rpc = %config.rpc_name,
            deliverq_max = config.deliverq_max,
            deliverq_threshold = config.deliverq_threshold,
            "shuffle started"
        );
        Ok(Shuffle {
            inner,
            deliverer: Some(deliverer),
        })
    }
}
