use crate::Core::error::{ShuffleError, ShuffleResult};
use crate::Shuffler::Structs::QueueClass;

mod env;

pub use env::ENV_PREFIX;

/// Default RPC name the shuffle registers with the transport.
pub const DEFAULT_RPC_NAME: &str = "shuffle_rpc";

/// Per-class output queue policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueLimits {
    /// Max RPCs in flight to one destination of this class.
    pub max_rpc: usize,
    /// Batch size in bytes (framing included) at which a batch is sealed.
    pub buf_target: usize,
}

impl QueueLimits {
    pub const fn new(max_rpc: usize, buf_target: usize) -> Self {
        Self { max_rpc, buf_target }
    }
}

/// Shuffle options.
///
/// Max-RPC caps apply per destination; sender limits apply to application
/// enqueues (not relayed traffic) across all local or all remote destinations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShuffleConfig {
    /// Name the shuffle's RPC is registered under.
    pub rpc_name: String,
    /// Outstanding application messages allowed on origin queues.
    pub local_sender_limit: usize,
    /// Outstanding application messages allowed on remote queues.
    pub remote_sender_limit: usize,
    /// Origin queues: application traffic to same-node peers.
    pub origin: QueueLimits,
    /// Relay queues: forwarded traffic to same-node peers.
    pub relay: QueueLimits,
    /// Remote queues: traffic to other nodes' representatives.
    pub remote: QueueLimits,
    /// Delivery depth above which incoming acknowledgements are held.
    pub deliverq_max: usize,
    /// Delivery depth that wakes the delivery thread.
    pub deliverq_threshold: usize,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            rpc_name: DEFAULT_RPC_NAME.to_string(),
            local_sender_limit: 4096,
            remote_sender_limit: 4096,
            origin: QueueLimits::new(1, 4096),
            relay: QueueLimits::new(1, 4096),
            remote: QueueLimits::new(1, 32768),
            deliverq_max: 1024,
            deliverq_threshold: 1,
        }
    }
}

impl ShuffleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limits(&self, class: QueueClass) -> QueueLimits {
        match class {
            QueueClass::Origin => self.origin,
            QueueClass::Relay => self.relay,
            QueueClass::Remote => self.remote,
        }
    }

    /// Set one option by its name.
    ///
    /// Recognised names: `localsenderlimit`, `remotesenderlimit`, `lomaxrpc`,
    /// `lobuftarget`, `lrmaxrpc`, `lrbuftarget`, `rmaxrpc`, `rbuftarget`,
    /// `deliverq_max`, `deliverq_threshold` (alias `deliverq_min`) and
    /// `rpc_name`. Names are case-insensitive.
    pub fn set(&mut self, key: &str, value: &str) -> ShuffleResult<()> {
        let key = key.trim().to_ascii_lowercase();
        if key == "rpc_name" {
            self.rpc_name = value.trim().to_string();
            return Ok(());
        }

        let slot = match key.as_str() {
            "localsenderlimit" | "lsenderlimit" => &mut self.local_sender_limit,
            "remotesenderlimit" | "rsenderlimit" => &mut self.remote_sender_limit,
            "lomaxrpc" => &mut self.origin.max_rpc,
            "lobuftarget" => &mut self.origin.buf_target,
            "lrmaxrpc" => &mut self.relay.max_rpc,
            "lrbuftarget" => &mut self.relay.buf_target,
            "rmaxrpc" => &mut self.remote.max_rpc,
            "rbuftarget" => &mut self.remote.buf_target,
            "deliverq_max" => &mut self.deliverq_max,
            "deliverq_threshold" | "deliverq_min" => &mut self.deliverq_threshold,
            _ => return Err(ShuffleError::config(format!("unknown option '{key}'"))),
        };

        *slot = value.trim().parse::<usize>().map_err(|e| {
            ShuffleError::config(format!("option '{key}': cannot parse '{value}': {e}"))
        })?;
        Ok(())
    }

    /// Check option values and combinations.
    pub fn validate(&self) -> ShuffleResult<()> {
        if self.rpc_name.is_empty() {
            return Err(ShuffleError::config("rpc_name must not be empty"));
        }

        let counts = [
            ("localsenderlimit", self.local_sender_limit),
            ("remotesenderlimit", self.remote_sender_limit),
            ("lomaxrpc", self.origin.max_rpc),
            ("lobuftarget", self.origin.buf_target),
            ("lrmaxrpc", self.relay.max_rpc),
            ("lrbuftarget", self.relay.buf_target),
            ("rmaxrpc", self.remote.max_rpc),
            ("rbuftarget", self.remote.buf_target),
            ("deliverq_max", self.deliverq_max),
            ("deliverq_threshold", self.deliverq_threshold),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ShuffleError::config(format!("{name} must be at least 1")));
            }
        }

        if self.deliverq_threshold > self.deliverq_max {
            return Err(ShuffleError::config(format!(
                "deliverq_threshold ({}) must not exceed deliverq_max ({})",
                self.deliverq_threshold, self.deliverq_max
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ShuffleConfig::default().validate().is_ok());
    }

    #[test]
    fn set_recognises_option_names() {
        let mut cfg = ShuffleConfig::default();
        cfg.set("LOMAXRPC", "3").unwrap();
        cfg.set("rbuftarget", " 65536 ").unwrap();
        cfg.set("deliverq_min", "8").unwrap();
        cfg.set("rpc_name", "bench_rpc").unwrap();

        assert_eq!(cfg.origin.max_rpc, 3);
        assert_eq!(cfg.remote.buf_target, 65536);
        assert_eq!(cfg.deliverq_threshold, 8);
        assert_eq!(cfg.rpc_name, "bench_rpc");
    }

    #[test]
    fn set_rejects_unknown_and_garbage() {
        let mut cfg = ShuffleConfig::default();
        assert!(cfg.set("maxrpc", "1").is_err());
        assert!(cfg.set("lrmaxrpc", "many").is_err());
    }

    #[test]
    fn threshold_above_max_is_rejected() {
        let mut cfg = ShuffleConfig::default();
        cfg.deliverq_max = 4;
        cfg.deliverq_threshold = 5;
        let err = cfg.validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut cfg = ShuffleConfig::default();
        cfg.relay.max_rpc = 0;
        assert!(cfg.validate().is_err());
    }
}
