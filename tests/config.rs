use hop_shuffle::Core::config::ENV_PREFIX;
use hop_shuffle::Core::LoopbackFabric;
use hop_shuffle::{Message, ShuffleBuilder, ShuffleConfig, ShuffleError};
use serial_test::serial;
use std::env;

/// Sets `SHUFFLE_*` variables for the duration of a test.
struct EnvGuard(Vec<String>);

impl EnvGuard {
    fn set(vars: &[(&str, &str)]) -> Self {
        let mut keys = Vec::new();
        for (option, value) in vars {
            let key = format!("{ENV_PREFIX}{option}");
            env::set_var(&key, value);
            keys.push(key);
        }
        Self(keys)
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in &self.0 {
            env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn environment_overrides_defaults() {
    let _env = EnvGuard::set(&[
        ("LOMAXRPC", "3"),
        ("RBUFTARGET", "131072"),
        ("LOCALSENDERLIMIT", "64"),
        ("DELIVERQ_MAX", "32"),
        ("DELIVERQ_THRESHOLD", "4"),
    ]);

    let config = ShuffleConfig::from_env().unwrap();
    assert_eq!(config.origin.max_rpc, 3);
    assert_eq!(config.remote.buf_target, 131072);
    assert_eq!(config.local_sender_limit, 64);
    assert_eq!(config.deliverq_max, 32);
    assert_eq!(config.deliverq_threshold, 4);
    // Untouched options keep their defaults.
    assert_eq!(config.relay, ShuffleConfig::default().relay);

    let builder = ShuffleBuilder::from_env().unwrap();
    assert_eq!(builder.config(), &config);
}

#[test]
#[serial]
fn unknown_environment_option_is_an_error() {
    let _env = EnvGuard::set(&[("NOT_AN_OPTION", "1")]);
    let err = ShuffleConfig::from_env().unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("not_an_option"));
}

#[test]
#[serial]
fn threshold_above_max_fails_validation() {
    let _env = EnvGuard::set(&[("DELIVERQ_MAX", "4"), ("DELIVERQ_MIN", "16")]);
    let err = ShuffleBuilder::from_env().err().expect("invalid combination");
    assert!(matches!(err, ShuffleError::Config { .. }));
}

#[test]
fn builder_options_by_name() {
    let builder = ShuffleBuilder::new()
        .with_option("lrmaxrpc", "5")
        .unwrap()
        .with_option("rpc_name", "my_shuffle")
        .unwrap();
    assert_eq!(builder.config().relay.max_rpc, 5);
    assert_eq!(builder.config().rpc_name, "my_shuffle");

    assert!(ShuffleBuilder::new().with_option("rmaxrpc", "lots").is_err());
}

#[test]
fn invalid_config_fails_build() {
    let fabric = LoopbackFabric::new(1, 1).unwrap();
    let endpoint = fabric.fabric(0);
    let err = ShuffleBuilder::new()
        .with_sender_limits(0, 16)
        .build(endpoint.topology, endpoint.transport, |_m: Message| {})
        .err()
        .expect("zero sender limit");
    assert!(err.is_configuration());
}

#[test]
fn custom_rpc_name_is_registered() {
    let fabric = LoopbackFabric::new(1, 2).unwrap();
    let shuffles: Vec<_> = (0..2)
        .map(|rank| {
            let endpoint = fabric.fabric(rank);
            ShuffleBuilder::new()
                .with_rpc_name("alt")
                .build(endpoint.topology, endpoint.transport, |_m: Message| {})
                .unwrap()
        })
        .collect();

    shuffles[0].enqueue(1, 0, b"x").unwrap();
    shuffles[0].flush_origin_queues().unwrap();
    assert_eq!(fabric.link(0, 1).rpcs_issued, 1);
    assert_eq!(shuffles[1].stats().local.recvs, 1);
}
