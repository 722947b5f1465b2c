use super::ShuffleConfig;
use crate::Core::error::ShuffleResult;

/// Environment variables named `SHUFFLE_<OPTION>` override option defaults.
pub const ENV_PREFIX: &str = "SHUFFLE_";

impl ShuffleConfig {
    /// Defaults overridden by `SHUFFLE_*` environment variables, validated.
    pub fn from_env() -> ShuffleResult<Self> {
        let mut config = Self::default();
        config.apply_vars(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SHUFFLE_<OPTION>=<value>` pairs. Other keys are skipped.
    pub fn apply_vars<I, K, V>(&mut self, vars: I) -> ShuffleResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(option) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            tracing::debug!(option, value = value.as_ref(), "shuffle option from environment");
            self.set(option, value.as_ref())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_prefixed_vars_only() {
        let mut cfg = ShuffleConfig::default();
        cfg.apply_vars([
            ("SHUFFLE_RMAXRPC", "4"),
            ("SHUFFLE_DELIVERQ_MAX", "64"),
            ("PATH", "/usr/bin"),
        ])
        .unwrap();

        assert_eq!(cfg.remote.max_rpc, 4);
        assert_eq!(cfg.deliverq_max, 64);
    }

    #[test]
    fn bad_value_is_a_config_error() {
        let mut cfg = ShuffleConfig::default();
        let err = cfg.apply_vars([("SHUFFLE_LOBUFTARGET", "-1")]).unwrap_err();
        assert!(err.is_configuration());
    }
}
