//! Wrapper configuration.

use std::sync::OnceLock;

use crate::env;

static FROM_ENV: OnceLock<ReplayConfig> = OnceLock::new();

/// Knobs for [`crate::GraphWrapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayConfig {
    /// Model executions before capture. Always at least one: kernels that initialise state on
    /// first use must do so before their addresses are recorded.
    pub warmup_runs: usize,
    /// Reject calls whose input signature differs from the captured one instead of handing
    /// moved addresses to the replay.
    pub strict_signature: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            warmup_runs: 1,
            strict_signature: true,
        }
    }
}

impl ReplayConfig {
    /// Defaults overridden by `REPLAY_RS_WARMUP_RUNS` and `REPLAY_RS_STRICT_SIGNATURE`.
    ///
    /// The environment is read once per process.
    pub fn from_env() -> Self {
        *FROM_ENV.get_or_init(Self::read_env)
    }

    fn read_env() -> Self {
        let defaults = Self::default();
        Self {
            warmup_runs: env::warmup_runs().unwrap_or(defaults.warmup_runs),
            strict_signature: env::strict_signature().unwrap_or(defaults.strict_signature),
        }
        .normalized()
    }

    pub fn with_warmup_runs(mut self, runs: usize) -> Self {
        self.warmup_runs = runs;
        self.normalized()
    }

    pub fn with_strict_signature(mut self, strict: bool) -> Self {
        self.strict_signature = strict;
        self
    }

    fn normalized(mut self) -> Self {
        self.warmup_runs = self.warmup_runs.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static ENV_TEST_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn warmup_runs_never_drop_below_one() {
        assert_eq!(ReplayConfig::default().with_warmup_runs(0).warmup_runs, 1);
        assert_eq!(ReplayConfig::default().with_warmup_runs(3).warmup_runs, 3);
    }

    #[test]
    fn environment_overrides_defaults() {
        let _serial_guard = ENV_TEST_MUTEX.lock().expect("env test mutex poisoned");
        std::env::set_var(env::WARMUP_RUNS_VAR, "2");
        std::env::set_var(env::STRICT_SIGNATURE_VAR, "off");
        let config = ReplayConfig::read_env();
        std::env::remove_var(env::WARMUP_RUNS_VAR);
        std::env::remove_var(env::STRICT_SIGNATURE_VAR);

        assert_eq!(config.warmup_runs, 2);
        assert!(!config.strict_signature);
    }

    #[test]
    fn unparsable_values_fall_back_to_defaults() {
        let _serial_guard = ENV_TEST_MUTEX.lock().expect("env test mutex poisoned");
        std::env::set_var(env::WARMUP_RUNS_VAR, "many");
        let config = ReplayConfig::read_env();
        std::env::remove_var(env::WARMUP_RUNS_VAR);

        assert_eq!(config.warmup_runs, 1);
        assert!(config.strict_signature);
    }
}
