//! Runtime configuration.
//!
//! Values come from (highest precedence first) builder setters, `TUPLEX_*`
//! environment variables, a TOML file, and finally the defaults below.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::partition::Grain;

pub const ENV_NUM_THREADS: &str = "TUPLEX_NUM_THREADS";
pub const ENV_GRAIN: &str = "TUPLEX_GRAIN";
pub const ENV_WAIT_POLL_MS: &str = "TUPLEX_WAIT_POLL_MS";
pub const ENV_MAX_STALLED_POLLS: &str = "TUPLEX_MAX_STALLED_POLLS";
pub const ENV_THREAD_NAME_PREFIX: &str = "TUPLEX_THREAD_NAME_PREFIX";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Worker threads; 0 means one per CPU.
    pub num_threads: usize,

    /// Grain used by `put_range` when no tuner overrides it.
    pub default_grain: Grain,

    /// Interval at which `wait()` re-polls parked retries and hidden graphs.
    pub wait_poll_ms: u64,

    /// Retry passes over the pending queue without any global progress
    /// before `wait()` leaves the remaining instances parked.
    pub max_stalled_polls: u32,

    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_threads: 0,
            default_grain: Grain::Auto,
            wait_poll_ms: 2,
            max_stalled_polls: 8,
            thread_name_prefix: "tuplex-worker".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults, overlaid with the optional file, overlaid with the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        base.apply_env()
    }

    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Applies `TUPLEX_*` overrides read through `lookup`.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_NUM_THREADS) {
            self.num_threads = parse_env(ENV_NUM_THREADS, &v)?;
        }
        if let Some(v) = lookup(ENV_GRAIN) {
            self.default_grain = parse_env(ENV_GRAIN, &v)?;
        }
        if let Some(v) = lookup(ENV_WAIT_POLL_MS) {
            self.wait_poll_ms = parse_env(ENV_WAIT_POLL_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_STALLED_POLLS) {
            self.max_stalled_polls = parse_env(ENV_MAX_STALLED_POLLS, &v)?;
        }
        if let Some(v) = lookup(ENV_THREAD_NAME_PREFIX) {
            if v.trim().is_empty() {
                return Err(ConfigError::Env {
                    var: ENV_THREAD_NAME_PREFIX,
                    value: v,
                    reason: "must not be empty".to_string(),
                });
            }
            self.thread_name_prefix = v;
        }
        Ok(self)
    }

    pub fn worker_threads(&self) -> usize {
        if self.num_threads == 0 {
            num_cpus::get()
        } else {
            self.num_threads
        }
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms.max(1))
    }
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn toml_overrides_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            num_threads = 3
            default_grain = "never"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.num_threads, 3);
        assert_eq!(cfg.default_grain, Grain::Never);
        assert_eq!(cfg.wait_poll_ms, 2);

        let cfg = Config::from_toml_str("default_grain = 128").unwrap();
        assert_eq!(cfg.default_grain, Grain::Fixed(128));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml_str("threads = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_file_values() {
        let cfg = Config::from_toml_str("num_threads = 3\nwait_poll_ms = 10")
            .unwrap()
            .apply_env_from(env(&[(ENV_NUM_THREADS, "5"), (ENV_GRAIN, "auto")]))
            .unwrap();
        assert_eq!(cfg.num_threads, 5);
        assert_eq!(cfg.wait_poll_ms, 10);
        assert_eq!(cfg.default_grain, Grain::Auto);
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let err = Config::default()
            .apply_env_from(env(&[(ENV_MAX_STALLED_POLLS, "lots")]))
            .unwrap_err();
        match err {
            ConfigError::Env { var, value, .. } => {
                assert_eq!(var, ENV_MAX_STALLED_POLLS);
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_threads_means_all_cpus() {
        assert_eq!(Config::default().worker_threads(), num_cpus::get());
    }
}
