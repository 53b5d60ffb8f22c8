//! Group configuration.
//!
//! Loaded from `SINGLECACHE_*` environment variables. [`GroupConfig::from_env`]
//! is lenient (a malformed value keeps its default);
//! [`GroupConfig::try_from_env`] reports the first malformed value instead.

use std::env;

use crate::error::ConfigError;

const ENV_GROUP_NAME: &str = "SINGLECACHE_GROUP_NAME";
const ENV_WORKER_STACK_BYTES: &str = "SINGLECACHE_WORKER_STACK_BYTES";
const ENV_METRICS: &str = "SINGLECACHE_METRICS";

/// Default label for log events and worker threads.
pub const DEFAULT_GROUP_NAME: &str = "singlecache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    /// Label attached to log events; also the worker-thread name prefix.
    pub name: String,
    /// Stack size for `do_chan` worker threads. `None` uses the std default.
    pub worker_stack_bytes: Option<usize>,
    /// Record coalescing counters.
    pub metrics_enabled: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_GROUP_NAME.to_string(),
            worker_stack_bytes: None,
            metrics_enabled: true,
        }
    }
}

impl GroupConfig {
    /// Config with the given name and defaults for everything else.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Load from the process environment, ignoring malformed values.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(env_value)
    }

    /// Load from the process environment, failing on malformed values.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Self::try_from_lookup(env_value)
    }

    /// Lenient load from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_GROUP_NAME).filter(|s| !s.trim().is_empty()) {
            config.name = v.trim().to_string();
        }
        if let Some(v) = lookup(ENV_WORKER_STACK_BYTES) {
            config.worker_stack_bytes = parse_stack_bytes(&v).ok().flatten();
        }
        if let Some(v) = lookup(ENV_METRICS) {
            config.metrics_enabled = parse_bool(&v).unwrap_or(config.metrics_enabled);
        }
        config
    }

    /// Strict load from an arbitrary key lookup.
    pub fn try_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_GROUP_NAME) {
            let name = v.trim();
            if name.is_empty() {
                return Err(ConfigError::invalid(ENV_GROUP_NAME, v, "must not be empty"));
            }
            config.name = name.to_string();
        }
        if let Some(v) = lookup(ENV_WORKER_STACK_BYTES) {
            config.worker_stack_bytes = parse_stack_bytes(&v).map_err(|reason| {
                ConfigError::invalid(ENV_WORKER_STACK_BYTES, v.clone(), reason)
            })?;
        }
        if let Some(v) = lookup(ENV_METRICS) {
            config.metrics_enabled = parse_bool(&v)
                .ok_or_else(|| ConfigError::invalid(ENV_METRICS, v.clone(), "expected a boolean"))?;
        }
        Ok(config)
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => Some(true),
        "0" | "false" | "f" | "no" | "n" => Some(false),
        _ => None,
    }
}

/// Empty or `0` means "use the default stack size".
fn parse_stack_bytes(value: &str) -> Result<Option<usize>, &'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.parse::<usize>() {
        Ok(0) => Ok(None),
        Ok(n) => Ok(Some(n)),
        Err(_) => Err("expected a byte count"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = GroupConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config, GroupConfig::default());
        assert_eq!(config.name, "singlecache");
        assert!(config.metrics_enabled);
        assert!(config.worker_stack_bytes.is_none());
    }

    #[test]
    fn reads_all_keys() {
        let config = GroupConfig::from_lookup(lookup_from(&[
            ("SINGLECACHE_GROUP_NAME", " user-lookup "),
            ("SINGLECACHE_WORKER_STACK_BYTES", "262144"),
            ("SINGLECACHE_METRICS", "no"),
        ]));
        assert_eq!(config.name, "user-lookup");
        assert_eq!(config.worker_stack_bytes, Some(262_144));
        assert!(!config.metrics_enabled);
    }

    #[test]
    fn lenient_load_keeps_defaults_on_garbage() {
        let config = GroupConfig::from_lookup(lookup_from(&[
            ("SINGLECACHE_GROUP_NAME", "   "),
            ("SINGLECACHE_WORKER_STACK_BYTES", "lots"),
            ("SINGLECACHE_METRICS", "perhaps"),
        ]));
        assert_eq!(config, GroupConfig::default());
    }

    #[test]
    fn strict_load_reports_first_bad_value() {
        let err = GroupConfig::try_from_lookup(lookup_from(&[(
            "SINGLECACHE_WORKER_STACK_BYTES",
            "-1",
        )]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::invalid("SINGLECACHE_WORKER_STACK_BYTES", "-1", "expected a byte count")
        );

        let err =
            GroupConfig::try_from_lookup(lookup_from(&[("SINGLECACHE_METRICS", "perhaps")]))
                .unwrap_err();
        assert!(err.to_string().contains("SINGLECACHE_METRICS"));

        let err = GroupConfig::try_from_lookup(lookup_from(&[("SINGLECACHE_GROUP_NAME", "")]))
            .unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn strict_load_accepts_valid_values() {
        let config = GroupConfig::try_from_lookup(lookup_from(&[
            ("SINGLECACHE_GROUP_NAME", "orders"),
            ("SINGLECACHE_WORKER_STACK_BYTES", "0"),
            ("SINGLECACHE_METRICS", "TRUE"),
        ]))
        .unwrap();
        assert_eq!(config.name, "orders");
        assert_eq!(config.worker_stack_bytes, None);
        assert!(config.metrics_enabled);
    }

    #[test]
    fn named_overrides_only_the_name() {
        let config = GroupConfig::named("inventory");
        assert_eq!(config.name, "inventory");
        assert!(config.metrics_enabled);
    }

    #[test]
    fn parse_bool_variants() {
        for v in ["1", "true", "T", "yes", "Y"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["0", "false", "F", "no", " n "] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("2"), None);
    }
}
