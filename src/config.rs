//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Runtime configuration, built from `RORI_*` environment variables.
#[derive(Debug, Clone)]
pub struct RoriConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Root directory holding `<location>/rsc.json` module configuration blobs.
    pub modules_dir: PathBuf,
    /// Upper bound on a single module `process` call.
    pub module_timeout: Duration,
    /// Language used when resolving localized phrases.
    pub lang: String,
    /// Enables daily rolling file logs when set.
    pub log_dir: Option<PathBuf>,
    /// Maximum number of dispatch cycles running at once.
    pub max_concurrent_cycles: usize,
    /// How often the scheduler re-reads its tasks and runs the due ones.
    pub scheduler_tick: Duration,
    /// JSON-lines file to replay instead of reading stdin.
    pub input_path: Option<PathBuf>,
}

impl Default for RoriConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/rori.db"),
            modules_dir: PathBuf::from("./rori_modules"),
            module_timeout: Duration::from_secs(5),
            lang: "en".to_string(),
            log_dir: None,
            max_concurrent_cycles: 64,
            scheduler_tick: Duration::from_secs(1),
            input_path: None,
        }
    }
}

impl RoriConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = lookup("RORI_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let modules_dir = lookup("RORI_MODULES_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.modules_dir);

        let module_timeout = match lookup("RORI_MODULE_TIMEOUT_MS") {
            Some(raw) => {
                let ms: u64 = parse_positive("RORI_MODULE_TIMEOUT_MS", &raw)?;
                Duration::from_millis(ms)
            }
            None => defaults.module_timeout,
        };

        let lang = lookup("RORI_LANG")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.lang);

        let log_dir = lookup("RORI_LOG_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let max_concurrent_cycles = match lookup("RORI_MAX_CONCURRENT_CYCLES") {
            Some(raw) => parse_positive("RORI_MAX_CONCURRENT_CYCLES", &raw)? as usize,
            None => defaults.max_concurrent_cycles,
        };

        let scheduler_tick = match lookup("RORI_SCHEDULER_TICK_MS") {
            Some(raw) => Duration::from_millis(parse_positive("RORI_SCHEDULER_TICK_MS", &raw)?),
            None => defaults.scheduler_tick,
        };

        let input_path = lookup("RORI_INPUT")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            db_path,
            modules_dir,
            module_timeout,
            lang,
            log_dir,
            max_concurrent_cycles,
            scheduler_tick,
            input_path,
        })
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64, ConfigError> {
    let value: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?} is not a number: {e}"),
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<RoriConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RoriConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = RoriConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.db_path, PathBuf::from("./data/rori.db"));
        assert_eq!(config.module_timeout, Duration::from_secs(5));
        assert_eq!(config.lang, "en");
        assert!(config.log_dir.is_none());
        assert_eq!(config.max_concurrent_cycles, 64);
        assert_eq!(config.scheduler_tick, Duration::from_secs(1));
        assert!(config.input_path.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("RORI_DB_PATH", "/tmp/r.db"),
            ("RORI_MODULE_TIMEOUT_MS", "250"),
            ("RORI_LANG", "fr"),
            ("RORI_LOG_DIR", "/var/log/rori"),
            ("RORI_MAX_CONCURRENT_CYCLES", "4"),
            ("RORI_SCHEDULER_TICK_MS", "500"),
            ("RORI_INPUT", "session.jsonl"),
        ])
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/r.db"));
        assert_eq!(config.module_timeout, Duration::from_millis(250));
        assert_eq!(config.lang, "fr");
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/rori")));
        assert_eq!(config.max_concurrent_cycles, 4);
        assert_eq!(config.scheduler_tick, Duration::from_millis(500));
        assert_eq!(config.input_path, Some(PathBuf::from("session.jsonl")));
    }

    #[test]
    fn rejects_invalid_timeout() {
        let err = config_from(&[("RORI_MODULE_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RORI_MODULE_TIMEOUT_MS"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = config_from(&[("RORI_MAX_CONCURRENT_CYCLES", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
