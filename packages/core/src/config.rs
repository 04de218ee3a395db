//! Environment-driven configuration.
//!
//! Every package reads its settings through [`Env`], which wraps a variable
//! lookup. Production code uses [`Env::process`]; tests pass a map.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required setting {0}")]
    Missing(&'static str),
}

/// Variable lookup used by every `from_env` constructor.
pub struct Env {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl Env {
    /// Read from the process environment.
    pub fn process() -> Self {
        Self {
            lookup: Box::new(|name| std::env::var(name).ok()),
        }
    }

    /// Read from a fixed set of values.
    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self {
            lookup: Box::new(move |name| values.get(name).cloned()),
        }
    }

    /// Read from `(name, value)` pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::from_map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    /// A non-empty, trimmed value.
    pub fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(non_empty)
    }

    pub fn bool(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };

        let parsed = match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" => true,
            "0" | "false" | "no" | "n" => false,
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "invalid boolean for {name}={v} (expected true/false)"
                )));
            }
        };
        Ok(Some(parsed))
    }

    pub fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        match self.string(name) {
            None => Ok(None),
            Some(v) => v.parse::<T>().map(Some).map_err(|_| {
                ConfigError::Invalid(format!("could not parse {name}={v}"))
            }),
        }
    }

    pub fn secs(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }
}

/// Trim a value and drop it when empty.
pub fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Settings for the channel, worker and consumer loops.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Bound of the local file channel.
    pub channel_capacity: usize,
    /// Upper bound on applying one file or message.
    pub processing_timeout: Duration,
    /// Messages requested per receive call (1-10).
    pub batch_size: u32,
    /// Lease requested for received messages.
    pub visibility_timeout: Duration,
    /// Long-poll wait per receive call.
    pub wait_time: Duration,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_receive_count: u32,
    /// Messages in flight across all consumers.
    pub in_flight_limit: usize,
    /// Number of consumer actors.
    pub consumers: usize,
    /// Extend the lease at half-window intervals while processing.
    pub extend_visibility: bool,
    /// Directory for uploaded files awaiting the channel.
    pub spool_dir: PathBuf,
    /// How long shutdown waits for in-flight work before aborting it.
    pub shutdown_grace: Duration,
    /// How long ledger entries are kept. Must outlast every redelivery.
    pub ledger_retention: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            processing_timeout: Duration::from_secs(3),
            batch_size: 10,
            visibility_timeout: Duration::from_secs(30),
            wait_time: Duration::from_secs(20),
            max_receive_count: 5,
            in_flight_limit: 20,
            consumers: 1,
            extend_visibility: false,
            spool_dir: std::env::temp_dir().join("ingest-spool"),
            shutdown_grace: Duration::from_secs(30),
            ledger_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl PipelineConfig {
    /// Build a config from environment variables.
    ///
    /// - `INGEST_CHANNEL_CAPACITY` (default: 100)
    /// - `INGEST_PROCESSING_TIMEOUT_SECS` (default: 3)
    /// - `INGEST_BATCH_SIZE` (default: 10, max 10)
    /// - `INGEST_VISIBILITY_TIMEOUT_SECS` (default: 30)
    /// - `INGEST_WAIT_TIME_SECS` (default: 20)
    /// - `INGEST_MAX_RECEIVE_COUNT` (default: 5)
    /// - `INGEST_IN_FLIGHT_LIMIT` (default: 20)
    /// - `INGEST_CONSUMERS` (default: 1)
    /// - `INGEST_EXTEND_VISIBILITY` (default: false)
    /// - `INGEST_SPOOL_DIR` (default: `<tmp>/ingest-spool`)
    /// - `INGEST_SHUTDOWN_GRACE_SECS` (default: 30)
    /// - `INGEST_LEDGER_RETENTION_SECS` (default: 604800, one week)
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let cfg = Self {
            channel_capacity: env
                .parse("INGEST_CHANNEL_CAPACITY")?
                .unwrap_or(defaults.channel_capacity),
            processing_timeout: env
                .secs("INGEST_PROCESSING_TIMEOUT_SECS")?
                .unwrap_or(defaults.processing_timeout),
            batch_size: env
                .parse("INGEST_BATCH_SIZE")?
                .unwrap_or(defaults.batch_size),
            visibility_timeout: env
                .secs("INGEST_VISIBILITY_TIMEOUT_SECS")?
                .unwrap_or(defaults.visibility_timeout),
            wait_time: env
                .secs("INGEST_WAIT_TIME_SECS")?
                .unwrap_or(defaults.wait_time),
            max_receive_count: env
                .parse("INGEST_MAX_RECEIVE_COUNT")?
                .unwrap_or(defaults.max_receive_count),
            in_flight_limit: env
                .parse("INGEST_IN_FLIGHT_LIMIT")?
                .unwrap_or(defaults.in_flight_limit),
            consumers: env.parse("INGEST_CONSUMERS")?.unwrap_or(defaults.consumers),
            extend_visibility: env
                .bool("INGEST_EXTEND_VISIBILITY")?
                .unwrap_or(defaults.extend_visibility),
            spool_dir: env
                .string("INGEST_SPOOL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.spool_dir),
            shutdown_grace: env
                .secs("INGEST_SHUTDOWN_GRACE_SECS")?
                .unwrap_or(defaults.shutdown_grace),
            ledger_retention: env
                .secs("INGEST_LEDGER_RETENTION_SECS")?
                .unwrap_or(defaults.ledger_retention),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel capacity must be at least 1".into(),
            ));
        }
        if self.processing_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "processing timeout must be positive".into(),
            ));
        }
        if !(1..=10).contains(&self.batch_size) {
            return Err(ConfigError::Invalid(format!(
                "batch size {} outside 1..=10",
                self.batch_size
            )));
        }
        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "visibility timeout must be positive".into(),
            ));
        }
        if self.in_flight_limit == 0 {
            return Err(ConfigError::Invalid(
                "in-flight limit must be at least 1".into(),
            ));
        }
        if self.max_receive_count == 0 {
            return Err(ConfigError::Invalid(
                "max receive count must be at least 1".into(),
            ));
        }
        if self.ledger_retention <= self.redelivery_horizon() {
            return Err(ConfigError::Invalid(format!(
                "ledger retention {:?} must exceed the redelivery horizon {:?}",
                self.ledger_retention,
                self.redelivery_horizon()
            )));
        }
        Ok(())
    }

    /// Longest a message can keep coming back before it is dead-lettered.
    pub fn redelivery_horizon(&self) -> Duration {
        self.visibility_timeout
            .max(self.processing_timeout)
            .saturating_mul(self.max_receive_count.saturating_add(1))
    }

    /// Whether a message could still be processing when its lease lapses.
    pub fn lease_may_lapse(&self) -> bool {
        self.processing_timeout >= self.visibility_timeout && !self.extend_visibility
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() -> Result<(), ConfigError> {
        let cfg = PipelineConfig::from_env(&Env::from_pairs([]))?;
        assert_eq!(cfg.channel_capacity, 100);
        assert_eq!(cfg.processing_timeout, Duration::from_secs(3));
        assert_eq!(cfg.batch_size, 10);
        Ok(())
    }

    #[test]
    fn reads_overrides() -> Result<(), ConfigError> {
        let env = Env::from_pairs([
            ("INGEST_CHANNEL_CAPACITY", "2"),
            ("INGEST_VISIBILITY_TIMEOUT_SECS", "45"),
            ("INGEST_EXTEND_VISIBILITY", "yes"),
            ("INGEST_SPOOL_DIR", " /var/spool/ingest "),
        ]);
        let cfg = PipelineConfig::from_env(&env)?;
        assert_eq!(cfg.channel_capacity, 2);
        assert_eq!(cfg.visibility_timeout, Duration::from_secs(45));
        assert!(cfg.extend_visibility);
        assert_eq!(cfg.spool_dir, PathBuf::from("/var/spool/ingest"));
        Ok(())
    }

    #[test]
    fn rejects_invalid_values() {
        let zero = Env::from_pairs([("INGEST_CHANNEL_CAPACITY", "0")]);
        assert!(matches!(
            PipelineConfig::from_env(&zero),
            Err(ConfigError::Invalid(_))
        ));

        let batch = Env::from_pairs([("INGEST_BATCH_SIZE", "11")]);
        assert!(PipelineConfig::from_env(&batch).is_err());

        let flag = Env::from_pairs([("INGEST_EXTEND_VISIBILITY", "maybe")]);
        assert!(PipelineConfig::from_env(&flag).is_err());
    }

    #[test]
    fn ledger_retention_must_outlast_redelivery() -> Result<(), ConfigError> {
        let env = Env::from_pairs([
            ("INGEST_VISIBILITY_TIMEOUT_SECS", "60"),
            ("INGEST_MAX_RECEIVE_COUNT", "4"),
            ("INGEST_LEDGER_RETENTION_SECS", "300"),
        ]);
        assert!(matches!(
            PipelineConfig::from_env(&env),
            Err(ConfigError::Invalid(_))
        ));

        let env = Env::from_pairs([("INGEST_LEDGER_RETENTION_SECS", "3600")]);
        let cfg = PipelineConfig::from_env(&env)?;
        assert_eq!(cfg.ledger_retention, Duration::from_secs(3600));
        assert_eq!(cfg.redelivery_horizon(), Duration::from_secs(180));
        Ok(())
    }
}
