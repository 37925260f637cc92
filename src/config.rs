use std::collections::HashMap;
use std::time::Duration;

use typed_builder::TypedBuilder;
use url::Url;

use crate::{IndexSenderError, Result};

/// Batch size that triggers an add or delete flush unless configured otherwise.
pub const DEFAULT_SEND_THRESHOLD: usize = 100;
/// Period of the background staleness scan.
pub const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(3);
/// Delay before the first staleness scan.
pub const DEFAULT_FLUSH_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Age after which a non-empty queue is flushed by the scheduler.
pub const DEFAULT_MAX_STALENESS: Duration = Duration::from_millis(1000);

/// Option keys understood by [`SenderConfig::from_options`].
pub const OPT_ADD_THRESHOLD: &str = "add.threshold";
pub const OPT_UPDATE_THRESHOLD: &str = "update.threshold";
pub const OPT_FLUSH_PERIOD_MS: &str = "flush.period.ms";
pub const OPT_FLUSH_INITIAL_DELAY_MS: &str = "flush.initial.delay.ms";
pub const OPT_MAX_STALENESS_MS: &str = "max.staleness.ms";

/// Batching and flushing knobs of one sender.
///
/// The update threshold has no default and must always be given.
#[derive(TypedBuilder, Debug, Clone, PartialEq, Eq)]
pub struct SenderConfig {
    /// Batch size that flushes add and delete queues
    #[builder(default = DEFAULT_SEND_THRESHOLD)]
    pub add_threshold: usize,

    /// Batch size that flushes update queues
    pub update_threshold: usize,

    #[builder(default = DEFAULT_FLUSH_PERIOD)]
    pub flush_period: Duration,

    #[builder(default = DEFAULT_FLUSH_INITIAL_DELAY)]
    pub flush_initial_delay: Duration,

    #[builder(default = DEFAULT_MAX_STALENESS)]
    pub max_staleness: Duration,
}

impl SenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.add_threshold == 0 {
            return Err(IndexSenderError::Configuration(
                "add threshold must be at least 1".to_string(),
            ));
        }
        if self.update_threshold == 0 {
            return Err(IndexSenderError::Configuration(
                "update threshold must be at least 1".to_string(),
            ));
        }
        if self.flush_period.is_zero() {
            return Err(IndexSenderError::Configuration(
                "flush period must be positive".to_string(),
            ));
        }
        Ok(())
    }

    ///
    /// Build a config from string options, e.g. taken from a properties file
    ///
    /// keys may carry a `sender.` prefix and are matched case-insensitively:
    ///
    /// ```text,no_run
    /// sender.add.threshold = 500
    /// update.threshold = 200
    /// flush.period.ms = 3000
    /// ```
    ///
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self> {
        let mut add_threshold = DEFAULT_SEND_THRESHOLD;
        let mut update_threshold = None;
        let mut flush_period = DEFAULT_FLUSH_PERIOD;
        let mut flush_initial_delay = DEFAULT_FLUSH_INITIAL_DELAY;
        let mut max_staleness = DEFAULT_MAX_STALENESS;

        for (k, v) in options {
            let key = k.to_ascii_lowercase();
            let key = key.strip_prefix("sender.").unwrap_or(&key);
            match key {
                OPT_ADD_THRESHOLD => add_threshold = parse_number(key, v)? as usize,
                OPT_UPDATE_THRESHOLD => update_threshold = Some(parse_number(key, v)? as usize),
                OPT_FLUSH_PERIOD_MS => flush_period = Duration::from_millis(parse_number(key, v)?),
                OPT_FLUSH_INITIAL_DELAY_MS => {
                    flush_initial_delay = Duration::from_millis(parse_number(key, v)?)
                }
                OPT_MAX_STALENESS_MS => max_staleness = Duration::from_millis(parse_number(key, v)?),
                _ => tracing::warn!(option = %k, "ignoring unknown sender option"),
            }
        }

        let update_threshold = update_threshold.ok_or_else(|| {
            IndexSenderError::Configuration(format!("{} is required", OPT_UPDATE_THRESHOLD))
        })?;

        let config = SenderConfig {
            add_threshold,
            update_threshold,
            flush_period,
            flush_initial_delay,
            max_staleness,
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value.trim().parse::<u64>().map_err(|e| {
        IndexSenderError::Configuration(format!("invalid value {:?} for {}: {}", value, key, e))
    })
}

///
/// Parse the index service address
///
/// current supported format:
///
/// ```text,no_run
/// nats://nats_address/subject_prefix
/// ```
///
/// for example:
///
/// ```text,no_run
/// nats://localhost:4222/uindex
/// ```
///
pub trait IndexUrl {
    /// NATS server connection string
    fn index_servers(&self) -> String;
    /// Prefix for all subjects of this service, if the path names one
    fn subject_prefix(&self) -> Option<String>;
}

impl IndexUrl for Url {
    fn index_servers(&self) -> String {
        format!(
            "{}:{}",
            self.host_str().unwrap_or("localhost"),
            self.port().unwrap_or(4222)
        )
    }

    fn subject_prefix(&self) -> Option<String> {
        self.path_segments()
            .and_then(|mut segments| segments.find(|s| !s.is_empty()))
            .map(|s| s.to_string())
    }
}
