//! Tuning knobs for listing, watching and backing off
//!
//! A [`Config`] is always validated: build one through
//! [`ConfigBuilder::finish`], [`Config::from_yaml`] or [`Config::load`], or
//! take [`Config::default`].
//!
//! ```yaml
//! pageSize: 500
//! firstPageSize: 50
//! watchTimeoutSecs: 290
//! initialBackoff: 5
//! maxBackoff: 60
//! backoffFactor: 2.0
//! jitter: true
//! pruneOnDelete: true
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::WatchParams;

/// Server-side watch timeouts must stay below this many seconds.
pub const MAX_WATCH_TIMEOUT_SECS: u32 = 295;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation
    #[error("invalid kubelite config: {0}")]
    Invalid(String),
    /// The document could not be parsed
    #[error("failed to parse kubelite config: {0}")]
    Parse(#[source] serde_yaml::Error),
    /// The file could not be read
    #[error("failed to read kubelite config from {path}: {source}")]
    Read {
        /// Path that was read
        path: String,
        /// Underlying io failure
        #[source]
        source: std::io::Error,
    },
}

/// Page sizes used by the paginated lister
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListConfig {
    /// `limit` for every page after the first; `None` lists in one request
    pub page_size: Option<u32>,
    /// `limit` for the first page; falls back to `page_size`
    pub first_page_size: Option<u32>,
    /// How often an expired continue token may restart the listing
    pub max_restarts: u32,
}

impl Default for ListConfig {
    fn default() -> Self {
        ConfigBuilder::default().list()
    }
}

/// Reconnect delay policy of the watch loops
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// First delay after a healthy period
    pub initial: Duration,
    /// Cap on any single delay, jitter included
    pub max: Duration,
    /// Growth factor between consecutive delays
    pub factor: f32,
    /// Whether to add random jitter to each delay
    pub jitter: bool,
    /// Quiet period after which the delay sequence starts over
    pub reset_after: Duration,
}

impl BackoffConfig {
    /// Always wait exactly `delay`
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            factor: 1.0,
            jitter: false,
            reset_after: Duration::MAX,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        ConfigBuilder::default().backoff_config()
    }
}

/// Unvalidated configuration, also the serde representation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigBuilder {
    /// `limit` for paginated list calls; `None` disables pagination
    pub page_size: Option<u32>,
    /// `limit` of the first page; defaults to `page_size`
    pub first_page_size: Option<u32>,
    /// Listing restarts allowed when a continue token expires
    pub max_list_restarts: u32,
    /// `timeoutSeconds` sent with every watch request
    pub watch_timeout_secs: u32,
    /// Initial reconnect delay
    #[serde(with = "seconds")]
    pub initial_backoff: Duration,
    /// Maximum reconnect delay, jitter included
    #[serde(with = "seconds")]
    pub max_backoff: Duration,
    /// Multiplier applied to the delay after each consecutive failure
    pub backoff_factor: f32,
    /// Randomize delays so watchers of different kinds do not reconnect in lockstep
    pub jitter: bool,
    /// Restart the delay sequence after this long without failures
    #[serde(with = "seconds")]
    pub backoff_reset_after: Duration,
    /// Remove index entries on `Deleted` events
    pub prune_on_delete: bool,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            page_size: Some(500),
            first_page_size: None,
            max_list_restarts: 3,
            watch_timeout_secs: 290,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: true,
            backoff_reset_after: Duration::from_secs(120),
            prune_on_delete: true,
        }
    }
}

impl ConfigBuilder {
    /// Set the page size of paginated listings
    #[must_use]
    pub fn page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set a different page size for the first page
    #[must_use]
    pub fn first_page_size(mut self, first_page_size: Option<u32>) -> Self {
        self.first_page_size = first_page_size;
        self
    }

    /// Set the server-side watch timeout
    #[must_use]
    pub fn watch_timeout_secs(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs;
        self
    }

    /// Use `backoff` for reconnects
    #[must_use]
    pub fn backoff(mut self, backoff: &BackoffConfig) -> Self {
        self.initial_backoff = backoff.initial;
        self.max_backoff = backoff.max;
        self.backoff_factor = backoff.factor;
        self.jitter = backoff.jitter;
        self.backoff_reset_after = backoff.reset_after;
        self
    }

    /// Whether deletes remove index entries
    #[must_use]
    pub fn prune_on_delete(mut self, enabled: bool) -> Self {
        self.prune_on_delete = enabled;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Will return `ConfigError::Invalid` if:
    /// - `page_size` or `first_page_size` is zero;
    /// - `watch_timeout_secs` is zero or not below [`MAX_WATCH_TIMEOUT_SECS`];
    /// - `initial_backoff` is zero or greater than `max_backoff`;
    /// - `backoff_factor` is below 1.
    pub fn finish(self) -> Result<Config, ConfigError> {
        if self.page_size == Some(0) || self.first_page_size == Some(0) {
            return Err(ConfigError::Invalid("page sizes must be non-zero".into()));
        }
        if self.watch_timeout_secs == 0 || self.watch_timeout_secs >= MAX_WATCH_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "watchTimeoutSecs must be between 1 and {}",
                MAX_WATCH_TIMEOUT_SECS - 1
            )));
        }
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::Invalid("initialBackoff must be positive".into()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::Invalid(
                "initialBackoff must not exceed maxBackoff".into(),
            ));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(ConfigError::Invalid("backoffFactor must be at least 1".into()));
        }
        Ok(Config(self))
    }

    fn list(&self) -> ListConfig {
        ListConfig {
            page_size: self.page_size,
            first_page_size: self.first_page_size,
            max_restarts: self.max_list_restarts,
        }
    }

    fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial: self.initial_backoff,
            max: self.max_backoff,
            factor: self.backoff_factor,
            jitter: self.jitter,
            reset_after: self.backoff_reset_after,
        }
    }
}

/// Validated configuration
#[derive(Clone, Debug, PartialEq)]
pub struct Config(ConfigBuilder);

impl Default for Config {
    fn default() -> Self {
        Config(ConfigBuilder::default())
    }
}

impl Config {
    /// Start from the defaults
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Parse and validate a YAML document; omitted fields keep their defaults
    ///
    /// # Errors
    /// Fails on malformed YAML or on any [`ConfigBuilder::finish`] violation.
    pub fn from_yaml(doc: &str) -> Result<Self, ConfigError> {
        let builder: ConfigBuilder = serde_yaml::from_str(doc).map_err(ConfigError::Parse)?;
        builder.finish()
    }

    /// Read, parse and validate a YAML file
    ///
    /// # Errors
    /// Fails if the file cannot be read, or as [`Config::from_yaml`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&doc)
    }

    /// Page sizes for listings
    #[must_use]
    pub fn list(&self) -> ListConfig {
        self.0.list()
    }

    /// Reconnect delay policy
    #[must_use]
    pub fn backoff(&self) -> BackoffConfig {
        self.0.backoff_config()
    }

    /// Parameters sent with every watch request
    #[must_use]
    pub fn watch_params(&self) -> WatchParams {
        WatchParams::default().timeout(self.0.watch_timeout_secs)
    }

    /// Whether deletes remove index entries
    #[must_use]
    pub fn prune_on_delete(&self) -> bool {
        self.0.prune_on_delete
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
