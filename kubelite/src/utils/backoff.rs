use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use educe::Educe;
use tokio::time::Instant;

use crate::config::BackoffConfig;

/// Reconnect delays for one watch loop
///
/// Delays grow exponentially from `initial` up to `max`, jitter included. The
/// sequence starts over when [`WatchBackoff::reset`] is called, or on its own
/// once `reset_after` has passed since the previous delay was handed out.
#[derive(Educe)]
#[educe(Debug)]
pub struct WatchBackoff {
    builder: ExponentialBuilder,
    #[educe(Debug(ignore))]
    current: Option<ExponentialBackoff>,
    max: Duration,
    reset_after: Duration,
    last_backoff: Option<Instant>,
}

impl WatchBackoff {
    /// Delays following `config`
    #[must_use]
    pub fn new(config: &BackoffConfig) -> Self {
        let builder = ExponentialBuilder::default()
            .with_min_delay(config.initial)
            .with_max_delay(config.max)
            .with_factor(config.factor)
            .with_max_times(usize::MAX);
        let builder = if config.jitter { builder.with_jitter() } else { builder };
        Self {
            builder,
            current: None,
            max: config.max,
            reset_after: config.reset_after,
            last_backoff: None,
        }
    }

    /// The delay to wait before the next reconnect attempt
    pub fn next_delay(&mut self) -> Duration {
        let now = Instant::now();
        if let Some(last_backoff) = self.last_backoff {
            if now.saturating_duration_since(last_backoff) > self.reset_after {
                tracing::debug!(
                    reset_after = ?self.reset_after,
                    "resetting backoff, quiet period has expired"
                );
                self.current = None;
            }
        }
        self.last_backoff = Some(now);
        let builder = self.builder;
        self.current
            .get_or_insert_with(|| builder.build())
            .next()
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Start the delay sequence over from `initial`
    pub fn reset(&mut self) {
        self.current = None;
    }
}
