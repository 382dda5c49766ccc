use std::time::Duration;

use crate::error::ConfigError;

/// Caller-supplied overrides for loader retries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryConfig {
    /// Per-loader retry budget. Falls back to [`LiveConfig::retry_times`].
    pub count: Option<u32>,
    /// Delay before every rescheduled attempt.
    pub delay: Option<Duration>,
}

/// Configuration for the live controller.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    /// Seconds of playback runway to keep buffered ahead of the playhead.
    /// When `None` it is derived from the playlist target duration.
    pub preload_time: Option<Duration>,
    /// Retry budget for loaders and for unparsable manifests.
    pub retry_times: u32,
    /// Cap the buffered-ahead distance by stepping the playhead forward.
    pub limit_cache: bool,
    /// Loader retry overrides.
    pub retry: RetryConfig,
    /// Period of the scheduling loop.
    pub tick_interval: Duration,
    /// Playlist refresh interval used until a target duration is known.
    pub default_refresh_interval: Duration,
    /// Preload time used when neither the config nor the playlist provide one.
    pub default_preload_time: Duration,
    /// Default delay between retries when no override is given.
    pub retry_delay: Duration,
    /// Upper bound for any retry delay.
    pub max_retry_delay: Duration,
    /// Double the retry delay on each consecutive failure.
    pub retry_backoff: bool,
    /// Add random jitter to retry delays.
    pub retry_jitter: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            preload_time: None,
            retry_times: 3,
            limit_cache: false,
            retry: RetryConfig::default(),
            tick_interval: Duration::from_millis(300),
            default_refresh_interval: Duration::from_secs(4),
            default_preload_time: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(10),
            retry_backoff: false,
            retry_jitter: false,
        }
    }
}

impl LiveConfig {
    pub fn with_preload_time(mut self, preload_time: Duration) -> Self {
        self.preload_time = Some(preload_time);
        self
    }

    pub fn with_retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    pub fn with_limit_cache(mut self, limit_cache: bool) -> Self {
        self.limit_cache = limit_cache;
        self
    }

    pub fn with_retry(mut self, count: Option<u32>, delay: Option<Duration>) -> Self {
        self.retry = RetryConfig { count, delay };
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: bool) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Budget applied to each loader.
    pub fn loader_budget(&self) -> u32 {
        self.retry.count.unwrap_or(self.retry_times)
    }

    /// Delay before a rescheduled fetch.
    pub fn loader_retry_delay(&self) -> Duration {
        self.retry.delay.unwrap_or(self.retry_delay)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroTickInterval);
        }
        if self.preload_time.is_some_and(|p| p.is_zero()) || self.default_preload_time.is_zero() {
            return Err(ConfigError::ZeroPreloadTime);
        }
        let delay = self.loader_retry_delay();
        if delay > self.max_retry_delay {
            return Err(ConfigError::RetryDelayAboveMax {
                delay_ms: delay.as_millis(),
                max_ms: self.max_retry_delay.as_millis(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_live_player_conventions() {
        let config = LiveConfig::default();
        assert_eq!(config.retry_times, 3);
        assert_eq!(config.tick_interval, Duration::from_millis(300));
        assert_eq!(config.default_refresh_interval, Duration::from_secs(4));
        assert!(config.preload_time.is_none());
        assert!(!config.limit_cache);
        assert!(!config.retry_backoff);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn retry_overrides_take_precedence() {
        let config = LiveConfig::default()
            .with_retry_times(5)
            .with_retry(Some(2), Some(Duration::from_millis(250)));
        assert_eq!(config.loader_budget(), 2);
        assert_eq!(config.loader_retry_delay(), Duration::from_millis(250));

        let config = LiveConfig::default().with_retry_times(5);
        assert_eq!(config.loader_budget(), 5);
        assert_eq!(config.loader_retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_is_opt_in() {
        let policy = crate::retry::RetryPolicy::from_config(&LiveConfig::default());
        assert!(!policy.backoff);
        let config = LiveConfig::default().with_retry_backoff(true);
        assert!(crate::retry::RetryPolicy::from_config(&config).backoff);
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        let config = LiveConfig::default().with_tick_interval(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroTickInterval));

        let config = LiveConfig::default().with_preload_time(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroPreloadTime));

        let config = LiveConfig::default().with_retry(None, Some(Duration::from_secs(60)));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RetryDelayAboveMax { .. })
        ));
    }
}
