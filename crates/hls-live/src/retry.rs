// Retry Policy: per-loader retry budgets with a fixed retry delay, optionally
// backed off exponentially up to a cap.
//
// A failure spends one unit of the failing loader's budget; the request is
// rescheduled until the budget reaches zero. Any success restores the budget.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::LiveConfig;
use crate::error::LoadError;
use crate::events::LoaderKind;

/// Consecutive-failure allowance for one loader (or for manifest content).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max: u32,
    remaining: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            remaining: max,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Failures recorded since the last reset.
    pub fn spent(&self) -> u32 {
        self.max - self.remaining
    }

    /// Record a failure. Returns `false` once the budget is exhausted.
    pub fn consume(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining > 0
    }

    /// Spend one unit if any is left. Returns `false`, spending nothing, once
    /// the budget is already empty; a budget of N tolerates N failures.
    pub fn try_spend(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    pub fn exhaust(&mut self) {
        self.remaining = 0;
    }

    pub fn reset(&mut self) {
        self.remaining = self.max;
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// What to do after a loader failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reissue the same request after `delay`.
    Retry {
        attempt: u32,
        remaining: u32,
        delay: Duration,
    },
    /// The budget ran out.
    Exhausted { attempts: u32 },
    /// The failure can never succeed on retry.
    Terminal,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    budgets: HashMap<LoaderKind, RetryBudget>,
    /// Delay between retries. With `backoff` it doubles per attempt.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// Grow the delay as base * 2^(attempt-1) instead of keeping it constant.
    pub backoff: bool,
    /// When true, adds random jitter of [0, base_delay/2).
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(budget: u32, base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        let budgets = LoaderKind::ALL
            .into_iter()
            .map(|kind| (kind, RetryBudget::new(budget)))
            .collect();
        Self {
            budgets,
            base_delay,
            max_delay,
            backoff: false,
            jitter,
        }
    }

    pub fn with_backoff(mut self, backoff: bool) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn from_config(config: &LiveConfig) -> Self {
        Self::new(
            config.loader_budget(),
            config.loader_retry_delay(),
            config.max_retry_delay,
            config.retry_jitter,
        )
        .with_backoff(config.retry_backoff)
    }

    /// Compute the delay for a given retry index (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = if self.backoff {
            // 2^attempt with a checked shift so large attempts saturate.
            let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
            self.base_delay
                .checked_mul(multiplier)
                .unwrap_or(self.max_delay)
                .min(self.max_delay)
        } else {
            self.base_delay.min(self.max_delay)
        };

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    fn budget_mut(&mut self, loader: LoaderKind) -> &mut RetryBudget {
        self.budgets
            .entry(loader)
            .or_insert_with(|| RetryBudget::new(0))
    }

    pub fn budget(&self, loader: LoaderKind) -> Option<&RetryBudget> {
        self.budgets.get(&loader)
    }

    /// Classify a failure and spend budget for it.
    pub fn on_failure(&mut self, loader: LoaderKind, error: &LoadError) -> RetryDecision {
        let budget = self.budget_mut(loader);
        if !error.is_retryable() {
            budget.exhaust();
            return RetryDecision::Terminal;
        }
        if !budget.consume() {
            let attempts = budget.max().max(1);
            return RetryDecision::Exhausted { attempts };
        }

        let attempt = budget.spent();
        let remaining = budget.remaining();
        let delay = self.delay_for_attempt(attempt - 1);
        warn!(
            %loader,
            attempt,
            remaining,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Rescheduling fetch after transient error"
        );
        RetryDecision::Retry {
            attempt,
            remaining,
            delay,
        }
    }

    /// Restore the loader's budget after a successful fetch.
    pub fn on_success(&mut self, loader: LoaderKind) {
        self.budget_mut(loader).reset();
    }
}
