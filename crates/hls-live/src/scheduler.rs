// Scheduling Loop: periodic inspection of the viewer that decides whether to
// fetch more data or step the playhead.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::collaborators::{ReadyState, TimeRange};

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// What the viewer looks like at tick time.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerSnapshot {
    pub position: f64,
    pub buffered: Vec<TimeRange>,
    pub ready_state: ReadyState,
}

/// Outcome of one inspection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TickPlan {
    /// Move the playhead here before anything else.
    pub seek: Option<f64>,
    /// Ask the pipeline for more data.
    pub preload: bool,
}

#[derive(Debug)]
pub struct Scheduler {
    token: CancellationToken,
    running: bool,
    tick_interval: Duration,
    last_refresh: Option<Instant>,
}

impl Scheduler {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            running: false,
            tick_interval,
            last_refresh: None,
        }
    }

    /// Start (or restart) ticking. Has no effect once cancelled.
    pub fn start(&mut self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.running = true;
        self.last_refresh = None;
        debug!(interval_ms = self.tick_interval.as_millis() as u64, "Scheduling loop started");
        true
    }

    /// Pause ticking. Events are still processed.
    pub fn stop(&mut self) {
        if self.running {
            debug!("Scheduling loop stopped");
        }
        self.running = false;
    }

    /// Stop for good. Whoever holds the token observes the cancellation.
    pub fn cancel(&mut self) {
        self.stop();
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running && !self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Decide from a snapshot what this tick should do.
    pub fn plan(&self, snapshot: &ViewerSnapshot, preload_time: f64, limit_cache: bool) -> TickPlan {
        let mut plan = TickPlan::default();

        let Some(tail) = snapshot.buffered.last() else {
            plan.preload = true;
            return plan;
        };

        let mut position = snapshot.position;
        let in_range = snapshot.buffered.iter().any(|r| r.contains(position));

        if !in_range && position < tail.start {
            // Behind the buffered data: jump the gap if stuck, and keep fetching.
            if snapshot.ready_state.is_starving() {
                trace!(from = position, to = tail.start, "Jumping buffer gap");
                plan.seek = Some(tail.start);
                position = tail.start;
            }
            plan.preload = true;
        } else if snapshot.ready_state.is_starving() {
            plan.preload = true;
        }

        if limit_cache && position < tail.end - 2.0 * preload_time {
            let target = tail.end - preload_time;
            trace!(from = position, to = target, "Catching up to live edge");
            plan.seek = Some(target);
            position = target;
        }

        if position > tail.end - preload_time {
            plan.preload = true;
        }

        plan
    }

    /// Whether the playlist should be polled again.
    pub fn refresh_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_refresh
            .is_none_or(|last| now.saturating_duration_since(last) > interval)
    }

    pub fn record_refresh(&mut self, now: Instant) {
        self.last_refresh = Some(now);
    }
}
