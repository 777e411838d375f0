use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

pub const DEFAULT_RATE_HORIZON: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateSample {
    pub count: f64,
    pub at: Instant,
}

/// Windowed throughput counter, e.g. samples per second for one worker.
///
/// Purely local bookkeeping: not shared across workers and not synchronized.
#[derive(Clone, Debug)]
pub struct RateTracker {
    horizon: Duration,
    start: Instant,
    window: VecDeque<RateSample>,
    window_count: f64,
    total: f64,
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RateTracker {
    pub fn new() -> Self {
        Self::with_horizon(DEFAULT_RATE_HORIZON)
    }

    pub fn with_horizon(horizon: Duration) -> Self {
        Self::starting_at(horizon, Instant::now())
    }

    pub fn starting_at(horizon: Duration, start: Instant) -> Self {
        Self {
            horizon,
            start,
            window: VecDeque::new(),
            window_count: 0.0,
            total: 0.0,
        }
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn add(&mut self, count: impl Into<f64>) {
        self.add_at(count, Instant::now());
    }

    pub fn add_at(&mut self, count: impl Into<f64>, at: Instant) {
        let count = count.into();
        self.total += count;
        self.window_count += count;
        self.window.push_back(RateSample { count, at });
        self.purge(at);
    }

    /// Throughput over the trailing window.
    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&mut self, now: Instant) -> f64 {
        self.purge(now);
        let span = now.saturating_duration_since(self.start).min(self.horizon);
        per_second(self.window_count, span)
    }

    /// Throughput since the tracker was created.
    pub fn global_rate(&self) -> f64 {
        self.global_rate_at(Instant::now())
    }

    pub fn global_rate_at(&self, now: Instant) -> f64 {
        per_second(self.total, now.saturating_duration_since(self.start))
    }

    fn purge(&mut self, now: Instant) {
        while let Some(oldest) = self.window.front() {
            if now.saturating_duration_since(oldest.at) < self.horizon {
                break;
            }
            self.window_count -= oldest.count;
            self.window.pop_front();
        }
        if self.window.is_empty() {
            self.window_count = 0.0;
        }
    }
}

fn per_second(count: f64, span: Duration) -> f64 {
    let seconds = span.as_secs_f64();
    if seconds > 0.0 {
        count / seconds
    } else {
        0.0
    }
}
