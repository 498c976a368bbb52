//! Scheduler: ticks a `Pattern` at a fixed cadence and hands the
//! coordinator `(elapsed_seconds, target_concurrency)` pairs.
//!
//! Sleeps against absolute monotonic deadlines (`Instant + n*interval`)
//! rather than accumulating `sleep(interval)` calls, so drift from slow
//! ticks never compounds.

use tokio::time::{self, Duration, Instant};
use tracing::warn;

use crate::pattern::Pattern;

/// Default tick cadence.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// One scheduler tick: elapsed time since the run started, and the target
/// concurrency the pattern prescribes for that instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub elapsed: Duration,
    pub target_concurrency: u32,
}

pub struct Scheduler {
    pattern: Pattern,
    tick_interval: Duration,
    duration: Duration,
}

impl Scheduler {
    pub fn new(pattern: Pattern, duration: Duration, tick_interval: Duration) -> Self {
        Self {
            pattern,
            tick_interval,
            duration,
        }
    }

    pub fn with_default_interval(pattern: Pattern, duration: Duration) -> Self {
        Self::new(pattern, duration, DEFAULT_TICK_INTERVAL)
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Drives `on_tick` once per tick until `duration` elapses, including a
    /// final tick at exactly `duration`. Emits a warning (never a catch-up
    /// burst) when a tick lands more than 2x the interval late.
    pub async fn run<F>(&self, mut on_tick: F)
    where
        F: FnMut(Tick),
    {
        let start = Instant::now();
        let interval = self.tick_interval;
        let total = self.duration;
        let mut elapsed = Duration::ZERO;
        let mut tick_index: u64 = 0;

        loop {
            let deadline = start + (interval * tick_index as u32).min(total);
            let now = Instant::now();
            if deadline > now {
                time::sleep_until(deadline).await;
            } else if now.duration_since(deadline) > interval * 2 {
                warn!(
                    tick_index,
                    late_by_ms = now.duration_since(deadline).as_millis() as u64,
                    "scheduler tick missed by more than 2x the tick interval"
                );
            }

            elapsed = Instant::now().duration_since(start).min(total);
            let target = self.pattern.target_at(elapsed.as_secs_f64());
            on_tick(Tick {
                elapsed,
                target_concurrency: target,
            });

            if elapsed >= total {
                break;
            }
            tick_index += 1;
        }

        debug_assert!(elapsed >= total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn emits_a_tick_every_interval_plus_a_final_one_at_duration() {
        let pattern = Pattern::Constant(5);
        let scheduler = Scheduler::new(pattern, Duration::from_secs(3), Duration::from_secs(1));

        let ticks = Arc::new(Mutex::new(Vec::new()));
        let ticks_clone = ticks.clone();
        scheduler
            .run(move |tick| ticks_clone.lock().unwrap().push(tick))
            .await;

        let recorded = ticks.lock().unwrap();
        assert_eq!(recorded.len(), 4);
        assert_eq!(recorded[0].elapsed, Duration::ZERO);
        assert_eq!(recorded.last().unwrap().elapsed, Duration::from_secs(3));
        for tick in recorded.iter() {
            assert_eq!(tick.target_concurrency, 5);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_targets_track_elapsed_time() {
        let pattern = Pattern::Ramp {
            start: 0,
            end: 100,
            ramp_duration: 4.0,
        };
        let scheduler = Scheduler::new(pattern, Duration::from_secs(4), Duration::from_secs(1));

        let ticks = Arc::new(Mutex::new(Vec::new()));
        let ticks_clone = ticks.clone();
        scheduler
            .run(move |tick| ticks_clone.lock().unwrap().push(tick))
            .await;

        let recorded = ticks.lock().unwrap();
        let targets: Vec<u32> = recorded.iter().map(|t| t.target_concurrency).collect();
        assert_eq!(targets, vec![0, 25, 50, 75, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_run_emits_single_tick() {
        let pattern = Pattern::Constant(1);
        let scheduler = Scheduler::new(pattern, Duration::ZERO, Duration::from_secs(1));

        let ticks = Arc::new(Mutex::new(Vec::new()));
        let ticks_clone = ticks.clone();
        scheduler
            .run(move |tick| ticks_clone.lock().unwrap().push(tick))
            .await;

        assert_eq!(ticks.lock().unwrap().len(), 1);
    }
}
