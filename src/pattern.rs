//! Load patterns: a pure function of elapsed time to target concurrency.
//!
//! Modeled as a tagged variant with a single `target_at` function rather than
//! a trait object — a closed set of six shapes needs no dynamic dispatch.

use std::f64::consts::PI;

/// A restartable, pure description of target concurrency over time.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Flat concurrency for the whole run.
    Constant(u32),

    /// Linear interpolation from `start` to `end` over `ramp_duration`
    /// seconds, then holds `end`.
    Ramp {
        start: u32,
        end: u32,
        ramp_duration: f64,
    },

    /// `start + step_size * min(floor(t / step_duration), steps)`. The new
    /// value takes effect at the tick where `t >= k * step_duration`.
    Step {
        start: u32,
        step_size: i32,
        step_duration: f64,
        steps: u32,
    },

    /// `spike_users` for `t < spike_duration`, `base` thereafter. No
    /// interpolation — an instantaneous transition.
    Spike {
        base: u32,
        spike_users: u32,
        spike_duration: f64,
    },

    /// A smooth sinusoidal daily cycle: `min + (max-min)*(1-cos(2*pi*t/period))/2`.
    Diurnal { min: u32, max: u32, period: f64 },

    /// Sequential concatenation of sub-patterns, each evaluated on its own
    /// local clock (`t' = t - offset`). After the last sub-pattern ends, its
    /// final value is held.
    Composite(Vec<(Box<Pattern>, f64)>),
}

impl Pattern {
    /// Target concurrency at elapsed time `t` (seconds). Always `>= 0`.
    pub fn target_at(&self, t: f64) -> u32 {
        match self {
            Pattern::Constant(n) => *n,

            Pattern::Ramp {
                start,
                end,
                ramp_duration,
            } => {
                if *ramp_duration <= 0.0 {
                    return *end;
                }
                let frac = (t / ramp_duration).clamp(0.0, 1.0);
                let value = *start as f64 + (*end as f64 - *start as f64) * frac;
                value.round().max(0.0) as u32
            }

            Pattern::Step {
                start,
                step_size,
                step_duration,
                steps,
            } => {
                if *step_duration <= 0.0 {
                    return (*start as i64 + *step_size as i64 * *steps as i64).max(0) as u32;
                }
                let k = (t / step_duration).floor().max(0.0) as u32;
                let k = k.min(*steps);
                let value = *start as i64 + *step_size as i64 * k as i64;
                value.max(0) as u32
            }

            Pattern::Spike {
                base,
                spike_users,
                spike_duration,
            } => {
                if t < *spike_duration {
                    *spike_users
                } else {
                    *base
                }
            }

            Pattern::Diurnal { min, max, period } => {
                if *period <= 0.0 {
                    return *min;
                }
                let phase = (2.0 * PI * t / period).cos();
                let value = *min as f64 + (*max as f64 - *min as f64) * (1.0 - phase) / 2.0;
                value.round().max(0.0) as u32
            }

            Pattern::Composite(segments) => {
                let mut offset = 0.0;
                for (idx, (sub, duration)) in segments.iter().enumerate() {
                    let is_last = idx + 1 == segments.len();
                    if t < offset + duration || is_last {
                        let local_t = (t - offset).clamp(0.0, *duration);
                        return sub.target_at(local_t);
                    }
                    offset += duration;
                }
                0
            }
        }
    }

    /// Stable, human-readable description (used in logs and `TestResult`
    /// metadata).
    pub fn describe(&self) -> String {
        match self {
            Pattern::Constant(n) => format!("constant({n})"),
            Pattern::Ramp {
                start,
                end,
                ramp_duration,
            } => format!("ramp({start}->{end} over {ramp_duration}s)"),
            Pattern::Step {
                start,
                step_size,
                step_duration,
                steps,
            } => format!("step(start={start}, step={step_size}, every {step_duration}s, {steps} steps)"),
            Pattern::Spike {
                base,
                spike_users,
                spike_duration,
            } => format!("spike(base={base}, spike={spike_users}, for {spike_duration}s)"),
            Pattern::Diurnal { min, max, period } => {
                format!("diurnal(min={min}, max={max}, period={period}s)")
            }
            Pattern::Composite(segments) => {
                let parts: Vec<String> = segments
                    .iter()
                    .map(|(p, d)| format!("{} for {d}s", p.describe()))
                    .collect();
                format!("composite[{}]", parts.join(", "))
            }
        }
    }

    /// Yields `(elapsed_seconds, target_concurrency)` at exactly
    /// `ceil(duration / tick_interval) + 1` points: `0, tick, 2*tick, ...,
    /// duration`. The last point is always exactly `duration`, even when it
    /// doesn't land on a tick boundary.
    pub fn sample_ticks(&self, duration: f64, tick_interval: f64) -> Vec<(f64, u32)> {
        assert!(tick_interval > 0.0, "tick_interval must be positive");
        let ticks = (duration / tick_interval).ceil() as u64 + 1;
        let mut out = Vec::with_capacity(ticks as usize);
        for i in 0..ticks {
            let t = (i as f64 * tick_interval).min(duration);
            out.push((t, self.target_at(t)));
        }
        // The last sample must land exactly on `duration`.
        if let Some(last) = out.last_mut() {
            if (last.0 - duration).abs() > f64::EPSILON {
                *last = (duration, self.target_at(duration));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_holds() {
        let p = Pattern::Constant(10);
        for t in [0.0, 1.0, 5.0, 100.0] {
            assert_eq!(p.target_at(t), 10);
        }
    }

    #[test]
    fn ramp_interpolates_linearly() {
        let p = Pattern::Ramp {
            start: 0,
            end: 100,
            ramp_duration: 10.0,
        };
        let samples = p.sample_ticks(10.0, 1.0);
        let expected: Vec<u32> = (0..=10).map(|i| i * 10).collect();
        let got: Vec<u32> = samples.iter().map(|(_, v)| *v).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn ramp_holds_after_duration() {
        let p = Pattern::Ramp {
            start: 0,
            end: 50,
            ramp_duration: 5.0,
        };
        assert_eq!(p.target_at(5.0), 50);
        assert_eq!(p.target_at(20.0), 50);
    }

    #[test]
    fn step_targets_follow_expected_sequence() {
        // Step(start=10, step_size=5, step_duration=2, steps=3), duration=8s, tick=1s
        // Expected: [10,10,15,15,20,20,25,25,25]
        let p = Pattern::Step {
            start: 10,
            step_size: 5,
            step_duration: 2.0,
            steps: 3,
        };
        let got: Vec<u32> = p
            .sample_ticks(8.0, 1.0)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(got, vec![10, 10, 15, 15, 20, 20, 25, 25, 25]);
    }

    #[test]
    fn spike_targets_follow_expected_sequence() {
        // Spike(base=5, spike_users=50, spike_duration=3), duration=6s, tick=1s
        // Expected: [50,50,50,5,5,5,5]
        let p = Pattern::Spike {
            base: 5,
            spike_users: 50,
            spike_duration: 3.0,
        };
        let got: Vec<u32> = p
            .sample_ticks(6.0, 1.0)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(got, vec![50, 50, 50, 5, 5, 5, 5]);
    }

    #[test]
    fn composite_chains_segments_on_local_clocks() {
        // [(Ramp(0,20,2), 2), (Constant(20), 3), (Ramp(20,0,2), 2)], tick=1s
        // Expected: [0,10,20,20,20,20,10,0]
        let p = Pattern::Composite(vec![
            (
                Box::new(Pattern::Ramp {
                    start: 0,
                    end: 20,
                    ramp_duration: 2.0,
                }),
                2.0,
            ),
            (Box::new(Pattern::Constant(20)), 3.0),
            (
                Box::new(Pattern::Ramp {
                    start: 20,
                    end: 0,
                    ramp_duration: 2.0,
                }),
                2.0,
            ),
        ]);
        let got: Vec<u32> = p
            .sample_ticks(7.0, 1.0)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(got, vec![0, 10, 20, 20, 20, 20, 10, 0]);
    }

    #[test]
    fn diurnal_is_symmetric_around_period() {
        let p = Pattern::Diurnal {
            min: 10,
            max: 110,
            period: 100.0,
        };
        assert_eq!(p.target_at(0.0), 10);
        assert_eq!(p.target_at(50.0), 110);
    }

    #[test]
    fn never_negative() {
        let p = Pattern::Step {
            start: 5,
            step_size: -10,
            step_duration: 1.0,
            steps: 5,
        };
        for t in 0..10 {
            assert!(p.target_at(t as f64) <= i32::MAX as u32);
        }
    }

    #[test]
    fn tick_count_matches_ceil_plus_one() {
        let p = Pattern::Constant(1);
        let samples = p.sample_ticks(5.0, 1.0);
        assert_eq!(samples.len(), 6);
        assert_eq!(samples.first().unwrap().0, 0.0);
        assert_eq!(samples.last().unwrap().0, 5.0);

        // Non-divisible duration: ceil(5.5/2)+1 = 3+1 = 4 ticks
        let samples2 = p.sample_ticks(5.5, 2.0);
        assert_eq!(samples2.len(), 4);
        assert_eq!(samples2.last().unwrap().0, 5.5);
    }

    #[test]
    fn describe_is_stable() {
        let p = Pattern::Constant(7);
        assert_eq!(p.describe(), p.describe());
        assert!(p.describe().contains('7'));
    }

    #[test]
    fn zero_duration_yields_single_tick() {
        let p = Pattern::Constant(10);
        let samples = p.sample_ticks(0.0, 1.0);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0], (0.0, 10));
    }
}
