//! Scenario descriptor: the fully-resolved, immutable structure a worker
//! consumes. Tasks are plain async closures over the injected `LoadClient`,
//! selected by weighted random choice via a precomputed cumulative-weight
//! array (inverse-CDF sampling).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rand::Rng;

use crate::client::LoadClient;
use crate::errors::CoreError;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TaskCallable = Arc<dyn Fn(LoadClient) -> TaskFuture + Send + Sync>;

/// One weighted scenario task. Weight-zero tasks are excluded at
/// `ScenarioDescriptor::new` time.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub weight: u32,
    pub run: TaskCallable,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        weight: u32,
        run: impl Fn(LoadClient) -> TaskFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            weight,
            run: Arc::new(run),
        }
    }
}

/// Think-time range: a virtual user sleeps `uniform(min, max)` between task
/// invocations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThinkTime {
    pub min: std::time::Duration,
    pub max: std::time::Duration,
}

impl ThinkTime {
    pub fn fixed(duration: std::time::Duration) -> Self {
        Self {
            min: duration,
            max: duration,
        }
    }

    pub fn sample(&self, rng: &mut impl Rng) -> std::time::Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min_s = self.min.as_secs_f64();
        let max_s = self.max.as_secs_f64();
        std::time::Duration::from_secs_f64(rng.gen_range(min_s..=max_s))
    }
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self {
            min: std::time::Duration::ZERO,
            max: std::time::Duration::ZERO,
        }
    }
}

/// The fully-resolved scenario a worker runs. Built once, shared
/// (read-only) across every virtual user in a worker process.
#[derive(Clone)]
pub struct ScenarioDescriptor {
    pub name: String,
    pub base_url: String,
    pub default_headers: Vec<(String, String)>,
    tasks: Vec<Task>,
    cumulative_weights: Vec<u64>,
    total_weight: u64,
    pub setup: Option<TaskCallable>,
    pub teardown: Option<TaskCallable>,
    pub think_time: ThinkTime,
}

impl ScenarioDescriptor {
    /// Builds a descriptor from an ordered task list, excluding weight-zero
    /// tasks and precomputing the cumulative-weight array used for
    /// inverse-CDF sampling.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        tasks: Vec<Task>,
    ) -> Result<Self, CoreError> {
        let tasks: Vec<Task> = tasks.into_iter().filter(|t| t.weight > 0).collect();
        if tasks.is_empty() {
            return Err(CoreError::configuration(
                "scenario must have at least one task with weight > 0",
            ));
        }

        let mut cumulative_weights = Vec::with_capacity(tasks.len());
        let mut running = 0u64;
        for task in &tasks {
            running += task.weight as u64;
            cumulative_weights.push(running);
        }

        Ok(Self {
            name: name.into(),
            base_url: base_url.into(),
            default_headers: Vec::new(),
            tasks,
            total_weight: running,
            cumulative_weights,
            setup: None,
            teardown: None,
            think_time: ThinkTime::default(),
        })
    }

    pub fn with_default_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.default_headers = headers;
        self
    }

    pub fn with_setup(mut self, setup: TaskCallable) -> Self {
        self.setup = Some(setup);
        self
    }

    pub fn with_teardown(mut self, teardown: TaskCallable) -> Self {
        self.teardown = Some(teardown);
        self
    }

    pub fn with_think_time(mut self, think_time: ThinkTime) -> Self {
        self.think_time = think_time;
        self
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Selects a task by weighted random choice: draw `r` uniform in
    /// `[0, total_weight)`, then return the first task whose cumulative
    /// weight exceeds `r` (inverse-CDF sampling).
    pub fn select_task(&self, rng: &mut impl Rng) -> &Task {
        let r = rng.gen_range(0..self.total_weight);
        let idx = self
            .cumulative_weights
            .partition_point(|&cumulative| cumulative <= r);
        &self.tasks[idx.min(self.tasks.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn noop_task(name: &str, weight: u32) -> Task {
        Task::new(name, weight, |_client| Box::pin(async {}))
    }

    #[test]
    fn rejects_empty_task_list() {
        let result = ScenarioDescriptor::new("empty", "http://localhost", vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn excludes_weight_zero_tasks() {
        let scenario = ScenarioDescriptor::new(
            "s",
            "http://localhost",
            vec![noop_task("a", 0), noop_task("b", 5)],
        )
        .unwrap();
        assert_eq!(scenario.tasks().len(), 1);
        assert_eq!(scenario.tasks()[0].name, "b");
    }

    #[test]
    fn rejects_all_zero_weight_tasks() {
        let result = ScenarioDescriptor::new(
            "s",
            "http://localhost",
            vec![noop_task("a", 0), noop_task("b", 0)],
        );
        assert!(result.is_err());
    }

    #[test]
    fn weighted_selection_respects_proportions() {
        // Weights 1:3 over a fixed RNG sequence sweeping the full range
        // should select the heavier task roughly 3x as often.
        let scenario = ScenarioDescriptor::new(
            "s",
            "http://localhost",
            vec![noop_task("light", 1), noop_task("heavy", 3)],
        )
        .unwrap();

        let mut counts = std::collections::HashMap::new();
        for i in 0..400u64 {
            let mut rng = StepRng::new(i, 1);
            let task = scenario.select_task(&mut rng);
            *counts.entry(task.name.clone()).or_insert(0) += 1;
        }

        let light = *counts.get("light").unwrap_or(&0);
        let heavy = *counts.get("heavy").unwrap_or(&0);
        assert!(heavy > light, "heavy={heavy} light={light}");
    }

    #[test]
    fn think_time_sample_within_bounds() {
        let think_time = ThinkTime {
            min: std::time::Duration::from_millis(10),
            max: std::time::Duration::from_millis(50),
        };
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let sample = think_time.sample(&mut rng);
            assert!(sample >= think_time.min && sample <= think_time.max);
        }
    }

    #[test]
    fn fixed_think_time_always_returns_same_value() {
        let think_time = ThinkTime::fixed(std::time::Duration::from_millis(100));
        let mut rng = rand::thread_rng();
        assert_eq!(think_time.sample(&mut rng), std::time::Duration::from_millis(100));
    }
}
