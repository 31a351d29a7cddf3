//! Stress run configuration.

use core::time::Duration;

use foundation_synckit::WorkerConfig;

/// Shape of a stress run: how many workers, how many rounds each, and an
/// optional wall-clock limit after which workers are cancelled.
#[derive(Debug, Clone)]
pub struct StressConfig {
    thread_count: usize,
    iterations: usize,
    duration: Option<Duration>,
    workers: WorkerConfig,
}

impl StressConfig {
    /// Defaults: 4 workers, 1000 iterations each, no time limit, workers
    /// named `stress-<index>`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            thread_count: 4,
            iterations: 1000,
            duration: None,
            workers: WorkerConfig {
                name_prefix: String::from("stress"),
                stack_size: None,
            },
        }
    }

    #[must_use]
    pub fn threads(mut self, count: usize) -> Self {
        self.thread_count = count;
        self
    }

    #[must_use]
    pub fn iterations(mut self, count: usize) -> Self {
        self.iterations = count;
        self
    }

    /// Cancels every worker once `duration` has elapsed.
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    #[must_use]
    pub fn duration_secs(self, secs: u64) -> Self {
        self.duration(Duration::from_secs(secs))
    }

    /// Thread attributes used for every worker of the run.
    #[must_use]
    pub fn workers(mut self, workers: WorkerConfig) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn get_thread_count(&self) -> usize {
        self.thread_count
    }

    #[must_use]
    pub fn get_iterations(&self) -> usize {
        self.iterations
    }

    #[must_use]
    pub fn get_duration(&self) -> Option<Duration> {
        self.duration
    }

    #[must_use]
    pub fn get_workers(&self) -> &WorkerConfig {
        &self.workers
    }
}

impl Default for StressConfig {
    fn default() -> Self {
        Self::new()
    }
}
