//! Run progress as a raise-only percentage.
//!
//! A [`ProgressTracker`] owns one percentage in `[0, 100]` per run. Pipeline
//! stages either raise a floor ("we are at least at 50% now that the request
//! is done") or advance by a step. Every change is pushed to the attached
//! [`ProgressObserver`]s, which are independent of any renderer. The binary
//! uses [`LogObserver`].
//!
//! Reporting never fails a run. An observer error is logged and dropped.

use thiserror::Error;

/// Default increment for [`ProgressTracker::advance`] between checkpoints.
pub const STEP: f32 = 5.0;

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("progress observer failed: {0}")]
    Failed(String),
}

/// One progress update as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Whole percent, `0..=100`.
    pub percent: u8,
    pub message: String,
    pub details: Vec<String>,
    /// The event must be rendered even if the observer throttles updates.
    pub force: bool,
}

/// Receives progress updates.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent) -> Result<(), ProgressError>;
}

/// Writes progress to the `tracing` log. Forced events go out at `info`.
#[derive(Debug, Default)]
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn on_progress(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        let details = event.details.join(" ");
        if event.force {
            tracing::info!(percent = event.percent, details = %details, "{}", event.message);
        } else {
            tracing::debug!(percent = event.percent, details = %details, "{}", event.message);
        }
        Ok(())
    }
}

/// Per-file percentage inside a stage: spreads `total` items over the 9
/// points following `start`.
pub fn step_percentage(total: usize, index: usize, start: f32) -> f32 {
    if total == 0 {
        return start;
    }
    start + (9.0 / total as f32) * (index + 1) as f32
}

/// Monotonic progress state for one run.
#[derive(Default)]
pub struct ProgressTracker {
    percent: f32,
    observers: Vec<Box<dyn ProgressObserver>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("percent", &self.percent)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn add_observer(&mut self, observer: impl ProgressObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn percent(&self) -> f32 {
        self.percent
    }

    /// Start a new run at 0%. The only way the percentage goes down.
    pub fn reset(&mut self) {
        self.percent = 0.0;
    }

    /// Raise the percentage to at least `percent`. Never lowers it.
    pub fn raise_floor(&mut self, percent: f32) {
        if self.percent < percent {
            self.percent = percent.min(100.0);
        }
    }

    /// Add `delta` to the percentage and emit the new state.
    pub fn advance(&mut self, delta: f32, message: &str, details: &[String]) {
        self.percent = (self.percent + delta.max(0.0)).min(100.0);
        self.report(self.percent, message, details, false);
    }

    /// Emit the current state without changing it.
    pub fn emit(&self, message: &str, details: &[String]) {
        self.report(self.percent, message, details, false);
    }

    /// Emit an event at an explicit percentage (e.g. a per-file step).
    ///
    /// The stored percentage is not touched. Observer failures are logged
    /// and swallowed.
    pub fn report(&self, percent: f32, message: &str, details: &[String], force: bool) {
        let event = ProgressEvent {
            percent: percent.clamp(0.0, 100.0).floor() as u8,
            message: message.to_string(),
            details: details.iter().filter(|d| !d.is_empty()).cloned().collect(),
            force,
        };
        for observer in &self.observers {
            if let Err(err) = observer.on_progress(&event) {
                tracing::warn!("progress reporting failed: {err}");
            }
        }
    }
}
