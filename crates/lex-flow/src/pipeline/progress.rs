//! Progress reporting for pipeline runs.
//!
//! Updates are emitted in execution order: one `started`, one event per stage
//! (`stage_started` + `stage_completed`, or `stage_skipped`), and a final
//! `completed` or `failed`.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut pipeline = Pipeline::new();
//! pipeline.on_progress(|update| {
//!     println!("[{:.0}%] {}", update.progress * 100.0, update.message);
//! });
//! ```

use serde::{Deserialize, Serialize};

/// What happened when a [`ProgressUpdate`] was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    /// The graph was expanded and ordered; stages are about to run.
    Started,
    StageStarted,
    StageCompleted,
    /// No output of the stage was needed.
    StageSkipped,
    Completed,
    Failed,
}

/// One progress event of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub event: RunEvent,

    /// Index of the stage in the expanded graph, for stage events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<usize>,

    /// Label of the stage (meta-stage path included), for stage events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    /// Stages finished or skipped so far.
    pub position: usize,

    /// Stages in the expanded graph.
    pub total: usize,

    /// Overall progress (0.0 - 1.0)
    pub progress: f32,

    /// Human-readable message describing current activity
    pub message: String,
}

static_assertions::assert_impl_all!(ProgressUpdate: Send, Sync);

impl ProgressUpdate {
    fn at(event: RunEvent, position: usize, total: usize, message: String) -> Self {
        let progress = if total > 0 {
            position as f32 / total as f32
        } else {
            1.0
        };
        Self {
            event,
            node: None,
            stage: None,
            position,
            total,
            progress: progress.clamp(0.0, 1.0),
            message,
        }
    }

    pub fn started(total: usize) -> Self {
        Self::at(
            RunEvent::Started,
            0,
            total,
            format!("Running {total} stages"),
        )
    }

    /// A stage event. `position` counts the stages already done.
    pub fn stage(
        event: RunEvent,
        node: usize,
        stage: impl Into<String>,
        position: usize,
        total: usize,
    ) -> Self {
        let stage = stage.into();
        let verb = match event {
            RunEvent::StageStarted => "Running",
            RunEvent::StageSkipped => "Skipped",
            _ => "Finished",
        };
        let mut update = Self::at(event, position, total, format!("{verb} {stage}"));
        update.node = Some(node);
        update.stage = Some(stage);
        update
    }

    pub fn completed(total: usize) -> Self {
        Self::at(
            RunEvent::Completed,
            total,
            total,
            "Pipeline completed".to_string(),
        )
    }

    pub fn failed(position: usize, total: usize, message: impl Into<String>) -> Self {
        Self::at(RunEvent::Failed, position, total, message.into())
    }
}

/// Trait for receiving progress updates during a run.
///
/// Implementations must be `Send + Sync` so a pipeline can run on a worker
/// thread while updates are forwarded elsewhere.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

/// Wrapper that implements [`ProgressReporter`] using a closure.
pub struct ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    callback: F,
}

impl<F> ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressReporter for ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: ProgressUpdate) {
        (self.callback)(update);
    }
}
