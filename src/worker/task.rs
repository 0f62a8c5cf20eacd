//! Worker task messages and the analysis collaborator they run.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// CPU-bound analysis run on a worker thread.
///
/// A panic inside `analyze` counts as a worker crash: the dispatching
/// caller gets [`crate::error::InfraError::WorkerCrash`] and the worker is
/// replaced.
pub trait Analyzer: Send + Sync + 'static {
    /// Analysis result.
    type Output: Send + 'static;

    /// Analyzes one payload.
    fn analyze(&self, content: &[u8], options: &TaskOptions) -> Self::Output;
}

/// An [`Analyzer`] backed by a plain function or closure.
pub struct FnAnalyzer<F> {
    f: F,
}

impl<F> fmt::Debug for FnAnalyzer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAnalyzer").finish_non_exhaustive()
    }
}

/// Wraps `f` as an [`Analyzer`].
pub fn analyzer_fn<F, O>(f: F) -> FnAnalyzer<F>
where
    F: Fn(&[u8], &TaskOptions) -> O + Send + Sync + 'static,
    O: Send + 'static,
{
    FnAnalyzer { f }
}

impl<F, O> Analyzer for FnAnalyzer<F>
where
    F: Fn(&[u8], &TaskOptions) -> O + Send + Sync + 'static,
    O: Send + 'static,
{
    type Output = O;

    fn analyze(&self, content: &[u8], options: &TaskOptions) -> O {
        (self.f)(content, options)
    }
}

/// Per-task options forwarded to the analyzer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// MIME type of the content, when known.
    pub content_type: Option<String>,
    /// Free-form hints.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Dispatch message: `{content, options, taskId}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTask {
    /// Correlation id.
    pub task_id: Uuid,
    /// Payload to analyze.
    pub content: Vec<u8>,
    /// Analyzer options.
    pub options: TaskOptions,
}

impl WorkerTask {
    /// Creates a task with a fresh correlation id.
    #[must_use]
    pub fn new(content: Vec<u8>, options: TaskOptions) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            content,
            options,
        }
    }
}

/// Worker reply: `{taskId, result}`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse<O> {
    /// Correlation id of the task this answers.
    pub task_id: Uuid,
    /// Analyzer output.
    pub output: O,
}
