//! Work units submitted to the pool.

use std::path::PathBuf;
use std::time::Duration;

use ember_vm::ExecStatus;

/// Callback invoked when a task finishes, on the worker thread.
pub type TaskCallback = Box<dyn FnOnce(ExecutionResult) + Send + 'static>;

/// What to execute.
#[derive(Debug, Clone)]
pub enum TaskPayload {
    /// Execute a script file; the pool reads it (and consults the
    /// bytecode cache).
    ScriptPath(PathBuf),
    /// Execute source text directly (no caching).
    Source {
        /// Label used in traces.
        name: String,
        /// The source text.
        source: String,
    },
}

/// One unit of work for the worker pool.
pub struct ExecutionTask {
    /// Unique id: monotonic per pool.
    pub id: u64,
    /// What to run.
    pub payload: TaskPayload,
    /// Completion callback.
    pub callback: Option<TaskCallback>,
}

impl std::fmt::Debug for ExecutionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTask")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Outcome of one task.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// The task's id.
    pub task_id: u64,
    /// Final status.
    pub status: ExecStatus,
    /// Rendered error when the status is a failure.
    pub error: Option<String>,
    /// Wall-clock execution time (including compilation).
    pub elapsed: Duration,
}

impl ExecutionResult {
    /// Whether the task succeeded.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
