//! Tracked background tasks that outlive the call that spawned them.
//!
//! A render keeps writing into its stream after `renderApp` has handed the
//! body back, so it runs as a background task with an observable lifecycle
//! and the host joins all of them at shutdown.

use std::fmt;
use std::future::Future;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Lifecycle of a background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Spawned,
    Running,
    Completed,
    Failed(String),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawned => f.write_str("spawned"),
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Observer for one background task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: String,
    state: watch::Receiver<TaskState>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state without waiting.
    pub fn state(&self) -> TaskState {
        self.state.borrow().clone()
    }

    /// Wait until the task settles and return its final state.
    pub async fn join(&mut self) -> TaskState {
        match self.state.wait_for(TaskState::is_terminal).await {
            Ok(state) => state.clone(),
            // Sender dropped without settling: the task was aborted.
            Err(_) => TaskState::Failed(String::from("task aborted")),
        }
    }
}

/// Set of background tasks with a single join point.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` on the current tokio runtime and track it.
    ///
    /// Failures are logged and recorded in the handle, never propagated.
    pub fn spawn<F, E>(&self, name: impl Into<String>, task: F) -> TaskHandle
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = watch::channel(TaskState::Spawned);
        let task_name = name.clone();
        self.tracker.spawn(async move {
            tx.send_replace(TaskState::Running);
            debug!(task = %task_name, "background task running");
            let outcome = match task.await {
                Ok(()) => TaskState::Completed,
                Err(err) => {
                    warn!(task = %task_name, error = %err, "background task failed");
                    TaskState::Failed(err.to_string())
                }
            };
            debug!(task = %task_name, state = %outcome, "background task settled");
            tx.send_replace(outcome);
        });
        TaskHandle { name, state: rx }
    }

    /// Number of tasks still in flight.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Stop accepting new tasks and wait for every tracked task to settle.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_completes() {
        let tasks = BackgroundTasks::new();
        let mut handle = tasks.spawn("render", async { Ok::<_, String>(()) });
        assert_eq!(handle.name(), "render");
        assert_eq!(handle.join().await, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_task_failure_is_recorded() {
        let tasks = BackgroundTasks::new();
        let mut handle = tasks.spawn("render", async { Err::<(), _>("boom") });
        assert_eq!(handle.join().await, TaskState::Failed("boom".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_tasks() {
        let tasks = BackgroundTasks::new();
        let finished = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let finished = finished.clone();
            tasks.spawn("slow", async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            });
        }

        tasks.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Spawned.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed(String::new()).is_terminal());
        assert_eq!(TaskState::Failed("x".into()).to_string(), "failed: x");
    }
}
