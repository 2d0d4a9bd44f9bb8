//! Sub-work task broker
//!
//! Workers request transcodes over the Task Request endpoint. The broker
//! assigns an id immediately, then admits the execution through a counting
//! semaphore and runs it on the runtime. The exit code can be polled later by id.
//!
//! Executions carry an optional deadline and are cancelled with the run's root
//! token. Both end the task in [`TaskState::Faulted`] with an HRESULT-style code.

use crate::process::{CommandSpec, ProcessLauncher};
use crate::types::TaskId;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;

/// Exit code reported for a task id that was never issued
pub const NOT_FOUND: i32 = -1;

/// Win32 error code used for executions that exceeded their deadline
pub const ERROR_TIMEOUT: u32 = 1460;
/// Win32 error code used for cancelled executions
pub const ERROR_CANCELLED: u32 = 1223;
/// Win32 error code used when an execution ended without recording a result
pub const ERROR_PROCESS_ABORTED: u32 = 1067;

const ERROR_FILE_NOT_FOUND: u32 = 2;
const ERROR_ACCESS_DENIED: u32 = 5;
const ERROR_GEN_FAILURE: u32 = 31;

/// Build an HRESULT-style fault code (`0x8007xxxx`) from a Win32 error code
///
/// The result is always negative and never equals [`NOT_FOUND`].
pub fn fault_code(win32: u32) -> i32 {
    (0x8007_0000u32 | (win32 & 0xFFFF)) as i32
}

fn fault_from_io(error: &std::io::Error) -> i32 {
    match error.kind() {
        std::io::ErrorKind::NotFound => fault_code(ERROR_FILE_NOT_FOUND),
        std::io::ErrorKind::PermissionDenied => fault_code(ERROR_ACCESS_DENIED),
        _ => fault_code(ERROR_GEN_FAILURE),
    }
}

/// Lifecycle of a brokered execution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Id assigned, waiting for admission
    Requested,
    /// Semaphore permit acquired
    Admitted,
    /// External process running
    Running,
    /// Process exited with the given code
    Completed(i32),
    /// Execution failed before producing an exit code
    Faulted(i32),
}

impl TaskState {
    /// True for `Completed` and `Faulted`
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed(_) | TaskState::Faulted(_))
    }

    /// Exit code (or fault code) of a terminal state
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TaskState::Completed(code) | TaskState::Faulted(code) => Some(*code),
            _ => None,
        }
    }
}

/// Executes one unit of brokered sub-work
#[async_trait]
pub trait SubworkRunner: Send + Sync {
    /// Run the work to completion and return its exit code
    async fn run(&self, task_id: TaskId, requested_by: &str, args: &[String])
    -> std::io::Result<i32>;
}

/// Runs the configured transcoder in the extractor's working directory
pub struct FfmpegRunner {
    launcher: Arc<dyn ProcessLauncher>,
    executable: PathBuf,
    working_dir: PathBuf,
}

impl FfmpegRunner {
    /// Create a runner for `executable`
    pub fn new(launcher: Arc<dyn ProcessLauncher>, executable: PathBuf, working_dir: PathBuf) -> Self {
        Self {
            launcher,
            executable,
            working_dir,
        }
    }
}

#[async_trait]
impl SubworkRunner for FfmpegRunner {
    async fn run(
        &self,
        task_id: TaskId,
        requested_by: &str,
        args: &[String],
    ) -> std::io::Result<i32> {
        let spec = CommandSpec::new(
            &self.executable,
            args.iter().map(|a| a.trim_matches('"').to_string()).collect(),
        )
        .working_dir(&self.working_dir)
        .label(format!("ffmpeg #{task_id} for {requested_by}"));
        self.launcher.run(&spec).await
    }
}

/// Admission-controlled sub-work broker
pub struct TaskBroker {
    semaphore: Arc<Semaphore>,
    tasks: Mutex<HashMap<TaskId, watch::Receiver<TaskState>>>,
    runner: Arc<dyn SubworkRunner>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl TaskBroker {
    /// Create a broker admitting at most `max_parallel` concurrent executions
    pub fn new(
        runner: Arc<dyn SubworkRunner>,
        max_parallel: usize,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            tasks: Mutex::new(HashMap::new()),
            runner,
            timeout,
            cancel,
        }
    }

    /// Register a request and start it in the background
    ///
    /// Returns immediately with an id unique among all ids issued by this
    /// broker. Must be called from within a tokio runtime.
    pub fn request(&self, requested_by: &str, args: Vec<String>) -> TaskId {
        let (state_tx, state_rx) = watch::channel(TaskState::Requested);
        let task_id = {
            let mut tasks = self.tasks.lock();
            let mut rng = rand::thread_rng();
            let task_id = loop {
                let candidate = TaskId(rng.gen_range(0..i32::MAX));
                if !tasks.contains_key(&candidate) {
                    break candidate;
                }
            };
            tasks.insert(task_id, state_rx);
            task_id
        };

        tracing::info!(
            task_id = %task_id,
            requested_by,
            args = %args.join(" "),
            "sub-work execution requested"
        );

        tokio::spawn(execute(
            Arc::clone(&self.semaphore),
            Arc::clone(&self.runner),
            self.timeout,
            self.cancel.clone(),
            task_id,
            requested_by.to_string(),
            args,
            state_tx,
        ));

        task_id
    }

    /// Await the exit code of `task_id`
    ///
    /// Returns `None` without side effects when the id was never issued.
    pub fn poll(&self, task_id: TaskId) -> Option<impl Future<Output = i32> + Send + 'static> {
        let mut state = self.tasks.lock().get(&task_id)?.clone();
        Some(async move {
            state
                .wait_for(TaskState::is_terminal)
                .await
                .ok()
                .and_then(|s| s.exit_code())
                .unwrap_or_else(|| fault_code(ERROR_PROCESS_ABORTED))
        })
    }

    /// Current state of `task_id`
    pub fn state(&self, task_id: TaskId) -> Option<TaskState> {
        self.tasks.lock().get(&task_id).map(|rx| *rx.borrow())
    }

    /// Number of ids issued so far
    pub fn issued(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Number of ids whose execution has not finished
    pub fn outstanding(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|rx| !rx.borrow().is_terminal())
            .count()
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    semaphore: Arc<Semaphore>,
    runner: Arc<dyn SubworkRunner>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    task_id: TaskId,
    requested_by: String,
    args: Vec<String>,
    state: watch::Sender<TaskState>,
) {
    tracing::debug!(task_id = %task_id, "sub-work waiting for admission");
    let permit = tokio::select! {
        permit = semaphore.acquire_owned() => permit.ok(),
        _ = cancel.cancelled() => None,
    };
    let Some(_permit) = permit else {
        tracing::warn!(task_id = %task_id, "sub-work cancelled before admission");
        state.send_replace(TaskState::Faulted(fault_code(ERROR_CANCELLED)));
        return;
    };
    state.send_replace(TaskState::Admitted);

    tracing::info!(task_id = %task_id, requested_by = %requested_by, "sub-work running");
    state.send_replace(TaskState::Running);

    let execution = async {
        let run = runner.run(task_id, &requested_by, &args);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(task_id = %task_id, timeout = ?limit, "sub-work timed out");
                    return TaskState::Faulted(fault_code(ERROR_TIMEOUT));
                }
            },
            None => run.await,
        };
        match result {
            Ok(code) => TaskState::Completed(code),
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "sub-work failed to execute");
                TaskState::Faulted(fault_from_io(&e))
            }
        }
    };

    let outcome = tokio::select! {
        outcome = execution => outcome,
        _ = cancel.cancelled() => {
            tracing::warn!(task_id = %task_id, "sub-work cancelled");
            TaskState::Faulted(fault_code(ERROR_CANCELLED))
        }
    };

    tracing::info!(task_id = %task_id, state = ?outcome, "sub-work finished");
    state.send_replace(outcome);
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runner that sleeps, tracking concurrency
    struct SleepyRunner {
        delay: Duration,
        exit_code: i32,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl SleepyRunner {
        fn new(delay: Duration, exit_code: i32) -> Arc<Self> {
            Arc::new(Self {
                delay,
                exit_code,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SubworkRunner for SleepyRunner {
        async fn run(&self, _: TaskId, _: &str, _: &[String]) -> std::io::Result<i32> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(self.exit_code)
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl SubworkRunner for FailingRunner {
        async fn run(&self, _: TaskId, _: &str, _: &[String]) -> std::io::Result<i32> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "ffmpeg"))
        }
    }

    #[test]
    fn fault_codes_are_negative_and_distinct_from_not_found() {
        for code in [ERROR_TIMEOUT, ERROR_CANCELLED, ERROR_PROCESS_ABORTED, 0, 0xFFFF] {
            let fault = fault_code(code);
            assert!(fault < 0);
            assert_ne!(fault, NOT_FOUND);
        }
        assert_eq!(fault_code(ERROR_TIMEOUT) as u32, 0x8007_05B4);
    }

    #[tokio::test]
    async fn poll_returns_exit_code() {
        let runner = SleepyRunner::new(Duration::from_millis(10), 3);
        let broker = TaskBroker::new(runner, 2, None, CancellationToken::new());

        let id = broker.request("1_page1", vec!["-i".into(), "\"in.zip\"".into()]);
        let code = broker.poll(id).unwrap().await;
        assert_eq!(code, 3);
        assert_eq!(broker.state(id), Some(TaskState::Completed(3)));
        assert_eq!(broker.outstanding(), 0);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found_without_side_effects() {
        let broker = TaskBroker::new(
            SleepyRunner::new(Duration::ZERO, 0),
            1,
            None,
            CancellationToken::new(),
        );
        assert!(broker.poll(TaskId(12345)).is_none());
        assert_eq!(broker.issued(), 0);
        assert!(broker.state(TaskId(12345)).is_none());
    }

    #[tokio::test]
    async fn admission_is_bounded() {
        let runner = SleepyRunner::new(Duration::from_millis(20), 0);
        let broker = TaskBroker::new(runner.clone(), 2, None, CancellationToken::new());

        let ids: Vec<_> = (0..8).map(|_| broker.request("w", vec![])).collect();
        for id in ids {
            assert_eq!(broker.poll(id).unwrap().await, 0);
        }
        assert!(runner.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(runner.max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ten_thousand_ids_are_unique() {
        let broker = TaskBroker::new(
            SleepyRunner::new(Duration::from_secs(60), 0),
            4,
            None,
            CancellationToken::new(),
        );
        let ids: HashSet<_> = (0..10_000).map(|_| broker.request("w", vec![])).collect();
        assert_eq!(ids.len(), 10_000);
        assert_eq!(broker.issued(), 10_000);
    }

    #[tokio::test]
    async fn timeout_faults_with_error_timeout() {
        let broker = TaskBroker::new(
            SleepyRunner::new(Duration::from_secs(60), 0),
            1,
            Some(Duration::from_millis(20)),
            CancellationToken::new(),
        );
        let id = broker.request("w", vec![]);
        assert_eq!(broker.poll(id).unwrap().await, fault_code(ERROR_TIMEOUT));
        assert_eq!(
            broker.state(id),
            Some(TaskState::Faulted(fault_code(ERROR_TIMEOUT)))
        );
    }

    #[tokio::test]
    async fn cancellation_faults_running_and_waiting_tasks() {
        let cancel = CancellationToken::new();
        let broker = TaskBroker::new(
            SleepyRunner::new(Duration::from_secs(60), 0),
            1,
            None,
            cancel.clone(),
        );
        let running = broker.request("w", vec![]);
        let waiting = broker.request("w", vec![]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.state(waiting), Some(TaskState::Requested));

        cancel.cancel();
        let cancelled = fault_code(ERROR_CANCELLED);
        assert_eq!(broker.poll(running).unwrap().await, cancelled);
        assert_eq!(broker.poll(waiting).unwrap().await, cancelled);
    }

    #[tokio::test]
    async fn launch_failure_faults() {
        let broker = TaskBroker::new(Arc::new(FailingRunner), 1, None, CancellationToken::new());
        let id = broker.request("w", vec![]);
        let code = broker.poll(id).unwrap().await;
        assert_eq!(code, fault_code(ERROR_FILE_NOT_FOUND));
    }
}
