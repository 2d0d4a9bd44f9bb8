//! Orchestration context
//!
//! One context is built per run. It owns the shared state the control plane
//! and the phases touch: identity table, progress registry, task broker,
//! batching queue and both router endpoints.

use crate::broker::{SubworkRunner, TaskBroker};
use crate::config::Config;
use crate::download_queue::{AppendSink, DownloadQueue};
use crate::error::{PipelineError, Result};
use crate::ipc::{
    CommunicationHandler, IdentityTable, ProgressRegistry, Router, TaskRequestHandler,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Endpoints {
    communication: Router,
    task: Router,
}

/// Per-run shared state with an explicit start/stop lifecycle
pub struct OrchestrationContext {
    cancel: CancellationToken,
    identities: Arc<IdentityTable>,
    progress: Arc<ProgressRegistry>,
    broker: Arc<TaskBroker>,
    queue: Arc<DownloadQueue>,
    endpoints: Option<Endpoints>,
}

impl OrchestrationContext {
    /// Build a context; nothing is bound until [`start`](Self::start)
    pub fn new(
        config: &Config,
        runner: Arc<dyn SubworkRunner>,
        sink: Arc<dyn AppendSink>,
        cancel: CancellationToken,
    ) -> Self {
        let broker = TaskBroker::new(
            runner,
            config.parallelism.subwork,
            config.subwork.timeout,
            cancel.child_token(),
        );
        Self {
            cancel,
            identities: Arc::new(IdentityTable::new()),
            progress: ProgressRegistry::new(),
            broker: Arc::new(broker),
            queue: DownloadQueue::new(sink),
            endpoints: None,
        }
    }

    /// Bind both control-plane endpoints
    pub async fn start(&mut self, communication_address: &str, task_address: &str) -> Result<()> {
        if self.endpoints.is_some() {
            return Ok(());
        }

        let communication = Router::bind(
            "communication",
            communication_address,
            Arc::new(CommunicationHandler::new(
                Arc::clone(&self.identities),
                Arc::clone(&self.progress),
            )),
            &self.cancel,
        )
        .await
        .map_err(|e| {
            PipelineError::ControlPlaneStartup(format!("{communication_address}: {e}"))
        })?;

        let task = match Router::bind(
            "task",
            task_address,
            Arc::new(TaskRequestHandler::new(
                Arc::clone(&self.identities),
                Arc::clone(&self.broker),
                Arc::clone(&self.queue),
            )),
            &self.cancel,
        )
        .await
        {
            Ok(task) => task,
            Err(e) => {
                communication.close().await;
                return Err(
                    PipelineError::ControlPlaneStartup(format!("{task_address}: {e}")).into(),
                );
            }
        };

        self.endpoints = Some(Endpoints {
            communication,
            task,
        });
        Ok(())
    }

    /// Close both endpoints and stop the queue timer
    pub async fn stop(&mut self) {
        if let Some(Endpoints {
            communication,
            task,
        }) = self.endpoints.take()
        {
            communication.close().await;
            task.close().await;
        }
        self.queue.end_timer().await;
        tracing::debug!("orchestration context stopped");
    }

    /// Resolved Communication endpoint address, once started
    pub fn communication_address(&self) -> Option<&str> {
        self.endpoints.as_ref().map(|e| e.communication.endpoint())
    }

    /// Resolved Task Request endpoint address, once started
    pub fn task_address(&self) -> Option<&str> {
        self.endpoints.as_ref().map(|e| e.task.endpoint())
    }

    /// `identifier|communication|task` value handed to workers
    pub fn ipc_address(&self, identifier: &str) -> String {
        format!(
            "{}|{}|{}",
            identifier,
            self.communication_address().unwrap_or_default(),
            self.task_address().unwrap_or_default()
        )
    }

    /// Root cancellation token of the run
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Connection identity table
    pub fn identities(&self) -> &Arc<IdentityTable> {
        &self.identities
    }

    /// Per-item progress registry
    pub fn progress(&self) -> &Arc<ProgressRegistry> {
        &self.progress
    }

    /// Sub-work broker
    pub fn broker(&self) -> &Arc<TaskBroker> {
        &self.broker
    }

    /// Downloader-input batching queue
    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::download_queue::FileAppendSink;
    use crate::error::Error;
    use crate::types::TaskId;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl SubworkRunner for Noop {
        async fn run(&self, _: TaskId, _: &str, _: &[String]) -> std::io::Result<i32> {
            Ok(0)
        }
    }

    fn context() -> OrchestrationContext {
        OrchestrationContext::new(
            &Config::default(),
            Arc::new(Noop),
            Arc::new(FileAppendSink),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn start_binds_ephemeral_ports_and_stop_releases() {
        let mut ctx = context();
        assert!(ctx.communication_address().is_none());

        ctx.start("tcp://127.0.0.1:0", "tcp://127.0.0.1:0")
            .await
            .unwrap();
        let comm = ctx.communication_address().unwrap().to_string();
        let task = ctx.task_address().unwrap().to_string();
        assert!(comm.starts_with("tcp://127.0.0.1:"));
        assert_ne!(comm, task);
        assert_eq!(ctx.ipc_address("5_page1"), format!("5_page1|{comm}|{task}"));

        ctx.stop().await;
        assert!(ctx.communication_address().is_none());
    }

    #[tokio::test]
    async fn bind_failure_is_a_startup_error() {
        let mut ctx = context();
        let err = ctx
            .start("tcp://127.0.0.1:0", "not-an-endpoint")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Pipeline(PipelineError::ControlPlaneStartup(_))
        ));
        assert!(ctx.communication_address().is_none());
    }
}
