use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::backend::{Task, TaskBackend};
use crate::error::GaleError;
use crate::resilience::RetryOutcome;
use crate::scheduler::{LoopConfig, LoopStats};

/// Read-only snapshot handed to hooks around one task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub namespace: String,
    pub task: Task,
    pub worker: usize,
}

/// Optional observer plugged into the scheduler's lifecycle. Every
/// method defaults to a no-op; implement only what you need. Hook
/// failures are isolated: an error or panic here never aborts the task
/// or suppresses the other hooks.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    fn name(&self) -> &str;

    /// May rewrite the loop config before the run starts.
    async fn on_config_load(&self, config: LoopConfig) -> Result<LoopConfig, GaleError> {
        Ok(config)
    }

    async fn on_loop_start(&self, _namespace: &str) -> Result<(), GaleError> {
        Ok(())
    }

    async fn on_task_start(&self, _ctx: &TaskContext) -> Result<(), GaleError> {
        Ok(())
    }

    async fn on_task_complete(
        &self,
        _ctx: &TaskContext,
        _result: &RetryOutcome,
    ) -> Result<(), GaleError> {
        Ok(())
    }

    async fn on_task_failed(&self, _ctx: &TaskContext, _error: &GaleError) -> Result<(), GaleError> {
        Ok(())
    }

    async fn on_loop_end(&self, _stats: &LoopStats) -> Result<(), GaleError> {
        Ok(())
    }

    async fn on_backend_ready(&self, _backend: &dyn TaskBackend) -> Result<(), GaleError> {
        Ok(())
    }
}

/// Sequential fan-out over registered hooks, in registration order.
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Chain the config through every hook. A hook that fails (or
    /// panics) is skipped and the config it received flows onward.
    pub async fn config_load(&self, mut config: LoopConfig) -> LoopConfig {
        for hook in &self.hooks {
            let input = config.clone();
            match std::panic::AssertUnwindSafe(hook.on_config_load(input))
                .catch_unwind()
                .await
            {
                Ok(Ok(rewritten)) => config = rewritten,
                Ok(Err(e)) => {
                    tracing::warn!(hook = hook.name(), "on_config_load failed: {e}");
                }
                Err(_) => {
                    tracing::error!(hook = hook.name(), "on_config_load panicked");
                }
            }
        }
        config
    }

    pub async fn loop_start(&self, namespace: &str) {
        for hook in &self.hooks {
            Self::isolated(hook.name(), "on_loop_start", hook.on_loop_start(namespace)).await;
        }
    }

    pub async fn task_start(&self, ctx: &TaskContext) {
        for hook in &self.hooks {
            Self::isolated(hook.name(), "on_task_start", hook.on_task_start(ctx)).await;
        }
    }

    pub async fn task_complete(&self, ctx: &TaskContext, result: &RetryOutcome) {
        for hook in &self.hooks {
            Self::isolated(
                hook.name(),
                "on_task_complete",
                hook.on_task_complete(ctx, result),
            )
            .await;
        }
    }

    pub async fn task_failed(&self, ctx: &TaskContext, error: &GaleError) {
        for hook in &self.hooks {
            Self::isolated(
                hook.name(),
                "on_task_failed",
                hook.on_task_failed(ctx, error),
            )
            .await;
        }
    }

    pub async fn loop_end(&self, stats: &LoopStats) {
        for hook in &self.hooks {
            Self::isolated(hook.name(), "on_loop_end", hook.on_loop_end(stats)).await;
        }
    }

    pub async fn backend_ready(&self, backend: &dyn TaskBackend) {
        for hook in &self.hooks {
            Self::isolated(
                hook.name(),
                "on_backend_ready",
                hook.on_backend_ready(backend),
            )
            .await;
        }
    }

    async fn isolated<F>(hook: &str, method: &str, fut: F)
    where
        F: Future<Output = Result<(), GaleError>>,
    {
        match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(hook, method, "hook failed: {e}");
            }
            Err(_) => {
                tracing::error!(hook, method, "hook panicked");
            }
        }
    }
}
