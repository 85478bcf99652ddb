//! Workflow Engine Adapter (C10): a minimal in-process stand-in for the durable
//! workflow engine this system would run against in production, just enough to make
//! C7/C8 runnable and testable inside one crate.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// What C7/C8 actually need from a durable engine: dedup-by-id child spawning, a
/// cancellation-aware sleep, and a way to check whether the run should stop early.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Spawn `fut` under `id` unless a workflow with that id is already running, in
    /// which case this is a no-op (mirrors spec §4.8: "a retry of the same poll tick
    /// cannot spawn duplicates").
    async fn spawn_child<F>(&self, id: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;

    async fn sleep(&self, duration: Duration);

    fn is_cancelled(&self) -> bool;

    fn cancel(&self);
}

pub struct LocalEngine {
    children: Mutex<HashMap<String, JoinHandle<()>>>,
    cancelled: AtomicBool,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
        }
    }
}

impl LocalEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl WorkflowEngine for LocalEngine {
    async fn spawn_child<F>(&self, id: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut children = self.children.lock().await;
        if let Some(existing) = children.get(id) {
            if !existing.is_finished() {
                return;
            }
        }
        let handle = tokio::spawn(fut);
        children.insert(id.to_string(), handle);
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Default retry policy for every C7 activity invocation (spec §4.7/§4.10): initial
/// 1s, factor 2, max 60s, max 3 attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

#[async_trait]
pub trait ActivityRetry {
    /// Run `op` with the given retry policy, retrying only while `op` returns `Err`
    /// and attempts remain.
    async fn with_retry<T, E, F, Fut>(&self, policy: RetryPolicy, op: F) -> Result<T, E>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Send;
}

pub struct TokioActivityRetry;

#[async_trait]
impl ActivityRetry for TokioActivityRetry {
    async fn with_retry<T, E, F, Fut>(&self, policy: RetryPolicy, op: F) -> Result<T, E>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        let mut attempt = 0;
        let mut backoff = policy.initial;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < policy.max_attempts => {
                    tokio::time::sleep(backoff).await;
                    backoff = Duration::from_secs_f64((backoff.as_secs_f64() * policy.factor).min(policy.max.as_secs_f64()));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn spawn_child_dedups_running_id() {
        let engine = LocalEngine::new();
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            engine
                .spawn_child("poll-project-1", async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_stops_after_max_attempts() {
        let retry = TokioActivityRetry;
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            initial: Duration::from_millis(1),
            factor: 2.0,
            max: Duration::from_millis(5),
            max_attempts: 3,
        };

        let result: Result<(), &str> = retry
            .with_retry(policy, || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("still failing")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
