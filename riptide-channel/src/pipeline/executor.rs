//! Execution contexts on which the pipeline runs its disk reads.

/// A unit of blocking read work.
pub type ReadJob = Box<dyn FnOnce() + Send + 'static>;

/// Runs read jobs on some execution context the consumer owns.
pub trait ReadExecutor: Send + Sync {
    fn submit(&self, job: ReadJob);
}

/// Runs each job immediately on the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineReadExecutor;

impl ReadExecutor for InlineReadExecutor {
    fn submit(&self, job: ReadJob) {
        job();
    }
}

/// Runs jobs on tokio's blocking thread pool.
#[derive(Debug, Clone)]
pub struct TokioReadExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioReadExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is currently running on.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl ReadExecutor for TokioReadExecutor {
    fn submit(&self, job: ReadJob) {
        // Detached: completion is reported through the pipeline itself.
        drop(self.handle.spawn_blocking(job));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_inline_executor_runs_immediately() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        InlineReadExecutor.submit(Box::new(move || flag.store(true, Ordering::SeqCst)));

        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_executor_runs_on_blocking_pool() {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let executor = TokioReadExecutor::current();

        executor.submit(Box::new(move || {
            let _ = sender.send(std::thread::current().name().map(str::to_string));
        }));

        let thread_name = receiver.await.unwrap();
        assert!(thread_name.is_some());
    }
}
