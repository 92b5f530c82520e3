use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

/// An isolated tokio runtime on its own dedicated thread pool.
/// The daemon owns one of these so its tasks never interfere with whatever
/// runtime an embedding process may already be running.
pub struct CuttleRuntime {
    runtime: Arc<Runtime>,
}

impl CuttleRuntime {
    /// Creates a new isolated runtime with a specific number of worker threads.
    pub fn new(worker_threads: usize) -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .max_blocking_threads(worker_threads)
            .thread_name("cuttled-worker")
            .enable_all()
            .build()
            .expect("Failed to create tokio runtime");

        Self {
            runtime: Arc::new(runtime),
        }
    }

    /// Spawn a future on the isolated runtime.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Block on a future using the isolated runtime.
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: std::future::Future,
    {
        self.runtime.block_on(future)
    }

    /// Get a handle for spawning tasks from other threads.
    pub fn handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }
}

impl Clone for CuttleRuntime {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolated_runtime() {
        let runtime = CuttleRuntime::new(2);

        let result = runtime.block_on(async {
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
            42
        });

        assert_eq!(result, 42);
    }

    #[test]
    fn test_spawn_on_runtime() {
        let runtime = CuttleRuntime::new(2);

        let handle = runtime.spawn(async {
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
            "done"
        });

        let result = runtime.block_on(handle).unwrap();
        assert_eq!(result, "done");
    }
}
