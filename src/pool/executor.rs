//! Dedicated executors
//!
//! An [`Executor`] is a multi-thread tokio runtime with a fixed worker count,
//! or a borrowed [`Handle`] to a runtime owned by the integrator.

use crate::error::GatewayError;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

/// A named executor sessions can spawn onto
#[derive(Debug)]
pub struct Executor {
    name: String,
    threads: usize,
    handle: Handle,
    /// `None` once shut down, or when the runtime is not ours.
    runtime: Mutex<Option<Runtime>>,
}

impl Executor {
    /// Start a dedicated runtime with `threads` workers.
    pub fn build(name: impl Into<String>, threads: usize) -> Result<Self, GatewayError> {
        let name = name.into();
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name(name.clone())
            .enable_all()
            .build()
            .map_err(|source| GatewayError::Executor {
                name: name.clone(),
                source,
            })?;

        debug!(executor = %name, threads, "Executor started");

        Ok(Self {
            name,
            threads,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Wrap a runtime the caller keeps ownership of.
    pub fn from_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            name: name.into(),
            threads: 0,
            handle,
            runtime: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Worker threads owned by this executor (0 when borrowed)
    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// True while an owned runtime is still running
    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Stop the owned runtime without waiting for its tasks.
    ///
    /// Safe to call from inside an async context; a no-op for borrowed
    /// handles and on repeated calls.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            debug!(executor = %self.name, "Executor shut down");
            runtime.shutdown_background();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_executor_runs_tasks_until_shutdown() {
        let executor = Executor::build("test-pool", 2).unwrap();
        assert_eq!(executor.threads(), 2);
        assert!(executor.is_running());

        let (tx, rx) = std::sync::mpsc::channel();
        executor.handle().spawn(async move {
            tx.send(42).unwrap();
        });
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), 42);

        executor.shutdown();
        assert!(!executor.is_running());
        // second call is a no-op
        executor.shutdown();
    }

    #[tokio::test]
    async fn borrowed_handle_is_never_shut_down() {
        let executor = Executor::from_handle("caller", Handle::current());
        assert_eq!(executor.threads(), 0);
        assert!(!executor.is_running());
        executor.shutdown();

        let value = executor.handle().spawn(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn zero_threads_is_clamped() {
        let executor = Executor::build("tiny", 0).unwrap();
        assert_eq!(executor.threads(), 1);
    }
}
