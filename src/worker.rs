//! Fixed-size task pool for endpoint and combining tasks.
//!
//! A semaphore bounds how many tasks run at once across all in-flight
//! client requests served by this process. Handles are awaited in
//! submission order, which fixes the order of output segments.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
}

pub struct TaskHandle<T> {
    join: JoinHandle<T>,
}

impl TaskPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    /// Submit a task. It starts once a worker slot frees up; the returned
    /// handle yields its result.
    pub fn spawn<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        TaskHandle {
            join: tokio::spawn(async move {
                // The semaphore is never closed while the pool exists.
                let _permit = permits
                    .acquire_owned()
                    .await
                    .expect("worker pool semaphore closed");
                task.await
            }),
        }
    }
}

impl<T> TaskHandle<T> {
    /// Await the task's result. A join error (task panic) is surfaced to
    /// the caller to map into its tagged result type.
    pub async fn join(self) -> Result<T, tokio::task::JoinError> {
        self.join.await
    }
}
