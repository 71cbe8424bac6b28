use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Runs device calls one at a time, strictly in submission order.
///
/// A single worker owns the receiving end of the channel and drives each job
/// to completion before taking the next. A job's result travels back over its
/// own oneshot, so a failing job has no effect on the ones queued behind it.
pub struct RequestQueue {
    sender: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl RequestQueue {
    /// Spawns the worker. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
            }
            tracing::debug!("Request queue worker exiting");
        });

        Self { sender, worker }
    }

    /// Queues `task` behind everything already submitted and waits for its
    /// result. The task is not polled until every earlier task has settled.
    pub async fn enqueue<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, result) = oneshot::channel();

        let job: Job = Box::pin(async move {
            // Caller may have stopped waiting
            let _ = reply.send(task.await);
        });

        self.sender.send(job).map_err(|_| Error::QueueClosed)?;
        result.await.map_err(|_| Error::QueueClosed)?
    }

    /// Stops the worker. Tasks still queued are dropped and their callers see
    /// [`Error::QueueClosed`].
    pub fn close(&self) {
        self.worker.abort();
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::sleep;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn task(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        delay_ms: u64,
    ) -> impl Future<Output = Result<&'static str>> + Send + 'static {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(name);
            sleep(Duration::from_millis(delay_ms)).await;
            log.lock().unwrap().push(name);
            Ok(name)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_slow_task_first() {
        let queue = RequestQueue::new();
        let log = recorder();

        let (a, b, c) = tokio::join!(
            queue.enqueue(task(&log, "A", 500)),
            queue.enqueue(task(&log, "B", 100)),
            queue.enqueue(task(&log, "C", 1)),
        );

        assert_eq!(a.unwrap(), "A");
        assert_eq!(b.unwrap(), "B");
        assert_eq!(c.unwrap(), "C");
        // Each task starts and finishes before the next one starts
        assert_eq!(*log.lock().unwrap(), vec!["A", "A", "B", "B", "C", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_poison_queue() {
        let queue = RequestQueue::new();

        let failed: Result<()> = queue
            .enqueue(async { Err(Error::Authentication("bad hash".into())) })
            .await;
        assert!(matches!(failed, Err(Error::Authentication(_))));

        let next = queue.enqueue(async { Ok(42) }).await;
        assert_eq!(next.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_waits_for_failed_predecessor() {
        let queue = RequestQueue::new();
        let log = recorder();

        let failing = {
            let log = log.clone();
            async move {
                sleep(Duration::from_millis(200)).await;
                log.lock().unwrap().push("failed");
                Err::<(), _>(Error::QueueClosed)
            }
        };

        let (first, second) = tokio::join!(
            queue.enqueue(failing),
            queue.enqueue(task(&log, "next", 1)),
        );

        assert!(first.is_err());
        assert!(second.is_ok());
        assert_eq!(*log.lock().unwrap(), vec!["failed", "next", "next"]);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let queue = RequestQueue::new();
        queue.close();
        tokio::task::yield_now().await;

        let result = queue.enqueue(async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::QueueClosed)));
    }
}
