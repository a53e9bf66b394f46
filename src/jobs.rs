use futures::future::BoxFuture;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// A bounded queue of background jobs with observable completion. Replaces
/// fire-and-forget continuations (opportunistic cache writes, exchange
/// contributions): producers backpressure when the queue is full, and tests
/// call [`drain`](JobQueue::drain) to await all queued work deterministically
/// instead of sleeping.
///
/// Jobs run sequentially on one worker task, in enqueue order.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<BoxFuture<'static, ()>>,
}

impl JobQueue {
    /// Spawns the worker task, so this must be called from within a Tokio
    /// runtime.
    pub fn new(capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<BoxFuture<'static, ()>>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
            }
        });
        Self { sender }
    }

    /// Queue a job. Waits when the queue is at capacity.
    pub async fn enqueue<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.sender.send(Box::pin(job)).await.is_err() {
            warn!("job queue worker gone, dropping job");
        }
    }

    /// Resolves after every job enqueued before this call has finished.
    pub async fn drain(&self) {
        let (done, finished) = oneshot::channel();
        self.enqueue(async move {
            let _ = done.send(());
        })
        .await;
        let _ = finished.await;
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(64)
    }
}
