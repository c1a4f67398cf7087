use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A job that panicked instead of returning. Job error types convert from
/// it so the panic reaches the job's [`Completion`] as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPanicked(pub String);

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

struct PendingJob<E> {
    job: BoxFuture<'static, Result<(), E>>,
    done: oneshot::Sender<Result<(), E>>,
}

struct QueueState<E> {
    pending: VecDeque<PendingJob<E>>,
    running: bool,
}

/// Runs submitted jobs one at a time, in submission order.
///
/// At most `bound` jobs wait behind the running one. Submitting past that
/// drops the oldest waiting job; its completion resolves `Ok(())` without
/// the job ever running. A running job is never cancelled.
pub struct RedrawQueue<E> {
    state: Arc<Mutex<QueueState<E>>>,
    bound: usize,
}

impl<E> Clone for RedrawQueue<E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            bound: self.bound,
        }
    }
}

impl<E> RedrawQueue<E>
where
    E: Display + From<JobPanicked> + Send + 'static,
{
    pub fn new(bound: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                pending: VecDeque::new(),
                running: false,
            })),
            bound: bound.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of jobs waiting to run, excluding the running one.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn enqueue<F>(&self, job: F) -> Completion<E>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if state.pending.len() >= self.bound
                && let Some(stale) = state.pending.pop_front()
            {
                debug!("Redraw queue full, dropping oldest pending job");
                let _ = stale.done.send(Ok(()));
            }
            state.pending.push_back(PendingJob {
                job: Box::pin(job),
                done,
            });
        }

        self.dequeue();
        Completion { rx }
    }

    fn dequeue(&self) {
        let next = {
            let mut state = self.lock();
            if state.running {
                return;
            }
            let Some(next) = state.pending.pop_front() else {
                return;
            };
            state.running = true;
            next
        };

        let queue = self.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(next.job).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(E::from(JobPanicked(panic_message(payload)))),
            };
            if let Err(e) = &result {
                warn!("Redraw job failed: {}", e);
            }
            let _ = next.done.send(result);

            queue.lock().running = false;
            queue.dequeue();
        });
    }
}

/// Resolves with the outcome of one enqueued job.
///
/// Dropping it does not cancel the job.
pub struct Completion<E> {
    rx: oneshot::Receiver<Result<(), E>>,
}

impl<E> Future for Completion<E> {
    type Output = Result<(), E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender gone without a result: the job was discarded.
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}
