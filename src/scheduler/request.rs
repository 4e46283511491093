use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::ApiError;

/// Queue a request waits in. `High` drains before `Normal` before `Low`;
/// `Batch` is released in groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
    Batch,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::High, Priority::Normal, Priority::Low, Priority::Batch];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Batch => "batch",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request options. Unset fields fall back to the scheduler config.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub priority: Priority,
    pub timeout: Option<Duration>,
    /// Total executions allowed, first attempt included.
    pub max_attempts: Option<u32>,
    pub provider: Option<String>,
    /// Routes the request through the batch queue.
    pub batchable: bool,
    pub batch_type: Option<String>,
    pub metadata: Value,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn batchable(mut self, batch_type: impl Into<String>) -> Self {
        self.batchable = true;
        self.batch_type = Some(batch_type.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

pub(crate) type Erased = Box<dyn Any + Send>;
pub(crate) type JobResult = Result<Erased, ApiError>;
pub(crate) type JobFactory = Box<dyn FnMut() -> BoxFuture<'static, JobResult> + Send>;

/// A queued unit of work with its reply channel.
pub(crate) struct Job {
    pub id: u64,
    pub priority: Priority,
    pub provider: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub attempt: u32,
    pub queued_at: Instant,
    pub batch_type: Option<String>,
    pub metadata: Value,
    /// Already counted as a rate-limit hit.
    pub rate_counted: bool,
    pub factory: JobFactory,
    pub reply: oneshot::Sender<JobResult>,
}

impl Job {
    pub fn reject(self, error: ApiError) {
        // the caller may have dropped its handle
        let _ = self.reply.send(Err(error));
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("provider", &self.provider)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Wraps a typed request closure into a [`JobFactory`].
pub(crate) fn erase<T, F, Fut>(mut f: F) -> JobFactory
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
{
    Box::new(move || {
        let fut = f();
        Box::pin(async move { fut.await.map(|value| Box::new(value) as Erased) })
    })
}

/// Completion of a submitted request. Resolves with the request's own
/// result, or with `CANCELLED` when the scheduler drops it.
#[must_use = "a request handle does nothing unless awaited"]
pub struct RequestHandle<T> {
    id: u64,
    rx: oneshot::Receiver<JobResult>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RequestHandle<T> {
    pub(crate) fn new(id: u64, rx: oneshot::Receiver<JobResult>) -> Self {
        Self {
            id,
            rx,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> fmt::Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle").field("id", &self.id).finish()
    }
}

impl<T: 'static> Future for RequestHandle<T> {
    type Output = Result<T, ApiError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Err(ApiError::cancelled("request dropped by scheduler"))),
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(Ok(value))) => Poll::Ready(
                value
                    .downcast::<T>()
                    .map(|boxed| *boxed)
                    .map_err(|_| ApiError::unknown("request produced an unexpected type")),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_resolves_typed_value() {
        let (tx, rx) = oneshot::channel();
        let handle: RequestHandle<u32> = RequestHandle::new(7, rx);
        let mut factory = erase(|| async { Ok::<_, ApiError>(42u32) });
        tx.send(factory().await).unwrap();
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn dropped_sender_is_cancellation() {
        let (tx, rx) = oneshot::channel::<JobResult>();
        let handle: RequestHandle<()> = RequestHandle::new(1, rx);
        drop(tx);
        assert_eq!(handle.await.unwrap_err().kind, crate::error::ErrorKind::Cancelled);
    }

    #[test]
    fn priority_order() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Low < Priority::Batch);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
