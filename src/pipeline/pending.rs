//! Pending results: the asynchronous half of a suspended step.

use std::future::Future;
use std::pin::Pin;

use crate::context::Exchange;
use crate::error::BoxError;

pub(crate) type Finish<T> = Box<dyn FnOnce(&mut Exchange) -> T + Send>;

pub(crate) type PendingFuture<T> =
    Pin<Box<dyn Future<Output = Result<Finish<T>, BoxError>> + Send + 'static>>;

/// A computation the pipeline waits on without blocking its caller.
///
/// The future itself cannot borrow the exchange, since the exchange is parked
/// while it runs. Work that needs to leave something on the exchange does so
/// in an apply step ([`Pending::then_apply`]), which runs on the resuming
/// thread with exclusive access once the future has resolved.
///
/// ```
/// use std::time::Duration;
/// use switchyard::error::BoxError;
/// use switchyard::pipeline::{FilterDone, FilterOutcome, Pending};
///
/// struct Quota(u32);
///
/// let outcome = FilterOutcome::AsyncStarted(Pending::then_apply(
///     async {
///         tokio::time::sleep(Duration::from_millis(5)).await;
///         Ok::<_, BoxError>(100)
///     },
///     |exchange, remaining| {
///         exchange.attachments_mut().insert(Quota(remaining));
///         FilterDone::Continue
///     },
/// ));
/// # drop(outcome);
/// ```
#[must_use = "a pending result does nothing unless returned to the pipeline"]
pub struct Pending<T> {
    pub(crate) future: PendingFuture<T>,
}

impl<T: Send + 'static> Pending<T> {
    /// Waits for `future` and uses its value as the outcome.
    pub fn new<F, E>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self {
            future: Box::pin(async move {
                let value = future.await.map_err(Into::into)?;
                Ok(Box::new(move |_: &mut Exchange| value) as Finish<T>)
            }),
        }
    }

    /// Waits for `future`, then runs `apply` against the exchange to produce
    /// the outcome.
    pub fn then_apply<F, V, E, A>(future: F, apply: A) -> Self
    where
        F: Future<Output = Result<V, E>> + Send + 'static,
        V: Send + 'static,
        E: Into<BoxError>,
        A: FnOnce(&mut Exchange, V) -> T + Send + 'static,
    {
        Self {
            future: Box::pin(async move {
                let value = future.await.map_err(Into::into)?;
                Ok(Box::new(move |exchange: &mut Exchange| apply(exchange, value)) as Finish<T>)
            }),
        }
    }

    /// An already-resolved result. The pipeline still suspends and resumes
    /// through the runtime.
    pub fn ready(value: T) -> Self {
        Self::new(std::future::ready(Ok::<_, BoxError>(value)))
    }

    /// An already-failed result.
    pub fn failed(error: impl Into<BoxError>) -> Self {
        let error = error.into();
        Self {
            future: Box::pin(std::future::ready(Err(error))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, Request};

    fn exchange() -> Exchange {
        Exchange::new(Request::builder(Method::Get, "/").build())
    }

    #[tokio::test]
    async fn new_yields_the_future_value() {
        let pending = Pending::new(async { Ok::<_, BoxError>(7u32) });
        let finish = pending.future.await.unwrap();
        assert_eq!(finish(&mut exchange()), 7);
    }

    #[tokio::test]
    async fn then_apply_sees_the_exchange() {
        struct Seen(u32);

        let pending = Pending::then_apply(async { Ok::<_, BoxError>(3u32) }, |ex, v| {
            ex.attachments_mut().insert(Seen(v));
            "applied"
        });
        let finish = pending.future.await.unwrap();
        let mut ex = exchange();
        assert_eq!(finish(&mut ex), "applied");
        assert_eq!(ex.attachments().get::<Seen>().map(|s| s.0), Some(3));
    }

    #[tokio::test]
    async fn failed_surfaces_the_error() {
        let pending: Pending<()> = Pending::failed("upstream down");
        let err = pending.future.await.err().unwrap();
        assert_eq!(err.to_string(), "upstream down");
    }
}
