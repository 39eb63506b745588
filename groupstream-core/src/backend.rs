// Stream Backend Traits
//
// Core interface shared by every stream store

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;

use crate::error::Result;

/// Error returned by a consumer handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a single handler invocation
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Callback invoked with one delivered payload
///
/// `Ok(())` acknowledges the message. `Err(_)` leaves it unacknowledged and
/// hands it to the backend's redelivery policy.
pub type Handler<T> = dyn Fn(T) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// Adapt an async closure into a [`Handler`]
///
/// ```rust,ignore
/// let handler = handler_fn(|value: String| async move {
///     println!("{value}");
///     Ok(())
/// });
/// backend.consume("orders", &handler).await?;
/// ```
pub fn handler_fn<T, F, Fut>(f: F) -> impl Fn(T) -> BoxFuture<'static, HandlerResult> + Send + Sync
where
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    move |value| Box::pin(f(value))
}

/// Stream storage with consumer-group delivery
///
/// A backend holds any number of streams, each an append-only sequence of
/// payloads. Every consumer group on a stream has its own cursor and its own
/// pending set, so groups never observe each other's acknowledgements.
///
/// Delivery is at-least-once: a message whose handler fails is redelivered
/// later, but the timing of redelivery depends on the implementation.
#[async_trait]
pub trait StreamBackend<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Name of the group used by [`init`](Self::init), [`consume`](Self::consume)
    /// and [`length`](Self::length)
    fn default_group(&self) -> &str;

    /// Create the default group at the current tail. No-op if it exists.
    async fn init(&self, stream_id: &str) -> Result<()> {
        let group = self.default_group().to_string();
        self.init_group(stream_id, &group).await
    }

    /// Create `group` at the current tail of `stream_id`
    ///
    /// Messages offered before the first call for a group are never visible
    /// to it. Calling again for an existing group is a no-op.
    async fn init_group(&self, stream_id: &str, group: &str) -> Result<()>;

    /// Append `value` to the tail of `stream_id`
    async fn offer(&self, stream_id: &str, value: T) -> Result<()>;

    /// Deliver at most one message from the default group
    async fn consume(&self, stream_id: &str, handler: &Handler<T>) -> Result<bool> {
        let group = self.default_group().to_string();
        self.consume_group(stream_id, &group, handler).await
    }

    /// Deliver at most one message from `group` to `handler`
    ///
    /// Returns `Ok(true)` when a message was delivered and the handler
    /// succeeded, `Ok(false)` when nothing was available. What a handler
    /// failure returns is backend-specific.
    async fn consume_group(
        &self,
        stream_id: &str,
        group: &str,
        handler: &Handler<T>,
    ) -> Result<bool>;

    /// Outstanding entries for the default group
    async fn length(&self, stream_id: &str) -> Result<usize> {
        let group = self.default_group().to_string();
        self.length_group(stream_id, &group).await
    }

    /// Entries not yet acknowledged by `group`: undelivered, pending and in flight
    async fn length_group(&self, stream_id: &str, group: &str) -> Result<usize>;
}
