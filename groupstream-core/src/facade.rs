//! Typed polling facade over a string stream backend
//!
//! A [`TypedStream`] encodes values with its codec on the way in and, for
//! every registered consumer, runs a background poller that decodes payloads
//! and hands them to the consumer callback.
//!
//! Each facade consumes as its own consumer group, so two facades with
//! different group names on the same stream id both see every message.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{HandlerResult, StreamBackend};
use crate::codec::Codec;
use crate::config::PollerConfig;
use crate::error::{Error, Result};

/// Per-facade consumer settings
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Name used in logs
    pub name: String,
    /// Consumer group every poller of this facade reads as
    pub consumer_group: String,
    /// Sleep after a poll that delivered nothing
    pub poll_interval: Duration,
}

impl ConsumerOptions {
    #[must_use]
    pub fn new(name: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consumer_group: consumer_group.into(),
            poll_interval: PollerConfig::default().poll_interval(),
        }
    }

    #[must_use]
    pub fn from_config(
        name: impl Into<String>,
        consumer_group: impl Into<String>,
        config: &PollerConfig,
    ) -> Self {
        Self::new(name, consumer_group).with_poll_interval(config.poll_interval())
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Typed stream facade with background consumers
pub struct TypedStream<T> {
    backend: Arc<dyn StreamBackend<String>>,
    codec: Arc<dyn Codec<T>>,
    options: ConsumerOptions,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> TypedStream<T>
where
    T: Send + 'static,
{
    #[must_use]
    pub fn new(
        backend: Arc<dyn StreamBackend<String>>,
        codec: Arc<dyn Codec<T>>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            backend,
            codec,
            options,
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.options.name
    }

    #[must_use]
    pub fn consumer_group_name(&self) -> &str {
        &self.options.consumer_group
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.options.poll_interval
    }

    /// Encode `value` and append it to `stream_id`
    pub async fn offer(&self, stream_id: &str, value: &T) -> Result<()> {
        let payload = self.codec.encode(value)?;
        self.backend.offer(stream_id, payload).await
    }

    /// Start a background poller delivering `stream_id` to `callback`
    ///
    /// The consumer group is created before this returns, so every message
    /// offered afterwards reaches the callback. A failing or panicking
    /// callback only affects the message it was handling.
    pub async fn add_consumer<F, Fut>(&self, stream_id: &str, callback: F) -> Result<()>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self.cancel_token.is_cancelled() {
            return Err(Error::Closed(self.options.name.clone()));
        }

        self.backend
            .init_group(stream_id, &self.options.consumer_group)
            .await?;

        let codec = self.codec.clone();
        let callback = Arc::new(callback);
        let handler = move |payload: String| -> BoxFuture<'static, HandlerResult> {
            let codec = codec.clone();
            let callback = callback.clone();
            Box::pin(async move {
                let value = codec.decode(&payload)?;
                AssertUnwindSafe(async move { callback(value).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err("consumer callback panicked".into()))
            })
        };

        let poller = Poller {
            backend: self.backend.clone(),
            stream_id: stream_id.to_string(),
            group: self.options.consumer_group.clone(),
            name: self.options.name.clone(),
            poll_interval: self.options.poll_interval,
            cancel_token: self.cancel_token.clone(),
        };

        let handle = tokio::spawn(poller.run(handler));
        self.tasks.lock().push(handle);

        Ok(())
    }

    /// Number of pollers still running
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Stop every poller and wait for them to exit
    ///
    /// A callback that is already running finishes first. Safe to call more
    /// than once.
    pub async fn close(&self) {
        self.cancel_token.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock());
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(
                    name = %self.options.name,
                    error = %e,
                    "Consumer task terminated abnormally"
                );
            }
        }

        info!(
            name = %self.options.name,
            group = %self.options.consumer_group,
            stopped = count,
            "Stream facade closed"
        );
    }
}

impl<T> Drop for TypedStream<T> {
    fn drop(&mut self) {
        // Pollers exit at their next iteration; use `close` to wait for them
        self.cancel_token.cancel();
    }
}

/// Background loop bound to one `(stream_id, group)` pair
struct Poller {
    backend: Arc<dyn StreamBackend<String>>,
    stream_id: String,
    group: String,
    name: String,
    poll_interval: Duration,
    cancel_token: CancellationToken,
}

impl Poller {
    async fn run<H>(self, handler: H)
    where
        H: Fn(String) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static,
    {
        info!(
            name = %self.name,
            stream_id = %self.stream_id,
            group = %self.group,
            "Consumer started"
        );

        while !self.cancel_token.is_cancelled() {
            let delivered = match self
                .backend
                .consume_group(&self.stream_id, &self.group, &handler)
                .await
            {
                Ok(delivered) => delivered,
                Err(e) if e.is_handler_failure() => {
                    warn!(
                        name = %self.name,
                        stream_id = %self.stream_id,
                        group = %self.group,
                        error = %e,
                        "Consumer callback failed, message left for redelivery"
                    );
                    false
                }
                Err(e) => {
                    error!(
                        name = %self.name,
                        stream_id = %self.stream_id,
                        group = %self.group,
                        error = %e,
                        "Failed to consume from stream, retrying after poll interval"
                    );
                    false
                }
            };

            if delivered {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        debug!(
            name = %self.name,
            stream_id = %self.stream_id,
            group = %self.group,
            "Consumer stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Handler;
    use crate::codec::JsonCodec;
    use crate::memory::MemoryBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend whose consume always fails as if the store were down
    struct UnavailableBackend {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl StreamBackend<String> for UnavailableBackend {
        fn default_group(&self) -> &str {
            "default"
        }

        async fn init_group(&self, _stream_id: &str, _group: &str) -> Result<()> {
            Ok(())
        }

        async fn offer(&self, _stream_id: &str, _value: String) -> Result<()> {
            Err(Error::Unavailable("connection refused".to_string()))
        }

        async fn consume_group(
            &self,
            _stream_id: &str,
            _group: &str,
            _handler: &Handler<String>,
        ) -> Result<bool> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Unavailable("connection refused".to_string()))
        }

        async fn length_group(&self, _stream_id: &str, _group: &str) -> Result<usize> {
            Ok(0)
        }
    }

    fn options(group: &str) -> ConsumerOptions {
        ConsumerOptions::new(format!("{group}-facade"), group)
            .with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_options_from_config() {
        let config = PollerConfig {
            poll_interval_ms: 250,
        };
        let options = ConsumerOptions::from_config("audit", "audit-group", &config);
        assert_eq!(options.name, "audit");
        assert_eq!(options.consumer_group, "audit-group");
        assert_eq!(options.poll_interval, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_poller_survives_backend_errors() {
        let backend = Arc::new(UnavailableBackend {
            attempts: AtomicUsize::new(0),
        });
        let facade: TypedStream<String> =
            TypedStream::new(backend.clone(), Arc::new(JsonCodec::new()), options("g"));

        facade
            .add_consumer("s", |_value: String| async { Ok(()) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend.attempts.load(Ordering::SeqCst) >= 2);
        assert_eq!(facade.consumer_count(), 1);

        facade.close().await;
        assert_eq!(facade.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_offer_propagates_backend_error() {
        let backend = Arc::new(UnavailableBackend {
            attempts: AtomicUsize::new(0),
        });
        let facade: TypedStream<String> =
            TypedStream::new(backend, Arc::new(JsonCodec::new()), options("g"));

        let err = facade.offer("s", &"x".to_string()).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_add_consumer_after_close_rejected() {
        let backend: Arc<dyn StreamBackend<String>> = Arc::new(MemoryBackend::<String>::new());
        let facade: TypedStream<u32> =
            TypedStream::new(backend, Arc::new(JsonCodec::new()), options("g"));

        facade.close().await;
        assert!(facade.is_closed());

        let err = facade
            .add_consumer("s", |_value: u32| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed(_)));

        // second close is a no-op
        facade.close().await;
    }

    #[tokio::test]
    async fn test_undecodable_payload_does_not_stop_poller() {
        let backend = Arc::new(MemoryBackend::<String>::new());
        let facade: TypedStream<u32> = TypedStream::new(
            backend.clone(),
            Arc::new(JsonCodec::new()),
            options("g"),
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        facade
            .add_consumer("s", move |value: u32| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(value);
                    Ok(())
                }
            })
            .await
            .unwrap();

        backend.offer("s", "not a number".to_string()).await.unwrap();
        facade.offer("s", &42).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        facade.close().await;

        assert_eq!(*seen.lock(), vec![42]);
        // the bad payload stays parked in the group's pending set
        assert_eq!(backend.length_group("s", "g").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let backend = Arc::new(MemoryBackend::<String>::new());
        let facade: TypedStream<u32> = TypedStream::new(
            backend.clone(),
            Arc::new(JsonCodec::new()),
            options("g"),
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        facade
            .add_consumer("s", move |value: u32| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert!(value != 1, "poison message");
                    Ok(())
                }
            })
            .await
            .unwrap();

        facade.offer("s", &1).await.unwrap();
        facade.offer("s", &2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(facade.consumer_count(), 1);
        facade.close().await;

        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
