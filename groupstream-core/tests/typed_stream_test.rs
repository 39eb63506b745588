// Typed facade and producer tests against the in-process backend

use groupstream_core::{
    Codec, ConsumerOptions, JsonCodec, MemoryBackend, Producer, StreamBackend, TypedMessage,
    TypedStream,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Greeting {
    text: String,
}

impl Greeting {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

impl TypedMessage for Greeting {
    fn topic_id() -> &'static str {
        "greetings"
    }

    fn codec() -> Arc<dyn Codec<Self>> {
        Arc::new(JsonCodec::new())
    }
}

fn facade(backend: &Arc<MemoryBackend<String>>, group: &str) -> TypedStream<Greeting> {
    TypedStream::new(
        backend.clone(),
        Greeting::codec(),
        ConsumerOptions::new(format!("{group}-listener"), group).with_poll_interval(POLL),
    )
}

async fn subscribe(stream: &TypedStream<Greeting>, stream_id: &str) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    stream
        .add_consumer(stream_id, move |greeting: Greeting| {
            let sink = sink.clone();
            async move {
                sink.lock().push(greeting.text);
                Ok(())
            }
        })
        .await
        .unwrap();
    seen
}

/// Poll `condition` until it holds or two seconds pass
async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    condition()
}

#[tokio::test]
async fn test_two_facades_each_receive_every_message() {
    let backend = Arc::new(MemoryBackend::<String>::new());
    let first = facade(&backend, "first");
    let second = facade(&backend, "second");

    let first_seen = subscribe(&first, "chat").await;
    let second_seen = subscribe(&second, "chat").await;

    first.offer("chat", &Greeting::new("one")).await.unwrap();
    first.offer("chat", &Greeting::new("two")).await.unwrap();

    assert!(eventually(|| first_seen.lock().len() == 2 && second_seen.lock().len() == 2).await);
    first.close().await;
    second.close().await;

    assert_eq!(*first_seen.lock(), vec!["one", "two"]);
    assert_eq!(*second_seen.lock(), vec!["one", "two"]);
}

#[tokio::test]
async fn test_producer_feeds_typed_consumer() {
    let backend = Arc::new(MemoryBackend::<String>::new());
    let listener = facade(&backend, "audit");
    let seen = subscribe(&listener, Greeting::topic_id()).await;

    let producer = Producer::new(backend.clone());
    producer.offer(&Greeting::new("hello")).await.unwrap();

    assert!(eventually(|| seen.lock().len() == 1).await);
    listener.close().await;
    assert_eq!(*seen.lock(), vec!["hello"]);
    assert_eq!(backend.length_group(Greeting::topic_id(), "audit").await.unwrap(), 0);
}

#[tokio::test]
async fn test_failing_callback_retried_after_rest_of_backlog() {
    let backend = Arc::new(MemoryBackend::<String>::new());
    let listener = facade(&backend, "retry");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let failed_once = Arc::new(AtomicUsize::new(0));
    let sink = seen.clone();
    let failures = failed_once.clone();
    listener
        .add_consumer("s", move |greeting: Greeting| {
            let sink = sink.clone();
            let failures = failures.clone();
            async move {
                sink.lock().push(greeting.text.clone());
                if greeting.text == "m2" && failures.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err("transient".into());
                }
                Ok(())
            }
        })
        .await
        .unwrap();

    // publish all three before the poller sees any of them
    for text in ["m1", "m2", "m3"] {
        backend
            .offer("s", Greeting::codec().encode(&Greeting::new(text)).unwrap())
            .await
            .unwrap();
    }

    assert!(eventually(|| seen.lock().len() == 4).await);
    listener.close().await;

    assert_eq!(*seen.lock(), vec!["m1", "m2", "m3", "m2"]);
}

#[tokio::test]
async fn test_close_stops_all_pollers() {
    let backend = Arc::new(MemoryBackend::<String>::new());
    let listener = facade(&backend, "closing");

    let calls = Arc::new(AtomicUsize::new(0));
    for stream_id in ["a", "b", "c"] {
        let calls = calls.clone();
        listener
            .add_consumer(stream_id, move |_greeting: Greeting| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
    }
    assert_eq!(listener.consumer_count(), 3);

    listener.close().await;
    assert_eq!(listener.consumer_count(), 0);

    listener.offer("a", &Greeting::new("late")).await.unwrap();
    tokio::time::sleep(POLL * 5).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(backend.length_group("a", "closing").await.unwrap(), 1);
}

#[tokio::test]
async fn test_close_waits_for_in_flight_callback() {
    let backend = Arc::new(MemoryBackend::<String>::new());
    let listener = facade(&backend, "drain");

    let finished = Arc::new(AtomicUsize::new(0));
    let done = finished.clone();
    listener
        .add_consumer("s", move |_greeting: Greeting| {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

    listener.offer("s", &Greeting::new("slow")).await.unwrap();
    // let the poller pick the message up
    tokio::time::sleep(POLL * 3).await;

    listener.close().await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(backend.length_group("s", "drain").await.unwrap(), 0);
}

#[test]
fn test_facade_accessors() {
    let backend = Arc::new(MemoryBackend::<String>::new());
    let listener = facade(&backend, "meta");

    assert_eq!(listener.name(), "meta-listener");
    assert_eq!(listener.consumer_group_name(), "meta");
    assert_eq!(listener.poll_interval(), POLL);
    assert!(!listener.is_closed());
}
