use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use groupstream_core::{
    logging, Codec, Config, ConsumerOptions, JsonCodec, MemoryBackend, Producer, StreamBackend,
    TypedMessage, TypedStream,
};
use groupstream_redis::RedisStreamBackend;

/// How long to wait for both groups to drain before giving up
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Memory,
    Redis,
}

/// Publish greetings and fan them out to two consumer groups
#[derive(Debug, Parser)]
#[command(name = "groupstream", version)]
struct Cli {
    /// Path to a config file (toml, yaml or json)
    #[arg(short, long, env = "GROUPSTREAM_CONFIG")]
    config: Option<String>,

    #[arg(short, long, value_enum, default_value_t = BackendKind::Memory)]
    backend: BackendKind,

    /// Number of greetings to publish
    #[arg(short = 'n', long, default_value_t = 10)]
    count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Greeting {
    seq: usize,
    text: String,
}

impl TypedMessage for Greeting {
    fn topic_id() -> &'static str {
        "demo.greetings"
    }

    fn codec() -> Arc<dyn Codec<Self>> {
        Arc::new(JsonCodec::new())
    }
}

/// Consumer name prefix unique to this host
fn consumer_prefix(base: &str) -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{base}-{hostname}")
}

async fn build_backend(kind: BackendKind, config: &Config) -> Result<Arc<dyn StreamBackend<String>>> {
    let backend: Arc<dyn StreamBackend<String>> = match kind {
        BackendKind::Memory => Arc::new(MemoryBackend::<String>::from_config(&config.memory)),
        BackendKind::Redis => {
            let mut redis_config = config.redis.clone();
            redis_config.consumer_prefix = consumer_prefix(&redis_config.consumer_prefix);
            Arc::new(RedisStreamBackend::connect(redis_config).await?)
        }
    };
    Ok(backend)
}

/// Register a facade that counts what it receives
async fn listen(
    backend: Arc<dyn StreamBackend<String>>,
    group: &str,
    config: &Config,
) -> Result<(TypedStream<Greeting>, Arc<AtomicUsize>)> {
    let stream = TypedStream::new(
        backend,
        Greeting::codec(),
        ConsumerOptions::from_config(format!("{group}-listener"), group, &config.poller),
    );

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let name = group.to_string();
    stream
        .add_consumer(Greeting::topic_id(), move |greeting: Greeting| {
            let counter = counter.clone();
            let name = name.clone();
            async move {
                info!(group = %name, seq = greeting.seq, text = %greeting.text, "Received greeting");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await?;

    Ok((stream, received))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = Config::load(cli.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(backend = ?cli.backend, count = cli.count, "groupstream demo starting");

    // 3. Backend shared by every facade and the producer
    let backend = build_backend(cli.backend, &config).await?;

    // 4. Two independent subscribers on the same stream
    let (audit, audit_received) = listen(backend.clone(), "audit", &config).await?;
    let (mailer, mailer_received) = listen(backend.clone(), "mailer", &config).await?;

    // 5. Publish
    let producer = Producer::new(backend);
    for seq in 0..cli.count {
        producer
            .offer(&Greeting {
                seq,
                text: format!("hello #{seq}"),
            })
            .await?;
    }
    info!(count = cli.count, topic = Greeting::topic_id(), "Published greetings");

    // 6. Wait for both groups to drain
    let drained = async {
        while audit_received.load(Ordering::SeqCst) < cli.count
            || mailer_received.load(Ordering::SeqCst) < cli.count
        {
            tokio::time::sleep(config.poller.poll_interval()).await;
        }
    };

    tokio::select! {
        () = drained => info!("Both consumer groups drained"),
        () = tokio::time::sleep(DRAIN_TIMEOUT) => warn!("Timed out waiting for consumers"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    // 7. Graceful shutdown
    audit.close().await;
    mailer.close().await;

    info!(
        audit = audit_received.load(Ordering::SeqCst),
        mailer = mailer_received.load(Ordering::SeqCst),
        "groupstream demo finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["groupstream"]);
        assert_eq!(cli.backend, BackendKind::Memory);
        assert_eq!(cli.count, 10);
    }

    #[test]
    fn test_cli_redis_backend() {
        let cli = Cli::parse_from(["groupstream", "--backend", "redis", "-n", "3"]);
        assert_eq!(cli.backend, BackendKind::Redis);
        assert_eq!(cli.count, 3);
    }

    #[test]
    fn test_consumer_prefix_includes_base() {
        assert!(consumer_prefix("worker").starts_with("worker-"));
    }

    #[tokio::test]
    async fn test_memory_fan_out() {
        let config = Config::default();
        let backend = build_backend(BackendKind::Memory, &config).await.unwrap();
        let (audit, audit_received) = listen(backend.clone(), "audit", &config).await.unwrap();
        let (mailer, mailer_received) = listen(backend.clone(), "mailer", &config).await.unwrap();

        let producer = Producer::new(backend);
        for seq in 0..3 {
            producer
                .offer(&Greeting {
                    seq,
                    text: "hi".to_string(),
                })
                .await
                .unwrap();
        }

        for _ in 0..100 {
            if audit_received.load(Ordering::SeqCst) == 3 && mailer_received.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        audit.close().await;
        mailer.close().await;

        assert_eq!(audit_received.load(Ordering::SeqCst), 3);
        assert_eq!(mailer_received.load(Ordering::SeqCst), 3);
    }
}
