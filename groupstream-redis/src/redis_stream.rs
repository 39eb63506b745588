//! Redis Streams backend
//!
//! Every stream id maps to one Redis stream key and every consumer group to a
//! native Redis consumer group, so group cursors and pending-entry lists live
//! in Redis and survive process restarts.
//!
//! Redelivery policy: when a handler fails the error is returned to the
//! caller and the entry stays in the group's pending-entries list without an
//! acknowledgement. Once it has been idle for longer than the claim timeout,
//! the next `consume` from any process reclaims it with `XAUTOCLAIM`. A
//! process that crashes mid-delivery therefore delays a message by at most
//! one claim timeout.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamMaxlen, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client as RedisClient, RedisResult};
use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;
use tokio::time::{error::Elapsed, timeout};
use tracing::{debug, info, warn};

use groupstream_core::{Error, Handler, RedisStreamConfig, Result, StreamBackend};

/// Entry field holding the payload
const VALUE_FIELD: &str = "value";

/// Start id for `XAUTOCLAIM` scans; also returned once a scan wraps around
const CLAIM_SCAN_START: &str = "0-0";

/// Durable [`StreamBackend`] on top of Redis Streams
///
/// The connection is supplied by the caller and may be shared with other
/// backends; `ConnectionManager` reconnects on its own, but a command that
/// fails is reported as [`Error::Unavailable`] and never retried here.
pub struct RedisStreamBackend {
    conn: ConnectionManager,
    config: RedisStreamConfig,
    /// Unique per backend instance so pending entries can be attributed
    consumer_name: String,
    /// `(key, group)` pairs known to exist
    known_groups: DashSet<(String, String)>,
    /// Where the next `XAUTOCLAIM` scan resumes, per `(key, group)`
    claim_cursors: DashMap<(String, String), String>,
}

impl RedisStreamBackend {
    /// Create a backend over an existing connection
    pub fn new(conn: ConnectionManager, config: RedisStreamConfig) -> Result<Self> {
        if config.consumer_group.trim().is_empty() {
            return Err(Error::Configuration(
                "consumer group name must not be empty".to_string(),
            ));
        }
        if config.claim_timeout_ms == 0 {
            return Err(Error::Configuration(
                "claim timeout must be greater than 0".to_string(),
            ));
        }
        if config.operation_timeout_ms == 0 {
            return Err(Error::Configuration(
                "operation timeout must be greater than 0".to_string(),
            ));
        }

        let consumer_name = format!("{}-{}", config.consumer_prefix, nanoid::nanoid!(8));
        info!(
            consumer = %consumer_name,
            default_group = %config.consumer_group,
            claim_timeout_ms = config.claim_timeout_ms,
            "Redis stream backend created"
        );

        Ok(Self {
            conn,
            config,
            consumer_name,
            known_groups: DashSet::new(),
            claim_cursors: DashMap::new(),
        })
    }

    /// Open a connection to `config.url` and create a backend on it
    pub async fn connect(config: RedisStreamConfig) -> Result<Self> {
        let client = RedisClient::open(config.url.as_str())
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        let conn = match timeout(config.operation_timeout(), ConnectionManager::new(client)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(Error::Unavailable(format!("Failed to connect to Redis: {e}")));
            }
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "Timed out connecting to Redis after {}ms",
                    config.operation_timeout_ms
                )));
            }
        };

        Self::new(conn, config)
    }

    #[must_use]
    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    #[must_use]
    pub const fn config(&self) -> &RedisStreamConfig {
        &self.config
    }

    fn stream_key(&self, stream_id: &str) -> String {
        format!("{}{}", self.config.key_prefix, stream_id)
    }

    /// Bound a Redis command by the operation timeout and map its failure
    async fn run<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let outcome = timeout(self.config.operation_timeout(), fut).await;
        self.finish(op, outcome)
    }

    /// Like [`run`](Self::run) for commands against a consumer group
    ///
    /// A `NOGROUP` reply means the key or group vanished, so the group is
    /// forgotten and re-created on the next call.
    async fn run_in_group<T, F>(&self, op: &str, key: &str, group: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let outcome = timeout(self.config.operation_timeout(), fut).await;
        if let Ok(Err(e)) = &outcome {
            if is_missing_group(&e.to_string()) {
                warn!(key = %key, group = %group, "Consumer group disappeared, will re-create");
                self.forget_group(key, group);
            }
        }
        self.finish(op, outcome)
    }

    fn finish<T>(&self, op: &str, outcome: std::result::Result<RedisResult<T>, Elapsed>) -> Result<T> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::Unavailable(format!("{op} failed: {e}"))),
            Err(_) => Err(Error::Timeout(format!(
                "{op} timed out after {}ms",
                self.config.operation_timeout_ms
            ))),
        }
    }

    fn forget_group(&self, key: &str, group: &str) {
        let pair = (key.to_string(), group.to_string());
        self.known_groups.remove(&pair);
        self.claim_cursors.remove(&pair);
    }

    async fn ensure_group(&self, stream_id: &str, key: &str, group: &str) -> Result<()> {
        if self
            .known_groups
            .contains(&(key.to_string(), group.to_string()))
        {
            return Ok(());
        }
        self.init_group(stream_id, group).await
    }

    /// Take over one entry that has been pending longer than the claim timeout
    ///
    /// Each call scans a bounded window of the pending list and resumes where
    /// the previous one stopped, so entries behind a run of recently failed
    /// ones are still reached.
    async fn reclaim(&self, key: &str, group: &str) -> Result<Option<StreamId>> {
        let pair = (key.to_string(), group.to_string());
        let start = self
            .claim_cursors
            .get(&pair)
            .map_or_else(|| CLAIM_SCAN_START.to_string(), |cursor| cursor.value().clone());

        let mut conn = self.conn.clone();
        let reply: StreamAutoClaimReply = self
            .run_in_group(
                "XAUTOCLAIM",
                key,
                group,
                conn.xautoclaim_options(
                    key,
                    group,
                    &self.consumer_name,
                    self.config.claim_timeout_ms,
                    start.as_str(),
                    StreamAutoClaimOptions::default().count(1),
                ),
            )
            .await?;

        match next_scan_start(&reply.next_stream_id) {
            Some(next) => {
                self.claim_cursors.insert(pair, next.to_string());
            }
            None => {
                self.claim_cursors.remove(&pair);
            }
        }

        Ok(reply.claimed.into_iter().next())
    }

    /// Read one never-delivered entry for this consumer
    async fn read_new(&self, key: &str, group: &str) -> Result<Option<StreamId>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, &self.consumer_name)
            .count(1);
        let reply: Option<StreamReadReply> = self
            .run_in_group(
                "XREADGROUP",
                key,
                group,
                conn.xread_options(&[key], &[">"], &options),
            )
            .await?;

        Ok(reply
            .and_then(|reply| reply.keys.into_iter().next())
            .and_then(|stream_key| stream_key.ids.into_iter().next()))
    }

    async fn ack(&self, key: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let acked: usize = self
            .run_in_group("XACK", key, group, conn.xack(key, group, &[entry_id]))
            .await?;
        if acked == 0 {
            // Another consumer reclaimed and acknowledged it first
            debug!(key = %key, group = %group, entry_id = %entry_id, "Entry was already acknowledged");
        }
        Ok(())
    }

    /// Number of entries after `last_delivered_id`, for servers that do not report lag
    async fn count_after(&self, key: &str, last_delivered_id: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let start = format!("({last_delivered_id}");
        let reply: StreamRangeReply = self
            .run("XRANGE", conn.xrange(key, start.as_str(), "+"))
            .await?;
        Ok(reply.ids.len())
    }
}

fn is_busy_group(message: &str) -> bool {
    message.contains("BUSYGROUP")
}

fn is_missing_group(message: &str) -> bool {
    message.contains("NOGROUP")
}

/// Cursor to resume the next `XAUTOCLAIM` from; `None` restarts the scan
fn next_scan_start(reply_next: &str) -> Option<&str> {
    if reply_next.is_empty() || reply_next == CLAIM_SCAN_START {
        None
    } else {
        Some(reply_next)
    }
}

/// Read an integer field of an `XINFO GROUPS` row
fn info_count(row: &HashMap<String, Option<String>>, field: &str) -> Option<usize> {
    row.get(field)?.as_deref()?.parse().ok()
}

#[async_trait]
impl StreamBackend<String> for RedisStreamBackend {
    fn default_group(&self) -> &str {
        self.config.default_consumer_group_name()
    }

    async fn init_group(&self, stream_id: &str, group: &str) -> Result<()> {
        let key = self.stream_key(stream_id);
        let mut conn = self.conn.clone();

        let created: RedisResult<()> = match timeout(
            self.config.operation_timeout(),
            conn.xgroup_create_mkstream(&key, group, "$"),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "XGROUP CREATE timed out after {}ms",
                    self.config.operation_timeout_ms
                )));
            }
        };

        match created {
            Ok(()) => {
                info!(stream_id = %stream_id, group = %group, "Created consumer group");
            }
            Err(e) if is_busy_group(&e.to_string()) => {
                debug!(stream_id = %stream_id, group = %group, "Consumer group already exists");
            }
            Err(e) => {
                warn!(stream_id = %stream_id, group = %group, error = %e, "Failed to create consumer group");
                return Err(Error::Unavailable(format!("XGROUP CREATE failed: {e}")));
            }
        }

        self.known_groups.insert((key, group.to_string()));
        Ok(())
    }

    async fn offer(&self, stream_id: &str, value: String) -> Result<()> {
        let key = self.stream_key(stream_id);
        let mut conn = self.conn.clone();
        let fields = [(VALUE_FIELD, value.as_str())];

        let entry_id: String = match self.config.max_stream_length {
            Some(max_len) => {
                self.run(
                    "XADD",
                    conn.xadd_maxlen(&key, StreamMaxlen::Approx(max_len), "*", &fields),
                )
                .await?
            }
            None => self.run("XADD", conn.xadd(&key, "*", &fields)).await?,
        };

        debug!(stream_id = %stream_id, entry_id = %entry_id, "Offered entry");
        Ok(())
    }

    async fn consume_group(
        &self,
        stream_id: &str,
        group: &str,
        handler: &Handler<String>,
    ) -> Result<bool> {
        let key = self.stream_key(stream_id);
        self.ensure_group(stream_id, &key, group).await?;

        let entry = match self.reclaim(&key, group).await? {
            Some(entry) => {
                warn!(
                    stream_id = %stream_id,
                    group = %group,
                    entry_id = %entry.id,
                    consumer = %self.consumer_name,
                    "Reclaimed entry idle past claim timeout"
                );
                entry
            }
            None => match self.read_new(&key, group).await? {
                Some(entry) => entry,
                None => return Ok(false),
            },
        };

        let Some(payload) = entry.get::<String>(VALUE_FIELD) else {
            // Unreadable entries would otherwise be reclaimed forever
            self.ack(&key, group, &entry.id).await?;
            return Err(Error::Codec(format!(
                "entry {} in {key} has no '{VALUE_FIELD}' field",
                entry.id
            )));
        };

        let started = Instant::now();
        let outcome = handler(payload).await;
        let elapsed = started.elapsed();

        if elapsed > self.config.consumer_warn_timeout() {
            warn!(
                stream_id = %stream_id,
                group = %group,
                entry_id = %entry.id,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                claim_timeout_ms = self.config.claim_timeout_ms,
                "Slow consumer; entry may be reclaimed by another consumer"
            );
        }

        match outcome {
            Ok(()) => {
                self.ack(&key, group, &entry.id).await?;
                debug!(stream_id = %stream_id, group = %group, entry_id = %entry.id, "Entry acknowledged");
                Ok(true)
            }
            Err(e) => {
                warn!(
                    stream_id = %stream_id,
                    group = %group,
                    entry_id = %entry.id,
                    error = %e,
                    "Handler failed, entry left pending until claim timeout"
                );
                Err(Error::Handler(e))
            }
        }
    }

    async fn length_group(&self, stream_id: &str, group: &str) -> Result<usize> {
        let key = self.stream_key(stream_id);
        let mut conn = self.conn.clone();

        let exists: bool = self.run("EXISTS", conn.exists(&key)).await?;
        if !exists {
            return Ok(0);
        }

        let rows: Vec<HashMap<String, Option<String>>> = self
            .run(
                "XINFO GROUPS",
                redis::cmd("XINFO")
                    .arg("GROUPS")
                    .arg(&key)
                    .query_async(&mut conn),
            )
            .await?;

        let Some(row) = rows
            .iter()
            .find(|row| row.get("name").and_then(Option::as_deref) == Some(group))
        else {
            // A group created now starts at the tail
            return Ok(0);
        };

        let pending = info_count(row, "pending").unwrap_or(0);
        let undelivered = match info_count(row, "lag") {
            Some(lag) => lag,
            None => {
                let last_delivered = row
                    .get("last-delivered-id")
                    .and_then(Option::as_deref)
                    .unwrap_or("0-0")
                    .to_string();
                self.count_after(&key, &last_delivered).await?
            }
        };

        Ok(pending + undelivered)
    }
}
