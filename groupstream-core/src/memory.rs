//! In-process stream backend
//!
//! Keeps every stream in memory. Each stream is an entry log shared by all of
//! its consumer groups; each group tracks its own cursor into the log plus a
//! pending set of messages whose handler failed.
//!
//! Redelivery policy: a failed message is parked in the group's pending set
//! and `consume` returns `Ok(false)`. The cursor keeps advancing, and pending
//! entries are retried (oldest first) only once the group has caught up with
//! the tail. A checked-out message that is never settled, because the
//! consume future was dropped or the handler panicked, is parked in the
//! pending set as well. Nothing survives the process.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::{Handler, StreamBackend};
use crate::config::MemoryConfig;
use crate::error::Result;

/// Group name used when none is configured
pub const DEFAULT_GROUP: &str = "default";

struct Entry<T> {
    seq: u64,
    value: T,
}

/// A delivered message whose handler failed
struct PendingEntry<T> {
    value: T,
    failed_at: Instant,
    deliveries: u32,
}

struct GroupState<T> {
    /// Sequence number of the next never-delivered entry
    cursor: u64,
    /// Failed entries keyed by original sequence, so retries stay in offer order
    pending: BTreeMap<u64, PendingEntry<T>>,
    /// Entries handed to a handler that has not finished yet
    in_flight: usize,
}

impl<T> GroupState<T> {
    const fn at(cursor: u64) -> Self {
        Self {
            cursor,
            pending: BTreeMap::new(),
            in_flight: 0,
        }
    }
}

/// A message checked out of a group for one handler invocation
struct Delivery<T> {
    seq: u64,
    value: T,
    deliveries: u32,
}

struct StreamState<T> {
    entries: VecDeque<Entry<T>>,
    next_seq: u64,
    groups: HashMap<String, GroupState<T>>,
}

impl<T: Clone> StreamState<T> {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 0,
            groups: HashMap::new(),
        }
    }

    /// Sequence number of the oldest retained entry
    fn base_seq(&self) -> u64 {
        self.next_seq - self.entries.len() as u64
    }

    fn ensure_group(&mut self, stream_id: &str, group: &str) -> &mut GroupState<T> {
        let tail = self.next_seq;
        self.groups.entry(group.to_string()).or_insert_with(|| {
            info!(
                stream_id = %stream_id,
                group = %group,
                cursor = tail,
                "Created consumer group"
            );
            GroupState::at(tail)
        })
    }

    fn push(&mut self, value: T) -> u64 {
        let seq = self.next_seq;
        self.entries.push_back(Entry { seq, value });
        self.next_seq += 1;
        self.compact();
        seq
    }

    /// Pop the next deliverable message for `group`
    ///
    /// Never-delivered entries come first; pending entries are only retried
    /// once the cursor has reached the tail.
    fn checkout(&mut self, stream_id: &str, group: &str) -> Option<Delivery<T>> {
        let base = self.base_seq();
        let tail = self.next_seq;
        self.ensure_group(stream_id, group);
        let state = self.groups.get_mut(group)?;

        let delivery = if state.cursor < tail {
            let seq = state.cursor;
            let index = usize::try_from(seq - base).ok()?;
            let value = self.entries.get(index)?.value.clone();
            state.cursor += 1;
            Delivery {
                seq,
                value,
                deliveries: 1,
            }
        } else {
            let (seq, pending) = state.pending.pop_first()?;
            debug!(
                stream_id = %stream_id,
                group = %group,
                seq = seq,
                idle_ms = u64::try_from(pending.failed_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Retrying pending entry"
            );
            Delivery {
                seq,
                value: pending.value,
                deliveries: pending.deliveries + 1,
            }
        };
        state.in_flight += 1;
        self.compact();

        Some(delivery)
    }

    /// Record the outcome of a checked-out delivery
    fn settle(&mut self, group: &str, delivery: Delivery<T>, acked: bool) {
        let Some(state) = self.groups.get_mut(group) else {
            return;
        };
        state.in_flight = state.in_flight.saturating_sub(1);
        if !acked {
            state.pending.insert(
                delivery.seq,
                PendingEntry {
                    value: delivery.value,
                    failed_at: Instant::now(),
                    deliveries: delivery.deliveries,
                },
            );
        }
    }

    /// Drop entries that every group has already read past
    ///
    /// With no groups nothing is retained: a group created later starts at
    /// the tail.
    fn compact(&mut self) {
        let min_cursor = self
            .groups
            .values()
            .map(|g| g.cursor)
            .min()
            .unwrap_or(self.next_seq);
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.seq < min_cursor)
        {
            self.entries.pop_front();
        }
    }

    fn outstanding(&self, group: &str) -> usize {
        match self.groups.get(group) {
            Some(state) => {
                let undelivered = usize::try_from(self.next_seq - state.cursor).unwrap_or(usize::MAX);
                undelivered + state.pending.len() + state.in_flight
            }
            // A group created now starts at the tail
            None => 0,
        }
    }
}

/// A delivery owned by one `consume_group` call
///
/// Settled as a failure when dropped without [`ack`](Self::ack) or
/// [`nack`](Self::nack), so the entry returns to the pending set.
struct Checkout<T: Clone> {
    stream: Arc<Mutex<StreamState<T>>>,
    stream_id: String,
    group: String,
    delivery: Option<Delivery<T>>,
}

impl<T: Clone> Checkout<T> {
    fn ack(mut self) {
        if let Some(delivery) = self.delivery.take() {
            self.stream.lock().settle(&self.group, delivery, true);
        }
    }

    fn nack(mut self) {
        if let Some(delivery) = self.delivery.take() {
            self.stream.lock().settle(&self.group, delivery, false);
        }
    }
}

impl<T: Clone> Drop for Checkout<T> {
    fn drop(&mut self) {
        if let Some(delivery) = self.delivery.take() {
            warn!(
                stream_id = %self.stream_id,
                group = %self.group,
                seq = delivery.seq,
                "Delivery abandoned before settling, entry moved to pending"
            );
            self.stream.lock().settle(&self.group, delivery, false);
        }
    }
}

/// In-memory [`StreamBackend`] for a single process
///
/// Cloning is cheap and clones share the same streams.
#[derive(Clone)]
pub struct MemoryBackend<T> {
    streams: Arc<DashMap<String, Arc<Mutex<StreamState<T>>>>>,
    default_group: Arc<str>,
}

impl<T> MemoryBackend<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a backend whose default group is [`DEFAULT_GROUP`]
    #[must_use]
    pub fn new() -> Self {
        Self::with_default_group(DEFAULT_GROUP)
    }

    #[must_use]
    pub fn with_default_group(group: &str) -> Self {
        Self {
            streams: Arc::new(DashMap::new()),
            default_group: Arc::from(group),
        }
    }

    #[must_use]
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::with_default_group(&config.default_group)
    }

    /// Number of streams created so far
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Age of the oldest failed entry waiting in `group`, if any
    #[must_use]
    pub fn oldest_pending_age(&self, stream_id: &str, group: &str) -> Option<Duration> {
        let stream = self.streams.get(stream_id)?.clone();
        let state = stream.lock();
        state
            .groups
            .get(group)?
            .pending
            .values()
            .map(|p| p.failed_at.elapsed())
            .max()
    }

    fn stream(&self, stream_id: &str) -> Arc<Mutex<StreamState<T>>> {
        self.streams
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(StreamState::new())))
            .clone()
    }
}

impl<T> Default for MemoryBackend<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> StreamBackend<T> for MemoryBackend<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default_group(&self) -> &str {
        &self.default_group
    }

    async fn init_group(&self, stream_id: &str, group: &str) -> Result<()> {
        self.stream(stream_id).lock().ensure_group(stream_id, group);
        Ok(())
    }

    async fn offer(&self, stream_id: &str, value: T) -> Result<()> {
        let seq = self.stream(stream_id).lock().push(value);
        debug!(stream_id = %stream_id, seq = seq, "Offered entry");
        Ok(())
    }

    async fn consume_group(
        &self,
        stream_id: &str,
        group: &str,
        handler: &Handler<T>,
    ) -> Result<bool> {
        let stream = self.stream(stream_id);

        // The lock is released before the handler runs; the checkout owns
        // the entry until it is settled or dropped.
        let Some(delivery) = stream.lock().checkout(stream_id, group) else {
            return Ok(false);
        };
        let (seq, deliveries, value) = (delivery.seq, delivery.deliveries, delivery.value.clone());
        let checkout = Checkout {
            stream: stream.clone(),
            stream_id: stream_id.to_string(),
            group: group.to_string(),
            delivery: Some(delivery),
        };

        match handler(value).await {
            Ok(()) => {
                checkout.ack();
                debug!(
                    stream_id = %stream_id,
                    group = %group,
                    seq = seq,
                    deliveries = deliveries,
                    "Entry acknowledged"
                );
                Ok(true)
            }
            Err(e) => {
                checkout.nack();
                warn!(
                    stream_id = %stream_id,
                    group = %group,
                    seq = seq,
                    deliveries = deliveries,
                    error = %e,
                    "Handler failed, entry moved to pending"
                );
                Ok(false)
            }
        }
    }

    async fn length_group(&self, stream_id: &str, group: &str) -> Result<usize> {
        let Some(stream) = self.streams.get(stream_id).map(|s| s.clone()) else {
            return Ok(0);
        };
        let outstanding = stream.lock().outstanding(group);
        Ok(outstanding)
    }
}
