//! Append-only per-stream event log for resumable streams.
//!
//! While a turn is generating, the transport appends every outbound event
//! here; a client that disconnects re-reads from its last seen offset and
//! catches up. Ids are assigned server-side as a per-stream counter
//! (decimal strings "1", "2", …), never derived from wall clock, so
//! `read(after)` has an unambiguous resume point and ids are strictly
//! increasing within a stream. Order across streams is unspecified.
//!
//! The in-memory backend bounds its footprint with a TTL from stream
//! creation; expired streams are observed as absent. Persistent backends
//! may implement the same trait with identical semantics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// One event in a resumable stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Monotonic per-stream id, assigned by the store on append. Caller
    /// values are ignored.
    pub id: String,

    /// Event type (`token`, `tool_call`, `preamble_end`, `file_open`,
    /// `file_change`, `compact`, `error`, `done`).
    #[serde(rename = "type")]
    pub event_type: String,

    /// Opaque payload, JSON-encoded by the producer.
    pub data: String,

    /// Producer timestamp, seconds since the epoch.
    pub timestamp: f64,
}

impl StreamEvent {
    /// Creates an event with an unassigned id, stamped now.
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            id: String::new(),
            event_type: event_type.into(),
            data: data.into(),
            timestamp,
        }
    }
}

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// The producer is still appending.
    Generating,
    /// The producer finished normally.
    Completed,
    /// The producer aborted.
    Failed,
}

/// Snapshot of a stream's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub stream_id: String,
    pub state: StreamState,
    pub event_count: usize,
}

/// Storage seam for resumable streams.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends an event, assigning the next id. The stream is created
    /// implicitly in the `generating` state on first append.
    async fn append(&self, stream_id: &str, event: StreamEvent) -> Result<()>;

    /// Reads at most `count` events strictly after id `after` (from the
    /// start when `None`), in append order. Unknown streams and unknown
    /// `after` ids read as empty.
    async fn read(
        &self,
        stream_id: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEvent>>;

    /// The stream's status, or `None` when absent or expired.
    async fn get_status(&self, stream_id: &str) -> Result<Option<StreamStatus>>;

    /// Marks the stream completed.
    async fn mark_complete(&self, stream_id: &str) -> Result<()>;

    /// Marks the stream failed.
    async fn mark_failed(&self, stream_id: &str) -> Result<()>;
}

// ============================================================================
// MEMORY BACKEND
// ============================================================================

struct StreamData {
    events: Vec<StreamEvent>,
    state: StreamState,
    created_at: Instant,
    counter: u64,
}

impl StreamData {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            state: StreamState::Generating,
            created_at: Instant::now(),
            counter: 0,
        }
    }
}

/// TTL-bounded in-memory event store for single-process deployments.
pub struct MemoryEventStore {
    ttl: Duration,
    streams: Mutex<HashMap<String, StreamData>>,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_STORE_TTL)
    }
}

impl MemoryEventStore {
    /// Creates a store whose streams expire `ttl` after creation.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamData>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drops the stream when expired; returns whether it is still live.
    fn prune_expired(streams: &mut HashMap<String, StreamData>, stream_id: &str, ttl: Duration) -> bool {
        match streams.get(stream_id) {
            Some(data) if data.created_at.elapsed() > ttl => {
                streams.remove(stream_id);
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, stream_id: &str, event: StreamEvent) -> Result<()> {
        // The store lock serializes appends, which is what keeps ids
        // monotonic within a stream.
        let mut streams = self.lock();
        let data = streams
            .entry(stream_id.to_string())
            .or_insert_with(StreamData::new);

        data.counter += 1;
        data.events.push(StreamEvent {
            id: data.counter.to_string(),
            event_type: event.event_type,
            data: event.data,
            timestamp: event.timestamp,
        });
        Ok(())
    }

    async fn read(
        &self,
        stream_id: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEvent>> {
        let mut streams = self.lock();
        if !Self::prune_expired(&mut streams, stream_id, self.ttl) {
            return Ok(Vec::new());
        }
        let events = &streams[stream_id].events;

        let start = match after {
            None => 0,
            Some(after_id) => match events.iter().position(|e| e.id == after_id) {
                Some(pos) => pos + 1,
                // Unknown offsets read as empty rather than replaying from
                // the start; the client's cursor is not ours to guess.
                None => return Ok(Vec::new()),
            },
        };

        Ok(events[start..].iter().take(count).cloned().collect())
    }

    async fn get_status(&self, stream_id: &str) -> Result<Option<StreamStatus>> {
        let mut streams = self.lock();
        if !Self::prune_expired(&mut streams, stream_id, self.ttl) {
            return Ok(None);
        }
        let data = &streams[stream_id];
        Ok(Some(StreamStatus {
            stream_id: stream_id.to_string(),
            state: data.state,
            event_count: data.events.len(),
        }))
    }

    async fn mark_complete(&self, stream_id: &str) -> Result<()> {
        if let Some(data) = self.lock().get_mut(stream_id) {
            data.state = StreamState::Completed;
        }
        Ok(())
    }

    async fn mark_failed(&self, stream_id: &str) -> Result<()> {
        if let Some(data) = self.lock().get_mut(stream_id) {
            data.state = StreamState::Failed;
        }
        Ok(())
    }
}
