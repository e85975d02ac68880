use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::db::{NewReading, RecordId, RecordStore, StoreError};
use crate::packet::{DecodeError, TelemetryPacket};
use crate::utils::{from_ms, MonotonicClock};

/// What happens to a decoded reading the store refused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IngestionPolicy {
    /// One attempt; a refused reading is logged and dropped.
    #[default]
    BestEffort,
    /// Repeat unavailable or timed-out appends up to `attempts` more times.
    /// Every attempt carries the same acceptance key, so a write that did
    /// commit is never stored twice.
    Retry { attempts: u32, backoff: Duration },
}

impl FromStr for IngestionPolicy {
    type Err = String;

    /// `best-effort` or `retry:<attempts>:<backoff_ms>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "best-effort" {
            return Ok(IngestionPolicy::BestEffort);
        }

        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("retry"), Some(attempts), Some(backoff_ms), None) => {
                let attempts = attempts
                    .parse()
                    .map_err(|e| format!("invalid retry attempts '{attempts}': {e}"))?;
                let backoff_ms: u64 = backoff_ms
                    .parse()
                    .map_err(|e| format!("invalid retry backoff '{backoff_ms}': {e}"))?;
                Ok(IngestionPolicy::Retry {
                    attempts,
                    backoff: Duration::from_millis(backoff_ms),
                })
            }
            _ => Err(format!(
                "unknown ingestion policy '{s}' (expected best-effort or retry:<attempts>:<backoff_ms>)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerState::Disconnected => "DISCONNECTED",
            ListenerState::Connecting => "CONNECTING",
            ListenerState::Connected => "CONNECTED",
            ListenerState::Subscribed => "SUBSCRIBED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
#[allow(unused)]
pub enum IngestOutcome {
    Stored(RecordId),
    /// The store did not answer; the reading may or may not be stored.
    Unconfirmed(StoreError),
    Dropped(StoreError),
}

/// Turns telemetry messages into stored readings.
///
/// The transport drives the connection state through `connecting`,
/// `connected`, `subscribed` and `dropped`. Each accepted message is written
/// by its own task so a slow or failing write never holds up the next one.
pub struct IngestListener<S> {
    store: Arc<S>,
    topic: String,
    policy: IngestionPolicy,
    clock: MonotonicClock,
    state: ListenerState,
}

impl<S: RecordStore> IngestListener<S> {
    pub fn new(store: Arc<S>, topic: impl Into<String>, policy: IngestionPolicy) -> Self {
        Self {
            store,
            topic: topic.into(),
            policy,
            clock: MonotonicClock::new(),
            state: ListenerState::Disconnected,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn connecting(&mut self) {
        self.transition(ListenerState::Connecting);
    }

    /// The caller issues the telemetry subscription after this.
    pub fn connected(&mut self) {
        self.transition(ListenerState::Connected);
    }

    pub fn subscribed(&mut self, granted: bool) {
        if self.state != ListenerState::Connected {
            warn!("[INGEST] Ignoring subscription result in state {}", self.state);
            return;
        }
        if granted {
            info!("[INGEST] Subscribed to data topic: {}", self.topic);
            self.transition(ListenerState::Subscribed);
        } else {
            error!("[INGEST] Subscription to {} refused by broker", self.topic);
        }
    }

    pub fn dropped(&mut self) {
        self.transition(ListenerState::Connecting);
    }

    fn transition(&mut self, next: ListenerState) {
        if self.state != next {
            debug!("[INGEST] {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Decodes a message and stamps it with its acceptance time and key.
    /// Messages on other topics and undecodable payloads yield `None`.
    pub fn accept(&self, topic: &str, payload: &[u8]) -> Option<NewReading> {
        if topic != self.topic {
            debug!("[INGEST] Ignoring message on topic {topic}");
            return None;
        }

        match TelemetryPacket::decode(payload) {
            Ok(m) => Some(NewReading {
                gas_value: m.gas_value,
                system_status: m.system_status,
                timestamp: from_ms(self.clock.now_ms()),
                key: Some(Uuid::new_v4()),
            }),
            Err(err) => {
                log_decode_error(&err, payload);
                None
            }
        }
    }

    pub fn spawn_append(&self, reading: NewReading) -> JoinHandle<IngestOutcome> {
        let store = self.store.clone();
        let policy = self.policy;
        tokio::spawn(async move { persist(store.as_ref(), policy, reading).await })
    }
}

fn log_decode_error(err: &DecodeError, payload: &[u8]) {
    warn!(
        "[INGEST] Discarding message: {err} (payload: {})",
        String::from_utf8_lossy(payload)
    );
}

async fn persist<S: RecordStore>(
    store: &S,
    policy: IngestionPolicy,
    reading: NewReading,
) -> IngestOutcome {
    let key = reading.key.unwrap_or_else(Uuid::new_v4);
    let reading = NewReading {
        key: Some(key),
        ..reading
    };
    let (retries, backoff) = match policy {
        IngestionPolicy::BestEffort => (0, Duration::ZERO),
        IngestionPolicy::Retry { attempts, backoff } => (attempts, backoff),
    };

    let mut attempt = 0;
    loop {
        match store.append(reading.clone()).await {
            Ok(id) => {
                info!(
                    "[INGEST] Data saved to DB. Gas: {}, Status: {}",
                    reading.gas_value,
                    i64::from(reading.system_status)
                );
                return IngestOutcome::Stored(id);
            }
            Err(err @ (StoreError::Unavailable(_) | StoreError::Timeout(_)))
                if attempt < retries =>
            {
                attempt += 1;
                warn!("[INGEST] {err}, retry {attempt}/{retries} for reading {key}");
                tokio::time::sleep(backoff).await;
            }
            Err(err @ StoreError::Timeout(_)) => {
                warn!("[INGEST] Reading {key} not confirmed, it may still be saved: {err}");
                return IngestOutcome::Unconfirmed(err);
            }
            Err(err) => {
                error!("[INGEST] Dropping reading: {err}");
                return IngestOutcome::Dropped(err);
            }
        }
    }
}
