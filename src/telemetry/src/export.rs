//! Batching exporter: ships ended spans to the server ingest endpoint.
//!
//! One exporter worker runs per client process on a dedicated tokio task. The
//! worker owns a bounded buffer and drives an explicit state machine:
//!
//! | state       | span arrives          | timer tick      | HTTP ok      | HTTP failure |
//! |-------------|-----------------------|-----------------|--------------|--------------|
//! | `Idle`      | buffer, -> Buffering  | -               | -            | -            |
//! | `Buffering` | buffer; size trigger  | send if any     | -            | -            |
//! | `Sending`   | buffer (overflow cap) | -               | -> Buffering | -> Backoff   |
//! | `Backoff`   | buffer; cap drops old | retry when due  | -            | -            |
//!
//! Buffer overflow discards the *oldest* spans; the count of discarded spans
//! is reported as `exporter.dropped_spans` on the next batch that ships, then
//! reset. Callers of `start`/`end` never touch the network: they hand spans
//! over a channel and return.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::TelemetryConfig;
use crate::context::ClientKind;
use crate::span::{AttributeValue, SpanRecord};
use crate::time::now_unix_ms;

/// Attribute carrying the dropped-span count on the next shipped batch.
pub const DROPPED_SPANS_ATTR: &str = "exporter.dropped_spans";

/// Retry schedule: base 1 s, factor 2, cap 30 s, jitter +/-20 %, 5 attempts.
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);
const RETRY_MAX_ATTEMPTS: u32 = 5;

/// The unit of shipment from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEnvelope {
    pub sent_at: u64,
    pub client_kind: ClientKind,
    pub client_version: String,
    pub spans: Vec<SpanRecord>,
}

/// Ingest acknowledgement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IngestResponse {
    pub accepted: u64,
    pub skipped_duplicates: u64,
}

pub(crate) enum ExporterEvent {
    SpanEnded(Box<SpanRecord>),
    /// The root span of a context ended; flush immediately.
    RootEnded,
    Flush(oneshot::Sender<()>),
}

/// Handle to the exporter worker. Cheap to clone; dropping all handles stops
/// the worker once the channel drains.
#[derive(Clone)]
pub struct ExporterHandle {
    tx: mpsc::UnboundedSender<ExporterEvent>,
    dropped: Arc<AtomicU64>,
}

impl ExporterHandle {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(config: TelemetryConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicU64::new(0));
        let worker = ExporterWorker::new(config, rx, dropped.clone());
        tokio::spawn(worker.run());
        Self { tx, dropped }
    }

    /// A handle whose receiving end is held by the test instead of a worker.
    #[cfg(test)]
    pub(crate) fn channel_for_tests() -> (Self, mpsc::UnboundedReceiver<ExporterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub(crate) fn span_ended(&self, span: SpanRecord) {
        let _ = self.tx.send(ExporterEvent::SpanEnded(Box::new(span)));
    }

    pub(crate) fn root_ended(&self) {
        let _ = self.tx.send(ExporterEvent::RootEnded);
    }

    /// Block until all currently-ended spans are delivered or permanently
    /// dropped, or the deadline expires. Returns true if the exporter drained.
    pub async fn flush(&self, deadline: Duration) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(ExporterEvent::Flush(ack_tx)).is_err() {
            return true; // worker already gone, nothing buffered
        }
        tokio::time::timeout(deadline, ack_rx).await.is_ok()
    }

    /// Spans discarded so far and not yet reported on a shipped batch.
    pub fn dropped_spans(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExporterState {
    Idle,
    Buffering,
    Sending,
    Backoff,
}

enum SendOutcome {
    Ok,
    Retryable,
    Permanent,
}

struct ExporterWorker {
    config: TelemetryConfig,
    rx: mpsc::UnboundedReceiver<ExporterEvent>,
    http: reqwest::Client,
    buffer: VecDeque<SpanRecord>,
    dropped: Arc<AtomicU64>,
    state: ExporterState,
}

impl ExporterWorker {
    fn new(
        config: TelemetryConfig,
        rx: mpsc::UnboundedReceiver<ExporterEvent>,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            config,
            rx,
            http,
            buffer: VecDeque::new(),
            dropped,
            state: ExporterState::Idle,
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(
            self.config.export_interval_ms.max(1),
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    match event {
                        Some(ExporterEvent::SpanEnded(span)) => {
                            self.buffer_span(*span);
                            if self.buffer.len() >= self.config.export_batch_size {
                                self.send_pending().await;
                            }
                        }
                        Some(ExporterEvent::RootEnded) => {
                            self.send_pending().await;
                        }
                        Some(ExporterEvent::Flush(ack)) => {
                            self.drain().await;
                            let _ = ack.send(());
                        }
                        None => {
                            self.drain().await;
                            return;
                        }
                    }
                }
                _ = tick.tick() => {
                    if !self.buffer.is_empty() {
                        self.send_pending().await;
                    }
                }
            }
        }
    }

    fn buffer_span(&mut self, span: SpanRecord) {
        if self.state == ExporterState::Idle {
            self.set_state(ExporterState::Buffering);
        }
        while self.buffer.len() >= self.config.buffer_capacity {
            self.buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.buffer.push_back(span);
    }

    /// Ship one batch from the buffer head, honoring the retry schedule.
    async fn send_pending(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let take = self.buffer.len().min(self.config.export_batch_size.max(1));
        let mut batch: Vec<SpanRecord> = self.buffer.drain(..take).collect();

        // Report drops observed so far on this batch; keep any that happen
        // while the request is in flight.
        let dropped_snapshot = self.dropped.load(Ordering::Relaxed);
        if dropped_snapshot > 0 {
            if let Some(first) = batch.first_mut() {
                first.attributes.insert(
                    DROPPED_SPANS_ATTR.to_string(),
                    AttributeValue::I64(dropped_snapshot as i64),
                );
            }
        }

        self.set_state(ExporterState::Sending);
        for attempt in 1..=RETRY_MAX_ATTEMPTS {
            match self.post_batch(&batch).await {
                SendOutcome::Ok => {
                    self.dropped.fetch_sub(dropped_snapshot, Ordering::Relaxed);
                    self.set_state(if self.buffer.is_empty() {
                        ExporterState::Idle
                    } else {
                        ExporterState::Buffering
                    });
                    return;
                }
                SendOutcome::Permanent => {
                    warn!(
                        spans = batch.len(),
                        "telemetry batch rejected by ingest, dropping"
                    );
                    self.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    self.set_state(ExporterState::Buffering);
                    return;
                }
                SendOutcome::Retryable if attempt < RETRY_MAX_ATTEMPTS => {
                    self.set_state(ExporterState::Backoff);
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    self.set_state(ExporterState::Sending);
                }
                SendOutcome::Retryable => {
                    warn!(
                        spans = batch.len(),
                        attempts = RETRY_MAX_ATTEMPTS,
                        "telemetry export exhausted retries, dropping batch"
                    );
                    self.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    self.set_state(ExporterState::Buffering);
                    return;
                }
            }
        }
    }

    /// Send until the buffer is empty; used by flush and shutdown.
    async fn drain(&mut self) {
        while !self.buffer.is_empty() {
            let before = self.buffer.len();
            self.send_pending().await;
            if self.buffer.len() >= before {
                // No forward progress; give up rather than spin.
                return;
            }
        }
    }

    async fn post_batch(&self, spans: &[SpanRecord]) -> SendOutcome {
        let envelope = BatchEnvelope {
            sent_at: now_unix_ms(),
            client_kind: self.config.client_kind,
            client_version: self.config.client_version.clone(),
            spans: spans.to_vec(),
        };

        let mut request = self.http.post(&self.config.endpoint).json(&envelope);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                trace!(spans = spans.len(), "telemetry batch shipped");
                SendOutcome::Ok
            }
            Ok(response) if response.status().as_u16() == 429 => SendOutcome::Retryable,
            Ok(response) if response.status().is_client_error() => {
                debug!(status = %response.status(), "ingest rejected batch");
                SendOutcome::Permanent
            }
            Ok(response) => {
                debug!(status = %response.status(), "ingest unavailable");
                SendOutcome::Retryable
            }
            Err(err) => {
                debug!(error = %err, "telemetry export failed");
                SendOutcome::Retryable
            }
        }
    }

    fn set_state(&mut self, next: ExporterState) {
        if self.state != next {
            trace!(from = ?self.state, to = ?next, "exporter state");
            self.state = next;
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE
        .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .unwrap_or(RETRY_CAP)
        .min(RETRY_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    exp.mul_f64(jitter)
}
