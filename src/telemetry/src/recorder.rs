//! In-process span recording.
//!
//! The recorder owns all live spans in a flat map keyed by span id; parent
//! linkage is by id value only, so spans never reference each other. Parent
//! resolution for `start` without an explicit parent uses a per-context span
//! stack, which yields natural nesting for sequential code. Concurrent
//! branches that need precise shape pass `parent_span_id` explicitly.
//!
//! `start`/`end`/`record_event`/`set_attribute` never suspend and never
//! perform I/O: ended spans are handed to the exporter worker over a channel.
//! Recording failures are swallowed (logged at most once per minute) so
//! instrumentation can never break the instrumented program.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::warn;

use crate::config::TelemetryConfig;
use crate::context::{SpanId, TraceContext, TraceId};
use crate::export::ExporterHandle;
use crate::span::{
    attribute_bytes, truncate_lossy, AttributeValue, SpanEventRecord, SpanRecord, SpanStatus,
    MAX_ATTRIBUTES_PER_SPAN, MAX_ATTRIBUTE_BYTES, MAX_EVENTS_PER_SPAN, MAX_NAME_LEN,
    MAX_STATUS_MESSAGE_LEN,
};
use crate::time::{now_unix_ms, MonotonicClock};

const FAILURE_LOG_INTERVAL_MS: u64 = 60_000;

/// Handle to a live span. Copyable; operations on an ended or unsampled span
/// are silent no-ops.
#[derive(Debug, Clone, Copy)]
pub struct SpanHandle {
    trace_id: TraceId,
    span_id: SpanId,
    recorded: bool,
}

impl SpanHandle {
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// False when the span was sampled out or recording is disabled.
    pub fn is_recorded(&self) -> bool {
        self.recorded
    }
}

struct ActiveSpan {
    record: SpanRecord,
}

struct ContextState {
    root_span_id: SpanId,
    stack: Vec<SpanId>,
    sampled: bool,
    open: usize,
    root_ended: bool,
}

#[derive(Default)]
struct RecorderState {
    spans: HashMap<SpanId, ActiveSpan>,
    contexts: HashMap<TraceId, ContextState>,
}

struct RecorderInner {
    config: TelemetryConfig,
    exporter: Option<ExporterHandle>,
    clock: MonotonicClock,
    state: Mutex<RecorderState>,
    last_failure_log_ms: AtomicU64,
}

/// The per-process span recorder. Cheap to clone; pass it along the
/// request-scoped context rather than stashing it in a global.
#[derive(Clone)]
pub struct SpanRecorder {
    inner: Arc<RecorderInner>,
}

impl SpanRecorder {
    /// Create a recorder and spawn its exporter worker on the current tokio
    /// runtime. With `enabled = false` all operations become no-ops.
    pub fn new(config: TelemetryConfig) -> Self {
        let exporter = config.enabled.then(|| ExporterHandle::spawn(config.clone()));
        Self::with_exporter(config, exporter)
    }

    /// A recorder that records nothing and exports nothing.
    pub fn disabled(config: TelemetryConfig) -> Self {
        Self::with_exporter(config.disabled(), None)
    }

    pub(crate) fn with_exporter(config: TelemetryConfig, exporter: Option<ExporterHandle>) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                config,
                exporter,
                clock: MonotonicClock::new(),
                state: Mutex::new(RecorderState::default()),
                last_failure_log_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.inner.config
    }

    /// Begin a span. With no explicit parent, the top of the context's span
    /// stack is used; the first span of a context becomes its root and takes
    /// the context's own span id.
    pub fn start(
        &self,
        name: impl Into<String>,
        ctx: &TraceContext,
        parent_span_id: Option<SpanId>,
    ) -> SpanHandle {
        if !self.inner.config.enabled {
            return SpanHandle {
                trace_id: ctx.trace_id,
                span_id: ctx.span_id,
                recorded: false,
            };
        }

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let is_new_context = !state.contexts.contains_key(&ctx.trace_id);
        if is_new_context {
            // Head sampling: decided once at root creation, inherited by
            // every child of the trace.
            let sampled = rand::thread_rng().gen::<f64>() < self.inner.config.sampler_rate;
            state.contexts.insert(
                ctx.trace_id,
                ContextState {
                    root_span_id: ctx.span_id,
                    stack: Vec::new(),
                    sampled,
                    open: 0,
                    root_ended: false,
                },
            );
        }

        let Some(context) = state.contexts.get_mut(&ctx.trace_id) else {
            return SpanHandle {
                trace_id: ctx.trace_id,
                span_id: ctx.span_id,
                recorded: false,
            };
        };

        if !context.sampled {
            return SpanHandle {
                trace_id: ctx.trace_id,
                span_id: ctx.span_id,
                recorded: false,
            };
        }

        let resolved_parent = parent_span_id
            .or_else(|| context.stack.last().copied())
            .or(ctx.parent_span_id);

        let span_id = if is_new_context {
            context.root_span_id
        } else {
            // Fresh id, distinct from the parent by construction.
            loop {
                let id = SpanId::generate();
                if Some(id) != resolved_parent {
                    break id;
                }
            }
        };

        let mut name = name.into();
        truncate_lossy(&mut name, MAX_NAME_LEN);

        context.stack.push(span_id);
        context.open += 1;

        state.spans.insert(
            span_id,
            ActiveSpan {
                record: SpanRecord {
                    trace_id: ctx.trace_id,
                    span_id,
                    parent_span_id: resolved_parent,
                    name,
                    start_time_ms: self.inner.clock.now_ms(),
                    end_time_ms: 0,
                    status: SpanStatus::Ok,
                    status_message: None,
                    attributes: Default::default(),
                    events: Vec::new(),
                },
            },
        );

        SpanHandle {
            trace_id: ctx.trace_id,
            span_id,
            recorded: true,
        }
    }

    /// End a span. The span becomes immutable and moves to the exporter
    /// buffer; ending the root of a context triggers an immediate flush.
    pub fn end(&self, handle: SpanHandle, status: SpanStatus, message: Option<&str>) {
        if !handle.recorded {
            return;
        }

        let (record, root_ended) = {
            let mut state = self.inner.state.lock();
            let Some(mut active) = state.spans.remove(&handle.span_id) else {
                drop(state);
                self.note_failure("end on unknown or already-ended span");
                return;
            };

            active.record.end_time_ms = self
                .inner
                .clock
                .now_ms()
                .max(active.record.start_time_ms);
            active.record.status = status;
            active.record.status_message = message.map(|m| {
                let mut m = m.to_string();
                truncate_lossy(&mut m, MAX_STATUS_MESSAGE_LEN);
                m
            });

            let mut root_ended = false;
            let mut context_done = false;
            if let Some(context) = state.contexts.get_mut(&handle.trace_id) {
                context.stack.retain(|id| *id != handle.span_id);
                context.open = context.open.saturating_sub(1);
                if handle.span_id == context.root_span_id {
                    context.root_ended = true;
                }
                root_ended = handle.span_id == context.root_span_id;
                context_done = context.root_ended && context.open == 0;
            }
            if context_done {
                state.contexts.remove(&handle.trace_id);
            }
            (active.record, root_ended)
        };

        if let Some(exporter) = &self.inner.exporter {
            exporter.span_ended(record);
            if root_ended {
                exporter.root_ended();
            }
        }
    }

    /// Record a span with precomputed timestamps, e.g. drained from the
    /// plugin's audio ring. The span is emitted directly to the exporter.
    pub fn record_complete(
        &self,
        ctx: &TraceContext,
        name: impl Into<String>,
        parent_span_id: Option<SpanId>,
        start_time_ms: u64,
        end_time_ms: u64,
        status: SpanStatus,
    ) {
        if !self.inner.config.enabled {
            return;
        }
        {
            let state = self.inner.state.lock();
            if let Some(context) = state.contexts.get(&ctx.trace_id) {
                if !context.sampled {
                    return;
                }
            }
        }

        let mut name = name.into();
        truncate_lossy(&mut name, MAX_NAME_LEN);
        let record = SpanRecord {
            trace_id: ctx.trace_id,
            span_id: ctx.child_span_id(),
            parent_span_id: parent_span_id.or(Some(ctx.span_id)),
            name,
            start_time_ms,
            end_time_ms: end_time_ms.max(start_time_ms),
            status,
            status_message: None,
            attributes: Default::default(),
            events: Vec::new(),
        };
        if let Some(exporter) = &self.inner.exporter {
            exporter.span_ended(record);
        }
    }

    /// Attach an event to a live span. Capped at 32 events per span; excess
    /// events are dropped silently.
    pub fn record_event(
        &self,
        handle: SpanHandle,
        name: impl Into<String>,
        attributes: impl IntoIterator<Item = (String, AttributeValue)>,
    ) {
        if !handle.recorded {
            return;
        }
        let timestamp_ms = self.inner.clock.now_ms();
        let mut state = self.inner.state.lock();
        let Some(active) = state.spans.get_mut(&handle.span_id) else {
            return;
        };
        if active.record.events.len() >= MAX_EVENTS_PER_SPAN {
            return;
        }
        let mut name = name.into();
        truncate_lossy(&mut name, MAX_NAME_LEN);
        active.record.events.push(SpanEventRecord {
            timestamp_ms,
            name,
            attributes: attributes.into_iter().collect(),
        });
    }

    /// Set an attribute on a live span. Bounded to 64 entries and 4 KiB of
    /// serialized attribute bytes per span; writes over the cap are dropped.
    pub fn set_attribute(
        &self,
        handle: SpanHandle,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) {
        if !handle.recorded {
            return;
        }
        let key = key.into();
        let value = value.into();
        let mut state = self.inner.state.lock();
        let Some(active) = state.spans.get_mut(&handle.span_id) else {
            return;
        };
        let attrs = &mut active.record.attributes;
        let replacing = attrs.contains_key(&key);
        if !replacing && attrs.len() >= MAX_ATTRIBUTES_PER_SPAN {
            return;
        }
        let previous = attrs.insert(key.clone(), value);
        if attribute_bytes(attrs) > MAX_ATTRIBUTE_BYTES {
            match previous {
                Some(previous) => {
                    attrs.insert(key, previous);
                }
                None => {
                    attrs.remove(&key);
                }
            }
        }
    }

    /// End every open span of a context with `cancelled`. Used when the
    /// owning operation is torn down before its spans complete.
    pub fn cancel_context(&self, trace_id: TraceId, message: &str) {
        let open: Vec<SpanHandle> = {
            let state = self.inner.state.lock();
            state
                .spans
                .values()
                .filter(|active| active.record.trace_id == trace_id)
                .map(|active| SpanHandle {
                    trace_id,
                    span_id: active.record.span_id,
                    recorded: true,
                })
                .collect()
        };
        for handle in open {
            self.end(handle, SpanStatus::Cancelled, Some(message));
        }
    }

    /// Block until everything already ended is delivered or permanently
    /// dropped, or the deadline passes. Returns true if fully drained.
    pub async fn flush(&self, deadline: Duration) -> bool {
        match &self.inner.exporter {
            Some(exporter) => exporter.flush(deadline).await,
            None => true,
        }
    }

    fn note_failure(&self, what: &str) {
        let now = now_unix_ms();
        let last = self.inner.last_failure_log_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= FAILURE_LOG_INTERVAL_MS
            && self
                .inner
                .last_failure_log_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!(detail = what, "span recorder error (throttled)");
        }
    }
}
