//! The live span factory.
//!
//! A [`Span`] is a cheaply clonable handle; clones share one underlying
//! span. A handle is in exactly one of four states:
//!
//! - *empty*: no span ID; produced by [`Registrar::new_factory`],
//! - *imported*: identity received from another process, no timing owned
//!   here,
//! - *live*: started and still recording,
//! - *finished*: end stamped and handed to the registrar queue.
//!
//! Mutators are expected to be called from the span's owning thread.
//! Creating sub-spans is the exception: [`Span::new_sub_span`] takes the
//! span's internal lock so any number of threads may derive children from
//! one shared parent.
//!
//! Operations that make no sense in the current state log a failure with a
//! stack trace and leave the span untouched; they never panic, and they
//! still return the handle so call chains keep working.
//!
//! [`Registrar::new_factory`]: crate::Registrar::new_factory

use std::backtrace::Backtrace;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crossbeam_channel::Sender;
use http::HeaderMap;

use crate::error::SpanError;
use crate::export::{zulu_time, AttributeValue, Attributes, CloudSpan, SpanKind, Status};
use crate::id_generator;
use crate::metrics;
use crate::rospan::ROSpan;
use crate::trace_context::{SpanId, TraceId};

/// What travels on the registrar queue. Finished spans are the payload;
/// the control variants drive flushes, test synchronization, and
/// shutdown, and are never written to the backend or counted.
pub(crate) enum QueueMessage {
    Finished(FinishedSpan),
    /// Flush the current batch, then acknowledge on the carried channel.
    Flush(Sender<()>),
    /// Acknowledge immediately, without flushing.
    Ack(Sender<()>),
    /// Final flush, signal done, exit the worker.
    Shutdown,
}

/// A finished span as enqueued by [`Span::finish`]: its identity plus the
/// record to ship. The full resource name is stamped by the writer.
pub(crate) struct FinishedSpan {
    pub(crate) ro: ROSpan,
    pub(crate) details: CloudSpan,
}

/// Tracks one span inside a trace and creates child spans within it.
/// Finishing the span hands it to the registrar for batched delivery.
#[derive(Clone)]
pub struct Span {
    inner: Arc<Inner>,
}

struct Inner {
    ro: ROSpan,
    queue: Option<Sender<QueueMessage>>,
    start: Option<SystemTime>,
    parent_span_id: SpanId,
    // Guards everything that mutates after creation, including the
    // sub-span walker. Never held across I/O.
    mu: Mutex<SpanState>,
}

#[derive(Default)]
struct SpanState {
    end: Option<SystemTime>,
    details: Option<CloudSpan>,
    /// Per-parent child-ID stride, chosen odd on first use.
    span_inc: u64,
    /// The previous child span ID handed out.
    kid_span: u64,
}

enum Denied {
    Empty,
    Finished,
    Imported,
}

impl Span {
    /// Handle around an identity with no recording state: the factory for
    /// empty and imported spans.
    pub(crate) fn adopt(ro: ROSpan, queue: Option<Sender<QueueMessage>>) -> Span {
        Span {
            inner: Arc::new(Inner {
                ro,
                queue,
                start: None,
                parent_span_id: SpanId::INVALID,
                mu: Mutex::default(),
            }),
        }
    }

    /// An empty factory with no registrar behind it; everything it is
    /// asked to do beyond creating identities logs a failure.
    pub(crate) fn detached() -> Span {
        Span::adopt(ROSpan::new(""), None)
    }

    fn live(
        ro: ROSpan,
        queue: Option<Sender<QueueMessage>>,
        parent_span_id: SpanId,
        same_process_as_parent: bool,
    ) -> Span {
        let start = SystemTime::now();
        let details = CloudSpan {
            span_id: ro.span_id().to_string(),
            parent_span_id: parent_span_id
                .is_valid()
                .then(|| parent_span_id.to_string()),
            start_time: zulu_time(start),
            same_process_as_parent_span: same_process_as_parent,
            ..Default::default()
        };
        Span {
            inner: Arc::new(Inner {
                ro,
                queue,
                start: Some(start),
                parent_span_id,
                mu: Mutex::new(SpanState {
                    details: Some(details),
                    ..Default::default()
                }),
            }),
        }
    }

    pub fn project(&self) -> &str {
        self.inner.ro.project()
    }

    pub fn trace_id(&self) -> TraceId {
        self.inner.ro.trace_id()
    }

    pub fn span_id(&self) -> SpanId {
        self.inner.ro.span_id()
    }

    /// `projects/{project}/traces/{traceID}`
    pub fn trace_path(&self) -> String {
        self.inner.ro.trace_path()
    }

    /// `projects/{project}/traces/{traceID}/spans/{spanID}`
    pub fn span_path(&self) -> String {
        self.inner.ro.span_path()
    }

    /// The span ID of this span's parent, if it has one in this process.
    pub fn parent_span_id(&self) -> SpanId {
        self.inner.parent_span_id
    }

    /// When the span began. `None` for empty and imported spans.
    pub fn start(&self) -> Option<SystemTime> {
        self.inner.start
    }

    /// How long the span lived. `None` until the span is finished.
    pub fn duration(&self) -> Option<Duration> {
        let end = self.lock().end?;
        let start = self.inner.start?;
        Some(end.duration_since(start).unwrap_or_default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpanState> {
        self.inner.mu.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_empty(&self) -> bool {
        !self.inner.ro.span_id().is_valid()
    }

    fn fail(&self, op: &'static str, denied: &Denied, span_name: Option<String>) {
        let reason = match denied {
            Denied::Empty => "disallowed operation on an empty span factory",
            Denied::Finished => "disallowed operation on a finished span",
            Denied::Imported => "disallowed operation on an imported span",
        };
        if self.inner.ro.trace_id().is_valid() {
            tracing::error!(
                op,
                trace = %self.inner.ro.trace_path(),
                span_id = %self.inner.ro.span_id(),
                span_name = span_name.as_deref().unwrap_or_default(),
                stack = %Backtrace::force_capture(),
                "{reason}"
            );
        } else {
            tracing::error!(op, stack = %Backtrace::force_capture(), "{reason}");
        }
    }

    /// Runs `f` against the details record iff the span is live; logs and
    /// skips for empty, imported, and finished spans. Returns the handle
    /// either way so calls chain.
    fn with_details(&self, op: &'static str, f: impl FnOnce(&mut CloudSpan)) -> Span {
        let denied = {
            let mut state = self.lock();
            if self.is_empty() {
                Some((Denied::Empty, None))
            } else if state.end.is_some() {
                let name = display_name_of(state.details.as_ref());
                Some((Denied::Finished, name))
            } else if self.inner.start.is_none() {
                Some((Denied::Imported, None))
            } else {
                if let Some(details) = state.details.as_mut() {
                    f(details);
                }
                None
            }
        };
        if let Some((denied, name)) = denied {
            self.fail(op, &denied, name);
        }
        self.clone()
    }

    /// Returns a new factory holding a span created somewhere else, so
    /// that sub-spans of it can be created here. Errors on an invalid
    /// trace or span ID.
    pub fn import(&self, trace_id: &str, span_id: u64) -> Result<Span, SpanError> {
        let ro = self.inner.ro.import(trace_id, span_id)?;
        Ok(Span::adopt(ro, self.inner.queue.clone()))
    }

    /// Returns a new factory holding the span identity carried in the
    /// `X-Cloud-Trace-Context` header. A missing or malformed header
    /// yields a valid but empty factory, never an error.
    pub fn import_from_headers(&self, headers: &HeaderMap) -> Span {
        let ro = self.inner.ro.import_from_headers(headers);
        Span::adopt(ro, self.inner.queue.clone())
    }

    /// Returns a fresh live root span in a brand-new trace. Any span held
    /// by the invoking factory is ignored beyond salting the new IDs.
    pub fn new_trace(&self) -> Span {
        let trace_id =
            id_generator::new_trace_id(Some(self.inner.ro.trace_id()).filter(|t| t.is_valid()));
        let span_id = SpanId::from(id_generator::new_span_id(self.inner.ro.span_id().to_u64()));
        let ro = ROSpan::new(self.inner.ro.project()).with_ids(trace_id, span_id);
        Span::live(ro, self.inner.queue.clone(), SpanId::INVALID, false)
    }

    /// Returns a fresh live span that is a child of this one.
    ///
    /// Safe to call from any number of threads sharing one parent: child
    /// IDs come from a lock-protected walker that adds a per-parent odd
    /// stride to the previous child ID, so the walk visits every 64-bit
    /// value before repeating and never re-issues the parent's own ID.
    ///
    /// A *finished* parent is deliberately allowed: a handler racing a
    /// cancellation may legitimately create a child just after the parent
    /// closed. Such children are recorded normally but no longer bump the
    /// already-shipped parent's child count.
    pub fn new_sub_span(&self) -> Span {
        if self.is_empty() {
            self.fail("new_sub_span", &Denied::Empty, None);
            return Span::adopt(
                ROSpan::new(self.inner.ro.project()),
                self.inner.queue.clone(),
            );
        }
        let kid_id = {
            let mut state = self.lock();
            if state.kid_span == 0 {
                // First child: walk starts at our own ID so the first
                // increment moves off it.
                state.kid_span = self.inner.ro.span_id().to_u64();
                state.span_inc = 1 | id_generator::new_span_id(0);
            }
            state.kid_span = state.kid_span.wrapping_add(state.span_inc);
            if state.kid_span == 0 {
                // The walk eventually rotates through 0; skip over it.
                state.kid_span = state.kid_span.wrapping_add(state.span_inc);
            }
            if state.end.is_none() {
                if let Some(details) = state.details.as_mut() {
                    details.child_span_count += 1;
                }
            }
            state.kid_span
        };
        let ro = self.inner.ro.with_span_id(SpanId::from(kid_id));
        Span::live(
            ro,
            self.inner.queue.clone(),
            self.inner.ro.span_id(),
            self.inner.start.is_some(),
        )
    }

    /// [`new_trace`] for an empty factory, [`new_sub_span`] otherwise.
    ///
    /// [`new_trace`]: Span::new_trace
    /// [`new_sub_span`]: Span::new_sub_span
    pub fn new_span(&self) -> Span {
        if self.is_empty() {
            self.new_trace()
        } else {
            self.new_sub_span()
        }
    }

    /// Sets the span's display name; the empty string clears it back to
    /// the default (the process name, applied at finish).
    pub fn set_display_name(&self, name: impl Into<String>) -> Span {
        let name = name.into();
        self.with_details("set_display_name", |details| {
            details.display_name = if name.is_empty() {
                None
            } else {
                Some(name.into())
            };
        })
    }

    /// Marks the span as covering the server side of an inbound request.
    pub fn set_is_server(&self) -> Span {
        self.with_details("set_is_server", |details| {
            details.span_kind = Some(SpanKind::Server);
        })
    }

    /// Marks the span as covering the client side of an outbound request.
    pub fn set_is_client(&self) -> Span {
        self.with_details("set_is_client", |details| {
            details.span_kind = Some(SpanKind::Client);
        })
    }

    /// Marks the span as covering publishing to a queue or topic.
    pub fn set_is_publisher(&self) -> Span {
        self.with_details("set_is_publisher", |details| {
            details.span_kind = Some(SpanKind::Producer);
        })
    }

    /// Marks the span as covering consuming from a queue or topic.
    pub fn set_is_subscriber(&self) -> Span {
        self.with_details("set_is_subscriber", |details| {
            details.span_kind = Some(SpanKind::Consumer);
        })
    }

    /// Records one typed attribute on the span. Errors on an empty key;
    /// misuse on an empty/imported/finished span is logged instead (and
    /// reads as success, matching the chained mutators).
    pub fn add_attribute(
        &self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Result<(), SpanError> {
        let key = key.into();
        let value = value.into();
        let mut result = Ok(());
        self.with_details("add_attribute", |details| {
            if key.is_empty() {
                result = Err(SpanError::EmptyAttributeKey);
            } else {
                details
                    .attributes
                    .get_or_insert_with(Attributes::default)
                    .attribute_map
                    .insert(key, value);
            }
        });
        result
    }

    /// Records a list of attribute pairs, skipping zero values (`0` and
    /// `false`, but not the empty string) rather than recording noise.
    /// Empty keys are logged and skipped.
    ///
    /// ```
    /// # use cloudtrace_spans::AttributeValue;
    /// # fn demo(span: &cloudtrace_spans::Span) {
    /// span.add_pairs(vec![
    ///     ("user", AttributeValue::from("alice")),
    ///     ("retries", 2.into()),
    /// ]);
    /// # }
    /// ```
    pub fn add_pairs<K, I>(&self, pairs: I) -> Span
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, AttributeValue)>,
    {
        self.with_details("add_pairs", |details| {
            for (key, value) in pairs {
                let key = key.into();
                if key.is_empty() {
                    tracing::error!(
                        stack = %Backtrace::force_capture(),
                        "empty attribute key passed to add_pairs"
                    );
                    continue;
                }
                if value.is_zero() {
                    continue;
                }
                details
                    .attributes
                    .get_or_insert_with(Attributes::default)
                    .attribute_map
                    .insert(key, value);
            }
        })
    }

    /// Sets the status code; values from `google.rpc.Code` are expected
    /// but HTTP status codes are also understood by the service.
    pub fn set_status_code(&self, code: i64) -> Span {
        self.with_details("set_status_code", |details| {
            details.status.get_or_insert_with(Status::default).code = code;
        })
    }

    /// Sets the status message. By convention only failures carry one.
    pub fn set_status_message(&self, message: impl Into<String>) -> Span {
        let message = message.into();
        self.with_details("set_status_message", |details| {
            details.status.get_or_insert_with(Status::default).message = message;
        })
    }

    /// Finishes the span: stamps the end time, applies the default display
    /// name if none was set, and hands the record to the registrar.
    ///
    /// The hand-off never blocks; if the queue is full (or the registrar
    /// was halted) the span is dropped and the drop counter advances.
    /// Returns the span's duration, or zero when called on an
    /// empty/imported/already-finished span (which is logged).
    pub fn finish(&self) -> Duration {
        if self.is_empty() {
            self.fail("finish", &Denied::Empty, None);
            return Duration::ZERO;
        }
        let Some(start) = self.inner.start else {
            self.fail("finish", &Denied::Imported, None);
            return Duration::ZERO;
        };
        let end = SystemTime::now();
        let details = {
            let mut state = self.lock();
            if state.end.is_some() {
                let name = display_name_of(state.details.as_ref());
                drop(state);
                self.fail("finish", &Denied::Finished, name);
                return Duration::ZERO;
            }
            state.end = Some(end);
            if let Some(details) = state.details.as_mut() {
                details.end_time = zulu_time(end);
                if details.display_name.is_none() {
                    details.display_name = Some(process_name().into());
                }
            }
            state.details.clone()
        };
        if let Some(details) = details {
            let finished = FinishedSpan {
                ro: self.inner.ro.clone(),
                details,
            };
            match &self.inner.queue {
                Some(queue) => {
                    if queue.try_send(QueueMessage::Finished(finished)).is_err() {
                        // Full, or disconnected after a halt: both drop.
                        metrics::span_dropped();
                    }
                }
                None => {
                    tracing::warn!(
                        span_id = %self.inner.ro.span_id(),
                        "span finished with no registrar behind it; dropped"
                    );
                    metrics::span_dropped();
                }
            }
        }
        end.duration_since(start).unwrap_or_default()
    }
}

fn display_name_of(details: Option<&CloudSpan>) -> Option<String> {
    details
        .and_then(|d| d.display_name.as_ref())
        .map(|name| name.value.clone())
}

fn process_name() -> String {
    std::env::args().next().unwrap_or_default()
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("project", &self.inner.ro.project())
            .field("trace_id", &self.inner.ro.trace_id())
            .field("span_id", &self.inner.ro.span_id())
            .field("start", &self.inner.start)
            .finish()
    }
}
