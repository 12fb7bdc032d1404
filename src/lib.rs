//! Register request spans, in batches, with Google Cloud Trace (API v2).
//!
//! This crate is the in-process half of a tracing setup for long-running
//! servers. Handlers build a tree of timed [`Span`]s, importing inbound
//! identities from `X-Cloud-Trace-Context` headers and deriving children
//! for outbound calls, possibly from many threads at once. Finished
//! spans flow through a bounded queue into parallel batch writers that
//! ship them with a [`TraceClient`] you supply. Tracing cost never
//! dominates request latency: finishing a span is one non-blocking send,
//! and when the queue is saturated spans are dropped and counted rather
//! than awaited.
//!
//! # Overview
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloudtrace_spans::{Registrar, TraceClient};
//!
//! # fn client() -> Arc<dyn TraceClient> { unimplemented!() }
//! let mut registrar = Registrar::must_new("my-project", client());
//!
//! let factory = registrar.new_factory();
//! let root = factory.new_trace().set_display_name("GET /work");
//! let child = root.new_sub_span().set_display_name("db.query").set_is_client();
//! // ... do the work ...
//! child.finish();
//! root.finish();
//!
//! registrar.halt(); // at server shutdown
//! ```
//!
//! For request plumbing see [`Context`], [`context_push_span`], and
//! [`request_push_span`]; for inbound propagation see
//! [`Span::import_from_headers`].

pub mod config;
mod context;
mod error;
pub mod export;
mod id_generator;
mod metrics;
mod propagation;
mod registrar;
mod rospan;
mod span;
mod trace_context;
mod writer;

pub use config::PipelineConfig;
pub use context::{
    context_push_span, get_span, push_span, request_push_span, store_span, Context, LogSpanKey,
    LogTraceKey, LOG_SPAN_KEY, LOG_TRACE_KEY,
};
pub use error::SpanError;
pub use export::{AttributeValue, ClientError, CloudSpan, SpanKind, TraceClient};
pub use id_generator::{new_span_id, new_trace_id};
pub use metrics::dropped_count;
pub use propagation::{header_value, set_header, TRACE_CONTEXT_HEADER};
pub use registrar::{start_server, Registrar};
pub use rospan::ROSpan;
pub use span::Span;
pub use trace_context::{SpanId, TraceId};
