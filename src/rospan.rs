//! Read-only span identity.

use std::time::{Duration, SystemTime};

use http::HeaderMap;

use crate::error::SpanError;
use crate::propagation;
use crate::trace_context::{SpanId, TraceId};

/// An immutable `(project, trace ID, span ID)` triple.
///
/// An `ROSpan` only identifies a span; it carries no timing and cannot be
/// finished. It is what header import produces and what a live
/// [`Span`](crate::Span) is built around.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ROSpan {
    project: String,
    trace_id: TraceId,
    span_id: SpanId,
}

impl ROSpan {
    /// An empty identity in `project`: no trace, no span.
    pub fn new(project: impl Into<String>) -> ROSpan {
        ROSpan {
            project: project.into(),
            trace_id: TraceId::INVALID,
            span_id: SpanId::INVALID,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// `projects/{project}/traces/{traceID}`
    pub fn trace_path(&self) -> String {
        format!("projects/{}/traces/{}", self.project, self.trace_id)
    }

    /// `projects/{project}/traces/{traceID}/spans/{spanID}`
    pub fn span_path(&self) -> String {
        format!("{}/spans/{}", self.trace_path(), self.span_id)
    }

    /// Adopt a span identity created somewhere else. `trace_id` must be 32
    /// hex digits and not all zero; `span_id` must be nonzero.
    pub fn import(&self, trace_id: &str, span_id: u64) -> Result<ROSpan, SpanError> {
        let trace_id = TraceId::from_hex(trace_id)?;
        if !trace_id.is_valid() {
            return Err(SpanError::InvalidTraceId(trace_id.to_string()));
        }
        if span_id == 0 {
            return Err(SpanError::InvalidSpanId(SpanId::INVALID.to_string()));
        }
        Ok(ROSpan {
            project: self.project.clone(),
            trace_id,
            span_id: SpanId::from(span_id),
        })
    }

    /// Adopt the span identity carried in an `X-Cloud-Trace-Context`
    /// header. A missing or malformed header yields an *empty* identity,
    /// never an error; callers simply proceed untraced.
    pub fn import_from_headers(&self, headers: &HeaderMap) -> ROSpan {
        match propagation::parse_headers(headers) {
            Some((trace_id, span_id)) => ROSpan {
                project: self.project.clone(),
                trace_id,
                span_id,
            },
            None => ROSpan::new(self.project.clone()),
        }
    }

    /// Identity with the same project and trace but another span ID.
    pub(crate) fn with_span_id(&self, span_id: SpanId) -> ROSpan {
        ROSpan {
            project: self.project.clone(),
            trace_id: self.trace_id,
            span_id,
        }
    }

    /// Identity with the same project but a freshly generated trace.
    pub(crate) fn with_ids(&self, trace_id: TraceId, span_id: SpanId) -> ROSpan {
        ROSpan {
            project: self.project.clone(),
            trace_id,
            span_id,
        }
    }

    /// An `ROSpan` has no timing: always `None`.
    pub fn start(&self) -> Option<SystemTime> {
        None
    }

    /// An `ROSpan` has no timing: always `None`.
    pub fn duration(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    const TRACE: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn paths() {
        let ro = ROSpan::new("my-proj").import(TRACE, 42).unwrap();
        assert_eq!(ro.trace_path(), format!("projects/my-proj/traces/{TRACE}"));
        assert_eq!(
            ro.span_path(),
            format!("projects/my-proj/traces/{TRACE}/spans/000000000000002a")
        );
    }

    #[test]
    fn import_validates() {
        let ro = ROSpan::new("my-proj");
        assert!(ro.import(TRACE, 42).is_ok());
        assert!(ro.import("short", 42).is_err());
        assert!(ro.import("00000000000000000000000000000000", 42).is_err());
        assert!(ro.import(TRACE, 0).is_err());
    }

    #[test]
    fn malformed_header_yields_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(
            propagation::TRACE_CONTEXT_HEADER,
            HeaderValue::from_static("not-a-trace-context"),
        );
        let ro = ROSpan::new("my-proj").import_from_headers(&headers);
        assert_eq!(ro, ROSpan::new("my-proj"));
        assert_eq!(ro.start(), None);
        assert_eq!(ro.duration(), None);
    }
}
