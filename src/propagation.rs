//! `X-Cloud-Trace-Context` header codec.
//!
//! The wire format is `{TRACE_ID}/{SPAN_ID}[;o={FLAGS}]` where `TRACE_ID`
//! is 32 hex digits and `SPAN_ID` is, per the established Cloud Trace
//! convention, a *decimal* u64 (it is rendered back as hex everywhere
//! else). Malformed values are never an error; they read as "no span".

use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::trace_context::{SpanId, TraceId};

/// Header carrying the trace context across processes.
pub const TRACE_CONTEXT_HEADER: &str = "x-cloud-trace-context";

/// Parses a raw `X-Cloud-Trace-Context` value. Returns `None` for any
/// malformed value, including a zero trace or span ID.
pub(crate) fn parse_value(value: &str) -> Option<(TraceId, SpanId)> {
    let value = value.trim();
    // Trailing ";o=1" style options are tolerated and ignored.
    let ids = value.split(';').next().unwrap_or(value);
    let (trace, span) = ids.split_once('/')?;
    let trace_id = TraceId::from_hex(trace).ok().filter(|t| t.is_valid())?;
    let span_id = span.parse::<u64>().ok().filter(|s| *s != 0)?;
    Some((trace_id, SpanId::from(span_id)))
}

/// Extracts the trace context from a request's headers, if present and
/// well formed.
pub(crate) fn parse_headers(headers: &HeaderMap) -> Option<(TraceId, SpanId)> {
    let value = headers.get(TRACE_CONTEXT_HEADER)?.to_str().ok()?;
    parse_value(value)
}

/// Renders the header value for an outbound request.
pub fn header_value(trace_id: TraceId, span_id: SpanId) -> String {
    format!("{}/{};o=1", trace_id, span_id.to_u64())
}

/// Sets `X-Cloud-Trace-Context` on `headers`. Does nothing for an invalid
/// trace or span ID.
pub fn set_header(headers: &mut HeaderMap, trace_id: TraceId, span_id: SpanId) {
    if !trace_id.is_valid() || !span_id.is_valid() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&header_value(trace_id, span_id)) {
        headers.insert(HeaderName::from_static(TRACE_CONTEXT_HEADER), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn parse_accepted() {
        let cases = [
            (format!("{TRACE}/42"), 42u64),
            (format!("{TRACE}/42;o=1"), 42),
            (format!("{TRACE}/42;o=TRACE_TRUE"), 42),
            (format!("  {TRACE}/42  "), 42),
            (format!("{TRACE}/18446744073709551615"), u64::MAX),
        ];
        for (value, want_span) in cases {
            let (trace_id, span_id) = parse_value(&value).unwrap_or_else(|| {
                panic!("{value:?} should parse");
            });
            assert_eq!(trace_id, TraceId::from_hex(TRACE).unwrap());
            assert_eq!(span_id.to_u64(), want_span);
        }
    }

    #[rustfmt::skip]
    fn rejected() -> Vec<(String, &'static str)> {
        vec![
            (String::new(),                        "empty value"),
            (TRACE.to_owned(),                     "no span part"),
            (format!("{TRACE}/"),                  "empty span part"),
            (format!("{TRACE}/0"),                 "zero span id"),
            (format!("{TRACE}/2a"),                "hex span id"),
            (format!("{TRACE}/-42"),               "negative span id"),
            (format!("{TRACE}/18446744073709551616"), "span id overflow"),
            ("0123/42".to_owned(),                 "short trace id"),
            (format!("{TRACE}ff/42"),              "long trace id"),
            ("00000000000000000000000000000000/42".to_owned(), "zero trace id"),
            (format!("{}zz/42", &TRACE[..30]),     "non-hex trace id"),
        ]
    }

    #[test]
    fn parse_rejected() {
        for (value, reason) in rejected() {
            assert!(parse_value(&value).is_none(), "{reason}: {value:?}");
        }
    }

    #[test]
    fn header_round_trip() {
        for span in [1u64, 42, 0x2a2a_2a2a, u64::MAX] {
            let trace_id = TraceId::from_hex(TRACE).unwrap();
            let rendered = header_value(trace_id, SpanId::from(span));
            let (got_trace, got_span) = parse_value(&rendered).unwrap();
            assert_eq!(got_trace, trace_id);
            assert_eq!(got_span.to_u64(), span);
        }
    }

    #[test]
    fn set_header_skips_invalid() {
        let mut headers = HeaderMap::new();
        set_header(&mut headers, TraceId::INVALID, SpanId::from(1));
        assert!(headers.get(TRACE_CONTEXT_HEADER).is_none());

        set_header(
            &mut headers,
            TraceId::from_hex(TRACE).unwrap(),
            SpanId::from(42),
        );
        assert_eq!(
            headers.get(TRACE_CONTEXT_HEADER).unwrap(),
            &format!("{TRACE}/42;o=1")
        );
    }
}
