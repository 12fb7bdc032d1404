//! The consumed slice of the Cloud Trace v2 API.
//!
//! The wire client itself lives outside this crate; the writer only needs
//! its [`TraceClient::batch_write`] operation and the JSON span model that
//! the `projects.traces.batchWrite` endpoint accepts.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use thiserror::Error as ThisError;

/// Failure modes reported by [`TraceClient::batch_write`].
#[derive(ThisError, Debug)]
#[non_exhaustive]
pub enum ClientError {
    /// The call did not complete within the timeout it was given.
    #[error("batch write deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The service answered with a non-OK status.
    #[error("cloud trace rejected the batch: {code} {message}")]
    Status { code: i32, message: String },

    /// The request never got a usable answer.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn Error + Send + Sync>),
}

impl ClientError {
    /// `true` when the failure was the per-call deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::DeadlineExceeded(_))
    }
}

/// A client capable of registering finished spans with Cloud Trace.
///
/// Implementations must be safe to call from several writer threads at
/// once and must honor `timeout` as the total budget for the call,
/// reporting [`ClientError::DeadlineExceeded`] when it runs out. A batch
/// that fails is never retried by the caller.
pub trait TraceClient: Send + Sync {
    /// Write `spans` under `trace_path` (`projects/{project}`) in one
    /// `batchWrite` call.
    fn batch_write(
        &self,
        trace_path: &str,
        spans: Vec<CloudSpan>,
        timeout: Duration,
    ) -> Result<(), ClientError>;
}

/// Body of a `projects.traces.batchWrite` call.
#[derive(Clone, Debug, Serialize)]
pub struct BatchWriteSpansRequest {
    pub spans: Vec<CloudSpan>,
}

/// One span record as the v2 API expects it.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudSpan {
    /// Full resource name, `projects/{p}/traces/{t}/spans/{s}`. Filled in
    /// by the batch writer just before dispatch.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// 16 hex digits.
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<TruncatableString>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub start_time: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub end_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_kind: Option<SpanKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "is_false")]
    pub same_process_as_parent_span: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub child_span_count: i64,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// The API's string wrapper; the service truncates over-long values.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TruncatableString {
    pub value: String,
}

impl From<&str> for TruncatableString {
    fn from(value: &str) -> Self {
        TruncatableString {
            value: value.to_owned(),
        }
    }
}

impl From<String> for TruncatableString {
    fn from(value: String) -> Self {
        TruncatableString { value }
    }
}

/// What kind of work the span describes, from its own point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanKind {
    Server,
    Client,
    Producer,
    Consumer,
}

/// A typed attribute value: string, 64-bit integer, or boolean.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeValue {
    StringValue(TruncatableString),
    IntValue(i64),
    BoolValue(bool),
}

impl AttributeValue {
    /// Capture anything printable as a string attribute.
    pub fn display(value: impl fmt::Display) -> Self {
        AttributeValue::from(value.to_string())
    }

    /// Capture an error's message as a string attribute.
    pub fn error(err: &(dyn Error + '_)) -> Self {
        AttributeValue::from(err.to_string())
    }

    /// Zero values are skipped by [`Span::add_pairs`]; note that the empty
    /// string does not count as zero.
    ///
    /// [`Span::add_pairs`]: crate::Span::add_pairs
    pub(crate) fn is_zero(&self) -> bool {
        matches!(
            self,
            AttributeValue::IntValue(0) | AttributeValue::BoolValue(false)
        )
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::StringValue(value.into())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::StringValue(value.into())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::IntValue(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::IntValue(value.into())
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::IntValue(value.into())
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::BoolValue(value)
    }
}

/// Attribute map attached to a span.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attributes {
    pub attribute_map: HashMap<String, AttributeValue>,
}

/// Span status; by convention only failures carry a message.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Status {
    pub code: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Renders a timestamp the way the API wants span times: RFC 3339 in UTC
/// with microsecond precision, trailing zeros in the fraction trimmed.
pub fn zulu_time(when: SystemTime) -> String {
    let mut out = chrono::DateTime::<chrono::Utc>::from(when)
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string();
    while out.ends_with('0') {
        out.pop();
    }
    if out.ends_with('.') {
        out.pop();
    }
    out.push('Z');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn zulu_time_microseconds() {
        let when = UNIX_EPOCH + Duration::new(1_577_934_245, 123_456_789);
        assert_eq!(zulu_time(when), "2020-01-02T03:04:05.123456Z");
    }

    #[test]
    fn zulu_time_trims_trailing_zeros() {
        let base = UNIX_EPOCH + Duration::new(1_577_934_245, 0);
        assert_eq!(zulu_time(base), "2020-01-02T03:04:05Z");
        assert_eq!(
            zulu_time(base + Duration::from_millis(500)),
            "2020-01-02T03:04:05.5Z"
        );
        assert_eq!(
            zulu_time(base + Duration::from_micros(120)),
            "2020-01-02T03:04:05.00012Z"
        );
    }

    #[test]
    fn span_serializes_as_camel_case_json() {
        let mut attribute_map = HashMap::new();
        attribute_map.insert("allowed".to_owned(), AttributeValue::BoolValue(true));
        let span = CloudSpan {
            name: "projects/p/traces/t/spans/s".to_owned(),
            span_id: "000000000000002a".to_owned(),
            parent_span_id: Some("0000000000000001".to_owned()),
            display_name: Some("main".into()),
            start_time: "2020-01-02T03:04:05Z".to_owned(),
            end_time: "2020-01-02T03:04:06Z".to_owned(),
            span_kind: Some(SpanKind::Server),
            attributes: Some(Attributes { attribute_map }),
            status: Some(Status {
                code: 5,
                message: "not found".to_owned(),
            }),
            same_process_as_parent_span: true,
            child_span_count: 2,
        };
        assert_eq!(
            serde_json::to_string(&span).unwrap(),
            concat!(
                "{\"name\":\"projects/p/traces/t/spans/s\",",
                "\"spanId\":\"000000000000002a\",",
                "\"parentSpanId\":\"0000000000000001\",",
                "\"displayName\":{\"value\":\"main\"},",
                "\"startTime\":\"2020-01-02T03:04:05Z\",",
                "\"endTime\":\"2020-01-02T03:04:06Z\",",
                "\"spanKind\":\"SERVER\",",
                "\"attributes\":{\"attributeMap\":{\"allowed\":{\"boolValue\":true}}},",
                "\"status\":{\"code\":5,\"message\":\"not found\"},",
                "\"sameProcessAsParentSpan\":true,",
                "\"childSpanCount\":2}",
            )
        );
    }

    #[test]
    fn empty_fields_are_omitted() {
        let span = CloudSpan {
            span_id: "000000000000002a".to_owned(),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&span).unwrap(),
            "{\"spanId\":\"000000000000002a\"}"
        );
    }
}
