use thiserror::Error;

/// Errors surfaced by span identity and attribute operations.
///
/// Misuse of a span factory (calling a mutator on an empty, imported, or
/// finished span) is *not* an error: those cases are logged and the call is
/// ignored so that chained calls keep working.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SpanError {
    /// A trace ID must be exactly 32 hex digits and not all zero.
    #[error("invalid trace id {0:?}")]
    InvalidTraceId(String),

    /// A span ID must be 16 hex digits; the zero ID means "no span" and
    /// cannot be imported.
    #[error("invalid span id {0:?}")]
    InvalidSpanId(String),

    #[error("attribute key must not be empty")]
    EmptyAttributeKey,

    /// No project was given and `GOOGLE_CLOUD_PROJECT` is not set.
    #[error("project id is empty and GOOGLE_CLOUD_PROJECT is not set")]
    NoProject,
}
