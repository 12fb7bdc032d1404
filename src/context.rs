//! Request-scoped context propagation.
//!
//! A [`Context`] is an immutable collection of values carried through
//! request handling; writes produce a new context sharing the old
//! entries. The helpers here store and fetch a span factory, keep a
//! request's extensions in sync, and bind the trace/span correlation
//! values a structured-logging sink attaches to each log line.

use std::any::{Any, TypeId};
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::Arc;

use http::Request;

use crate::span::Span;

/// Structured-log field under which the trace path travels
/// (`projects/{project}/traces/{traceID}`).
pub const LOG_TRACE_KEY: &str = "logging.googleapis.com/trace";

/// Structured-log field under which the 16-hex span ID travels.
pub const LOG_SPAN_KEY: &str = "logging.googleapis.com/spanId";

/// Trace-path correlation value bound by [`store_span`]; logging sinks
/// read it to attach [`LOG_TRACE_KEY`] to each line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogTraceKey(pub String);

/// Span-ID correlation value bound by [`store_span`]; logging sinks read
/// it to attach [`LOG_SPAN_KEY`] to each line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSpanKey(pub String);

/// An immutable, request-scoped collection of values, keyed by type.
#[derive(Clone, Default)]
pub struct Context {
    entries: Option<Arc<EntryMap>>,
}

type EntryMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

impl Context {
    /// Creates an empty context; it will not allocate until a value is
    /// added.
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns a copy of the context with `value` included, replacing any
    /// previous value of the same type.
    pub fn with_value<T: 'static + Send + Sync>(&self, value: T) -> Self {
        let mut entries = self.entries.as_deref().cloned().unwrap_or_default();
        entries.insert(TypeId::of::<T>(), Arc::new(value));
        Context {
            entries: Some(Arc::new(entries)),
        }
    }

    /// Returns a reference to the entry of the given type, if any.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.entries
            .as_ref()?
            .get(&TypeId::of::<T>())?
            .downcast_ref()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field(
                "entries",
                &self.entries.as_ref().map(|e| e.len()).unwrap_or(0),
            )
            .finish()
    }
}

/// Returns a derived context carrying `span` as its factory, along with
/// the log correlation values for the span's trace and ID.
pub fn store_span(cx: &Context, span: Span) -> Context {
    let mut cx = cx.clone();
    if span.trace_id().is_valid() {
        cx = cx.with_value(LogTraceKey(span.trace_path()));
        if span.span_id().is_valid() {
            cx = cx.with_value(LogSpanKey(span.span_id().to_string()));
        }
    }
    cx.with_value(span)
}

/// Returns the span factory carried by `cx`, if any.
pub fn get_span(cx: &Context) -> Option<Span> {
    cx.get::<Span>().cloned()
}

/// Derives a child span named `name` from the factory carried in `cx` and
/// returns the context decorated with it plus the child itself.
///
/// An undecorated context is logged (with a stack trace) and yields the
/// original context and an empty, detached factory, useless except that
/// calls on it keep working.
///
/// ```
/// # fn handle(cx: &cloudtrace_spans::Context) {
/// let (cx2, span) = cloudtrace_spans::context_push_span(cx, "db.lookup");
/// // ... do the work under `cx2` ...
/// span.finish();
/// # }
/// ```
pub fn context_push_span(cx: &Context, name: &str) -> (Context, Span) {
    let Some(span) = get_span(cx) else {
        tracing::warn!(
            stack = %Backtrace::force_capture(),
            "context_push_span called on an undecorated context"
        );
        return (cx.clone(), Span::detached());
    };
    let kid = span.new_span().set_display_name(name);
    (store_span(cx, kid.clone()), kid)
}

/// Like [`context_push_span`], but also returns a deep clone of `req`
/// bound to the new context, safe to hand to a concurrent outbound call
/// while the original request is still in use.
///
/// When `cx` is `None` the context stored in the request's extensions is
/// used (or a fresh one if there is none, which will log as undecorated).
pub fn request_push_span<B: Clone>(
    req: &Request<B>,
    cx: Option<&Context>,
    name: &str,
) -> (Request<B>, Context, Span) {
    let base = match cx {
        Some(cx) => cx.clone(),
        None => req.extensions().get::<Context>().cloned().unwrap_or_default(),
    };
    let (cx, span) = match get_span(&base) {
        Some(span) => {
            let kid = span.new_span().set_display_name(name);
            (store_span(&base, kid.clone()), kid)
        }
        None => {
            tracing::warn!(
                stack = %Backtrace::force_capture(),
                "request_push_span called on an undecorated context"
            );
            (base, Span::detached())
        }
    };
    let clone = clone_request(req, cx.clone());
    (clone, cx, span)
}

/// In-place variant of [`request_push_span`]: derives the child span,
/// updates `cx` to the decorated context, and installs it on the
/// request's extensions. No request clone is made.
pub fn push_span<B>(req: &mut Request<B>, cx: &mut Context, name: &str) -> Span {
    // Prefer the caller's context; fall back to the request's own.
    let base = if get_span(cx).is_some() {
        cx.clone()
    } else {
        req.extensions()
            .get::<Context>()
            .cloned()
            .unwrap_or_else(|| cx.clone())
    };
    let Some(span) = get_span(&base) else {
        tracing::warn!(
            stack = %Backtrace::force_capture(),
            "push_span called on an undecorated context"
        );
        return Span::detached();
    };
    let kid = span.new_span().set_display_name(name);
    let decorated = store_span(&base, kid.clone());
    *cx = decorated.clone();
    req.extensions_mut().insert(decorated);
    kid
}

fn clone_request<B: Clone>(req: &Request<B>, cx: Context) -> Request<B> {
    let mut clone = Request::new(req.body().clone());
    *clone.method_mut() = req.method().clone();
    *clone.uri_mut() = req.uri().clone();
    *clone.version_mut() = req.version();
    *clone.headers_mut() = req.headers().clone();
    *clone.extensions_mut() = req.extensions().clone();
    clone.extensions_mut().insert(cx);
    clone
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rospan::ROSpan;
    use crossbeam_channel::bounded;

    fn decorated() -> (Context, crossbeam_channel::Receiver<crate::span::QueueMessage>) {
        let (tx, rx) = bounded(16);
        let factory = Span::adopt(ROSpan::new("my-proj"), Some(tx));
        (store_span(&Context::new(), factory), rx)
    }

    #[test]
    fn with_value_and_get() {
        #[derive(Debug, PartialEq)]
        struct ValueA(&'static str);
        #[derive(Debug, PartialEq)]
        struct ValueB(u64);

        let cx = Context::new().with_value(ValueA("a"));
        assert_eq!(cx.get::<ValueA>(), Some(&ValueA("a")));
        assert_eq!(cx.get::<ValueB>(), None);

        let cx2 = cx.with_value(ValueB(42));
        assert_eq!(cx2.get::<ValueA>(), Some(&ValueA("a")));
        assert_eq!(cx2.get::<ValueB>(), Some(&ValueB(42)));
        // The original context is unchanged.
        assert_eq!(cx.get::<ValueB>(), None);
    }

    #[test]
    fn store_span_binds_log_correlation() {
        let (cx, _rx) = decorated();
        // The empty factory has no trace yet, so no correlation values.
        assert!(cx.get::<LogTraceKey>().is_none());

        let root = get_span(&cx).unwrap().new_trace();
        let cx = store_span(&cx, root.clone());
        assert_eq!(cx.get::<LogTraceKey>(), Some(&LogTraceKey(root.trace_path())));
        assert_eq!(
            cx.get::<LogSpanKey>(),
            Some(&LogSpanKey(root.span_id().to_string()))
        );
    }

    #[test]
    fn context_push_span_decorates() {
        let (cx, _rx) = decorated();
        let (cx2, span) = context_push_span(&cx, "handler");
        assert!(span.span_id().is_valid());
        assert_eq!(
            get_span(&cx2).map(|s| s.span_id()),
            Some(span.span_id())
        );
    }

    #[test]
    fn context_push_span_survives_undecorated_context() {
        let (cx, span) = context_push_span(&Context::new(), "nothing");
        assert!(get_span(&cx).is_none());
        assert!(!span.span_id().is_valid());
        // The detached span is inert but safe to use.
        span.set_display_name("still fine");
        assert_eq!(span.finish(), std::time::Duration::ZERO);
    }

    #[test]
    fn request_push_span_deep_clones() {
        let (cx, _rx) = decorated();
        let req = Request::builder()
            .method("GET")
            .uri("https://example.com/x")
            .header("x-probe", "1")
            .body("body".to_owned())
            .unwrap();

        let (req2, cx2, span) = request_push_span(&req, Some(&cx), "outbound");
        assert!(span.span_id().is_valid());
        assert_eq!(req2.uri(), req.uri());
        assert_eq!(req2.headers().get("x-probe"), req.headers().get("x-probe"));
        assert_eq!(req2.body(), "body");
        let carried = req2.extensions().get::<Context>().unwrap();
        assert_eq!(
            get_span(carried).map(|s| s.span_id()),
            get_span(&cx2).map(|s| s.span_id())
        );
    }

    #[test]
    fn push_span_updates_request_in_place() {
        let (cx, _rx) = decorated();
        let mut cx = cx;
        let mut req = Request::builder()
            .uri("https://example.com/y")
            .body(())
            .unwrap();

        let span = push_span(&mut req, &mut cx, "inline");
        assert!(span.span_id().is_valid());
        assert_eq!(get_span(&cx).map(|s| s.span_id()), Some(span.span_id()));
        let carried = req.extensions().get::<Context>().unwrap();
        assert_eq!(get_span(carried).map(|s| s.span_id()), Some(span.span_id()));
    }

    #[test]
    fn push_span_falls_back_to_request_context() {
        let (cx, _rx) = decorated();
        let mut req = Request::builder()
            .uri("https://example.com/z")
            .body(())
            .unwrap();
        req.extensions_mut().insert(cx);

        let mut fresh = Context::new();
        let span = push_span(&mut req, &mut fresh, "from-request");
        assert!(span.span_id().is_valid());
        assert_eq!(get_span(&fresh).map(|s| s.span_id()), Some(span.span_id()));
    }
}
