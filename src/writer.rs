//! The batch writer loop.
//!
//! Each registrar runner drains the shared queue into an outgoing batch
//! and flushes it to Cloud Trace when the batch is full, when a control
//! message asks for it, or when a jittered timer fires. Flushing on a
//! control message takes precedence over size, size over the timer; any
//! flush disarms the timer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, select, Receiver, Sender};
use rand::Rng;

use crate::export::{CloudSpan, TraceClient};
use crate::metrics::{self, CapacityUsage};
use crate::span::QueueMessage;

pub(crate) struct WriterConfig {
    /// `projects/{project}`: the batchWrite target.
    pub(crate) path: String,
    pub(crate) max_spans: usize,
    pub(crate) max_batch_dur: Duration,
    pub(crate) max_lag: Duration,
}

pub(crate) fn write_spans(
    client: Arc<dyn TraceClient>,
    queue: Receiver<QueueMessage>,
    dones: Sender<()>,
    capacity: Arc<CapacityUsage>,
    cfg: WriterConfig,
) {
    let mut batch: Vec<CloudSpan> = Vec::with_capacity(cfg.max_spans);
    // Receive side of the flush timer; `None` while the timer is idle.
    let mut timeout: Option<Receiver<Instant>> = None;

    loop {
        if timeout.is_none() && !batch.is_empty() {
            // Jitter the interval by [1.0, 1.5) so parallel runners
            // de-phase instead of all firing at the backend together.
            let jitter = 1.0 + rand::thread_rng().gen::<f64>() / 2.0;
            timeout = Some(after(cfg.max_batch_dur.mul_f64(jitter)));
            tracing::trace!("armed span batch timer");
        }
        let mut full = false;
        let mut skip = false;
        // Acknowledged only after any flush this message triggers.
        let mut reply: Option<Sender<()>> = None;
        let timer = timeout.clone().unwrap_or_else(never);

        select! {
            recv(queue) -> msg => match msg {
                Err(_) => {
                    // Every sender is gone; nothing can arrive anymore.
                    let _ = dones.send(());
                    return;
                }
                Ok(msg) => {
                    capacity.record(queue.len());
                    match msg {
                        QueueMessage::Finished(mut span) => {
                            span.details.name = span.ro.span_path();
                            tracing::trace!(span = %span.details.span_id, "adding span to batch");
                            batch.push(span.details);
                        }
                        QueueMessage::Ack(ready) => {
                            let _ = ready.send(());
                            skip = true;
                        }
                        QueueMessage::Flush(ready) => {
                            tracing::trace!("flush requested");
                            reply = Some(ready);
                            full = true;
                        }
                        QueueMessage::Shutdown => {
                            flush(client.as_ref(), &mut batch, &cfg);
                            let _ = dones.send(());
                            return;
                        }
                    }
                }
            },
            recv(timer) -> _ => {
                tracing::trace!("span batch timed out");
                timeout = None;
                if batch.is_empty() {
                    skip = true;
                } else {
                    full = true;
                }
            }
        }
        if skip {
            continue;
        }
        if !full && batch.len() < cfg.max_spans {
            continue;
        }
        if !batch.is_empty() {
            timeout = None; // any flush stops the timer
            flush(client.as_ref(), &mut batch, &cfg);
        }
        if let Some(ready) = reply {
            let _ = ready.send(());
        }
    }
}

fn flush(client: &dyn TraceClient, batch: &mut Vec<CloudSpan>, cfg: &WriterConfig) {
    if batch.is_empty() {
        return;
    }
    let spans = batch.split_off(0);
    let count = spans.len();
    tracing::trace!(count, "writing span batch");
    let start = Instant::now();
    match client.batch_write(&cfg.path, spans, cfg.max_lag) {
        Ok(()) => metrics::span_created(start.elapsed(), "ok"),
        Err(err) if err.is_timeout() => metrics::span_created(start.elapsed(), "timeout"),
        Err(err) => {
            metrics::span_created(start.elapsed(), "fail");
            tracing::error!(error = %err, spans = count, "failed to create span batch");
        }
    }
}
