//! The registrar owns the span pipeline: the bounded queue of finished
//! spans and the runner threads that batch them into Cloud Trace.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::config::{self, PipelineConfig};
use crate::context::{store_span, Context};
use crate::error::SpanError;
use crate::export::TraceClient;
use crate::metrics::CapacityUsage;
use crate::rospan::ROSpan;
use crate::span::{QueueMessage, Span};
use crate::writer::{self, WriterConfig};

/// Owns the batch-writing runners started for one project and hands out
/// span factories that feed them. Mostly you keep one per process, halt
/// it at shutdown, and let [`Registrar::new_factory`] do the rest.
pub struct Registrar {
    project: String,
    runners: usize,
    queue: Option<Sender<QueueMessage>>,
    dones: Receiver<()>,
}

impl Registrar {
    /// Starts the configured number of runners waiting to receive
    /// finished spans and register them with Cloud Trace.
    ///
    /// An empty `project` is resolved from `GOOGLE_CLOUD_PROJECT`.
    /// Pipeline tuning comes from the `SPAN_*` environment variables.
    pub fn new(project: &str, client: Arc<dyn TraceClient>) -> Result<Registrar, SpanError> {
        Registrar::with_config(project, client, PipelineConfig::default())
    }

    /// [`Registrar::new`] with explicit tuning instead of the
    /// environment's.
    pub fn with_config(
        project: &str,
        client: Arc<dyn TraceClient>,
        config: PipelineConfig,
    ) -> Result<Registrar, SpanError> {
        let project = if project.is_empty() {
            config::ambient_project()?
        } else {
            project.to_owned()
        };
        let runners = config.runners.max(1);
        let (queue_tx, queue_rx) = bounded(config.queue_capacity.max(1));
        let (dones_tx, dones_rx) = bounded(runners);
        let capacity = Arc::new(CapacityUsage::new(
            config.queue_capacity.max(1),
            "span-queue",
            &config.gauge_prefix,
        ));
        let path = format!("projects/{project}");
        for i in 0..runners {
            let client = client.clone();
            let queue_rx = queue_rx.clone();
            let dones_tx = dones_tx.clone();
            let capacity = capacity.clone();
            let writer_config = WriterConfig {
                path: path.clone(),
                max_spans: config.max_spans.max(1),
                max_batch_dur: config.max_batch_dur,
                max_lag: config.max_lag,
            };
            let spawned = thread::Builder::new()
                .name(format!("span-writer-{i}"))
                .spawn(move || {
                    writer::write_spans(client, queue_rx, dones_tx, capacity, writer_config)
                });
            if let Err(err) = spawned {
                config::fatal(&format!("can't spawn span writer thread: {err}"));
            }
        }
        Ok(Registrar {
            project,
            runners,
            queue: Some(queue_tx),
            dones: dones_rx,
        })
    }

    /// [`Registrar::new`], aborting the process on failure. Meant for
    /// server start-up paths where running untraced is not acceptable.
    pub fn must_new(project: &str, client: Arc<dyn TraceClient>) -> Registrar {
        match Registrar::new(project, client) {
            Ok(registrar) => registrar,
            Err(err) => config::fatal(&format!(
                "could not start registrar for cloud trace spans: {err}"
            )),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Returns a fresh empty span factory feeding this registrar's queue.
    pub fn new_factory(&self) -> Span {
        Span::adopt(ROSpan::new(self.project.clone()), self.queue.clone())
    }

    /// Tells the runners to terminate and waits for each to acknowledge.
    /// Idempotent. Spans finished after `halt` returns are dropped (and
    /// counted as drops), never delivered.
    ///
    /// Not waiting for `halt` can mean recently finished spans are never
    /// registered.
    pub fn halt(&mut self) {
        let Some(queue) = self.queue.take() else {
            return;
        };
        for _ in 0..self.runners {
            let _ = queue.send(QueueMessage::Shutdown);
        }
        for _ in 0..self.runners {
            let _ = self.dones.recv();
        }
    }

    /// Test hook: returns once every runner has fully processed all work
    /// enqueued before this call, flushing partial batches on the way.
    ///
    /// One flush request per runner goes onto the queue, each carrying a
    /// rendezvous reply channel. A runner acknowledges only after
    /// completing the flush the request triggered, and runners process
    /// one message at a time, so collecting every acknowledgement proves
    /// all earlier work has drained.
    pub fn wait_for_idle_runners(&self) {
        let Some(queue) = &self.queue else { return };
        let (ready_tx, ready_rx) = bounded(0);
        for _ in 0..self.runners {
            let _ = queue.send(QueueMessage::Flush(ready_tx.clone()));
        }
        for _ in 0..self.runners {
            let _ = ready_rx.recv();
        }
    }

    /// Test hook, single-runner only: returns once the runner has read
    /// everything enqueued before this call. Unlike
    /// [`Registrar::wait_for_idle_runners`] this does not force a flush.
    pub fn wait_for_runner_read(&self) {
        if self.runners != 1 {
            tracing::error!(
                runners = self.runners,
                stack = %std::backtrace::Backtrace::force_capture(),
                "wait_for_runner_read is only allowed with a single runner"
            );
            return;
        }
        let Some(queue) = &self.queue else { return };
        let (ready_tx, ready_rx) = bounded(1);
        let _ = queue.send(QueueMessage::Ack(ready_tx));
        let _ = ready_rx.recv();
    }
}

/// One-call server bootstrap: a registrar for the ambient project plus a
/// context already decorated with a span factory, ready to hand to a
/// server's request handling.
///
/// ```no_run
/// # use std::sync::Arc;
/// # fn client() -> Arc<dyn cloudtrace_spans::TraceClient> { unimplemented!() }
/// let (cx, mut registrar) = cloudtrace_spans::start_server(client()).unwrap();
/// // ... serve, deriving request spans from `cx` ...
/// registrar.halt();
/// ```
pub fn start_server(client: Arc<dyn TraceClient>) -> Result<(Context, Registrar), SpanError> {
    let registrar = Registrar::new("", client)?;
    let cx = store_span(&Context::new(), registrar.new_factory());
    Ok((cx, registrar))
}
