//! Result pipeline: bounded queue from virtual users to the report sink.
//!
//! The queue bound is the system's backpressure mechanism: when the sink
//! falls behind, VUs block on push. Sampling caps how many reports reach the
//! sink per one-second wall-clock window; the excess is counted into a
//! sampled-out aggregate rather than lost silently.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::report::{IterationReport, RunSummary};
use crate::reporter::ReportSink;

const SAMPLING_WINDOW: std::time::Duration = std::time::Duration::from_secs(1);

/// Pipeline tuning, derived from the plan by the engine.
pub struct PipelineConfig {
    /// Queue capacity; the engine uses 10 × pool size.
    pub capacity: usize,
    /// Per-second forward cap; 0 disables sampling.
    pub sampling_rate: u64,
    /// When false, debug payloads are stripped before they reach the sink.
    pub debug: bool,
}

/// Start the consumer task. The returned sender is cloned into every VU; the
/// join handle yields the summary and the sink back once the queue drains.
pub fn start(
    mut sink: Box<dyn ReportSink>,
    config: PipelineConfig,
) -> (
    mpsc::Sender<IterationReport>,
    JoinHandle<(RunSummary, Box<dyn ReportSink>)>,
) {
    let (tx, mut rx) = mpsc::channel::<IterationReport>(config.capacity.max(1));

    let handle = tokio::spawn(async move {
        let mut summary = RunSummary::new();
        let mut window_start = Instant::now();
        let mut forwarded_in_window: u64 = 0;
        let mut sampled_out_in_window: u64 = 0;

        while let Some(mut report) = rx.recv().await {
            if !config.debug {
                for step in &mut report.step_reports {
                    step.debug = None;
                }
            }
            summary.absorb(&report);

            if config.sampling_rate == 0 {
                sink.report(&report).await;
                continue;
            }

            let now = Instant::now();
            if now.duration_since(window_start) >= SAMPLING_WINDOW {
                if sampled_out_in_window > 0 {
                    sink.sampled_out(sampled_out_in_window).await;
                    summary.sampled_out += sampled_out_in_window;
                }
                window_start = now;
                forwarded_in_window = 0;
                sampled_out_in_window = 0;
            }

            if forwarded_in_window < config.sampling_rate {
                forwarded_in_window += 1;
                sink.report(&report).await;
            } else {
                sampled_out_in_window += 1;
            }
        }

        if sampled_out_in_window > 0 {
            sink.sampled_out(sampled_out_in_window).await;
            summary.sampled_out += sampled_out_in_window;
        }

        debug!(iterations = summary.iterations, "result pipeline drained");
        (summary, sink)
    });

    (tx, handle)
}
