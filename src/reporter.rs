//! Report sinks: where iteration reports and the final summary go.

use async_trait::async_trait;
use reqwest::Url;
use tracing::warn;

use crate::plan::ReportDestination;
use crate::report::{IterationReport, SummarySnapshot};

/// How many reports a remote sink accumulates before POSTing a batch.
const REMOTE_BATCH_SIZE: usize = 100;

/// Consumer side of the result pipeline.
#[async_trait]
pub trait ReportSink: Send {
    /// One (possibly sampled) iteration report.
    async fn report(&mut self, report: &IterationReport);

    /// `count` reports were dropped by sampling in the closing window.
    async fn sampled_out(&mut self, count: u64);

    /// Final summary on clean shutdown; flushes any buffered output.
    async fn done(&mut self, summary: &SummarySnapshot);
}

/// Build the sink for a plan's report destination.
pub fn for_destination(destination: &ReportDestination) -> Box<dyn ReportSink> {
    match destination {
        ReportDestination::Stdout => Box::new(StdoutReporter),
        ReportDestination::JsonLines => Box::new(JsonReporter),
        ReportDestination::Remote(url) => Box::new(RemoteReporter::new(url.clone())),
    }
}

/// Human-readable per-iteration lines plus a closing summary block.
pub struct StdoutReporter;

#[async_trait]
impl ReportSink for StdoutReporter {
    async fn report(&mut self, report: &IterationReport) {
        for step in &report.step_reports {
            let outcome = match &step.error_kind {
                Some(kind) => kind.label(),
                None if step.failed_assertions.is_empty() => "ok".to_string(),
                None => format!("{} assertion(s) failed", step.failed_assertions.len()),
            };
            println!(
                "iter {:>6}  step {:<20} {:>4}  {:>6} ms  {}",
                report.iteration_id,
                step.step_name,
                step.status_code,
                step.timings.total_ms,
                outcome
            );
        }
    }

    async fn sampled_out(&mut self, count: u64) {
        println!("         ... {count} report(s) sampled out this second");
    }

    async fn done(&mut self, summary: &SummarySnapshot) {
        println!();
        println!("iterations : {} ({} failed)", summary.iterations, summary.failed_iterations);
        println!("dispatched : {}", summary.dispatched);
        if summary.overruns > 0 {
            println!("overruns   : {}", summary.overruns);
        }
        if summary.sampled_out > 0 {
            println!("sampled out: {}", summary.sampled_out);
        }
        let mut codes: Vec<_> = summary.status_codes.iter().collect();
        codes.sort();
        for (code, count) in codes {
            println!("  status {code}: {count}");
        }
        let mut errors: Vec<_> = summary.error_kinds.iter().collect();
        errors.sort();
        for (kind, count) in errors {
            println!("  error  {kind}: {count}");
        }
        if let Some(latency) = &summary.latency {
            println!(
                "latency    : mean {:.1} ms  p50 {} ms  p95 {} ms  p99 {} ms  max {} ms",
                latency.mean_ms, latency.p50_ms, latency.p95_ms, latency.p99_ms, latency.max_ms
            );
        }
        println!("elapsed    : {} ms", summary.elapsed_ms);
    }
}

/// One JSON object per iteration on a single line; summary as a final line.
pub struct JsonReporter;

#[async_trait]
impl ReportSink for JsonReporter {
    async fn report(&mut self, report: &IterationReport) {
        match serde_json::to_string(report) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to serialize iteration report"),
        }
    }

    async fn sampled_out(&mut self, count: u64) {
        println!("{}", serde_json::json!({ "sampled_out": count }));
    }

    async fn done(&mut self, summary: &SummarySnapshot) {
        match serde_json::to_string(&serde_json::json!({ "summary": summary })) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to serialize summary"),
        }
    }
}

/// POSTs JSON batches to a collector endpoint.
pub struct RemoteReporter {
    endpoint: Url,
    client: reqwest::Client,
    batch: Vec<serde_json::Value>,
}

impl RemoteReporter {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            batch: Vec::with_capacity(REMOTE_BATCH_SIZE),
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        let result = self
            .client
            .post(self.endpoint.clone())
            .json(&batch)
            .send()
            .await;
        if let Err(e) = result {
            warn!(endpoint = %self.endpoint, error = %e, "failed to ship report batch");
        }
    }
}

#[async_trait]
impl ReportSink for RemoteReporter {
    async fn report(&mut self, report: &IterationReport) {
        match serde_json::to_value(report) {
            Ok(value) => self.batch.push(value),
            Err(e) => warn!(error = %e, "failed to serialize iteration report"),
        }
        if self.batch.len() >= REMOTE_BATCH_SIZE {
            self.flush().await;
        }
    }

    async fn sampled_out(&mut self, count: u64) {
        self.batch.push(serde_json::json!({ "sampled_out": count }));
    }

    async fn done(&mut self, summary: &SummarySnapshot) {
        match serde_json::to_value(serde_json::json!({ "summary": summary })) {
            Ok(value) => self.batch.push(value),
            Err(e) => warn!(error = %e, "failed to serialize summary"),
        }
        self.flush().await;
    }
}
