//! Per-iteration reports and the aggregated run summary.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use hdrhistogram::Histogram;
use serde::Serialize;
use serde_json::Value;

use crate::assertion::FailedAssertion;
use crate::errors::ErrorKind;

/// Phase timings for one request, milliseconds on a monotonic clock.
///
/// `dns`/`connect`/`tls` stay `None` when the HTTP client does not expose the
/// phase; the schema keeps the fields so downstream sinks are stable.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepTimings {
    pub dns_ms: Option<u64>,
    pub connect_ms: Option<u64>,
    pub tls_ms: Option<u64>,
    pub first_byte_ms: Option<u64>,
    pub total_ms: u64,
}

/// Full wire capture, present only in debug runs.
#[derive(Debug, Clone, Serialize)]
pub struct DebugPayload {
    pub request_method: String,
    pub request_url: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: String,
    pub response_status: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_body: String,
}

/// Outcome of one scenario step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step_id: u16,
    pub step_name: String,
    pub timings: StepTimings,
    /// 0 when no response arrived.
    pub status_code: u16,
    pub response_size_bytes: u64,
    pub failed_assertions: Vec<FailedAssertion>,
    pub extracted_envs: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugPayload>,
}

impl StepReport {
    /// Skeleton report for a step that never produced a response.
    pub fn failed(step_id: u16, step_name: &str, kind: ErrorKind, total_ms: u64) -> Self {
        Self {
            step_id,
            step_name: step_name.to_string(),
            timings: StepTimings {
                total_ms,
                ..StepTimings::default()
            },
            status_code: 0,
            response_size_bytes: 0,
            failed_assertions: Vec::new(),
            extracted_envs: HashMap::new(),
            error_kind: Some(kind),
            debug: None,
        }
    }
}

/// One complete scenario execution by a virtual user.
#[derive(Debug, Clone, Serialize)]
pub struct IterationReport {
    /// Sequential, assigned at dispatch time, starts at 1.
    pub iteration_id: u64,
    /// Unix epoch milliseconds.
    pub started_at_ms: u64,
    pub step_reports: Vec<StepReport>,
    /// Final environment after all capture merges.
    pub env: HashMap<String, Value>,
}

impl IterationReport {
    pub fn passed(&self) -> bool {
        self.step_reports
            .iter()
            .all(|s| s.error_kind.is_none() && s.failed_assertions.is_empty())
    }
}

/// Current wall-clock time as epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Mutable aggregation over every report the pipeline sees, sampled or not.
#[derive(Debug)]
pub struct RunSummary {
    pub iterations: u64,
    pub failed_iterations: u64,
    pub status_codes: HashMap<u16, u64>,
    pub error_kinds: HashMap<String, u64>,
    pub failed_assertion_count: u64,
    pub sampled_out: u64,
    pub overruns: u64,
    pub dispatched: u64,
    pub elapsed_ms: u64,
    latency: Histogram<u64>,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            iterations: 0,
            failed_iterations: 0,
            status_codes: HashMap::new(),
            error_kinds: HashMap::new(),
            failed_assertion_count: 0,
            sampled_out: 0,
            overruns: 0,
            dispatched: 0,
            elapsed_ms: 0,
            latency: Histogram::new_with_bounds(1, 3_600_000, 3)
                .expect("static histogram bounds are valid"),
        }
    }

    /// Fold one iteration into the aggregate.
    pub fn absorb(&mut self, report: &IterationReport) {
        self.iterations += 1;
        if !report.passed() {
            self.failed_iterations += 1;
        }
        for step in &report.step_reports {
            if step.status_code != 0 {
                *self.status_codes.entry(step.status_code).or_insert(0) += 1;
            }
            if let Some(kind) = &step.error_kind {
                *self.error_kinds.entry(kind.label()).or_insert(0) += 1;
            }
            self.failed_assertion_count += step.failed_assertions.len() as u64;
            self.latency
                .record(step.timings.total_ms.max(1))
                .ok();
        }
    }

    /// Immutable, serializable view for sinks.
    pub fn snapshot(&self) -> SummarySnapshot {
        let percentiles = if self.latency.is_empty() {
            None
        } else {
            Some(LatencyPercentiles {
                mean_ms: self.latency.mean(),
                p50_ms: self.latency.value_at_quantile(0.50),
                p90_ms: self.latency.value_at_quantile(0.90),
                p95_ms: self.latency.value_at_quantile(0.95),
                p99_ms: self.latency.value_at_quantile(0.99),
                max_ms: self.latency.max(),
            })
        };
        SummarySnapshot {
            iterations: self.iterations,
            failed_iterations: self.failed_iterations,
            status_codes: self
                .status_codes
                .iter()
                .map(|(&code, &count)| (code.to_string(), count))
                .collect(),
            error_kinds: self.error_kinds.clone(),
            failed_assertion_count: self.failed_assertion_count,
            sampled_out: self.sampled_out,
            overruns: self.overruns,
            dispatched: self.dispatched,
            elapsed_ms: self.elapsed_ms,
            latency: percentiles,
        }
    }
}

/// Latency distribution of step durations across the run.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyPercentiles {
    pub mean_ms: f64,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

/// Final summary handed to the report sink on clean shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct SummarySnapshot {
    pub iterations: u64,
    pub failed_iterations: u64,
    pub status_codes: HashMap<String, u64>,
    pub error_kinds: HashMap<String, u64>,
    pub failed_assertion_count: u64,
    pub sampled_out: u64,
    pub overruns: u64,
    pub dispatched: u64,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyPercentiles>,
}
