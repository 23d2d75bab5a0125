//! The validated, immutable test plan (the "hammer") and its scenario model.
//!
//! A `Hammer` is produced once by the config intake and never mutated after
//! dispatch starts. Everything the engine, virtual users and requester need
//! is resolved here: payload bytes, parsed sleep specs, enumerated step
//! options, proxy policy and load shape.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use reqwest::Url;
use serde_json::Value;

use crate::data_source::RowSource;
use crate::errors::ConfigError;

/// Default per-step timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
/// Default iteration count when the plan specifies neither
/// `iteration_count` nor the legacy `request_count`.
pub const DEFAULT_ITERATION_COUNT: u64 = 100;
/// Default test duration in seconds.
pub const DEFAULT_DURATION_SECS: u64 = 10;

/// Shape of the load curve over the test duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadShape {
    /// Evenly spaced iterations.
    Linear,
    /// Linearly increasing rate, light start and heavy finish.
    Incremental,
    /// Rate oscillates around the mean following a sine wave.
    Waved,
}

impl FromStr for LoadShape {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(LoadShape::Linear),
            "incremental" => Ok(LoadShape::Incremental),
            "waved" => Ok(LoadShape::Waved),
            other => Err(ConfigError::UnknownLoadType(other.to_string())),
        }
    }
}

/// One manual load bucket: `count` iterations spread evenly over
/// `duration_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub duration_secs: u64,
    pub count: u64,
}

/// Where iteration reports and the final summary go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportDestination {
    /// Human-readable per-iteration lines plus a summary block.
    Stdout,
    /// One JSON object per iteration on a single line; summary as a final line.
    JsonLines,
    /// POST JSON batches to a collector endpoint.
    Remote(Url),
}

/// Per-request proxy selection policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProxyPolicy {
    #[default]
    None,
    Single(Url),
    RoundRobin(Vec<Url>),
}

impl ProxyPolicy {
    /// Pure selector: the proxy to use for a given iteration.
    pub fn pick(&self, iteration_id: u64) -> Option<&Url> {
        match self {
            ProxyPolicy::None => None,
            ProxyPolicy::Single(url) => Some(url),
            ProxyPolicy::RoundRobin(urls) => {
                if urls.is_empty() {
                    None
                } else {
                    urls.get(iteration_id as usize % urls.len())
                }
            }
        }
    }
}

/// Parsed sleep specification between scenario steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SleepSpec {
    #[default]
    None,
    /// Fixed pause in milliseconds.
    Fixed(u64),
    /// Uniform random pause in `[min, max]` milliseconds.
    Range(u64, u64),
}

impl SleepSpec {
    /// Parse `""`, `"500"` or `"300-700"`. Whitespace is stripped upstream.
    pub fn parse(s: &str) -> Result<Self, ()> {
        if s.is_empty() {
            return Ok(SleepSpec::None);
        }
        if let Some((min, max)) = s.split_once('-') {
            let min: u64 = min.parse().map_err(|_| ())?;
            let max: u64 = max.parse().map_err(|_| ())?;
            if min > max {
                return Err(());
            }
            return Ok(SleepSpec::Range(min, max));
        }
        s.parse().map(SleepSpec::Fixed).map_err(|_| ())
    }

    /// Resolve to a concrete pause, sampling ranged specs uniformly.
    pub fn pick(&self) -> Option<Duration> {
        match self {
            SleepSpec::None => None,
            SleepSpec::Fixed(ms) => Some(Duration::from_millis(*ms)),
            SleepSpec::Range(min, max) => {
                let ms = rand::thread_rng().gen_range(*min..=*max);
                Some(Duration::from_millis(ms))
            }
        }
    }
}

/// HTTP basic auth credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Client certificate and key, kept as validated PEM bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// Enumerated step options, populated from the untyped `others` bag at plan
/// build time. Unknown keys are reported as validation warnings upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOptions {
    /// Do not follow 3xx responses; return them verbatim.
    pub disable_redirect: bool,
    /// When false the connection is closed after each request.
    pub keep_alive: bool,
    /// Do not advertise or accept compressed encodings.
    pub disable_compression: bool,
    /// Overrides the host presented to the server.
    pub hostname: Option<String>,
    /// Force HTTP/2 transport.
    pub h2: bool,
    /// Abort the iteration when this step fails at the transport level.
    pub abort_on_fail: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            disable_redirect: false,
            keep_alive: true,
            disable_compression: false,
            hostname: None,
            h2: false,
            abort_on_fail: false,
        }
    }
}

/// Where a capture reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    Body,
    Header { key: String },
}

/// How a capture extracts its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extract {
    /// First match of a JSONPath query.
    JsonPath(String),
    /// String value of an XPath expression.
    Xpath(String),
    /// The `match_no`-th regex match, 1-indexed.
    Regex { expr: String, match_no: usize },
}

/// A named extraction recorded into the iteration environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSpec {
    pub name: String,
    pub from: CaptureSource,
    pub extract: Extract,
}

/// One HTTP request within a scenario.
#[derive(Debug, Clone)]
pub struct Step {
    /// Unique within the scenario.
    pub id: u16,
    pub name: String,
    /// Uppercased at plan build.
    pub method: String,
    /// May contain `{{var}}` placeholders.
    pub url: String,
    /// Order and duplicates preserved; values may contain placeholders.
    pub headers: Vec<(String, String)>,
    /// Resolved bytes: multipart wins over file wins over inline.
    pub payload: Vec<u8>,
    pub auth: Option<BasicAuth>,
    pub timeout_secs: u64,
    pub sleep: SleepSpec,
    pub tls: Option<TlsMaterial>,
    pub captures: Vec<CaptureSpec>,
    /// Rule strings evaluated against the response.
    pub assertions: Vec<String>,
    pub options: StepOptions,
}

/// An ordered sequence of steps plus the initial environment and named row
/// sources shared by every iteration.
#[derive(Debug, Clone, Default)]
pub struct Scenario {
    pub envs: HashMap<String, Value>,
    pub data: HashMap<String, RowSource>,
    pub steps: Vec<Step>,
}

/// The immutable, validated test plan.
#[derive(Debug, Clone)]
pub struct Hammer {
    pub iteration_count: u64,
    pub duration_secs: u64,
    pub load_shape: LoadShape,
    /// When non-empty, overrides count, duration and shape.
    pub manual_buckets: Vec<Bucket>,
    pub scenario: Scenario,
    pub proxy: ProxyPolicy,
    pub report_destination: ReportDestination,
    /// Forces single-VU execution and full wire capture.
    pub debug: bool,
    /// Per-second cap on reports forwarded to the sink; 0 disables sampling.
    pub sampling_rate: u64,
}

impl Hammer {
    /// Total iterations the engine will dispatch.
    pub fn effective_iteration_count(&self) -> u64 {
        if self.manual_buckets.is_empty() {
            self.iteration_count
        } else {
            self.manual_buckets.iter().map(|b| b.count).sum()
        }
    }

    /// Total test duration in seconds.
    pub fn effective_duration_secs(&self) -> u64 {
        if self.manual_buckets.is_empty() {
            self.duration_secs
        } else {
            self.manual_buckets.iter().map(|b| b.duration_secs).sum()
        }
    }

    /// Structural validation run once after plan build.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scenario.steps.is_empty() {
            return Err(ConfigError::NoSteps);
        }
        if self.effective_iteration_count() == 0 {
            return Err(ConfigError::NonPositive {
                field: "iteration_count",
            });
        }
        if self.effective_duration_secs() == 0 {
            return Err(ConfigError::NonPositive { field: "duration" });
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.scenario.steps {
            if !seen.insert(step.id) {
                return Err(ConfigError::DuplicateStepId { step_id: step.id });
            }
            if step.timeout_secs == 0 {
                return Err(ConfigError::NonPositive { field: "timeout" });
            }
        }
        Ok(())
    }
}
