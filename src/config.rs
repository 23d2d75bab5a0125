//! JSON plan intake: a plan document in, a validated `Hammer` out.
//!
//! Everything that can be resolved ahead of the run is resolved here:
//! payload bytes (multipart wins over file wins over inline), TLS material,
//! CSV row sources, parsed sleep specs and the enumerated step options.
//! Unknown step custom keys are warnings, not errors.

use std::collections::HashMap;
use std::path::Path;

use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::assertion;
use crate::data_source::{CsvSpec, RowOrder, RowSource, VarKind, VarTag};
use crate::errors::ConfigError;
use crate::plan::{
    BasicAuth, Bucket, CaptureSource, CaptureSpec, Extract, Hammer, LoadShape, ProxyPolicy,
    ReportDestination, Scenario, SleepSpec, Step, StepOptions, TlsMaterial,
    DEFAULT_DURATION_SECS, DEFAULT_ITERATION_COUNT, DEFAULT_TIMEOUT_SECS,
};

fn default_load_type() -> String {
    "linear".to_string()
}

fn default_duration() -> u64 {
    DEFAULT_DURATION_SECS
}

fn default_output() -> String {
    "stdout".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_true() -> bool {
    true
}

fn default_order() -> String {
    "random".to_string()
}

fn default_tag_type() -> String {
    "string".to_string()
}

fn default_match_no() -> usize {
    1
}

/// Header values accept both the single-string and the string-list forms;
/// the internal representation is always multi-valued.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct ManualLoadEntry {
    duration: u64,
    count: u64,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    #[serde(default, rename = "type")]
    auth_type: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
struct MultipartPartEntry {
    name: String,
    #[serde(default)]
    value: String,
    #[serde(default, rename = "type")]
    part_type: String,
    #[serde(default)]
    src: String,
}

#[derive(Debug, Deserialize)]
struct RegexCaptureEntry {
    exp: String,
    #[serde(default = "default_match_no", rename = "matchNo")]
    match_no: usize,
}

#[derive(Debug, Deserialize)]
struct CaptureEntry {
    #[serde(default)]
    json_path: Option<String>,
    #[serde(default)]
    xpath: Option<String>,
    #[serde(default)]
    regexp: Option<RegexCaptureEntry>,
    from: String,
    #[serde(default)]
    header_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    tag: String,
    #[serde(default = "default_tag_type", rename = "type")]
    tag_type: String,
}

#[derive(Debug, Deserialize)]
struct CsvEntry {
    path: String,
    #[serde(default = "default_delimiter")]
    delimiter: String,
    #[serde(default)]
    skip_first_line: bool,
    #[serde(default = "default_true")]
    skip_empty_line: bool,
    #[serde(default)]
    allow_quota: bool,
    #[serde(default)]
    vars: HashMap<String, TagEntry>,
    #[serde(default = "default_order")]
    order: String,
}

#[derive(Debug, Deserialize)]
struct StepEntry {
    #[serde(default)]
    id: u16,
    #[serde(default)]
    name: String,
    url: String,
    #[serde(default)]
    auth: Option<AuthEntry>,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: Option<HashMap<String, OneOrMany>>,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    payload_file: String,
    #[serde(default)]
    payload_multipart: Vec<MultipartPartEntry>,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default)]
    sleep: String,
    #[serde(default)]
    others: HashMap<String, Value>,
    #[serde(default)]
    cert_path: String,
    #[serde(default)]
    cert_key_path: String,
    #[serde(default)]
    capture_env: HashMap<String, CaptureEntry>,
    #[serde(default, rename = "assertion")]
    assertions: Vec<String>,
}

/// Raw plan document as read from disk.
#[derive(Debug, Deserialize)]
pub struct PlanFile {
    #[serde(default)]
    request_count: Option<u64>,
    #[serde(default)]
    iteration_count: Option<u64>,
    #[serde(default = "default_load_type")]
    load_type: String,
    #[serde(default = "default_duration")]
    duration: u64,
    #[serde(default)]
    manual_load: Vec<ManualLoadEntry>,
    #[serde(default)]
    steps: Vec<StepEntry>,
    #[serde(default = "default_output")]
    output: String,
    #[serde(default)]
    proxy: Option<String>,
    #[serde(default)]
    env: HashMap<String, Value>,
    #[serde(default)]
    data: HashMap<String, CsvEntry>,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    sampling_rate: Option<u64>,
}

impl PlanFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&bytes)
    }

    /// Resolve the document into an immutable plan. Async because remote
    /// multipart files are fetched at build time.
    pub async fn into_hammer(self) -> Result<Hammer, ConfigError> {
        // Legacy `request_count` keeps working; `iteration_count` wins.
        let iteration_count = self
            .iteration_count
            .or(self.request_count)
            .unwrap_or(DEFAULT_ITERATION_COUNT);
        let load_shape: LoadShape = self.load_type.parse()?;

        let manual_buckets: Vec<Bucket> = self
            .manual_load
            .iter()
            .map(|entry| Bucket {
                duration_secs: entry.duration,
                count: entry.count,
            })
            .collect();

        let proxy = match self.proxy.as_deref().filter(|s| !s.is_empty()) {
            None => ProxyPolicy::None,
            Some(raw) if raw.contains(',') => {
                let urls = raw
                    .split(',')
                    .map(|part| parse_proxy(part.trim()))
                    .collect::<Result<Vec<_>, _>>()?;
                ProxyPolicy::RoundRobin(urls)
            }
            Some(raw) => ProxyPolicy::Single(parse_proxy(raw)?),
        };

        let report_destination = parse_output(&self.output)?;

        let mut data = HashMap::with_capacity(self.data.len());
        for (name, entry) in &self.data {
            let spec = csv_spec(name, entry)?;
            let source = RowSource::load(&spec).map_err(|e| ConfigError::CsvSource {
                name: name.clone(),
                message: e.to_string(),
            })?;
            data.insert(name.clone(), source);
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for entry in self.steps {
            steps.push(build_step(entry).await?);
        }

        let hammer = Hammer {
            iteration_count,
            duration_secs: self.duration,
            load_shape,
            manual_buckets,
            scenario: Scenario {
                envs: self.env,
                data,
                steps,
            },
            proxy,
            report_destination,
            debug: self.debug,
            sampling_rate: self.sampling_rate.unwrap_or(0),
        };
        hammer.validate()?;
        Ok(hammer)
    }
}

fn parse_proxy(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidProxy {
        url: raw.to_string(),
        message: e.to_string(),
    })
}

fn parse_output(output: &str) -> Result<ReportDestination, ConfigError> {
    match output.to_lowercase().as_str() {
        "stdout" => Ok(ReportDestination::Stdout),
        "json" | "stdout-json" => Ok(ReportDestination::JsonLines),
        other => {
            if other.starts_with("http://") || other.starts_with("https://") {
                let url = Url::parse(output).map_err(|_| {
                    ConfigError::UnknownOutput(output.to_string())
                })?;
                Ok(ReportDestination::Remote(url))
            } else {
                Err(ConfigError::UnknownOutput(output.to_string()))
            }
        }
    }
}

fn csv_spec(name: &str, entry: &CsvEntry) -> Result<CsvSpec, ConfigError> {
    let delimiter = entry.delimiter.as_bytes().first().copied().unwrap_or(b',');
    let mut vars = HashMap::with_capacity(entry.vars.len());
    for (column, tag) in &entry.vars {
        let index: usize = column.parse().map_err(|_| ConfigError::CsvSource {
            name: name.to_string(),
            message: format!("var key '{column}' is not a column index"),
        })?;
        vars.insert(
            index,
            VarTag {
                tag: tag.tag.clone(),
                kind: VarKind::parse(&tag.tag_type),
            },
        );
    }
    Ok(CsvSpec {
        path: entry.path.clone(),
        delimiter,
        skip_first_line: entry.skip_first_line,
        skip_empty_line: entry.skip_empty_line,
        allow_quota: entry.allow_quota,
        vars,
        order: RowOrder::parse(&entry.order),
    })
}

async fn build_step(entry: StepEntry) -> Result<Step, ConfigError> {
    let step_id = entry.id;
    let method = entry.method.to_uppercase();
    Method::from_bytes(method.as_bytes()).map_err(|_| ConfigError::InvalidMethod {
        step_id,
        method: entry.method.clone(),
    })?;

    // URLs without placeholders must parse now; templated ones are checked
    // per-send after interpolation.
    if !entry.url.contains("{{") {
        Url::parse(&entry.url).map_err(|e| ConfigError::InvalidUrl {
            step_id,
            url: entry.url.clone(),
            message: e.to_string(),
        })?;
    }

    let mut headers: Vec<(String, String)> = Vec::new();
    if let Some(raw_headers) = entry.headers {
        for (name, value) in raw_headers {
            match value {
                OneOrMany::One(v) => headers.push((name, v)),
                OneOrMany::Many(vs) => {
                    for v in vs {
                        headers.push((name.clone(), v));
                    }
                }
            }
        }
    }

    let payload = if !entry.payload_multipart.is_empty() {
        let (body, content_type) = build_multipart(&entry.payload_multipart).await?;
        // The generated boundary replaces any explicit Content-Type.
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-type"));
        headers.push(("Content-Type".to_string(), content_type));
        body
    } else if !entry.payload_file.is_empty() {
        std::fs::read(&entry.payload_file).map_err(|e| ConfigError::PayloadFile {
            path: entry.payload_file.clone(),
            message: e.to_string(),
        })?
    } else {
        entry.payload.into_bytes()
    };

    let auth = entry.auth.map(|auth| {
        if !auth.auth_type.is_empty() && auth.auth_type != "basic" {
            warn!(step_id, auth_type = %auth.auth_type, "unsupported auth type, using basic");
        }
        BasicAuth {
            username: auth.username,
            password: auth.password,
        }
    });

    let sleep_text: String = entry.sleep.chars().filter(|c| !c.is_whitespace()).collect();
    let sleep = SleepSpec::parse(&sleep_text).map_err(|_| ConfigError::InvalidSleep {
        step_id,
        sleep: entry.sleep.clone(),
    })?;

    let tls = load_tls_material(step_id, &entry.cert_path, &entry.cert_key_path)?;

    let mut captures = Vec::with_capacity(entry.capture_env.len());
    for (name, capture) in entry.capture_env {
        captures.push(build_capture(step_id, name, capture)?);
    }

    for rule in &entry.assertions {
        assertion::parse_rule(rule).map_err(|e| ConfigError::InvalidAssertion {
            step_id,
            rule: rule.clone(),
            message: e.to_string(),
        })?;
    }

    let options = step_options(step_id, &entry.others);

    Ok(Step {
        id: step_id,
        name: entry.name,
        method,
        url: entry.url,
        headers,
        payload,
        auth,
        timeout_secs: entry.timeout,
        sleep,
        tls,
        captures,
        assertions: entry.assertions,
        options,
    })
}

fn build_capture(
    step_id: u16,
    name: String,
    entry: CaptureEntry,
) -> Result<CaptureSpec, ConfigError> {
    let from = match entry.from.as_str() {
        "header" => CaptureSource::Header {
            key: entry.header_key.ok_or_else(|| ConfigError::Capture {
                step_id,
                name: name.clone(),
                message: "header captures need a header_key".to_string(),
            })?,
        },
        "body" => CaptureSource::Body,
        other => {
            return Err(ConfigError::Capture {
                step_id,
                name,
                message: format!("unknown capture source '{other}'"),
            })
        }
    };

    let extract = if let Some(regexp) = entry.regexp {
        regex::Regex::new(&regexp.exp).map_err(|e| ConfigError::Capture {
            step_id,
            name: name.clone(),
            message: format!("invalid regex: {e}"),
        })?;
        Extract::Regex {
            expr: regexp.exp,
            match_no: regexp.match_no,
        }
    } else if let Some(xpath) = entry.xpath {
        Extract::Xpath(xpath)
    } else if let Some(json_path) = entry.json_path {
        Extract::JsonPath(json_path)
    } else {
        return Err(ConfigError::Capture {
            step_id,
            name,
            message: "one of json_path, xpath or regexp is required".to_string(),
        });
    };

    Ok(CaptureSpec {
        name,
        from,
        extract,
    })
}

fn load_tls_material(
    step_id: u16,
    cert_path: &str,
    key_path: &str,
) -> Result<Option<TlsMaterial>, ConfigError> {
    if cert_path.is_empty() || key_path.is_empty() {
        return Ok(None);
    }

    let tls_err = |message: String| ConfigError::TlsMaterial { step_id, message };

    let cert_pem =
        std::fs::read(cert_path).map_err(|e| tls_err(format!("read '{cert_path}': {e}")))?;
    let key_pem = std::fs::read(key_path).map_err(|e| tls_err(format!("read '{key_path}': {e}")))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice()).collect();
    if certs.is_empty() {
        return Err(tls_err(format!("no certificates found in '{cert_path}'")));
    }
    for cert in certs {
        cert.map_err(|e| tls_err(format!("bad certificate in '{cert_path}': {e}")))?;
    }

    let keys: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_slice()).collect();
    if keys.is_empty() {
        return Err(tls_err(format!("no pkcs#8 private key found in '{key_path}'")));
    }
    for key in keys {
        key.map_err(|e| tls_err(format!("bad private key in '{key_path}': {e}")))?;
    }

    Ok(Some(TlsMaterial { cert_pem, key_pem }))
}

fn step_options(step_id: u16, others: &HashMap<String, Value>) -> StepOptions {
    let mut options = StepOptions::default();
    for (key, value) in others {
        match key.as_str() {
            "disable-redirect" => options.disable_redirect = value.as_bool().unwrap_or(false),
            "keep-alive" => options.keep_alive = value.as_bool().unwrap_or(true),
            "disable-compression" => options.disable_compression = value.as_bool().unwrap_or(false),
            "hostname" => options.hostname = value.as_str().map(str::to_string),
            "h2" => options.h2 = value.as_bool().unwrap_or(false),
            "abort-on-fail" => options.abort_on_fail = value.as_bool().unwrap_or(false),
            other => warn!(step_id, key = %other, "unknown step option ignored"),
        }
    }
    options
}

/// Assemble a multipart/form-data body at plan build time. Remote file parts
/// are fetched once, here, not per request.
async fn build_multipart(
    parts: &[MultipartPartEntry],
) -> Result<(Vec<u8>, String), ConfigError> {
    let boundary: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(30)
        .map(char::from)
        .collect();

    let mut body: Vec<u8> = Vec::new();
    for part in parts {
        let part_err = |message: String| ConfigError::Multipart {
            name: part.name.clone(),
            message,
        };

        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        if part.part_type.eq_ignore_ascii_case("file") {
            let (filename, content) = if part.src.eq_ignore_ascii_case("remote") {
                let url = Url::parse(&part.value)
                    .map_err(|e| part_err(format!("invalid remote url: {e}")))?;
                let filename = url
                    .path_segments()
                    .and_then(|segments| segments.last())
                    .unwrap_or("file")
                    .to_string();
                let response = reqwest::get(url)
                    .await
                    .map_err(|e| part_err(format!("fetch failed: {e}")))?;
                let content = response
                    .bytes()
                    .await
                    .map_err(|e| part_err(format!("fetch failed: {e}")))?;
                (filename, content.to_vec())
            } else {
                let filename = Path::new(&part.value)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| part.value.clone());
                let content = std::fs::read(&part.value)
                    .map_err(|e| part_err(format!("read '{}': {e}", part.value)))?;
                (filename, content)
            };
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    part.name, filename
                )
                .as_bytes(),
            );
            body.extend_from_slice(&content);
        } else {
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                    part.name
                )
                .as_bytes(),
            );
            body.extend_from_slice(part.value.as_bytes());
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    Ok((body, format!("multipart/form-data; boundary={boundary}")))
}
