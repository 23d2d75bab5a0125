//! Per-step HTTP requester.
//!
//! `init` validates the step and resolves a client from the shared cache;
//! `send` interpolates the request against the iteration environment, fires
//! it, measures timings on a monotonic clock, reads the body into a bounded
//! buffer, and runs captures and assertions over whatever arrived.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use reqwest::{Method, Url};
use serde_json::Value;
use tracing::{debug, warn};

use crate::assertion::{self, AssertContext};
use crate::errors::{ErrorKind, TransportKind};
use crate::extractor;
use crate::interpolate::{interpolate, interpolate_payload};
use crate::plan::Step;
use crate::report::{DebugPayload, StepReport, StepTimings};

/// Default cap on buffered response bodies.
pub const DEFAULT_BODY_CAP: usize = 10 * 1024 * 1024;

/// Everything that forces a distinct `reqwest::Client`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    timeout_secs: u64,
    keep_alive: bool,
    disable_compression: bool,
    disable_redirect: bool,
    h2: bool,
    proxy: Option<String>,
    tls_fingerprint: Option<u64>,
}

impl ClientKey {
    fn for_step(step: &Step, proxy: Option<&Url>) -> Self {
        let tls_fingerprint = step.tls.as_ref().map(|tls| {
            let mut hasher = DefaultHasher::new();
            tls.cert_pem.hash(&mut hasher);
            tls.key_pem.hash(&mut hasher);
            hasher.finish()
        });
        Self {
            timeout_secs: step.timeout_secs,
            keep_alive: step.options.keep_alive,
            disable_compression: step.options.disable_compression,
            disable_redirect: step.options.disable_redirect,
            h2: step.options.h2,
            proxy: proxy.map(|u| u.to_string()),
            tls_fingerprint,
        }
    }
}

/// Read-mostly cache of compiled HTTP clients, shared across virtual users.
/// Entries are immutable after insertion; `reqwest::Client` clones are cheap
/// handles onto the same pooled transport.
#[derive(Clone, Default)]
pub struct ClientCache {
    inner: Arc<RwLock<HashMap<ClientKey, reqwest::Client>>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, step: &Step, proxy: Option<&Url>) -> Result<reqwest::Client, ErrorKind> {
        let key = ClientKey::for_step(step, proxy);

        if let Some(client) = self
            .inner
            .read()
            .expect("client cache lock poisoned")
            .get(&key)
        {
            return Ok(client.clone());
        }

        let client = build_client(step, proxy)?;
        let mut cache = self.inner.write().expect("client cache lock poisoned");
        // A racing VU may have inserted the same key; keep the first entry.
        Ok(cache.entry(key).or_insert(client).clone())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }
}

fn build_client(step: &Step, proxy: Option<&Url>) -> Result<reqwest::Client, ErrorKind> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(step.timeout_secs))
        .danger_accept_invalid_certs(true);

    builder = match proxy {
        Some(url) => {
            let proxy = reqwest::Proxy::all(url.clone()).map_err(|e| ErrorKind::Transport {
                kind: TransportKind::ProxyConnect,
                message: e.to_string(),
            })?;
            builder.proxy(proxy)
        }
        None => builder.no_proxy(),
    };

    if !step.options.keep_alive {
        builder = builder.pool_max_idle_per_host(0);
    }
    if step.options.disable_compression {
        builder = builder.no_gzip();
    }
    if step.options.disable_redirect {
        builder = builder.redirect(reqwest::redirect::Policy::none());
    }
    if step.options.h2 {
        builder = builder.http2_prior_knowledge();
    }

    if let Some(tls) = &step.tls {
        let mut combined = tls.cert_pem.clone();
        if !combined.ends_with(b"\n") {
            combined.push(b'\n');
        }
        combined.extend_from_slice(&tls.key_pem);
        let identity =
            reqwest::Identity::from_pem(&combined).map_err(|e| ErrorKind::Transport {
                kind: TransportKind::Tls,
                message: e.to_string(),
            })?;
        builder = builder.identity(identity);
    }

    builder.build().map_err(|e| ErrorKind::Transport {
        kind: TransportKind::Other,
        message: e.to_string(),
    })
}

/// Sends one scenario step per call, reusing a cached client.
pub struct HttpRequester<'a> {
    step: &'a Step,
    client: reqwest::Client,
    debug: bool,
    body_cap: usize,
}

impl<'a> HttpRequester<'a> {
    /// Validate the step and resolve the client. Fails with `TargetInvalid`
    /// before any request is sent when the method is not a legal token.
    pub fn init(
        step: &'a Step,
        proxy: Option<&Url>,
        debug: bool,
        cache: &ClientCache,
    ) -> Result<Self, ErrorKind> {
        Method::from_bytes(step.method.as_bytes())
            .map_err(|_| ErrorKind::TargetInvalid(format!("invalid method '{}'", step.method)))?;

        let client = cache.client_for(step, proxy)?;
        Ok(Self {
            step,
            client,
            debug,
            body_cap: DEFAULT_BODY_CAP,
        })
    }

    /// Override the response body cap (default 10 MiB).
    pub fn with_body_cap(mut self, cap: usize) -> Self {
        self.body_cap = cap;
        self
    }

    /// Execute the step against the given environment.
    pub async fn send(&self, env: &HashMap<String, Value>) -> StepReport {
        let step = self.step;
        let started = Instant::now();

        let url_text = interpolate(&step.url, env);
        let url = match Url::parse(&url_text) {
            Ok(url) => url,
            Err(e) => {
                return self.failed_report(
                    ErrorKind::TargetInvalid(format!("invalid url '{url_text}': {e}")),
                    started,
                    env,
                )
            }
        };
        // Validated in init; placeholders are not allowed in methods.
        let method = match Method::from_bytes(step.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return self.failed_report(
                    ErrorKind::TargetInvalid(format!("invalid method '{}'", step.method)),
                    started,
                    env,
                )
            }
        };

        let headers = self.assemble_headers(env);
        let body = interpolate_payload(&step.payload, env);

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(auth) = &step.auth {
            builder = builder.basic_auth(
                interpolate(&auth.username, env),
                Some(interpolate(&auth.password, env)),
            );
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let request = match builder.build() {
            Ok(request) => request,
            Err(e) => {
                return self.failed_report(
                    ErrorKind::TargetInvalid(e.to_string()),
                    started,
                    env,
                )
            }
        };

        let mut debug_payload = self.debug.then(|| DebugPayload {
            request_method: request.method().to_string(),
            request_url: request.url().to_string(),
            request_headers: header_pairs(request.headers()),
            request_body: request
                .body()
                .and_then(|b| b.as_bytes())
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default(),
            response_status: 0,
            response_headers: Vec::new(),
            response_body: String::new(),
        });

        match self.client.execute(request).await {
            Ok(response) => {
                let first_byte_ms = started.elapsed().as_millis() as u64;
                let status_code = response.status().as_u16();
                let response_headers = response.headers().clone();

                let (body, read_error) = self.read_body(response).await;
                let total_ms = started.elapsed().as_millis() as u64;

                if let Some(dbg) = debug_payload.as_mut() {
                    dbg.response_status = status_code;
                    dbg.response_headers = header_pairs(&response_headers);
                    dbg.response_body = String::from_utf8_lossy(&body).into_owned();
                }

                let extracted_envs = extractor::capture_all(&step.captures, &response_headers, &body);
                let body_text = String::from_utf8_lossy(&body);
                let failed_assertions = assertion::run_all(
                    &step.assertions,
                    &AssertContext {
                        status_code,
                        response_time_ms: total_ms,
                        response_size: body.len() as u64,
                        headers: &response_headers,
                        body: &body_text,
                        env,
                    },
                );

                debug!(
                    step = %step.name,
                    status = status_code,
                    total_ms,
                    size = body.len(),
                    "step completed"
                );

                StepReport {
                    step_id: step.id,
                    step_name: step.name.clone(),
                    timings: StepTimings {
                        dns_ms: None,
                        connect_ms: None,
                        tls_ms: None,
                        first_byte_ms: Some(first_byte_ms),
                        total_ms,
                    },
                    status_code,
                    response_size_bytes: body.len() as u64,
                    failed_assertions,
                    extracted_envs,
                    error_kind: read_error,
                    debug: debug_payload,
                }
            }
            Err(e) => {
                let kind = ErrorKind::from_reqwest(&e);
                warn!(step = %step.name, error = %e, kind = %kind.label(), "request failed");
                let mut report = self.failed_report(kind, started, env);
                report.debug = debug_payload;
                report
            }
        }
    }

    fn assemble_headers(&self, env: &HashMap<String, Value>) -> HeaderMap {
        let step = self.step;
        let mut headers = HeaderMap::new();
        let mut host_seen = false;

        for (name, value) in &step.headers {
            let value = interpolate(value, env);
            if name.eq_ignore_ascii_case("host") {
                host_seen = true;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(step = %step.name, header = %name, "skipping unrepresentable header"),
            }
        }

        // The hostname option overrides the host presented to the server
        // unless the step already pins one explicitly.
        if let Some(hostname) = &step.options.hostname {
            if !host_seen {
                if let Ok(value) = HeaderValue::from_str(hostname) {
                    headers.insert(HOST, value);
                }
            }
        }

        // Connection header management is an HTTP/1 concern.
        if !step.options.keep_alive && !step.options.h2 {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }

        headers
    }

    /// Buffer the body up to the cap; larger bodies become `ResponseTooLarge`.
    async fn read_body(&self, mut response: reqwest::Response) -> (Vec<u8>, Option<ErrorKind>) {
        let mut body = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if body.len() + chunk.len() > self.body_cap {
                        return (
                            body,
                            Some(ErrorKind::ResponseTooLarge {
                                limit_bytes: self.body_cap,
                            }),
                        );
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => return (body, None),
                Err(e) => return (body, Some(ErrorKind::from_reqwest(&e))),
            }
        }
    }

    /// Report for a step that produced no response. Captures yield empty
    /// strings and assertions still run against the absent response.
    fn failed_report(
        &self,
        kind: ErrorKind,
        started: Instant,
        env: &HashMap<String, Value>,
    ) -> StepReport {
        let step = self.step;
        let total_ms = started.elapsed().as_millis() as u64;

        let empty_headers = HeaderMap::new();
        let extracted_envs: HashMap<String, String> = step
            .captures
            .iter()
            .map(|c| (c.name.clone(), String::new()))
            .collect();
        let failed_assertions = assertion::run_all(
            &step.assertions,
            &AssertContext {
                status_code: 0,
                response_time_ms: total_ms,
                response_size: 0,
                headers: &empty_headers,
                body: "",
                env,
            },
        );

        let mut report = StepReport::failed(step.id, &step.name, kind, total_ms);
        report.extracted_envs = extracted_envs;
        report.failed_assertions = failed_assertions;
        report
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            )
        })
        .collect()
}
