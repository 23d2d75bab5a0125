//! Variable capture from HTTP responses.
//!
//! A capture reads from the response body or a header and applies a JSONPath,
//! XPath or regex extractor. Captures are best-effort: any failure yields the
//! empty string and the iteration continues.

use reqwest::header::HeaderMap;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::plan::{CaptureSource, CaptureSpec, Extract};

/// Errors that can occur during a single capture.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("response body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("jsonpath query failed: {0}")]
    JsonPath(String),

    #[error("response body is not valid XML: {0}")]
    InvalidXml(String),

    #[error("xpath evaluation failed: {0}")]
    Xpath(String),

    #[error("regex did not produce match {0}")]
    RegexNoMatch(usize),

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("header '{0}' not found")]
    HeaderNotFound(String),

    #[error("header value is not valid utf-8")]
    HeaderEncoding,
}

/// Apply one capture spec against a response.
pub fn capture(
    spec: &CaptureSpec,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<String, CaptureError> {
    match &spec.from {
        CaptureSource::Header { key } => {
            let value = headers
                .get(key)
                .ok_or_else(|| CaptureError::HeaderNotFound(key.clone()))?
                .to_str()
                .map_err(|_| CaptureError::HeaderEncoding)?
                .to_string();
            extract_from_text(&spec.extract, &value)
        }
        CaptureSource::Body => {
            let text = String::from_utf8_lossy(body);
            extract_from_text(&spec.extract, &text)
        }
    }
}

/// Run every capture of a step, storing `""` for failures.
pub fn capture_all(
    specs: &[CaptureSpec],
    headers: &HeaderMap,
    body: &[u8],
) -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::with_capacity(specs.len());
    for spec in specs {
        let value = match capture(spec, headers, body) {
            Ok(v) => v,
            Err(e) => {
                debug!(capture = %spec.name, error = %e, "capture failed, storing empty string");
                String::new()
            }
        };
        out.insert(spec.name.clone(), value);
    }
    out
}

fn extract_from_text(extract: &Extract, text: &str) -> Result<String, CaptureError> {
    match extract {
        Extract::JsonPath(path) => extract_json_path(text, path),
        Extract::Xpath(path) => extract_xpath(text, path),
        Extract::Regex { expr, match_no } => extract_regex(text, expr, *match_no),
    }
}

/// First match of a JSONPath query.
pub fn extract_json_path(json_body: &str, path: &str) -> Result<String, CaptureError> {
    use serde_json_path::JsonPath;

    let json: Value =
        serde_json::from_str(json_body).map_err(|e| CaptureError::InvalidJson(e.to_string()))?;

    let json_path =
        JsonPath::parse(path).map_err(|e| CaptureError::JsonPath(format!("invalid path: {e}")))?;

    let nodes = json_path.query(&json);
    match nodes.first() {
        Some(value) => Ok(crate::interpolate::value_to_string(value)),
        None => Err(CaptureError::JsonPath(format!("'{path}' matched nothing"))),
    }
}

/// String value of an XPath expression over an XML body.
pub fn extract_xpath(xml_body: &str, path: &str) -> Result<String, CaptureError> {
    let package =
        sxd_document::parser::parse(xml_body).map_err(|e| CaptureError::InvalidXml(e.to_string()))?;
    let document = package.as_document();

    let value = sxd_xpath::evaluate_xpath(&document, path)
        .map_err(|e| CaptureError::Xpath(e.to_string()))?;

    let text = value.string();
    if text.is_empty() {
        return Err(CaptureError::Xpath(format!("'{path}' matched nothing")));
    }
    Ok(text)
}

/// The `match_no`-th regex match (1-indexed). When the pattern has a capture
/// group, group 1 is taken; otherwise the whole match.
pub fn extract_regex(text: &str, expr: &str, match_no: usize) -> Result<String, CaptureError> {
    let re = regex::Regex::new(expr)?;
    let index = match_no.saturating_sub(1);

    let caps = re
        .captures_iter(text)
        .nth(index)
        .ok_or(CaptureError::RegexNoMatch(match_no))?;

    let matched = caps
        .get(1)
        .or_else(|| caps.get(0))
        .ok_or(CaptureError::RegexNoMatch(match_no))?;
    Ok(matched.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn spec(from: CaptureSource, extract: Extract) -> CaptureSpec {
        CaptureSpec {
            name: "out".into(),
            from,
            extract,
        }
    }

    #[test]
    fn json_path_takes_first_match() {
        let body = r#"{"users":[{"id":"u1"},{"id":"u2"}]}"#;
        let result = extract_json_path(body, "$.users[*].id").unwrap();
        assert_eq!(result, "u1");
    }

    #[test]
    fn json_path_scalar_types_stringify() {
        let body = r#"{"tok":"abc","n":7,"ok":true}"#;
        assert_eq!(extract_json_path(body, "$.tok").unwrap(), "abc");
        assert_eq!(extract_json_path(body, "$.n").unwrap(), "7");
        assert_eq!(extract_json_path(body, "$.ok").unwrap(), "true");
    }

    #[test]
    fn json_path_miss_is_an_error() {
        assert!(extract_json_path(r#"{"a":1}"#, "$.missing").is_err());
        assert!(extract_json_path("not-json", "$.a").is_err());
    }

    #[test]
    fn xpath_extracts_text() {
        let xml = "<order><id>ord-9</id><total>12.5</total></order>";
        assert_eq!(extract_xpath(xml, "/order/id").unwrap(), "ord-9");
    }

    #[test]
    fn regex_match_no_is_one_indexed() {
        let text = "id=11 id=22 id=33";
        assert_eq!(extract_regex(text, r"id=(\d+)", 1).unwrap(), "11");
        assert_eq!(extract_regex(text, r"id=(\d+)", 3).unwrap(), "33");
        assert!(extract_regex(text, r"id=(\d+)", 4).is_err());
    }

    #[test]
    fn regex_without_group_uses_whole_match() {
        let text = "abc-123-def";
        assert_eq!(extract_regex(text, r"\d+", 1).unwrap(), "123");
    }

    #[test]
    fn header_capture_applies_extractor() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req-991"));

        let s = spec(
            CaptureSource::Header {
                key: "x-request-id".into(),
            },
            Extract::Regex {
                expr: r"req-(\d+)".into(),
                match_no: 1,
            },
        );
        assert_eq!(capture(&s, &headers, b"").unwrap(), "991");
    }

    #[test]
    fn failed_capture_yields_empty_string() {
        let headers = HeaderMap::new();
        let specs = vec![
            spec(CaptureSource::Body, Extract::JsonPath("$.tok".into())),
            CaptureSpec {
                name: "missing".into(),
                from: CaptureSource::Body,
                extract: Extract::JsonPath("$.nope".into()),
            },
        ];
        let out = capture_all(&specs, &headers, br#"{"tok":"abc"}"#);
        assert_eq!(out.get("out").unwrap(), "abc");
        assert_eq!(out.get("missing").unwrap(), "");
    }
}
