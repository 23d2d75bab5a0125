//! `{{var}}` placeholder substitution against an iteration environment.
//!
//! Placeholders that name an unknown variable are left in place so the
//! outgoing request makes the mistake visible instead of silently sending an
//! empty value.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").expect("valid placeholder regex")
    })
}

/// Render an environment value for injection into a string context.
///
/// Strings are inserted verbatim (no JSON quoting); everything else uses its
/// compact JSON representation.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{{var}}` in `input` with the matching env value.
pub fn interpolate(input: &str, env: &HashMap<String, Value>) -> String {
    if !input.contains("{{") {
        return input.to_string();
    }
    placeholder_re()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match env.get(name) {
                Some(value) => value_to_string(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Interpolate a payload, leaving non-UTF-8 bodies (e.g. binary multipart
/// parts) untouched.
pub fn interpolate_payload(payload: &[u8], env: &HashMap<String, Value>) -> Vec<u8> {
    match std::str::from_utf8(payload) {
        Ok(text) if text.contains("{{") => interpolate(text, env).into_bytes(),
        _ => payload.to_vec(),
    }
}
