//! Assertion rules evaluated against HTTP responses.
//!
//! Rules are function-call strings such as `equals(status_code,200)` or
//! `contains(body,"welcome")`. Evaluation is pure: the same response and
//! environment always produce the same failed set. A failed rule is recorded
//! with the literal rule text and the observed value; it is never an error.

use std::collections::HashMap;

use reqwest::header::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A rule that evaluated to false, with the value the response actually had.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedAssertion {
    pub rule: String,
    pub received: String,
}

/// Parse-time errors, surfaced as plan validation failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("expected 'function(arg, ...)'")]
    Malformed,

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{func} takes {expected} argument(s), got {got}")]
    ArgCount {
        func: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("unterminated string literal")]
    UnterminatedString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Equals,
    NotEquals,
    Contains,
    Exists,
    LessThan,
    GreaterThan,
}

impl Func {
    fn name(&self) -> &'static str {
        match self {
            Func::Equals => "equals",
            Func::NotEquals => "not_equals",
            Func::Contains => "contains",
            Func::Exists => "exists",
            Func::LessThan => "less_than",
            Func::GreaterThan => "greater_than",
        }
    }

    fn arity(&self) -> usize {
        match self {
            Func::Exists => 1,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Number(f64),
    Str(String),
    Ident(String),
}

/// A parsed assertion rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    func: Func,
    args: Vec<Term>,
}

/// Parse a rule string. Used both at plan validation and before evaluation.
pub fn parse_rule(rule: &str) -> Result<Rule, RuleParseError> {
    let rule = rule.trim();
    let open = rule.find('(').ok_or(RuleParseError::Malformed)?;
    if !rule.ends_with(')') {
        return Err(RuleParseError::Malformed);
    }

    let func = match &rule[..open] {
        "equals" => Func::Equals,
        "not_equals" => Func::NotEquals,
        "contains" => Func::Contains,
        "exists" => Func::Exists,
        "less_than" => Func::LessThan,
        "greater_than" => Func::GreaterThan,
        other => return Err(RuleParseError::UnknownFunction(other.to_string())),
    };

    let args = split_args(&rule[open + 1..rule.len() - 1])?
        .into_iter()
        .map(parse_term)
        .collect::<Result<Vec<_>, _>>()?;

    if args.len() != func.arity() {
        return Err(RuleParseError::ArgCount {
            func: func.name(),
            expected: func.arity(),
            got: args.len(),
        });
    }

    Ok(Rule { func, args })
}

/// Split on top-level commas, respecting double-quoted strings.
fn split_args(input: &str) -> Result<Vec<String>, RuleParseError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                in_string = !in_string;
                current.push(ch);
            }
            '\\' if in_string => {
                current.push(ch);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' if !in_string => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if in_string {
        return Err(RuleParseError::UnterminatedString);
    }
    if !current.trim().is_empty() || !args.is_empty() {
        args.push(current.trim().to_string());
    }
    Ok(args)
}

fn parse_term(arg: String) -> Result<Term, RuleParseError> {
    if arg.starts_with('"') {
        if arg.len() < 2 || !arg.ends_with('"') {
            return Err(RuleParseError::UnterminatedString);
        }
        let inner = arg[1..arg.len() - 1].replace("\\\"", "\"");
        return Ok(Term::Str(inner));
    }
    if let Ok(n) = arg.parse::<f64>() {
        return Ok(Term::Number(n));
    }
    if arg.is_empty() {
        return Err(RuleParseError::Malformed);
    }
    Ok(Term::Ident(arg))
}

/// Everything a rule can observe about a response.
pub struct AssertContext<'a> {
    pub status_code: u16,
    pub response_time_ms: u64,
    pub response_size: u64,
    pub headers: &'a HeaderMap,
    pub body: &'a str,
    pub env: &'a HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    Number(f64),
    Str(String),
    Missing,
}

impl Resolved {
    fn display(&self) -> String {
        match self {
            Resolved::Number(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Resolved::Str(s) => format!("{s:?}"),
            Resolved::Missing => "null".to_string(),
        }
    }
}

fn resolve(term: &Term, ctx: &AssertContext<'_>) -> Resolved {
    match term {
        Term::Number(n) => Resolved::Number(*n),
        Term::Str(s) => Resolved::Str(s.clone()),
        Term::Ident(name) => match name.as_str() {
            "status_code" => Resolved::Number(ctx.status_code as f64),
            "response_time" => Resolved::Number(ctx.response_time_ms as f64),
            "response_size" => Resolved::Number(ctx.response_size as f64),
            "body" => Resolved::Str(ctx.body.to_string()),
            _ => {
                if let Some(key) = name.strip_prefix("headers.") {
                    return match ctx.headers.get(key).and_then(|v| v.to_str().ok()) {
                        Some(v) => Resolved::Str(v.to_string()),
                        None => Resolved::Missing,
                    };
                }
                let env_key = name.strip_prefix("env.").unwrap_or(name);
                match ctx.env.get(env_key) {
                    Some(Value::String(s)) => Resolved::Str(s.clone()),
                    Some(Value::Number(n)) => {
                        Resolved::Number(n.as_f64().unwrap_or(f64::NAN))
                    }
                    Some(other) => Resolved::Str(other.to_string()),
                    None => Resolved::Missing,
                }
            }
        },
    }
}

fn compare_eq(a: &Resolved, b: &Resolved) -> bool {
    match (a, b) {
        (Resolved::Missing, _) | (_, Resolved::Missing) => false,
        (Resolved::Number(x), Resolved::Number(y)) => x == y,
        (Resolved::Str(x), Resolved::Str(y)) => x == y,
        // Mixed types compare numerically when the string parses as a number.
        (Resolved::Number(x), Resolved::Str(y)) | (Resolved::Str(y), Resolved::Number(x)) => {
            y.parse::<f64>().map(|p| p == *x).unwrap_or(false)
        }
    }
}

fn as_number(r: &Resolved) -> Option<f64> {
    match r {
        Resolved::Number(n) => Some(*n),
        Resolved::Str(s) => s.parse().ok(),
        Resolved::Missing => None,
    }
}

impl Rule {
    fn evaluate(&self, ctx: &AssertContext<'_>) -> (bool, String) {
        let observed = resolve(&self.args[0], ctx);
        let passed = match self.func {
            Func::Equals => compare_eq(&observed, &resolve(&self.args[1], ctx)),
            Func::NotEquals => {
                !matches!(observed, Resolved::Missing)
                    && !compare_eq(&observed, &resolve(&self.args[1], ctx))
            }
            Func::Contains => match (&observed, resolve(&self.args[1], ctx)) {
                (Resolved::Str(hay), Resolved::Str(needle)) => hay.contains(&needle),
                (Resolved::Str(hay), Resolved::Number(n)) => {
                    hay.contains(&Resolved::Number(n).display())
                }
                _ => false,
            },
            Func::Exists => !matches!(observed, Resolved::Missing),
            Func::LessThan => match (as_number(&observed), as_number(&resolve(&self.args[1], ctx)))
            {
                (Some(x), Some(y)) => x < y,
                _ => false,
            },
            Func::GreaterThan => {
                match (as_number(&observed), as_number(&resolve(&self.args[1], ctx))) {
                    (Some(x), Some(y)) => x > y,
                    _ => false,
                }
            }
        };
        (passed, observed.display())
    }
}

/// Evaluate every rule, returning only the failures.
///
/// Unparseable rules fail with the parse error as the received value; plan
/// validation normally rejects them before a run gets here.
pub fn run_all(rules: &[String], ctx: &AssertContext<'_>) -> Vec<FailedAssertion> {
    let mut failed = Vec::new();
    for rule_text in rules {
        match parse_rule(rule_text) {
            Ok(rule) => {
                let (passed, received) = rule.evaluate(ctx);
                if !passed {
                    failed.push(FailedAssertion {
                        rule: rule_text.clone(),
                        received,
                    });
                }
            }
            Err(e) => failed.push(FailedAssertion {
                rule: rule_text.clone(),
                received: format!("parse error: {e}"),
            }),
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn ctx<'a>(
        status: u16,
        headers: &'a HeaderMap,
        body: &'a str,
        env: &'a HashMap<String, Value>,
    ) -> AssertContext<'a> {
        AssertContext {
            status_code: status,
            response_time_ms: 120,
            response_size: body.len() as u64,
            headers,
            body,
            env,
        }
    }

    #[test]
    fn parses_common_rules() {
        assert!(parse_rule("equals(status_code,200)").is_ok());
        assert!(parse_rule(r#"equals(headers.Argentina,"Ronaldo")"#).is_ok());
        assert!(parse_rule(r#"contains(body,"hello, world")"#).is_ok());
        assert!(parse_rule("exists(headers.Content-Type)").is_ok());
    }

    #[test]
    fn rejects_malformed_rules() {
        assert!(parse_rule("equals(status_code,200").is_err());
        assert!(parse_rule("frobnicate(status_code)").is_err());
        assert!(parse_rule("equals(status_code)").is_err());
        assert!(parse_rule(r#"equals(body,"open"#).is_err());
    }

    #[test]
    fn status_and_header_failures_report_received_values() {
        let mut headers = HeaderMap::new();
        headers.insert("Argentina", HeaderValue::from_static("Messi"));
        let env = HashMap::new();
        let c = ctx(403, &headers, "", &env);

        let rules = vec![
            "equals(status_code,405)".to_string(),
            r#"equals(headers.Argentina,"Ronaldo")"#.to_string(),
        ];
        let failed = run_all(&rules, &c);

        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].rule, "equals(status_code,405)");
        assert_eq!(failed[0].received, "403");
        assert_eq!(failed[1].received, "\"Messi\"");
    }

    #[test]
    fn evaluation_is_pure() {
        let headers = HeaderMap::new();
        let env = HashMap::new();
        let c = ctx(200, &headers, r#"{"ok":true}"#, &env);
        let rules = vec![
            "equals(status_code,200)".to_string(),
            r#"contains(body,"nope")"#.to_string(),
        ];

        let first = run_all(&rules, &c);
        let second = run_all(&rules, &c);
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn numeric_comparisons() {
        let headers = HeaderMap::new();
        let env = HashMap::new();
        let c = ctx(200, &headers, "ok", &env);

        assert!(run_all(&["less_than(response_time,1000)".into()], &c).is_empty());
        assert_eq!(run_all(&["greater_than(response_time,1000)".into()], &c).len(), 1);
        assert!(run_all(&["equals(response_size,2)".into()], &c).is_empty());
    }

    #[test]
    fn env_variables_resolve() {
        let headers = HeaderMap::new();
        let mut env = HashMap::new();
        env.insert("token".to_string(), Value::String("abc".into()));
        let c = ctx(200, &headers, "", &env);

        assert!(run_all(&[r#"equals(env.token,"abc")"#.into()], &c).is_empty());
        assert!(run_all(&["exists(token)".into()], &c).is_empty());
        assert_eq!(run_all(&["exists(missing_var)".into()], &c).len(), 1);
    }

    #[test]
    fn assertions_against_absent_response_still_run() {
        let headers = HeaderMap::new();
        let env = HashMap::new();
        let c = ctx(0, &headers, "", &env);

        let failed = run_all(&["equals(status_code,200)".into()], &c);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].received, "0");
    }
}
