//! Integration tests for the per-step HTTP requester against a mock server.

use std::collections::HashMap;

use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use loadhammer::errors::ErrorKind;
use loadhammer::plan::{
    BasicAuth, CaptureSource, CaptureSpec, Extract, SleepSpec, Step, StepOptions,
};
use loadhammer::requester::{ClientCache, HttpRequester};

fn step(id: u16, method: &str, url: String) -> Step {
    Step {
        id,
        name: format!("step-{id}"),
        method: method.into(),
        url,
        headers: Vec::new(),
        payload: Vec::new(),
        auth: None,
        timeout_secs: 5,
        sleep: SleepSpec::None,
        tls: None,
        captures: Vec::new(),
        assertions: Vec::new(),
        options: StepOptions::default(),
    }
}

fn no_env() -> HashMap<String, Value> {
    HashMap::new()
}

#[tokio::test]
async fn basic_get_reports_status_and_size() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let cache = ClientCache::new();
    let s = step(1, "GET", format!("{}/ok", server.uri()));
    let requester = HttpRequester::init(&s, None, false, &cache).unwrap();

    let report = requester.send(&no_env()).await;

    assert_eq!(report.status_code, 200);
    assert_eq!(report.response_size_bytes, 2);
    assert!(report.error_kind.is_none());
    assert!(report.failed_assertions.is_empty());
    assert!(report.timings.total_ms >= report.timings.first_byte_ms.unwrap());
}

#[tokio::test]
async fn keep_alive_off_sends_connection_close() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .and(header("connection", "close"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(3)
        .mount(&server)
        .await;

    let cache = ClientCache::new();
    let mut s = step(1, "GET", format!("{}/ok", server.uri()));
    s.options.keep_alive = false;
    let requester = HttpRequester::init(&s, None, false, &cache).unwrap();

    for _ in 0..3 {
        let report = requester.send(&no_env()).await;
        assert_eq!(report.status_code, 200);
    }
    // Dropping the server verifies the expect(3) on the close-header mock.
}

#[tokio::test]
async fn keep_alive_default_does_not_send_close() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let cache = ClientCache::new();
    let s = step(1, "GET", format!("{}/ok", server.uri()));
    let requester = HttpRequester::init(&s, None, false, &cache).unwrap();
    requester.send(&no_env()).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let has_close = requests[0]
        .headers
        .keys()
        .any(|name| name.as_str().eq_ignore_ascii_case("connection"));
    assert!(!has_close, "default keep-alive must not send Connection");
}

#[tokio::test]
async fn disable_redirect_returns_302_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/redir"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/next"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/next"))
        .respond_with(ResponseTemplate::new(200).set_body_string("done"))
        .mount(&server)
        .await;

    let cache = ClientCache::new();
    let mut s = step(1, "GET", format!("{}/redir", server.uri()));
    s.options.disable_redirect = true;
    let requester = HttpRequester::init(&s, None, false, &cache).unwrap();
    let report = requester.send(&no_env()).await;
    assert_eq!(report.status_code, 302);

    // Default policy follows the redirect to /next.
    let s2 = step(2, "GET", format!("{}/redir", server.uri()));
    let requester = HttpRequester::init(&s2, None, false, &cache).unwrap();
    let report = requester.send(&no_env()).await;
    assert_eq!(report.status_code, 200);
    assert_eq!(report.response_size_bytes, 4);
}

#[tokio::test]
async fn headers_preserve_duplicates_and_host_overrides() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let cache = ClientCache::new();
    let mut s = step(1, "GET", server.uri());
    s.headers = vec![
        ("X-Tag".into(), "one".into()),
        ("X-Tag".into(), "two".into()),
        ("Host".into(), "vhost.test".into()),
    ];
    let requester = HttpRequester::init(&s, None, false, &cache).unwrap();
    requester.send(&no_env()).await;

    let requests = server.received_requests().await.unwrap();
    let tag_values = requests[0]
        .headers
        .iter()
        .filter(|(name, _)| name.as_str().eq_ignore_ascii_case("x-tag"))
        .flat_map(|(_, values)| values.iter().map(|v| v.to_string()))
        .collect::<Vec<_>>()
        .join(",");
    assert!(tag_values.contains("one"));
    assert!(tag_values.contains("two"));
}

#[tokio::test]
async fn basic_auth_sets_authorization_header() {
    let server = MockServer::start().await;
    // base64("user:pass") == dXNlcjpwYXNz
    Mock::given(method("GET"))
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let cache = ClientCache::new();
    let mut s = step(1, "GET", server.uri());
    s.auth = Some(BasicAuth {
        username: "user".into(),
        password: "pass".into(),
    });
    let requester = HttpRequester::init(&s, None, false, &cache).unwrap();
    let report = requester.send(&no_env()).await;
    assert_eq!(report.status_code, 200);
}

#[tokio::test]
async fn capture_and_assert_on_real_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(403)
                .set_body_string(r#"{"tok":"abc"}"#)
                .insert_header("Argentina", "Messi"),
        )
        .mount(&server)
        .await;

    let cache = ClientCache::new();
    let mut s = step(1, "GET", format!("{}/login", server.uri()));
    s.captures = vec![CaptureSpec {
        name: "token".into(),
        from: CaptureSource::Body,
        extract: Extract::JsonPath("$.tok".into()),
    }];
    s.assertions = vec![
        "equals(status_code,405)".into(),
        r#"equals(headers.Argentina,"Ronaldo")"#.into(),
    ];

    let requester = HttpRequester::init(&s, None, false, &cache).unwrap();
    let report = requester.send(&no_env()).await;

    assert_eq!(report.extracted_envs.get("token").unwrap(), "abc");
    assert_eq!(report.failed_assertions.len(), 2);
    assert_eq!(report.failed_assertions[0].received, "403");
    assert_eq!(report.failed_assertions[1].received, "\"Messi\"");
}

#[tokio::test]
async fn url_interpolation_uses_env() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/42"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let cache = ClientCache::new();
    let s = step(1, "GET", format!("{}/items/{{{{item_id}}}}", server.uri()));
    let requester = HttpRequester::init(&s, None, false, &cache).unwrap();

    let mut env = no_env();
    env.insert("item_id".into(), json!(42));
    let report = requester.send(&env).await;
    assert_eq!(report.status_code, 200);
}

#[tokio::test]
async fn debug_mode_captures_full_wire_data() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .mount(&server)
        .await;

    let cache = ClientCache::new();
    let url = format!("{}/submit", server.uri());
    let mut s = step(1, "POST", url.clone());
    s.payload = b"reqbodypayload".to_vec();
    s.headers = vec![("X".into(), "y".into())];

    let requester = HttpRequester::init(&s, None, true, &cache).unwrap();
    let report = requester.send(&no_env()).await;

    let debug = report.debug.expect("debug payload present in debug mode");
    assert_eq!(debug.request_method, "POST");
    assert_eq!(debug.request_url, url);
    assert_eq!(debug.request_body, "reqbodypayload");
    assert!(debug
        .request_headers
        .iter()
        .any(|(name, value)| name.eq_ignore_ascii_case("x") && value == "y"));
    assert_eq!(debug.response_status, 201);
    assert_eq!(debug.response_body, "created");
}

#[tokio::test]
async fn non_debug_mode_has_no_debug_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let cache = ClientCache::new();
    let s = step(1, "GET", server.uri());
    let requester = HttpRequester::init(&s, None, false, &cache).unwrap();
    let report = requester.send(&no_env()).await;
    assert!(report.debug.is_none());
}

#[tokio::test]
async fn oversized_body_yields_response_too_large() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
        .mount(&server)
        .await;

    let cache = ClientCache::new();
    let s = step(1, "GET", server.uri());
    let requester = HttpRequester::init(&s, None, false, &cache)
        .unwrap()
        .with_body_cap(256);
    let report = requester.send(&no_env()).await;

    assert_eq!(report.status_code, 200);
    assert!(matches!(
        report.error_kind,
        Some(ErrorKind::ResponseTooLarge { limit_bytes: 256 })
    ));
}

#[tokio::test]
async fn multipart_content_type_reaches_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    // Multipart payloads are assembled at plan build; the step carries the
    // generated header. Mirror that shape here.
    let cache = ClientCache::new();
    let mut s = step(1, "POST", server.uri());
    s.headers = vec![(
        "Content-Type".into(),
        "multipart/form-data; boundary=abcDEF123".into(),
    )];
    s.payload =
        b"--abcDEF123\r\nContent-Disposition: form-data; name=\"f\"\r\n\r\nv\r\n--abcDEF123--\r\n"
            .to_vec();

    let requester = HttpRequester::init(&s, None, true, &cache).unwrap();
    let report = requester.send(&no_env()).await;

    let debug = report.debug.unwrap();
    let content_type = debug
        .request_headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.clone())
        .unwrap();
    assert!(content_type.starts_with("multipart/form-data; boundary="));
}

#[tokio::test]
async fn connection_refused_maps_to_transport_error() {
    let cache = ClientCache::new();
    // Nothing listens on discard port 9.
    let s = step(1, "GET", "http://127.0.0.1:9/".into());
    let requester = HttpRequester::init(&s, None, false, &cache).unwrap();
    let report = requester.send(&no_env()).await;

    assert_eq!(report.status_code, 0);
    match report.error_kind {
        Some(ErrorKind::Transport { .. }) | Some(ErrorKind::Timeout) => {}
        other => panic!("expected transport error, got {other:?}"),
    }
}
