//! HTTP handlers
//!
//! - `POST /check`: HTML report for a form-encoded submission
//! - `GET|POST /checkNJS`: structured report plus signed archive
//! - `GET /health`: liveness probe
//!
//! Every check that gets as far as resolving an identity sets the `ccid`
//! cookie, so a browser keeps its identity across submissions.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{RawQuery, State},
    http::{header, HeaderMap},
    response::{Html, IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde_json::json;
use tracing::info;

use crate::callback::CallbackNotifier;
use crate::check::{self, Checked};
use crate::config::Config;
use crate::engine::GradingEngine;
use crate::error::AppError;
use crate::identity::CCID_COOKIE;
use crate::invoker::GradingInvoker;
use crate::pool::CheckPool;
use crate::submission::RequestBody;

/// Shared, read-only service state
pub struct AppState {
    pub config: Config,
    pub invoker: GradingInvoker,
    pub notifier: CallbackNotifier,
    pub pool: CheckPool,
}

impl AppState {
    pub fn new(config: Config, engine: Arc<dyn GradingEngine>) -> Result<Self> {
        let invoker = GradingInvoker::new(engine, config.engine_timeout);
        let notifier =
            CallbackNotifier::new(config.callback_timeout, config.callback_downgrade_https)?;
        let pool = CheckPool::new(config.max_concurrent_checks);
        info!(
            "Check pool ready: size={} engine_timeout={}s",
            config.max_concurrent_checks,
            config.engine_timeout.as_secs()
        );

        Ok(Self {
            config,
            invoker,
            notifier,
            pool,
        })
    }

    fn ccid_cookie(&self, ccid: String) -> Cookie<'static> {
        Cookie::build((CCID_COOKIE, ccid))
            .path("/")
            .max_age(time::Duration::days(self.config.ccid_cookie_max_age_days))
            .same_site(SameSite::Lax)
            .build()
    }
}

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "codecheck-intake"
    }))
}

/// HTML check. Only form-encoded bodies carry fields here.
pub async fn check_html_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = match RequestBody::from_request(content_type(&headers), body, None) {
        form @ RequestBody::Form(_) => form,
        _ => RequestBody::Form(Bytes::new()),
    };
    let stored_ccid = jar.get(CCID_COOKIE).map(|c| c.value().to_string());

    let task_state = state.clone();
    let outcome = state
        .pool
        .run(async move { Ok(check::check_html(&task_state, body, stored_ccid).await) })
        .await;

    respond(&state, jar, outcome, |report| Html(report).into_response())
}

/// Structured check from a form body, a JSON object or the query string
pub async fn check_structured_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = RequestBody::from_request(content_type(&headers), body, query);
    let stored_ccid = jar.get(CCID_COOKIE).map(|c| c.value().to_string());

    let task_state = state.clone();
    let outcome = state
        .pool
        .run(async move { Ok(check::check_structured(&task_state, body, stored_ccid).await) })
        .await;

    respond(&state, jar, outcome, |result| Json(result).into_response())
}

/// Render a check outcome. The `ccid` cookie goes out with every response
/// for which an identity was resolved, errors included.
fn respond<T>(
    state: &AppState,
    jar: CookieJar,
    outcome: Result<Checked<T>, AppError>,
    render: impl FnOnce(T) -> Response,
) -> Response {
    let expose_detail = state.config.expose_error_detail;
    let checked = match outcome {
        Ok(checked) => checked,
        Err(e) => return e.into_response_with_detail(expose_detail),
    };

    let jar = match checked.ccid {
        Some(ccid) => jar.add(state.ccid_cookie(ccid)),
        None => jar,
    };
    match checked.result {
        Ok(body) => (jar, render(body)).into_response(),
        Err(e) => (jar, e.into_response_with_detail(expose_detail)).into_response(),
    }
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive;
    use crate::config::SigningKey;
    use crate::create_router;
    use crate::engine::testing::StubEngine;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    const KEY: &str = "handler-test-signing-key-0123456789";

    fn test_config(engine_timeout: Duration) -> Config {
        Config {
            host: "127.0.0.1".into(),
            port: 8080,
            engine_command: vec!["codecheck".into()],
            engine_timeout,
            max_concurrent_checks: 2,
            signing_key: SigningKey::new(KEY).unwrap(),
            callback_downgrade_https: false,
            callback_timeout: Duration::from_secs(2),
            ccid_cookie_max_age_days: 180,
            expose_error_detail: false,
        }
    }

    fn app_with(engine: StubEngine, engine_timeout: Duration) -> (Arc<StubEngine>, axum::Router) {
        let engine = Arc::new(engine);
        let state = AppState::new(test_config(engine_timeout), engine.clone()).unwrap();
        (engine, create_router(Arc::new(state)))
    }

    fn app(engine: StubEngine) -> (Arc<StubEngine>, axum::Router) {
        app_with(engine, Duration::from_secs(5))
    }

    fn post(uri: &str, content_type: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(body.into())
            .unwrap()
    }

    fn set_cookie(response: &Response) -> String {
        response
            .headers()
            .get(header::SET_COOKIE)
            .expect("set-cookie header")
            .to_str()
            .unwrap()
            .to_string()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_, app) = app(StubEngine::new());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "codecheck-intake");
    }

    #[tokio::test]
    async fn test_structured_json_check() {
        let (engine, app) = app(StubEngine::new());
        let body = r#"{"repo":"ext","problem":"hello","Main.java":"class Main{}"}"#;

        let response = app
            .oneshot(post("/checkNJS", "application/json", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cookie = set_cookie(&response);
        let json = body_json(response).await;
        assert_eq!(json["report"], "<p>structured report</p>");
        assert_eq!(json["score"], "1/1");

        let request = engine.last_request().unwrap();
        assert_eq!(request.repo, "ext");
        assert_eq!(request.problem, "hello");
        assert_eq!(request.format.selector(), "NJS");
        assert_eq!(request.submission.get("Main.java"), Some("class Main{}"));
        assert_eq!(request.submission.len(), 1);
        assert!(cookie.starts_with(&format!("ccid={}", request.ccid)));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("SameSite=Lax"));

        let bytes = archive::decode(json["zip"].as_str().unwrap()).unwrap();
        let key = SigningKey::new(KEY).unwrap();
        let entries = archive::verify(&bytes, &key).unwrap();
        assert_eq!(entries["Main.java"], b"class Main{}");
        assert_eq!(entries["report.html"], b"<p>structured report</p>");
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_stored_ccid_reused() {
        let (engine, app) = app(StubEngine::new());
        let request = Request::builder()
            .method("POST")
            .uri("/checkNJS")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::COOKIE, "ccid=bika-tuno-ramo-lefi")
            .body(Body::from("problem=hello&a.py=print%281%29"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(set_cookie(&response).starts_with("ccid=bika-tuno-ramo-lefi"));

        let request = engine.last_request().unwrap();
        assert_eq!(request.ccid, "bika-tuno-ramo-lefi");
        assert_eq!(request.submission.get("a.py"), Some("print(1)"));
    }

    #[tokio::test]
    async fn test_explicit_ccid_overrides_cookie() {
        let (engine, app) = app(StubEngine::new());
        let request = Request::builder()
            .method("POST")
            .uri("/checkNJS")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::COOKIE, "ccid=from-cookie")
            .body(Body::from(r#"{"ccid":"from-field","a.py":"x"}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert!(set_cookie(&response).starts_with("ccid=from-field"));
        assert_eq!(engine.last_request().unwrap().ccid, "from-field");
    }

    #[tokio::test]
    async fn test_malformed_json_rejected() {
        let (engine, app) = app(StubEngine::new());
        let response = app
            .oneshot(post("/checkNJS", "application/json", "{not json"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        let json = body_json(response).await;
        assert_eq!(json["code"], "MALFORMED_INPUT");
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_reserved_path_rejected() {
        let (engine, app) = app(StubEngine::new());
        let response = app
            .oneshot(post(
                "/checkNJS",
                "application/json",
                r#"{"../etc/passwd":"x"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_structured_query_check() {
        let (engine, app) = app(StubEngine::new());
        let response = app
            .oneshot(
                Request::get("/checkNJS?repo=cs1&problem=p2&reportType=Setup&x.py=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let request = engine.last_request().unwrap();
        assert_eq!(request.repo, "cs1");
        assert_eq!(request.problem, "p2");
        assert_eq!(request.format.selector(), "Setup");
        assert_eq!(request.submission.get("x.py"), Some("1"));
    }

    #[tokio::test]
    async fn test_invalid_engine_output_is_bad_gateway() {
        let (_, app) = app(StubEngine::with_output("<html>oops</html>"));
        let response = app
            .oneshot(post("/checkNJS", "application/json", r#"{"a.py":"x"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["code"], "ENGINE_OUTPUT_INVALID");
    }

    #[tokio::test]
    async fn test_structured_timeout_still_signed() {
        let (_, app) = app_with(
            StubEngine::slow(Duration::from_secs(30)),
            Duration::from_millis(50),
        );
        let body = r#"{"a.py":"x","scoreCallback":"http://127.0.0.1:9/score"}"#;
        let response = app
            .oneshot(post("/checkNJS", "application/json", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let report = json["report"].as_str().unwrap();
        assert!(report.starts_with("Timed out after"));

        let bytes = archive::decode(json["zip"].as_str().unwrap()).unwrap();
        let entries = archive::verify(&bytes, &SigningKey::new(KEY).unwrap()).unwrap();
        assert_eq!(entries["report.html"], report.as_bytes());
    }

    #[tokio::test]
    async fn test_unreachable_callback_does_not_change_response() {
        let (_, app) = app(StubEngine::new());

        let plain = app
            .clone()
            .oneshot(post("/checkNJS", "application/json", r#"{"a.py":"x"}"#))
            .await
            .unwrap();
        assert_eq!(plain.status(), StatusCode::OK);
        let plain = body_json(plain).await;

        let body = r#"{"a.py":"x","scoreCallback":"http://127.0.0.1:9/score"}"#;
        let notified = app
            .oneshot(post("/checkNJS", "application/json", body))
            .await
            .unwrap();
        assert_eq!(notified.status(), StatusCode::OK);
        let notified = body_json(notified).await;

        assert_eq!(notified["score"], "1/1");
        assert_eq!(notified["report"], plain["report"]);
        assert_eq!(notified["zip"], plain["zip"]);
        assert!(notified["zip"].as_str().is_some_and(|zip| !zip.is_empty()));
    }

    #[tokio::test]
    async fn test_html_form_check() {
        let (engine, app) = app(StubEngine::new());
        let response = app
            .oneshot(post(
                "/check",
                "application/x-www-form-urlencoded",
                "repo=cs1&problem=loops&Loop.java=class+Loop+%7B%7D",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(set_cookie(&response).starts_with("ccid="));
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        assert_eq!(body_text(response).await, "<p>html report</p>");

        let request = engine.last_request().unwrap();
        assert_eq!(request.format.selector(), "html");
        assert_eq!(request.repo, "cs1");
        assert_eq!(request.submission.get("Loop.java"), Some("class Loop {}"));
    }

    #[tokio::test]
    async fn test_html_ignores_non_form_body() {
        let (engine, app) = app(StubEngine::new());
        let response = app
            .oneshot(post("/check", "application/json", r#"{"a.py":"x"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let request = engine.last_request().unwrap();
        assert!(request.submission.is_empty());
        assert_eq!(request.repo, "ext");
    }

    #[tokio::test]
    async fn test_html_timeout_placeholder() {
        let (_, app) = app_with(
            StubEngine::slow(Duration::from_secs(30)),
            Duration::from_millis(50),
        );
        let response = app
            .oneshot(post("/check", "application/x-www-form-urlencoded", "a.py=x"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.starts_with("Timed out after"));
    }

    #[tokio::test]
    async fn test_engine_failure_is_bad_gateway() {
        let (_, app) = app(StubEngine::failing());
        let response = app
            .oneshot(post("/check", "application/x-www-form-urlencoded", "a.py=x"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(set_cookie(&response).starts_with("ccid="));
        let json = body_json(response).await;
        assert_eq!(json["code"], "ENGINE_ERROR");
        assert!(!json["message"].as_str().unwrap().contains("exploded"));
    }

    #[tokio::test]
    async fn test_invalid_output_keeps_identity() {
        let (_, app) = app(StubEngine::with_output("not json"));
        let request = Request::builder()
            .method("POST")
            .uri("/checkNJS")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::COOKIE, "ccid=bika-tuno-ramo-lefi")
            .body(Body::from(r#"{"a.py":"x"}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(set_cookie(&response).starts_with("ccid=bika-tuno-ramo-lefi"));
    }
}
