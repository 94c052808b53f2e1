//! Per-request check pipeline
//!
//! identity + normalization -> engine -> (archive, callback)
//!
//! The HTML flavour stops after the engine; the structured flavour signs an
//! archive and may notify a score callback.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::archive::ReportArchive;
use crate::callback::CallbackNotifier;
use crate::engine::{GradingRequest, ReportFormat};
use crate::error::AppError;
use crate::handlers::AppState;
use crate::identity;
use crate::submission::{normalize, summarize, NormalizedRequest, RequestBody};

/// Field of the structured response holding the base64 archive
pub const ZIP_FIELD: &str = "zip";

/// Outcome of a check.
///
/// `ccid` is set once identity resolution has happened, so it is echoed back
/// even when a later stage fails.
#[derive(Debug)]
pub struct Checked<T> {
    pub ccid: Option<String>,
    pub result: Result<T, AppError>,
}

impl<T> Checked<T> {
    fn rejected(err: AppError) -> Self {
        Self {
            ccid: None,
            result: Err(err),
        }
    }
}

/// Prepare the engine request shared by both flavours
fn prepare(
    body: &RequestBody,
    stored_ccid: Option<&str>,
    format: impl FnOnce(&NormalizedRequest) -> ReportFormat,
) -> Result<(GradingRequest, Option<String>), AppError> {
    let fields = body.fields()?;
    debug!("Check request: {}", summarize(&fields));

    let normalized = normalize(fields)?;
    let format = format(&normalized);
    let NormalizedRequest {
        control,
        submission,
    } = normalized;

    let ccid = identity::resolve(control.ccid.as_deref(), stored_ccid);

    let request = GradingRequest {
        format,
        repo: control.repo,
        problem: control.problem,
        ccid,
        submission,
    };
    Ok((request, control.score_callback))
}

/// HTML report: the engine's output is returned as-is
pub async fn check_html(
    state: &AppState,
    body: RequestBody,
    stored_ccid: Option<String>,
) -> Checked<String> {
    let (request, _) = match prepare(&body, stored_ccid.as_deref(), |_| ReportFormat::Html) {
        Ok(prepared) => prepared,
        Err(e) => return Checked::rejected(e),
    };

    info!(
        "HTML check: repo={} problem={} ccid={} files={}",
        request.repo,
        request.problem,
        request.ccid,
        request.submission.len()
    );

    let result = state
        .invoker
        .invoke(&request)
        .await
        .map(|rendered| rendered.text);

    Checked {
        ccid: Some(request.ccid),
        result,
    }
}

/// Structured report: engine result plus a signed archive, optionally
/// relayed to the score callback
pub async fn check_structured(
    state: &AppState,
    body: RequestBody,
    stored_ccid: Option<String>,
) -> Checked<Value> {
    let prepared = prepare(&body, stored_ccid.as_deref(), |normalized| {
        ReportFormat::structured(normalized.control.report_type.as_deref())
    });
    let (request, score_callback) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => return Checked::rejected(e),
    };

    info!(
        "Structured check: repo={} problem={} ccid={} files={} format={}",
        request.repo,
        request.problem,
        request.ccid,
        request.submission.len(),
        request.format.selector()
    );

    let result = grade_structured(state, &request, score_callback).await;

    Checked {
        ccid: Some(request.ccid),
        result,
    }
}

async fn grade_structured(
    state: &AppState,
    request: &GradingRequest,
    score_callback: Option<String>,
) -> Result<Value, AppError> {
    let report = state.invoker.invoke_structured(request).await?;

    let archive = ReportArchive::build(
        &request.submission,
        &report.report_html,
        &state.config.signing_key,
    )
    .map_err(AppError::Archive)?;

    if let Some(url) = score_callback.filter(|url| !url.is_empty()) {
        if report.timed_out {
            warn!(
                "Skipping score callback for timed out check: ccid={} url={}",
                request.ccid, url
            );
        } else {
            let payload = CallbackNotifier::payload(&report.result, &request.submission);
            state.notifier.dispatch(url, payload);
        }
    }

    let mut result = report.result;
    result.insert(ZIP_FIELD.to_string(), Value::String(archive.encode()));

    Ok(Value::Object(result))
}
