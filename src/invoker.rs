//! Grading invoker
//!
//! The single call into the grading engine per request. The call is raced
//! against a deadline; a late or silent engine yields a placeholder report
//! instead of an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::engine::{GradingEngine, GradingRequest};
use crate::error::AppError;

/// Field of a structured result holding the HTML report
pub const REPORT_FIELD: &str = "report";

/// Text output of one engine call
#[derive(Debug, Clone)]
pub struct Rendered {
    pub text: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Parsed output of a structured engine call
#[derive(Debug, Clone)]
pub struct StructuredReport {
    /// Engine result object, passed through to the caller
    pub result: Map<String, Value>,
    /// Value of the result's `report` field
    pub report_html: String,
    pub timed_out: bool,
}

/// Placeholder report used when the engine produced nothing in time
pub fn timeout_report(elapsed: Duration) -> String {
    format!("Timed out after {:5.0} seconds\n", elapsed.as_secs_f64())
}

pub struct GradingInvoker {
    engine: Arc<dyn GradingEngine>,
    deadline: Duration,
}

impl GradingInvoker {
    pub fn new(engine: Arc<dyn GradingEngine>, deadline: Duration) -> Self {
        Self { engine, deadline }
    }

    /// Run the engine once and return its raw output.
    pub async fn invoke(&self, request: &GradingRequest) -> Result<Rendered, AppError> {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.deadline, self.engine.run(request)).await;
        let elapsed = start.elapsed();

        let text = match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                info!(
                    "Check finished: repo={} problem={} ccid={} elapsed_ms={}",
                    request.repo,
                    request.problem,
                    request.ccid,
                    elapsed.as_millis()
                );
                return Ok(Rendered {
                    text,
                    timed_out: false,
                    elapsed,
                });
            }
            Ok(Ok(_)) => {
                warn!(
                    "Grading engine produced no output: repo={} problem={} elapsed_ms={}",
                    request.repo,
                    request.problem,
                    elapsed.as_millis()
                );
                timeout_report(elapsed)
            }
            Ok(Err(e)) => return Err(AppError::Engine(e)),
            Err(_) => {
                warn!(
                    "Grading engine exceeded deadline of {}s: repo={} problem={}",
                    self.deadline.as_secs(),
                    request.repo,
                    request.problem
                );
                timeout_report(elapsed)
            }
        };

        Ok(Rendered {
            text,
            timed_out: true,
            elapsed,
        })
    }

    /// Run the engine once and parse its structured result.
    ///
    /// A timed-out check becomes `{"report": <placeholder>}`.
    pub async fn invoke_structured(
        &self,
        request: &GradingRequest,
    ) -> Result<StructuredReport, AppError> {
        let rendered = self.invoke(request).await?;
        if rendered.timed_out {
            let mut result = Map::new();
            result.insert(REPORT_FIELD.to_string(), Value::String(rendered.text.clone()));
            return Ok(StructuredReport {
                result,
                report_html: rendered.text,
                timed_out: true,
            });
        }

        parse_structured(&rendered.text).map_err(AppError::EngineOutput)
    }
}

fn parse_structured(text: &str) -> anyhow::Result<StructuredReport> {
    let value: Value = serde_json::from_str(text).context("Engine output is not JSON")?;
    let Value::Object(result) = value else {
        anyhow::bail!("Engine output is not a JSON object");
    };
    let report_html = result
        .get(REPORT_FIELD)
        .and_then(Value::as_str)
        .context("Engine output has no string report field")?
        .to_string();

    Ok(StructuredReport {
        result,
        report_html,
        timed_out: false,
    })
}
