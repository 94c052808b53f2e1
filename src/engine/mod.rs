//! Grading engine abstraction
//!
//! The engine compiles, runs and scores a submission. This crate treats it as
//! a black box:
//! - `CommandEngine`: runs an external grading program per request
//!
//! The engine module does NOT:
//! - Enforce the request deadline (see `invoker`)
//! - Interpret the rendered report

pub mod command;

use anyhow::Result;
use async_trait::async_trait;

use crate::submission::Submission;

/// Selector passed to the engine when no report type is requested
pub const DEFAULT_STRUCTURED_FORMAT: &str = "NJS";

/// Report renderer the engine should use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportFormat {
    /// Plain HTML report
    Html,
    /// Score-bearing JSON report; the selector is passed through verbatim
    Structured(String),
}

impl ReportFormat {
    /// Structured format for an optional `reportType` field
    pub fn structured(selector: Option<&str>) -> Self {
        match selector.filter(|s| !s.is_empty()) {
            Some(s) => ReportFormat::Structured(s.to_string()),
            None => ReportFormat::Structured(DEFAULT_STRUCTURED_FORMAT.to_string()),
        }
    }

    /// Value handed to the engine
    pub fn selector(&self) -> &str {
        match self {
            ReportFormat::Html => "html",
            ReportFormat::Structured(s) => s,
        }
    }
}

/// Everything the engine needs for one check
#[derive(Debug, Clone)]
pub struct GradingRequest {
    pub format: ReportFormat,
    pub repo: String,
    pub problem: String,
    pub ccid: String,
    pub submission: Submission,
}

/// Grading engine trait
#[async_trait]
pub trait GradingEngine: Send + Sync {
    /// Grade a submission and return the rendered output.
    ///
    /// Empty output means the engine gave up without a report. Dropping the
    /// returned future must stop the work in progress.
    async fn run(&self, request: &GradingRequest) -> Result<String>;
}

// Re-exports
pub use command::CommandEngine;
