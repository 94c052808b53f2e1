//! Submission normalization
//!
//! Requests arrive form-encoded, as a flat JSON object, or as a bare query
//! string. Each shape is reduced to the same ordered key/value list, which is
//! then split into control parameters and submitted files.

use std::collections::{BTreeMap, HashSet};

use axum::body::Bytes;
use serde_json::Value;

use crate::archive::{is_valid_entry_name, REPORT_ENTRY, SIGNATURE_DIR};
use crate::error::AppError;
use crate::identity::CCID_COOKIE;

pub const REPO_FIELD: &str = "repo";
pub const PROBLEM_FIELD: &str = "problem";
pub const CALLBACK_FIELD: &str = "scoreCallback";
pub const REPORT_TYPE_FIELD: &str = "reportType";

/// Repository used when the request names none
pub const DEFAULT_REPO: &str = "ext";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Request payload, tagged by wire shape
#[derive(Debug, Clone)]
pub enum RequestBody {
    Form(Bytes),
    Json(Bytes),
    Query(String),
}

impl RequestBody {
    /// Pick the wire shape from the content type. Unknown types fall back to
    /// the query string.
    pub fn from_request(content_type: Option<&str>, body: Bytes, query: Option<String>) -> Self {
        match content_type.map(media_type) {
            Some(t) if t.eq_ignore_ascii_case(FORM_CONTENT_TYPE) => RequestBody::Form(body),
            Some(t) if t.eq_ignore_ascii_case(JSON_CONTENT_TYPE) => RequestBody::Json(body),
            _ => RequestBody::Query(query.unwrap_or_default()),
        }
    }

    /// Canonical key/value view of the payload, in wire order.
    ///
    /// Form and query fields keep the first occurrence of a repeated name.
    pub fn fields(&self) -> Result<Vec<(String, String)>, AppError> {
        match self {
            RequestBody::Form(bytes) => Ok(decode_urlencoded(bytes)),
            RequestBody::Query(query) => Ok(decode_urlencoded(query.as_bytes())),
            RequestBody::Json(bytes) => decode_json(bytes),
        }
    }
}

fn media_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or("").trim()
}

fn decode_urlencoded(input: &[u8]) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    url::form_urlencoded::parse(input)
        .filter(|(key, _)| seen.insert(key.to_string()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

fn decode_json(bytes: &[u8]) -> Result<Vec<(String, String)>, AppError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| AppError::MalformedInput(format!("invalid JSON body: {}", e)))?;

    let Value::Object(map) = value else {
        return Err(AppError::MalformedInput(
            "JSON body must be an object".into(),
        ));
    };

    map.into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null => String::new(),
                Value::Array(_) | Value::Object(_) => {
                    return Err(AppError::MalformedInput(format!(
                        "field {} must be a string",
                        key
                    )));
                }
            };
            Ok((key, text))
        })
        .collect()
}

/// Control parameters carried next to the submitted files
#[derive(Debug, Clone, PartialEq)]
pub struct ControlParams {
    pub repo: String,
    pub problem: String,
    pub ccid: Option<String>,
    pub score_callback: Option<String>,
    pub report_type: Option<String>,
}

impl Default for ControlParams {
    fn default() -> Self {
        Self {
            repo: DEFAULT_REPO.to_string(),
            problem: String::new(),
            ccid: None,
            score_callback: None,
            report_type: None,
        }
    }
}

/// Submitted files, ordered by path
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Submission {
    files: BTreeMap<String, String>,
}

impl Submission {
    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Insert a file; rejects paths that are not plain relative paths, that
    /// collide with entries the archive synthesizes itself, or that would
    /// need an existing file to be a directory (and vice versa).
    ///
    /// A repeated path keeps its first content.
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) -> Result<(), AppError> {
        let path = path.into();
        check_path(&path)?;
        if self.files.contains_key(&path) {
            return Ok(());
        }
        if let Some(other) = self.conflicting_path(&path) {
            return Err(AppError::MalformedInput(format!(
                "file name {:?} is both a file and a directory (see {:?})",
                path, other
            )));
        }
        self.files.insert(path, content.into());
        Ok(())
    }

    /// An existing file that is a parent directory of `path`, or lives
    /// below `path` used as a directory
    fn conflicting_path(&self, path: &str) -> Option<&str> {
        let parent = path
            .match_indices('/')
            .find_map(|(i, _)| self.files.get_key_value(&path[..i]));
        if let Some((parent, _)) = parent {
            return Some(parent.as_str());
        }

        let dir = format!("{}/", path);
        self.files
            .range(dir.clone()..)
            .next()
            .map(|(other, _)| other.as_str())
            .filter(|other| other.starts_with(&dir))
    }

    /// Submitted files as a JSON object (path -> content)
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.files
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

fn check_path(path: &str) -> Result<(), AppError> {
    let reject = |why: &str| Err(AppError::MalformedInput(format!("{}: {:?}", why, path)));

    if !is_valid_entry_name(path) {
        return reject("file name is empty or contains control characters");
    }
    if path.starts_with('/') || path.contains('\\') {
        return reject("file name must be a relative path");
    }
    if path.split('/').any(|part| part == "..") {
        return reject("file name must not leave the submission directory");
    }
    if path.split('/').any(|part| part.is_empty() || part == ".") {
        return reject("file name has an empty or '.' component");
    }
    if path == REPORT_ENTRY
        || path
            .get(..SIGNATURE_DIR.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(SIGNATURE_DIR))
    {
        return reject("file name is reserved for the report archive");
    }
    Ok(())
}

/// A request split into control parameters and submitted files
#[derive(Debug, Clone, Default)]
pub struct NormalizedRequest {
    pub control: ControlParams,
    pub submission: Submission,
}

/// Split canonical fields into control parameters and the submission
pub fn normalize(fields: Vec<(String, String)>) -> Result<NormalizedRequest, AppError> {
    let mut request = NormalizedRequest::default();

    for (key, value) in fields {
        match key.as_str() {
            REPO_FIELD => request.control.repo = value,
            PROBLEM_FIELD => request.control.problem = value,
            CCID_COOKIE => request.control.ccid = Some(value),
            CALLBACK_FIELD => request.control.score_callback = Some(value),
            REPORT_TYPE_FIELD => request.control.report_type = Some(value),
            _ => request.submission.insert(key, value)?,
        }
    }

    Ok(request)
}

/// One-line rendering of request fields for diagnostic logs.
///
/// Multi-line values are cut to their first line followed by `...`.
pub fn summarize(fields: &[(String, String)]) -> String {
    fields
        .iter()
        .map(|(key, value)| match value.split_once('\n') {
            Some((first, _)) => format!("{}={}...", key, first),
            None => format!("{}={}", key, value),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
