//! Service configuration
//!
//! Values come from an optional TOML file (`INTAKE_CONFIG`), then environment
//! variables override them. Loaded once at start-up and shared immutably.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Minimum accepted length of the archive signing key, in bytes
pub const MIN_SIGNING_KEY_LEN: usize = 32;

/// Upper bound for `CCID_COOKIE_MAX_AGE_DAYS` (about 100 years)
pub const MAX_CCID_COOKIE_MAX_AGE_DAYS: i64 = 36_500;

/// Secret used to sign report archives.
///
/// Held for the whole process lifetime and never regenerated per request.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() < MIN_SIGNING_KEY_LEN {
            anyhow::bail!(
                "SIGNING_KEY must be at least {} bytes (got {})",
                MIN_SIGNING_KEY_LEN,
                bytes.len()
            );
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey([redacted; {} bytes])", self.0.len())
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Grading engine command line (program followed by fixed arguments)
    pub engine_command: Vec<String>,
    /// Deadline for a single engine invocation
    pub engine_timeout: Duration,
    /// Number of checks that may run at the same time
    pub max_concurrent_checks: usize,
    pub signing_key: SigningKey,
    /// Rewrite `https://` score callbacks to `http://` (legacy callers only)
    pub callback_downgrade_https: bool,
    pub callback_timeout: Duration,
    pub ccid_cookie_max_age_days: i64,
    /// Put the full error chain into client-visible error bodies
    pub expose_error_detail: bool,
}

/// Raw TOML configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    engine_command: Option<String>,
    engine_timeout_secs: Option<u64>,
    max_concurrent_checks: Option<usize>,
    signing_key: Option<String>,
    callback_downgrade_https: Option<bool>,
    callback_timeout_secs: Option<u64>,
    ccid_cookie_max_age_days: Option<i64>,
    expose_error_detail: Option<bool>,
}

impl Config {
    /// Load configuration from `INTAKE_CONFIG` (if set) and the environment
    pub fn load() -> Result<Self> {
        let file = match std::env::var("INTAKE_CONFIG") {
            Ok(path) => read_file_config(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };

        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = env("INTAKE_HOST")
            .or(file.host)
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = parse_env(&env, "INTAKE_PORT")?.or(file.port).unwrap_or(8080);

        let engine_command = env("ENGINE_COMMAND")
            .or(file.engine_command)
            .unwrap_or_else(|| "codecheck".into());
        let engine_timeout_secs = parse_env(&env, "ENGINE_TIMEOUT_SECS")?
            .or(file.engine_timeout_secs)
            .unwrap_or(60);
        let max_concurrent_checks = parse_env(&env, "MAX_CONCURRENT_CHECKS")?
            .or(file.max_concurrent_checks)
            .unwrap_or(8);

        let signing_key = env("SIGNING_KEY")
            .or(file.signing_key)
            .context("SIGNING_KEY is not set")?;

        let callback_downgrade_https = parse_flag(&env, "CALLBACK_DOWNGRADE_HTTPS")?
            .or(file.callback_downgrade_https)
            .unwrap_or(false);
        let callback_timeout_secs = parse_env(&env, "CALLBACK_TIMEOUT_SECS")?
            .or(file.callback_timeout_secs)
            .unwrap_or(30);
        let ccid_cookie_max_age_days = parse_env(&env, "CCID_COOKIE_MAX_AGE_DAYS")?
            .or(file.ccid_cookie_max_age_days)
            .unwrap_or(180);
        let expose_error_detail = parse_flag(&env, "EXPOSE_ERROR_DETAIL")?
            .or(file.expose_error_detail)
            .unwrap_or(false);

        let config = Config {
            host,
            port,
            engine_command: into_command(&engine_command),
            engine_timeout: Duration::from_secs(engine_timeout_secs),
            max_concurrent_checks,
            signing_key: SigningKey::new(signing_key)?,
            callback_downgrade_https,
            callback_timeout: Duration::from_secs(callback_timeout_secs),
            ccid_cookie_max_age_days,
            expose_error_detail,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("INTAKE_PORT must be greater than 0");
        }
        if self.engine_command.is_empty() {
            anyhow::bail!("ENGINE_COMMAND must not be empty");
        }
        if self.engine_timeout.is_zero() {
            anyhow::bail!("ENGINE_TIMEOUT_SECS must be greater than 0");
        }
        if self.max_concurrent_checks == 0 {
            anyhow::bail!("MAX_CONCURRENT_CHECKS must be greater than 0");
        }
        if !(1..=MAX_CCID_COOKIE_MAX_AGE_DAYS).contains(&self.ccid_cookie_max_age_days) {
            anyhow::bail!(
                "CCID_COOKIE_MAX_AGE_DAYS must be between 1 and {}",
                MAX_CCID_COOKIE_MAX_AGE_DAYS
            );
        }
        Ok(())
    }

    /// Address the HTTP listener binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Invalid config file {}", path.display()))
}

fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {}: {}", key, raw))
        })
        .transpose()
}

fn parse_flag(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    env(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => anyhow::bail!("Invalid {}: {}", key, raw),
        })
        .transpose()
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
