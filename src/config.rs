//! Service configuration.
//!
//! Loaded from an optional JSON file (`OCR_CONFIG_FILE`) and then overridden
//! field by field from environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// How a PDF's document-level `success` flag is derived from its pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfSuccessPolicy {
    /// Successful whenever the document could be split; page failures stay per page.
    #[default]
    SplitSucceeded,
    /// Successful only when every page was recognized.
    AllPages,
}

impl FromStr for PdfSuccessPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "split_succeeded" => Ok(Self::SplitSucceeded),
            "all_pages" => Ok(Self::AllPages),
            other => anyhow::bail!(
                "Unknown PDF success policy: {} (expected split_succeeded or all_pages)",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind_addr: String,
    /// Base URL of the OpenAI-compatible engine, e.g. `http://localhost:8001/v1`.
    pub engine_url: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Prompt used when an item carries none.
    pub default_prompt: String,
    pub max_tokens: u32,
    /// Upper bound on concurrent `recognize` calls across all items and pages.
    pub max_concurrency: usize,
    /// Upper bound on concurrent remote fetches across a batch.
    pub max_concurrent_fetches: usize,
    pub fetch_timeout_secs: u64,
    pub batch_timeout_secs: Option<u64>,
    pub pdf_success_policy: PdfSuccessPolicy,
    pub body_limit_mb: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            engine_url: "http://localhost:8001/v1".to_string(),
            model: "deepseek-ai/DeepSeek-OCR".to_string(),
            api_key: None,
            default_prompt: "Free OCR.".to_string(),
            max_tokens: 8192,
            max_concurrency: 4,
            max_concurrent_fetches: 8,
            fetch_timeout_secs: 60,
            batch_timeout_secs: None,
            pdf_success_policy: PdfSuccessPolicy::default(),
            body_limit_mb: 100,
        }
    }
}

impl ServiceConfig {
    /// Load from `OCR_CONFIG_FILE` (if set) and the process environment.
    pub fn load() -> Result<Self> {
        let base = match std::env::var("OCR_CONFIG_FILE") {
            Ok(path) => Self::load_from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Apply overrides from a variable lookup, then validate.
    pub fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = var("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = var("OCR_ENGINE_URL") {
            self.engine_url = v;
        }
        if let Some(v) = var("OCR_MODEL") {
            self.model = v;
        }
        if let Some(v) = var("OCR_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = var("OCR_DEFAULT_PROMPT") {
            self.default_prompt = v;
        }
        if let Some(v) = var("OCR_MAX_TOKENS") {
            self.max_tokens = parse_var("OCR_MAX_TOKENS", &v)?;
        }
        if let Some(v) = var("OCR_MAX_CONCURRENCY") {
            self.max_concurrency = parse_var("OCR_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = var("OCR_MAX_CONCURRENT_FETCHES") {
            self.max_concurrent_fetches = parse_var("OCR_MAX_CONCURRENT_FETCHES", &v)?;
        }
        if let Some(v) = var("FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = parse_var("FETCH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("BATCH_TIMEOUT_SECS") {
            self.batch_timeout_secs = Some(parse_var("BATCH_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = var("PDF_SUCCESS_POLICY") {
            self.pdf_success_policy = v.parse()?;
        }
        if let Some(v) = var("BODY_LIMIT_MB") {
            self.body_limit_mb = parse_var("BODY_LIMIT_MB", &v)?;
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        if self.max_concurrent_fetches == 0 {
            anyhow::bail!("max_concurrent_fetches must be at least 1");
        }
        if self.max_tokens == 0 {
            anyhow::bail!("max_tokens must be at least 1");
        }
        if self.body_limit_bytes().is_none() {
            anyhow::bail!("body_limit_mb is too large: {}", self.body_limit_mb);
        }
        Ok(())
    }

    /// Request body limit in bytes, `None` if it does not fit in `usize`.
    pub fn body_limit_bytes(&self) -> Option<usize> {
        self.body_limit_mb.checked_mul(1024 * 1024)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, value))
}
