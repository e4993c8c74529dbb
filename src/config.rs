//! Service configuration.
//!
//! Defaults, then an optional YAML file named by `PROOFREAD_CONFIG`
//! (feature `yaml`), then `PROOFREAD_*` environment variables. A value that
//! does not parse is logged and ignored.

use crate::error::{PipelineError, Result};
use crate::merge::MergeConfig;
use crate::producer::LocateMode;
use crate::types::{ErrorType, PipelineEntry};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming the YAML config file.
pub const CONFIG_PATH_VAR: &str = "PROOFREAD_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address.
    pub bind: String,
    /// OpenAI-compatible endpoint base.
    pub llm_base_url: String,
    #[serde(skip_serializing)]
    pub llm_api_key: Option<String>,
    /// Default model of the LLM roles.
    pub model: String,
    /// Whole-request deadline.
    pub request_timeout_ms: u64,
    /// SSE `:ping` interval.
    pub heartbeat_ms: u64,
    pub merge_confidence_first: bool,
    pub type_priority: Vec<ErrorType>,
    pub basic_locate: LocateMode,
    pub reviewer_locate: LocateMode,
    /// Concurrent LLM calls across all requests.
    pub llm_max_concurrency: usize,
    /// Longest accepted input, in UTF-16 code units.
    pub max_text_chars: usize,
    /// Stream `basic` replies for partial results.
    pub streaming: bool,
    /// Pipeline used when a request does not name one.
    pub default_pipeline: Vec<PipelineEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            llm_base_url: "https://api.openai.com".to_string(),
            llm_api_key: None,
            model: "gpt-4o-mini".to_string(),
            request_timeout_ms: 60_000,
            heartbeat_ms: 15_000,
            merge_confidence_first: false,
            type_priority: ErrorType::builtin(),
            basic_locate: LocateMode::UniqueSubstring,
            reviewer_locate: LocateMode::ExactIndex,
            llm_max_concurrency: 8,
            max_text_chars: 10_000,
            streaming: true,
            default_pipeline: vec![PipelineEntry::new("basic"), PipelineEntry::new("reviewer")],
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Overwrite `slot` with the parsed value of `key`, if set and valid.
fn set_parsed<T, F>(slot: &mut T, lookup: &F, key: &str, parse: impl Fn(&str) -> Option<T>)
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match parse(&raw) {
        Some(value) => *slot = value,
        None => tracing::warn!(key, value = %raw, "ignoring invalid config value"),
    }
}

fn from_str_opt<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

impl Config {
    /// Load from the optional file and the process environment.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "yaml")]
    fn from_file() -> Result<Self> {
        let Ok(path) = std::env::var(CONFIG_PATH_VAR) else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| PipelineError::InvalidConfig(format!("reading {path}: {e}")))?;
        let config = Self::from_yaml(&raw)?;
        tracing::info!(path = %path, "loaded config file");
        Ok(config)
    }

    #[cfg(not(feature = "yaml"))]
    fn from_file() -> Result<Self> {
        if std::env::var_os(CONFIG_PATH_VAR).is_some() {
            tracing::warn!("{CONFIG_PATH_VAR} is set but YAML support is not compiled in (feature `yaml`)");
        }
        Ok(Self::default())
    }

    /// Parse a YAML document; missing keys keep their defaults.
    #[cfg(feature = "yaml")]
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| PipelineError::InvalidConfig(format!("config file: {e}")))
    }

    /// Apply `PROOFREAD_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |raw: &str| {
            let raw = raw.trim();
            (!raw.is_empty()).then(|| raw.to_string())
        };
        set_parsed(&mut self.bind, &lookup, "PROOFREAD_BIND", text);
        set_parsed(&mut self.llm_base_url, &lookup, "PROOFREAD_LLM_BASE_URL", text);
        set_parsed(&mut self.model, &lookup, "PROOFREAD_MODEL", text);
        if let Some(key) = lookup("PROOFREAD_LLM_API_KEY").and_then(|k| text(&k)) {
            self.llm_api_key = Some(key);
        }
        set_parsed(&mut self.request_timeout_ms, &lookup, "PROOFREAD_REQUEST_TIMEOUT_MS", from_str_opt);
        set_parsed(&mut self.heartbeat_ms, &lookup, "PROOFREAD_HEARTBEAT_MS", from_str_opt);
        set_parsed(&mut self.merge_confidence_first, &lookup, "PROOFREAD_MERGE_CONFIDENCE_FIRST", parse_bool);
        set_parsed(&mut self.type_priority, &lookup, "PROOFREAD_TYPE_PRIORITY", |raw| {
            let list: Vec<ErrorType> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ErrorType::from)
                .collect();
            (!list.is_empty()).then_some(list)
        });
        set_parsed(&mut self.basic_locate, &lookup, "PROOFREAD_BASIC_LOCATE", from_str_opt);
        set_parsed(&mut self.reviewer_locate, &lookup, "PROOFREAD_REVIEWER_LOCATE", from_str_opt);
        set_parsed(&mut self.llm_max_concurrency, &lookup, "PROOFREAD_LLM_MAX_CONCURRENCY", from_str_opt);
        set_parsed(&mut self.max_text_chars, &lookup, "PROOFREAD_MAX_TEXT_CHARS", from_str_opt);
        set_parsed(&mut self.streaming, &lookup, "PROOFREAD_STREAMING", parse_bool);
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(PipelineError::InvalidConfig("request_timeout_ms must be > 0".into()));
        }
        if self.heartbeat_ms == 0 {
            return Err(PipelineError::InvalidConfig("heartbeat_ms must be > 0".into()));
        }
        if self.llm_max_concurrency == 0 {
            return Err(PipelineError::InvalidConfig("llm_max_concurrency must be > 0".into()));
        }
        if self.max_text_chars == 0 {
            return Err(PipelineError::InvalidConfig("max_text_chars must be > 0".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn merge_config(&self) -> MergeConfig {
        MergeConfig::default()
            .with_confidence_first(self.merge_confidence_first)
            .with_type_priority(self.type_priority.clone())
    }
}
