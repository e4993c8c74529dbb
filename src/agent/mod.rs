//! One LLM round trip: render prompt, call the backend, extract JSON entries.
//!
//! [`LlmAgent`] is the configured call (templates, sampling, streaming).
//! Per-call state (model, cancel signal, partial-result sink) is passed to
//! [`LlmAgent::call`], so one agent is shared by every request.

pub mod parse;

use crate::backend::{
    with_backoff, with_backoff_streaming, BackoffStreamOpts, LlmConfig, LlmRequest, RetryStats,
};
use crate::cancel::CancelSignal;
use crate::diagnostics::ParseDiagnostics;
use crate::error::{PipelineError, Result};
use crate::exec_ctx::ExecCtx;
use crate::prompt::render;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

/// Receives the complete entries seen so far while a reply streams in.
pub type PartialSink<'a> = &'a mut (dyn FnMut(Vec<Value>) + Send);

/// Parsed reply of one call.
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// JSON entries (array elements) the model returned.
    pub entries: Vec<Value>,
    /// Raw reply text.
    pub raw: String,
    pub diagnostics: ParseDiagnostics,
}

/// A configured LLM call.
///
/// # Example
///
/// ```
/// use proofread_pipeline::agent::LlmAgent;
/// use proofread_pipeline::prompt::{DETECT_TEMPLATE, SYSTEM_PROMPT};
///
/// let agent = LlmAgent::new("basic", DETECT_TEMPLATE)
///     .with_system(SYSTEM_PROMPT)
///     .with_streaming(true);
/// assert!(agent.is_streaming());
/// ```
#[derive(Debug, Clone)]
pub struct LlmAgent {
    name: String,
    template: String,
    system: Option<String>,
    config: LlmConfig,
    streaming: bool,
}

impl LlmAgent {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            system: None,
            config: LlmConfig::default(),
            streaming: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_config(mut self, config: LlmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Render the prompt for `input`; `vars` override the context's shared ones.
    pub fn render_prompt(
        &self,
        ctx: &ExecCtx,
        input: &str,
        vars: &HashMap<String, String>,
    ) -> String {
        let mut all = ctx.vars.clone();
        all.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        render(&self.template, input, &all)
    }

    /// Run the call.
    ///
    /// Waits for an admission permit, then calls the backend with transport
    /// retry. Every wait is raced against `cancel`. A reply with no
    /// recognizable JSON is a [`PipelineError::Parse`].
    pub async fn call(
        &self,
        ctx: &ExecCtx,
        input: &str,
        vars: &HashMap<String, String>,
        model: &str,
        cancel: &CancelSignal,
        on_partial: Option<PartialSink<'_>>,
    ) -> Result<AgentReply> {
        cancel.check()?;
        let _permit = tokio::select! {
            biased;
            reason = cancel.cancelled() => return Err(PipelineError::Cancelled(reason)),
            permit = ctx.admit() => permit?,
        };

        let request = LlmRequest {
            model: model.to_string(),
            system_prompt: self.system.clone(),
            prompt: self.render_prompt(ctx, input, vars),
            config: self.config.clone(),
            stream: self.streaming,
        };
        let started = Instant::now();
        tracing::debug!(agent = %self.name, model, stream = self.streaming, "calling LLM");

        let mut stats = RetryStats::default();
        let response = match (self.streaming, on_partial) {
            (true, Some(sink)) => {
                let mut buffer = String::new();
                let mut seen = 0usize;
                let mut on_token = |token: String| {
                    buffer.push_str(&token);
                    let complete = parse::complete_array_elements(&buffer);
                    if complete.len() > seen {
                        seen = complete.len();
                        sink(complete);
                    }
                };
                with_backoff_streaming(
                    &ctx.backend,
                    &ctx.client,
                    &ctx.base_url,
                    &request,
                    &ctx.backoff,
                    BackoffStreamOpts {
                        cancel,
                        stats: &mut stats,
                        on_token: &mut on_token,
                    },
                )
                .await?
            }
            _ => {
                with_backoff(
                    &ctx.backend,
                    &ctx.client,
                    &ctx.base_url,
                    &request,
                    &ctx.backoff,
                    cancel,
                    &mut stats,
                )
                .await?
            }
        };

        let mut diagnostics = ParseDiagnostics {
            transport_retries: stats.retries,
            backoff_total_ms: stats.total_backoff.as_millis() as u64,
            ..Default::default()
        };
        let parsed = parse::parse_reply(&response.text).map_err(|e| {
            tracing::warn!(agent = %self.name, error = %e, "unparseable model reply");
            PipelineError::Parse(e)
        })?;
        diagnostics.strategy = Some(parsed.strategy);
        diagnostics.repaired = parsed.repaired;
        diagnostics.auto_completed = parsed.auto_completed;

        let entries = parse::entry_list(&parsed.value);
        tracing::debug!(
            agent = %self.name,
            entries = entries.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "LLM reply parsed"
        );
        Ok(AgentReply {
            entries,
            raw: response.text,
            diagnostics,
        })
    }
}
