//! Diagnostics for one LLM-backed producer call.
//!
//! [`ParseDiagnostics`] records how the model output became candidates:
//! which extraction strategy worked, whether repair or auto-completion was
//! needed, how many transport retries happened, and how many entries the
//! locator dropped or re-located.

use serde::Serialize;

/// Records what happened between the raw model reply and the final items.
///
/// # Example
///
/// ```
/// use proofread_pipeline::diagnostics::ParseDiagnostics;
///
/// let diag = ParseDiagnostics::default();
/// assert!(diag.ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseDiagnostics {
    /// Extraction strategy that produced the JSON, e.g. `"direct"`,
    /// `"fenced"`, `"bracketed"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<&'static str>,

    /// Parse failure message. `None` means success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,

    /// Transport retries (429, 5xx) before the request succeeded.
    pub transport_retries: u32,

    /// Total time spent in backoff delays (milliseconds).
    pub backoff_total_ms: u64,

    /// Full-width punctuation or trailing-comma repair was applied.
    pub repaired: bool,

    /// Truncated output was closed by auto-completion.
    pub auto_completed: bool,

    /// Entries discarded because their span could not be located.
    pub dropped: u32,

    /// Entries whose span was found by unique-substring search instead of
    /// the reported offsets.
    pub relocated: u32,
}

impl ParseDiagnostics {
    /// Did parsing succeed?
    pub fn ok(&self) -> bool {
        self.parse_error.is_none()
    }
}
