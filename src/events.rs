//! Progress events for the check client.
//!
//! [`CheckClient::check`](crate::client::CheckClient::check) reports
//! attempts, streamed chunks, warnings and retries through an optional
//! [`EventHandler`]. The final result is returned, not emitted.

use crate::client::RetryReason;
use crate::types::ErrorItem;
use std::sync::Arc;
use std::time::Duration;

/// Events emitted while a check is in flight.
#[derive(Debug, Clone)]
pub enum CheckEvent {
    /// An attempt is starting (1-indexed).
    Attempt { attempt: u32 },
    /// A stage result arrived.
    Chunk {
        agent: String,
        run_index: Option<u32>,
        /// Items of this chunk alone.
        errors: Vec<ErrorItem>,
        /// Everything seen so far in this attempt, merged.
        merged: Vec<ErrorItem>,
    },
    /// A stage failed on the server; the check goes on.
    Warning { agent: String, message: String },
    /// The attempt failed and another one follows after `delay`.
    Retry {
        attempt: u32,
        reason: RetryReason,
        delay: Duration,
    },
}

/// Handler for check progress events.
///
/// # Example
///
/// ```
/// use proofread_pipeline::events::{CheckEvent, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: CheckEvent) {
///         match event {
///             CheckEvent::Chunk { agent, merged, .. } => println!("[{agent}] {} so far", merged.len()),
///             CheckEvent::Retry { reason, delay, .. } => println!("retrying ({reason}) in {delay:?}"),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: CheckEvent);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: CheckEvent) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// ```
/// use proofread_pipeline::events::{CheckEvent, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: CheckEvent| {
///     if let CheckEvent::Warning { agent, message } = event {
///         eprintln!("{agent}: {message}");
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(CheckEvent) + Send + Sync>(pub F);

impl<F: Fn(CheckEvent) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: CheckEvent) {
        (self.0)(event);
    }
}
