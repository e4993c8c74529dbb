//! Role adapter around a [`CandidateProducer`].

use super::{BoxFut, Role, RoleContext, RoleEvent, RoleInput, RoleOutput, RoleRun};
use crate::error::Result;
use crate::producer::{CandidateProducer, ProduceRequest};
use crate::types::{ErrorItem, ErrorType};
use futures::channel::mpsc::{self, UnboundedReceiver};
use futures::stream::{self, StreamExt};
use std::sync::Arc;

/// Exposes a producer as a pipeline role.
///
/// Non-streaming producers answer with [`RoleRun::Single`]. Streaming
/// producers are driven inside a [`RoleRun::Streaming`] stream that yields
/// their partial item lists as chunks and then the final result.
pub struct ProducerRole {
    id: String,
    name: String,
    capabilities: Vec<ErrorType>,
    default_model: String,
    producer: Arc<dyn CandidateProducer>,
}

impl ProducerRole {
    pub fn new(id: impl Into<String>, producer: Arc<dyn CandidateProducer>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            capabilities: ErrorType::builtin(),
            default_model: String::new(),
            producer,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<ErrorType>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }
}

/// State of a streaming run: the producer call plus its partial channel.
struct Driven {
    call: Option<BoxFut<'static, Result<RoleOutput>>>,
    partials: UnboundedReceiver<Vec<ErrorItem>>,
    result: Option<Result<RoleOutput>>,
    model: Option<String>,
}

enum Step {
    Partial(Vec<ErrorItem>),
    Done(Result<RoleOutput>),
}

impl Driven {
    async fn next_event(&mut self) -> Option<Result<RoleEvent>> {
        loop {
            let Some(call) = self.call.as_mut() else {
                // Call finished: drain what it queued, then the final.
                if let Some(items) = self.partials.next().await {
                    return Some(Ok(self.chunk(items)));
                }
                return self.result.take().map(|r| r.map(RoleEvent::Final));
            };
            let step = tokio::select! {
                biased;
                Some(items) = self.partials.next() => Step::Partial(items),
                result = call => Step::Done(result),
            };
            match step {
                Step::Partial(items) => return Some(Ok(self.chunk(items))),
                Step::Done(result) => {
                    self.call = None;
                    self.result = Some(result);
                }
            }
        }
    }

    fn chunk(&self, items: Vec<ErrorItem>) -> RoleEvent {
        RoleEvent::Chunk(RoleOutput {
            items,
            diagnostics: None,
            model: self.model.clone(),
        })
    }
}

/// Run the producer to completion. Dropping `request` on return closes its
/// partial channel.
async fn produce(
    producer: Arc<dyn CandidateProducer>,
    input: RoleInput,
    request: ProduceRequest,
    model: Option<String>,
) -> Result<RoleOutput> {
    let found = producer.produce(&input.text, &request).await?;
    Ok(RoleOutput {
        items: found.items,
        diagnostics: found.diagnostics,
        model,
    })
}

impl Role for ProducerRole {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[ErrorType] {
        &self.capabilities
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn run(&self, input: RoleInput, ctx: RoleContext) -> RoleRun {
        let producer = Arc::clone(&self.producer);
        let model = (!ctx.model.is_empty()).then(|| ctx.model.clone());
        let request = ProduceRequest::new(ctx.model, ctx.cancel);

        if !producer.streams() {
            return RoleRun::Single(Box::pin(produce(producer, input, request, model)));
        }

        let (tx, partials) = mpsc::unbounded();
        let request = request.with_partial(tx);
        let driven = Driven {
            call: Some(Box::pin(produce(producer, input, request, model.clone()))),
            partials,
            result: None,
            model,
        };
        RoleRun::Streaming(
            stream::unfold(driven, |mut driven| async move {
                driven.next_event().await.map(|event| (event, driven))
            })
            .boxed(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelReason, CancelSignal};
    use crate::error::PipelineError;
    use crate::producer::{Candidates, RuleProducer};
    use async_trait::async_trait;

    /// Emits one partial per item, then all items.
    struct Trickle(Vec<ErrorItem>);

    #[async_trait]
    impl CandidateProducer for Trickle {
        fn source(&self) -> &'static str {
            "test"
        }

        fn streams(&self) -> bool {
            true
        }

        async fn produce(&self, _text: &str, request: &ProduceRequest) -> Result<Candidates> {
            for n in 1..=self.0.len() {
                request.cancel.check()?;
                request.send_partial(self.0[..n].to_vec());
                tokio::task::yield_now().await;
            }
            Ok(Candidates::new(self.0.clone()))
        }
    }

    fn item(start: usize, text: &str) -> ErrorItem {
        ErrorItem::new(start, start + 1, text, "x", ErrorType::Spelling)
    }

    #[tokio::test]
    async fn test_non_streaming_producer_is_single() {
        let role = ProducerRole::new("rules", Arc::new(RuleProducer::new().unwrap()));
        let run = role.run(RoleInput::new("以经"), RoleContext::new(CancelSignal::new(), ""));
        let RoleRun::Single(fut) = run else {
            panic!("expected single run");
        };
        let out = fut.await.unwrap();
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.model, None);
    }

    #[tokio::test]
    async fn test_streaming_chunks_precede_final() {
        let role = ProducerRole::new("t", Arc::new(Trickle(vec![item(0, "a"), item(1, "b")])));
        let run = role.run(RoleInput::new("ab"), RoleContext::new(CancelSignal::new(), "m"));
        assert!(matches!(run, RoleRun::Streaming(_)));

        let events: Vec<RoleEvent> = run
            .into_stream()
            .map(|e| e.unwrap())
            .collect()
            .await;
        let sizes: Vec<_> = events
            .iter()
            .map(|e| match e {
                RoleEvent::Chunk(o) => ("chunk", o.items.len()),
                RoleEvent::Final(o) => ("final", o.items.len()),
            })
            .collect();
        assert_eq!(sizes, vec![("chunk", 1), ("chunk", 2), ("final", 2)]);
        if let RoleEvent::Final(out) = &events[2] {
            assert_eq!(out.model.as_deref(), Some("m"));
        }
    }

    #[tokio::test]
    async fn test_streaming_error_ends_stream() {
        let cancel = CancelSignal::new();
        cancel.cancel(CancelReason::Aborted);
        let role = ProducerRole::new("t", Arc::new(Trickle(vec![item(0, "a")])));
        let events: Vec<_> = role
            .run(RoleInput::new("a"), RoleContext::new(cancel, "m"))
            .into_stream()
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(PipelineError::Cancelled(CancelReason::Aborted))));
    }
}
