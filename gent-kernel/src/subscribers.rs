//! A concrete [`Subscriber`] built on the [`tracing`] crate.
//!
//! Mirrors the shape of a hook collaborators plug into an observability
//! pipeline: it only observes (never mutates "before" payloads) and
//! never fails dispatch — [`TracingSubscriber::on_event`] always
//! returns `Ok(())`.

use async_trait::async_trait;

use crate::error::KernelError;
use crate::event::{Event, Subscriber};

/// Emits one structured `tracing` event per kernel event variant.
///
/// | Variant | Level |
/// |---------|-------|
/// | before/after-execution, compaction | `INFO` |
/// | before/after-iteration, model/tool calls, validator, common(-diff) | `DEBUG` |
/// | parse-error, limit-exceeded | `WARN` |
/// | error | `ERROR` |
///
/// # Example
///
/// ```no_run
/// use gent_kernel::event::EventPublisher;
/// use gent_kernel::subscribers::TracingSubscriber;
/// use std::sync::Arc;
///
/// let publisher = EventPublisher::new(10);
/// publisher.subscribe(Arc::new(TracingSubscriber::new()));
/// ```
pub struct TracingSubscriber;

impl TracingSubscriber {
    /// Create a new `TracingSubscriber`.
    #[must_use]
    pub fn new() -> Self {
        TracingSubscriber
    }
}

impl Default for TracingSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscriber for TracingSubscriber {
    async fn on_event(&self, event: &mut Event) -> Result<(), KernelError> {
        match event {
            Event::BeforeExecution(e) => {
                tracing::info!(iteration = e.base.iteration, depth = e.base.depth, "gent.execution.before");
            }
            Event::AfterExecution(e) => {
                tracing::info!(reason = ?e.termination_reason, error = ?e.error, "gent.execution.after");
            }
            Event::BeforeIteration(e) => {
                tracing::debug!(iteration = e.base.iteration, "gent.iteration.before");
            }
            Event::AfterIteration(e) => {
                tracing::debug!(
                    iteration = e.base.iteration,
                    result = ?e.result,
                    duration_ms = e.duration.as_millis() as u64,
                    "gent.iteration.after"
                );
            }
            Event::BeforeModelCall(e) => {
                tracing::debug!(model = %e.model_id, "gent.model.before_call");
            }
            Event::AfterModelCall(e) => {
                tracing::debug!(
                    model = %e.model_id,
                    input_tokens = e.input_tokens,
                    output_tokens = e.output_tokens,
                    duration_ms = e.duration.as_millis() as u64,
                    error = ?e.error,
                    "gent.model.after_call"
                );
            }
            Event::BeforeToolCall(e) => {
                tracing::debug!(tool = %e.tool_name, "gent.tool.before_call");
            }
            Event::AfterToolCall(e) => {
                tracing::debug!(
                    tool = %e.tool_name,
                    error = ?e.error,
                    duration_ms = e.duration.as_millis() as u64,
                    "gent.tool.after_call"
                );
            }
            Event::ParseError(e) => {
                tracing::warn!(kind = ?e.kind, error = %e.error, "gent.parse.error");
            }
            Event::ValidatorCalled(e) => {
                tracing::debug!(validator = %e.name, "gent.validator.called");
            }
            Event::ValidatorResult(e) => {
                tracing::debug!(validator = %e.name, accepted = e.accepted, "gent.validator.result");
            }
            Event::Error(e) => {
                tracing::error!(error = %e.error, "gent.error");
            }
            Event::Compaction(_) => {
                tracing::info!("gent.compaction");
            }
            Event::LimitExceeded(e) => {
                tracing::warn!(
                    key = %e.matched_key,
                    current = e.current,
                    max = e.limit.max,
                    "gent.limit.exceeded"
                );
            }
            Event::Common(e) => {
                tracing::debug!(name = %e.name, description = %e.description, "gent.common");
            }
            Event::CommonDiff(e) => {
                tracing::debug!(name = %e.name, description = %e.description, "gent.common_diff");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration::TimestampMs;
    use crate::event::{ErrorEvent, EventBase};

    #[tokio::test]
    async fn tracing_subscriber_never_errors() {
        let subscriber = TracingSubscriber::new();
        let mut event = Event::Error(ErrorEvent {
            base: EventBase {
                name: "error",
                timestamp: TimestampMs::ZERO,
                iteration: 0,
                depth: 0,
            },
            error: "boom".to_string(),
        });
        assert!(subscriber.on_event(&mut event).await.is_ok());
    }
}
