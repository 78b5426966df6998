//! The unified event vocabulary (C4): a single, sealed family of
//! typed variants, all carrying a common base, dispatched
//! synchronously to subscribers in registration order.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::duration::TimestampMs;
use crate::error::KernelError;
use crate::executor::TerminationReason;
use crate::limits::Limit;

/// Fields populated by the owning context at publish time, never by
/// the caller.
#[derive(Debug, Clone)]
pub struct EventBase {
    /// The event's name, e.g. `"before_model_call"`.
    pub name: &'static str,
    /// Milliseconds since the root context started.
    pub timestamp: TimestampMs,
    /// The context's iteration counter at publish time.
    pub iteration: u64,
    /// The context's depth at publish time (root = 0).
    pub depth: u32,
}

/// Which kind of text a parse error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// A text-format codec failed to parse its envelope.
    Format,
    /// A toolchain failed to parse a tool-call section.
    Toolchain,
    /// A termination validator's section failed to parse.
    Termination,
    /// A generic text section failed to parse.
    Section,
}

/// Outcome recorded on an after-iteration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The loop body asked to continue.
    Continue,
    /// The loop body asked to terminate.
    Terminate,
}

/// Fired once, before the first iteration.
#[derive(Debug, Clone)]
pub struct BeforeExecution {
    /// Common event fields.
    pub base: EventBase,
}

/// Fired once, after termination, regardless of exit path.
#[derive(Debug, Clone)]
pub struct AfterExecution {
    /// Common event fields.
    pub base: EventBase,
    /// Why execution stopped.
    pub termination_reason: TerminationReason,
    /// The terminal error, if any.
    pub error: Option<String>,
}

/// Fired at the start of every iteration, including the first.
#[derive(Debug, Clone)]
pub struct BeforeIteration {
    /// Common event fields.
    pub base: EventBase,
}

/// Fired after the loop body returns for an iteration.
#[derive(Debug, Clone)]
pub struct AfterIteration {
    /// Common event fields.
    pub base: EventBase,
    /// Whether the body continued or terminated.
    pub result: IterationOutcome,
    /// Wall-clock time the body took.
    pub duration: Duration,
}

/// Fired before a model is invoked. `request` is mutable: a subscriber
/// may rewrite it, and the rewritten value is what the model actually
/// sends and what the matching after-model-call event records.
#[derive(Debug, Clone)]
pub struct BeforeModelCall {
    /// Common event fields.
    pub base: EventBase,
    /// Identifies which model is being called.
    pub model_id: String,
    /// The request payload, opaque to the kernel.
    pub request: Value,
}

/// Fired after a model call returns (or fails).
#[derive(Debug, Clone)]
pub struct AfterModelCall {
    /// Common event fields.
    pub base: EventBase,
    /// Identifies which model was called.
    pub model_id: String,
    /// The request actually sent (post-mutation).
    pub request: Value,
    /// The response payload, opaque to the kernel.
    pub response: Value,
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens consumed by the completion.
    pub output_tokens: u64,
    /// Wall-clock time the call took.
    pub duration: Duration,
    /// Set if the call failed.
    pub error: Option<String>,
}

/// Fired before a tool is invoked. `args` is mutable, same contract as
/// [`BeforeModelCall::request`].
#[derive(Debug, Clone)]
pub struct BeforeToolCall {
    /// Common event fields.
    pub base: EventBase,
    /// The tool being invoked.
    pub tool_name: String,
    /// The tool's input arguments, opaque to the kernel.
    pub args: Value,
}

/// Fired after a tool call returns (or fails).
#[derive(Debug, Clone)]
pub struct AfterToolCall {
    /// Common event fields.
    pub base: EventBase,
    /// The tool that was invoked.
    pub tool_name: String,
    /// The arguments actually used (post-mutation).
    pub args: Value,
    /// The tool's output, opaque to the kernel.
    pub output: Value,
    /// Wall-clock time the call took.
    pub duration: Duration,
    /// Set if the tool call failed.
    pub error: Option<String>,
}

/// Fired when a format/toolchain/termination/section parser fails.
#[derive(Debug, Clone)]
pub struct ParseErrorEvent {
    /// Common event fields.
    pub base: EventBase,
    /// Which kind of parsing failed.
    pub kind: ParseErrorKind,
    /// The raw content that failed to parse.
    pub raw: String,
    /// The parse error's message.
    pub error: String,
}

/// Fired when a termination validator is invoked.
#[derive(Debug, Clone)]
pub struct ValidatorCalled {
    /// Common event fields.
    pub base: EventBase,
    /// The validator's name.
    pub name: String,
    /// The candidate answer being validated.
    pub answer: String,
}

/// Fired with a termination validator's verdict.
#[derive(Debug, Clone)]
pub struct ValidatorResultEvent {
    /// Common event fields.
    pub base: EventBase,
    /// The validator's name.
    pub name: String,
    /// The candidate answer that was validated.
    pub answer: String,
    /// Whether the answer was accepted.
    pub accepted: bool,
    /// Feedback for the model, if rejected.
    pub feedback: Option<String>,
}

/// A generic error report not covered by a more specific variant.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Common event fields.
    pub base: EventBase,
    /// The error's message.
    pub error: String,
}

/// Fired when compaction replaces the scratchpad.
#[derive(Debug, Clone)]
pub struct CompactionEvent {
    /// Common event fields.
    pub base: EventBase,
    /// The scratchpad before compaction.
    pub before: Value,
    /// The scratchpad after compaction.
    pub after: Value,
}

/// Fired the moment a limit breach is detected, before cancellation is
/// delivered.
#[derive(Debug, Clone)]
pub struct LimitExceededEvent {
    /// Common event fields.
    pub base: EventBase,
    /// The limit that was breached.
    pub limit: Limit,
    /// The value observed at breach time.
    pub current: u64,
    /// The specific stat key that crossed the threshold — for a
    /// prefix limit, this is the matching key, not the prefix itself.
    pub matched_key: String,
}

/// An escape hatch for ad hoc, named observations.
#[derive(Debug, Clone)]
pub struct CommonEvent {
    /// Common event fields.
    pub base: EventBase,
    /// A short machine-readable name, e.g. `"context.spawned"`.
    pub name: String,
    /// A human-readable description.
    pub description: String,
    /// Arbitrary structured payload.
    pub data: Value,
}

/// Like [`CommonEvent`], with an optional before/after diff.
#[derive(Debug, Clone)]
pub struct CommonDiffEvent {
    /// Common event fields.
    pub base: EventBase,
    /// A short machine-readable name.
    pub name: String,
    /// A human-readable description.
    pub description: String,
    /// Arbitrary structured payload.
    pub data: Value,
    /// State before the change this event reports, if applicable.
    pub before: Option<Value>,
    /// State after the change this event reports, if applicable.
    pub after: Option<Value>,
}

/// The sealed family of events the kernel publishes. Closed by design
/// — see the module docs — rather than open for extension.
#[derive(Debug, Clone)]
pub enum Event {
    /// See [`BeforeExecution`].
    BeforeExecution(BeforeExecution),
    /// See [`AfterExecution`].
    AfterExecution(AfterExecution),
    /// See [`BeforeIteration`].
    BeforeIteration(BeforeIteration),
    /// See [`AfterIteration`].
    AfterIteration(AfterIteration),
    /// See [`BeforeModelCall`].
    BeforeModelCall(BeforeModelCall),
    /// See [`AfterModelCall`].
    AfterModelCall(AfterModelCall),
    /// See [`BeforeToolCall`].
    BeforeToolCall(BeforeToolCall),
    /// See [`AfterToolCall`].
    AfterToolCall(AfterToolCall),
    /// See [`ParseErrorEvent`].
    ParseError(ParseErrorEvent),
    /// See [`ValidatorCalled`].
    ValidatorCalled(ValidatorCalled),
    /// See [`ValidatorResultEvent`].
    ValidatorResult(ValidatorResultEvent),
    /// See [`ErrorEvent`].
    Error(ErrorEvent),
    /// See [`CompactionEvent`].
    Compaction(CompactionEvent),
    /// See [`LimitExceededEvent`].
    LimitExceeded(LimitExceededEvent),
    /// See [`CommonEvent`].
    Common(CommonEvent),
    /// See [`CommonDiffEvent`].
    CommonDiff(CommonDiffEvent),
}

impl Event {
    /// Borrow this event's base fields, regardless of variant.
    pub fn base(&self) -> &EventBase {
        match self {
            Event::BeforeExecution(e) => &e.base,
            Event::AfterExecution(e) => &e.base,
            Event::BeforeIteration(e) => &e.base,
            Event::AfterIteration(e) => &e.base,
            Event::BeforeModelCall(e) => &e.base,
            Event::AfterModelCall(e) => &e.base,
            Event::BeforeToolCall(e) => &e.base,
            Event::AfterToolCall(e) => &e.base,
            Event::ParseError(e) => &e.base,
            Event::ValidatorCalled(e) => &e.base,
            Event::ValidatorResult(e) => &e.base,
            Event::Error(e) => &e.base,
            Event::Compaction(e) => &e.base,
            Event::LimitExceeded(e) => &e.base,
            Event::Common(e) => &e.base,
            Event::CommonDiff(e) => &e.base,
        }
    }

    /// Mutably borrow this event's base fields.
    pub(crate) fn base_mut(&mut self) -> &mut EventBase {
        match self {
            Event::BeforeExecution(e) => &mut e.base,
            Event::AfterExecution(e) => &mut e.base,
            Event::BeforeIteration(e) => &mut e.base,
            Event::AfterIteration(e) => &mut e.base,
            Event::BeforeModelCall(e) => &mut e.base,
            Event::AfterModelCall(e) => &mut e.base,
            Event::BeforeToolCall(e) => &mut e.base,
            Event::AfterToolCall(e) => &mut e.base,
            Event::ParseError(e) => &mut e.base,
            Event::ValidatorCalled(e) => &mut e.base,
            Event::ValidatorResult(e) => &mut e.base,
            Event::Error(e) => &mut e.base,
            Event::Compaction(e) => &mut e.base,
            Event::LimitExceeded(e) => &mut e.base,
            Event::Common(e) => &mut e.base,
            Event::CommonDiff(e) => &mut e.base,
        }
    }
}

/// Implemented by anything that wants to observe kernel events.
///
/// A subscriber sees every variant through one method and matches on
/// what it cares about — the open-set-of-interfaces design the source
/// also used is equally sound, but a closed enum plus one entry point
/// reads more plainly in Rust. Mutating a "before" variant's payload
/// (`request`, `args`) is how a subscriber influences the run; the
/// kernel applies whatever the subscriber leaves behind.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handle one event. Returning `Err` logs a warning and does not
    /// stop dispatch to the remaining subscribers, and does not affect
    /// execution — only an event-recursion overflow is fatal.
    async fn on_event(&self, event: &mut Event) -> Result<(), KernelError>;
}

/// Programmatic knobs for building an [`EventPublisher`].
///
/// There is no file/env-backed configuration layer — callers build this
/// directly, the way [`crate::executor::ExecutorConfig`] is built.
#[derive(Debug, Clone)]
pub struct EventPublisherConfig {
    /// Maximum nesting depth a subscriber may cause by publishing from
    /// within its own `on_event` call before dispatch fails fast.
    pub max_recursion_depth: u32,
}

impl Default for EventPublisherConfig {
    fn default() -> Self {
        EventPublisherConfig { max_recursion_depth: 10 }
    }
}

/// Dispatches events to registered subscribers in registration order.
/// Owns the recursion bound described in
/// [`ExecutionContext::publish`](crate::context::ExecutionContext::publish).
pub struct EventPublisher {
    subscribers: std::sync::RwLock<Vec<std::sync::Arc<dyn Subscriber>>>,
    /// Maximum nesting depth a subscriber may cause by publishing from
    /// within its own `on_event` call.
    pub max_recursion_depth: u32,
}

impl EventPublisher {
    /// Build a publisher with the given recursion bound.
    pub fn new(max_recursion_depth: u32) -> Self {
        EventPublisher {
            subscribers: std::sync::RwLock::new(Vec::new()),
            max_recursion_depth,
        }
    }

    /// Build a publisher from an [`EventPublisherConfig`].
    pub fn from_config(config: EventPublisherConfig) -> Self {
        EventPublisher::new(config.max_recursion_depth)
    }

    /// Register a subscriber. Dispatch order follows registration
    /// order.
    pub fn subscribe(&self, subscriber: std::sync::Arc<dyn Subscriber>) {
        self.subscribers.write().unwrap().push(subscriber);
    }

    pub(crate) async fn dispatch(&self, event: &mut Event) {
        let subscribers = self.subscribers.read().unwrap().clone();
        for subscriber in &subscribers {
            if let Err(err) = subscriber.on_event(event).await {
                tracing::warn!(error = %err, event = event.base().name, "subscriber returned an error, continuing dispatch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn subscriber_is_object_safe() {
        _assert_send_sync::<std::sync::Arc<dyn Subscriber>>();
    }

    #[test]
    fn event_is_send_sync() {
        _assert_send_sync::<Event>();
    }

    #[test]
    fn publisher_from_config_carries_recursion_depth() {
        let publisher = EventPublisher::from_config(EventPublisherConfig {
            max_recursion_depth: 4,
        });
        assert_eq!(publisher.max_recursion_depth, 4);
    }

    #[test]
    fn publisher_config_default_matches_executor_default() {
        assert_eq!(EventPublisherConfig::default().max_recursion_depth, 10);
    }
}
