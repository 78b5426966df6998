//! External interface contracts (§6): what the kernel consumes from
//! and exposes to collaborators it does not implement itself — the
//! loop body, models, toolchains, text formats, and termination
//! validators.

use std::sync::Weak;

use async_trait::async_trait;
use serde_json::Value;

use crate::content::ContentPart;
use crate::context::ExecutionContext;

/// One iteration's recorded history: what was sent, what came back.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IterationRecord {
    /// The prompt/messages sent this iteration.
    pub request: Value,
    /// The raw model output this iteration.
    pub response: Value,
}

/// User-supplied state carried across iterations: the task, history,
/// and the scratchpad compaction prunes. Opaque to the kernel beyond
/// this interface.
///
/// The kernel calls [`set_execution_context`](LoopData::set_execution_context)
/// exactly once, at construction, so implementations can publish diff
/// events through the context when history or scratchpad mutate,
/// without callers threading the context through by hand.
pub trait LoopData: Send + Sync {
    /// The task this execution is working on.
    fn task(&self) -> &Value;

    /// Full iteration history recorded so far.
    fn iteration_history(&self) -> &[IterationRecord];

    /// Append one iteration's record to history.
    fn add_iteration_history(&mut self, iteration: IterationRecord);

    /// The subset of history fed into the next model call.
    fn scratchpad(&self) -> &[IterationRecord];

    /// Replace the scratchpad, e.g. with a compaction strategy's
    /// output.
    fn set_scratchpad(&mut self, iterations: Vec<IterationRecord>);

    /// Bind this data object to the context that owns it. Called once.
    fn set_execution_context(&mut self, ctx: Weak<ExecutionContext>);
}

/// What a loop body asks the executor to do next.
#[derive(Debug, Clone)]
pub enum LoopAction {
    /// Keep iterating. `next_prompt` flows through to the caller's
    /// next model call unexamined.
    Continue {
        /// Opaque to the kernel.
        next_prompt: Value,
    },
    /// Stop iterating and report this output as the final result.
    Terminate {
        /// The final answer.
        output: Vec<ContentPart>,
    },
}

/// The loop body: one think-act-observe round, invoked once per
/// iteration by the [`Executor`](crate::executor::Executor). The
/// kernel never inspects `next_prompt` or `output` — they flow through
/// to the caller untouched.
#[async_trait]
pub trait AgentLoopBody: Send + Sync {
    /// Run one iteration.
    async fn next(
        &mut self,
        ctx: &ExecutionContext,
    ) -> Result<LoopAction, Box<dyn std::error::Error + Send + Sync>>;
}

/// Token usage and content returned by a model call.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    /// The model's raw output.
    pub content: Value,
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens consumed by the completion.
    pub output_tokens: u64,
}

/// A model collaborator. Implementations MUST use
/// [`ExecutionContext::cancellation_token`] for any I/O, publish
/// before/after-model-call events around the call, and emit at least
/// one stream chunk with the final content even for a non-streaming
/// provider, so subscribers observe every model uniformly.
#[async_trait]
pub trait Model: Send + Sync {
    /// Generate a response. `stream_id`/`topic_id`, if given, tag any
    /// chunks this call emits.
    async fn generate(
        &self,
        ctx: &ExecutionContext,
        stream_id: Option<&str>,
        topic_id: Option<&str>,
        messages: Value,
        options: Value,
    ) -> Result<ModelResponse, Box<dyn std::error::Error + Send + Sync>>;
}

/// A model collaborator that can stream incremental chunks rather than
/// only a final response.
#[async_trait]
pub trait StreamingModel: Model {
    /// Like [`Model::generate`], but emits one stream chunk per delta
    /// as the response arrives instead of only at the end.
    async fn generate_stream(
        &self,
        ctx: &ExecutionContext,
        stream_id: Option<&str>,
        topic_id: Option<&str>,
        messages: Value,
        options: Value,
    ) -> Result<ModelResponse, Box<dyn std::error::Error + Send + Sync>>;
}

/// Parses a raw section of model output into tool calls, runs each
/// through the before/after-tool-call event envelope, and formats
/// results back into text. Must publish parse errors and reset the
/// corresponding consecutive-error gauge on successful parses.
#[async_trait]
pub trait ToolChain: Send + Sync {
    /// Parse `raw`, run any tool calls it contains, and return the
    /// formatted tool-result text to feed back to the model.
    async fn run_section(
        &self,
        ctx: &ExecutionContext,
        raw: &str,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;
}

/// A named section of formatted text, e.g. a `<scratchpad>` block.
#[derive(Debug, Clone, Default)]
pub struct TextSection {
    /// The section's name.
    pub name: String,
    /// The section's raw content.
    pub content: String,
}

/// A text-format codec (XML, Markdown, ...). Must publish format parse
/// errors and reset the corresponding consecutive-error gauge on
/// successful parses.
pub trait TextFormat: Send + Sync {
    /// Parse raw text into its sections.
    fn parse(
        &self,
        ctx: &ExecutionContext,
        raw: &str,
    ) -> Result<Vec<TextSection>, Box<dyn std::error::Error + Send + Sync>>;

    /// Format sections back into raw text.
    fn format(&self, sections: &[TextSection]) -> String;
}

/// A termination validator's verdict on a candidate answer.
#[derive(Debug, Clone)]
pub enum TerminationVerdict {
    /// The answer is not yet final; keep iterating.
    Continue,
    /// The answer was rejected, with feedback for the next iteration.
    AnswerRejected {
        /// Feedback fed back to the model.
        feedback: String,
    },
    /// The answer was accepted as final.
    AnswerAccepted,
}

/// Decides whether a candidate answer is acceptable. Must publish
/// validator-called and validator-result events around each
/// invocation.
#[async_trait]
pub trait Termination: Send + Sync {
    /// Evaluate a parsed section as a candidate answer.
    async fn evaluate(
        &self,
        ctx: &ExecutionContext,
        section: &TextSection,
    ) -> Result<TerminationVerdict, Box<dyn std::error::Error + Send + Sync>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn contracts_are_object_safe() {
        _assert_send_sync::<Box<dyn LoopData>>();
        _assert_send_sync::<Box<dyn AgentLoopBody>>();
        _assert_send_sync::<std::sync::Arc<dyn Model>>();
        _assert_send_sync::<std::sync::Arc<dyn StreamingModel>>();
        _assert_send_sync::<std::sync::Arc<dyn ToolChain>>();
        _assert_send_sync::<std::sync::Arc<dyn TextFormat>>();
        _assert_send_sync::<std::sync::Arc<dyn Termination>>();
    }
}
