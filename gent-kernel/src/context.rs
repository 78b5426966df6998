//! The execution context (C6): the hierarchical, thread-safe object
//! every agent loop runs inside. Owns stats, events, streaming, and
//! termination state, and is the only thing a loop body, model, or
//! tool ever needs to hold onto.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::contracts::LoopData;
use crate::duration::TimestampMs;
use crate::error::{KernelError, LimitExceeded};
use crate::event::{
    AfterExecution, AfterIteration, AfterModelCall, AfterToolCall, BeforeExecution,
    BeforeIteration, BeforeModelCall, BeforeToolCall, CommonDiffEvent, CommonEvent, CompactionEvent,
    ErrorEvent, Event, EventBase, EventPublisher, IterationOutcome, LimitExceededEvent,
    ParseErrorEvent, ParseErrorKind, ValidatorCalled, ValidatorResultEvent,
};
use crate::executor::TerminationReason;
use crate::limits::{
    default_limits, Limit, LimitKind, FORMAT_PARSE_ERROR_CONSECUTIVE_KEY, ITERATIONS_KEY,
    SECTION_PARSE_ERROR_CONSECUTIVE_KEY, TERMINATION_PARSE_ERROR_CONSECUTIVE_KEY,
    TOOLCHAIN_PARSE_ERROR_CONSECUTIVE_KEY, TOOL_ERROR_CONSECUTIVE_KEY,
    VALIDATOR_REJECTED_TOTAL_KEY,
};
use crate::stats::ExecutionStats;
use crate::stream::{StreamChunk, StreamHub, SubscriptionHandle};
use crate::ContentPart;

const LAST_ITERATION_INPUT_TOKENS_GAUGE: &str = "gent:last_iteration_input_tokens";
const LAST_ITERATION_OUTPUT_TOKENS_GAUGE: &str = "gent:last_iteration_output_tokens";

fn parse_error_key(kind: ParseErrorKind) -> &'static str {
    match kind {
        ParseErrorKind::Format => FORMAT_PARSE_ERROR_CONSECUTIVE_KEY,
        ParseErrorKind::Toolchain => TOOLCHAIN_PARSE_ERROR_CONSECUTIVE_KEY,
        ParseErrorKind::Termination => TERMINATION_PARSE_ERROR_CONSECUTIVE_KEY,
        ParseErrorKind::Section => SECTION_PARSE_ERROR_CONSECUTIVE_KEY,
    }
}

fn parse_error_total_key(kind: ParseErrorKind) -> String {
    let name = match kind {
        ParseErrorKind::Format => "format",
        ParseErrorKind::Toolchain => "toolchain",
        ParseErrorKind::Termination => "termination",
        ParseErrorKind::Section => "section",
    };
    format!("gent:{name}_parse_error_total")
}

/// The outcome of a terminated execution. `None` until
/// [`ExecutionContext::result`] observes a termination reason.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Why the execution stopped.
    pub termination_reason: TerminationReason,
    /// The final answer. Only meaningful when `termination_reason` is
    /// [`TerminationReason::Success`].
    pub output: Vec<ContentPart>,
    /// The terminal error's message, if any.
    pub error: Option<String>,
    /// The limit that caused termination, if `termination_reason` is
    /// [`TerminationReason::LimitExceeded`].
    pub exceeded_limit: Option<LimitExceeded>,
}

#[derive(Default)]
struct ContextInner {
    termination_reason: Option<TerminationReason>,
    end_time: Option<Instant>,
    error: Option<String>,
    exceeded_limit: Option<LimitExceeded>,
    output: Vec<ContentPart>,
    event_log: Vec<Event>,
}

/// Decrements the context's event-recursion counter on drop, so the
/// counter stays balanced even if dispatch panics or a future carrying
/// it is dropped mid-poll.
struct RecursionGuard<'a> {
    depth: &'a AtomicU32,
}

impl<'a> RecursionGuard<'a> {
    fn enter(depth: &'a AtomicU32, max_depth: u32) -> Self {
        let previous = depth.fetch_add(1, Ordering::SeqCst);
        if previous >= max_depth {
            depth.fetch_sub(1, Ordering::SeqCst);
            panic!("{}", KernelError::EventRecursionExceeded(max_depth));
        }
        RecursionGuard { depth }
    }
}

impl Drop for RecursionGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The hierarchical, thread-safe object carrying cancellation, stats,
/// events, and streaming across a tree of nested or parallel agent
/// loops.
///
/// One read-write mutex ([`ContextInner`]) protects bookkeeping fields
/// (event log, termination state). Stats and streaming guard their own
/// state internally — the context never holds its own lock across a
/// stats update or a subscriber dispatch, which is what keeps those
/// operations from deadlocking against each other.
pub struct ExecutionContext {
    name: String,
    parent: Option<Weak<ExecutionContext>>,
    children: Mutex<Vec<Arc<ExecutionContext>>>,
    iteration: AtomicU64,
    depth: u32,
    start: Instant,
    inner: Mutex<ContextInner>,
    limits: Mutex<Vec<Limit>>,
    cancellation: CancellationToken,
    cancel_cause: Mutex<Option<String>>,
    stats: Arc<ExecutionStats>,
    stream_hub: StreamHub,
    publisher: OnceLock<Arc<EventPublisher>>,
    data: Mutex<Box<dyn LoopData>>,
    event_recursion_depth: AtomicU32,
}

impl ExecutionContext {
    /// Create a root context. Wired with the kernel's
    /// [`default_limits`] and a fresh cancellation token derived from
    /// `parent_cancellation`, if given.
    pub fn new_root(
        parent_cancellation: Option<CancellationToken>,
        name: impl Into<String>,
        data: Box<dyn LoopData>,
    ) -> Arc<ExecutionContext> {
        let token = match parent_cancellation {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        Arc::new_cyclic(|weak_self| {
            let stats = Arc::new(ExecutionStats::new(weak_self.clone(), None));
            let mut data = data;
            data.set_execution_context(weak_self.clone());
            ExecutionContext {
                name: name.into(),
                parent: None,
                children: Mutex::new(Vec::new()),
                iteration: AtomicU64::new(0),
                depth: 0,
                start: Instant::now(),
                inner: Mutex::new(ContextInner::default()),
                limits: Mutex::new(default_limits()),
                cancellation: token,
                cancel_cause: Mutex::new(None),
                stats,
                stream_hub: StreamHub::new(),
                publisher: OnceLock::new(),
                data: Mutex::new(data),
                event_recursion_depth: AtomicU32::new(0),
            }
        })
    }

    /// Derive a child context: a cancellation child (so parent
    /// cancellation propagates down), the parent's current limit list,
    /// and stats linked for real-time aggregation. Records a spawn
    /// event on `self` — not on the child, which has no publisher
    /// bound yet.
    pub async fn spawn_child(
        self: &Arc<Self>,
        name: impl Into<String>,
        data: Box<dyn LoopData>,
    ) -> Arc<ExecutionContext> {
        let name = name.into();
        let child_token = self.cancellation.child_token();
        let limits = self.limits.lock().unwrap().clone();
        let depth = self.depth + 1;
        let parent_stats = self.stats.clone();
        let parent_weak: Weak<ExecutionContext> = Arc::downgrade(self);

        let child = Arc::new_cyclic(|weak_self| {
            let stats = Arc::new(ExecutionStats::new(weak_self.clone(), Some(parent_stats)));
            let mut data = data;
            data.set_execution_context(weak_self.clone());
            ExecutionContext {
                name: name.clone(),
                parent: Some(parent_weak),
                children: Mutex::new(Vec::new()),
                iteration: AtomicU64::new(0),
                depth,
                start: Instant::now(),
                inner: Mutex::new(ContextInner::default()),
                limits: Mutex::new(limits),
                cancellation: child_token,
                cancel_cause: Mutex::new(None),
                stats,
                stream_hub: StreamHub::new(),
                publisher: OnceLock::new(),
                data: Mutex::new(data),
                event_recursion_depth: AtomicU32::new(0),
            }
        });

        self.children.lock().unwrap().push(child.clone());

        let event = Event::Common(CommonEvent {
            base: self.new_base("context_spawned"),
            name: "context.spawned".to_string(),
            description: format!("spawned child context '{}'", child.name),
            data: serde_json::json!({ "child_name": child.name, "depth": child.depth }),
        });
        self.publish(event).await;

        child
    }

    /// Record that a child finished. Stats are already aggregated in
    /// real time — this only removes the child from the live-children
    /// list (so a long-lived parent doesn't accumulate every child it
    /// ever spawned) and appends the completion event, on `self`.
    pub async fn complete_child(
        self: &Arc<Self>,
        child: &Arc<ExecutionContext>,
        reason: TerminationReason,
        duration: Duration,
    ) {
        self.children.lock().unwrap().retain(|c| !Arc::ptr_eq(c, child));

        let event = Event::Common(CommonEvent {
            base: self.new_base("context_completed"),
            name: "context.completed".to_string(),
            description: format!("child context '{}' completed: {reason:?}", child.name),
            data: serde_json::json!({
                "child_name": child.name,
                "reason": format!("{reason:?}"),
                "duration_ms": duration.as_millis() as u64,
            }),
        });
        self.publish(event).await;
    }

    /// This context's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This context's depth (root = 0).
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// This context's current iteration (0 before the first
    /// iteration).
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::SeqCst)
    }

    /// This context's stats object.
    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// A snapshot of this context's currently-live children — those
    /// spawned but not yet completed via [`complete_child`](Self::complete_child).
    pub fn children(&self) -> Vec<Arc<ExecutionContext>> {
        self.children.lock().unwrap().clone()
    }

    /// Lock and access the user-supplied loop data.
    pub fn data(&self) -> std::sync::MutexGuard<'_, Box<dyn LoopData>> {
        self.data.lock().unwrap()
    }

    /// The cancellation handle for use in external I/O. Clones are
    /// cheap and share the same underlying signal.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// The cause recorded for this context's cancellation, if any.
    pub fn cancellation_cause(&self) -> Option<String> {
        self.cancel_cause.lock().unwrap().clone()
    }

    /// Cancel this context. One-shot: only the first call's cause is
    /// kept; later calls are no-ops on the cause (the underlying token
    /// is already idempotent).
    pub(crate) fn cancel(&self, cause: String) {
        let mut stored = self.cancel_cause.lock().unwrap();
        if stored.is_none() {
            *stored = Some(cause);
        }
        drop(stored);
        self.cancellation.cancel();
    }

    /// Replace this context's limit list. Callers must do this before
    /// execution begins — limits are snapshotted onto each spawned
    /// child at spawn time, not re-read live.
    pub fn set_limits(&self, limits: Vec<Limit>) {
        *self.limits.lock().unwrap() = limits;
    }

    /// The limit that caused this context to be cancelled, if any.
    /// Immutable once set.
    pub fn exceeded_limit(&self) -> Option<LimitExceeded> {
        self.inner.lock().unwrap().exceeded_limit.clone()
    }

    /// Bind the event publisher. One-shot: called by the executor
    /// before the first publish; later calls are ignored.
    pub fn set_event_publisher(&self, publisher: Arc<EventPublisher>) {
        let _ = self.publisher.set(publisher);
    }

    fn publisher_handle(&self) -> Option<Arc<EventPublisher>> {
        self.publisher.get().cloned()
    }

    /// The execution result, populated once [`Executor::run`](crate::executor::Executor::run)
    /// calls `set_termination`. `None` before that.
    pub fn result(&self) -> Option<ExecutionResult> {
        let inner = self.inner.lock().unwrap();
        inner.termination_reason.map(|reason| ExecutionResult {
            termination_reason: reason,
            output: inner.output.clone(),
            error: inner.error.clone(),
            exceeded_limit: inner.exceeded_limit.clone(),
        })
    }

    /// A read-only snapshot of the event log recorded so far.
    pub fn event_log(&self) -> Vec<Event> {
        self.inner.lock().unwrap().event_log.clone()
    }

    pub(crate) fn set_output(&self, output: Vec<ContentPart>) {
        self.inner.lock().unwrap().output = output;
    }

    pub(crate) fn set_error(&self, error: impl std::fmt::Display) {
        self.inner.lock().unwrap().error = Some(error.to_string());
    }

    /// Subscribe to every chunk emitted on this context or any
    /// descendant.
    pub fn subscribe_all(&self) -> (tokio::sync::mpsc::UnboundedReceiver<StreamChunk>, SubscriptionHandle) {
        self.stream_hub.subscribe_all()
    }

    /// Subscribe to chunks tagged with `stream_id`.
    pub fn subscribe_to_stream(
        &self,
        stream_id: impl Into<String>,
    ) -> (tokio::sync::mpsc::UnboundedReceiver<StreamChunk>, SubscriptionHandle) {
        self.stream_hub.subscribe_to_stream(stream_id)
    }

    /// Subscribe to chunks tagged with `topic_id`.
    pub fn subscribe_to_topic(
        &self,
        topic_id: impl Into<String>,
    ) -> (tokio::sync::mpsc::UnboundedReceiver<StreamChunk>, SubscriptionHandle) {
        self.stream_hub.subscribe_to_topic(topic_id)
    }

    /// Emit a stream chunk: fans out locally, then re-emits on the
    /// parent so every ancestor's `subscribe_all` also observes it.
    /// Fills in `source_path` if it arrives empty.
    pub fn emit_chunk(&self, mut chunk: StreamChunk) {
        if chunk.source_path.is_empty() {
            chunk.source_path = self.source_path();
        }
        self.stream_hub.emit(chunk.clone());
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.emit_chunk(chunk);
        }
    }

    /// Close this context's stream hub. Idempotent.
    pub fn close_streams(&self) {
        self.stream_hub.close();
    }

    fn source_path(&self) -> String {
        let mut segments = vec![format!("{}/{}", self.name, self.iteration())];
        let mut cursor = self.parent.clone();
        while let Some(weak) = cursor {
            match weak.upgrade() {
                Some(parent) => {
                    segments.push(format!("{}/{}", parent.name, parent.iteration()));
                    cursor = parent.parent.clone();
                }
                None => break,
            }
        }
        segments.reverse();
        segments.join("/")
    }

    fn new_base(&self, name: &'static str) -> EventBase {
        EventBase {
            name,
            timestamp: TimestampMs::since(self.start, Instant::now()),
            iteration: self.iteration(),
            depth: self.depth,
        }
    }

    /// The common publish path (§4.4): bound-recursion check, base
    /// population, append-to-log, stats effects, then dispatch.
    /// Returns the event as subscribers left it, so callers can read
    /// back mutations to "before" payloads.
    pub async fn publish(&self, mut event: Event) -> Event {
        let guard = self
            .publisher_handle()
            .map(|publisher| RecursionGuard::enter(&self.event_recursion_depth, publisher.max_recursion_depth));

        *event.base_mut() = self.new_base(event.base().name);

        {
            let mut inner = self.inner.lock().unwrap();
            inner.event_log.push(event.clone());
        }

        self.apply_stats_effect(&event).await;

        if let Some(publisher) = self.publisher_handle() {
            publisher.dispatch(&mut event).await;
        }

        drop(guard);
        event
    }

    async fn apply_stats_effect(&self, event: &Event) {
        match event {
            Event::AfterModelCall(e) => {
                self.stats.increment_counter("gent:input_tokens", e.input_tokens as i64).await;
                self.stats.increment_counter("gent:output_tokens", e.output_tokens as i64).await;
                self.stats
                    .increment_counter("gent:total_tokens", (e.input_tokens + e.output_tokens) as i64)
                    .await;
                self.stats
                    .increment_counter(&format!("gent:input_tokens:{}", e.model_id), e.input_tokens as i64)
                    .await;
                self.stats
                    .increment_counter(&format!("gent:output_tokens:{}", e.model_id), e.output_tokens as i64)
                    .await;
                self.stats.set_gauge(LAST_ITERATION_INPUT_TOKENS_GAUGE, e.input_tokens as f64).await;
                self.stats.set_gauge(LAST_ITERATION_OUTPUT_TOKENS_GAUGE, e.output_tokens as f64).await;
            }
            Event::BeforeToolCall(e) => {
                self.stats.increment_counter("gent:tool_calls", 1).await;
                self.stats
                    .increment_counter(&format!("gent:tool_calls:{}", e.tool_name), 1)
                    .await;
            }
            Event::AfterToolCall(e) => {
                if e.error.is_some() {
                    self.stats.increment_counter("gent:tool_errors", 1).await;
                    self.stats
                        .increment_counter(&format!("gent:tool_errors:{}", e.tool_name), 1)
                        .await;
                    self.stats.increment_gauge(TOOL_ERROR_CONSECUTIVE_KEY, 1.0).await;
                }
            }
            Event::ParseError(e) => {
                self.stats.increment_counter(&parse_error_total_key(e.kind), 1).await;
                self.stats.increment_gauge(parse_error_key(e.kind), 1.0).await;
            }
            Event::ValidatorResult(e) => {
                if !e.accepted {
                    self.stats.increment_counter(VALIDATOR_REJECTED_TOTAL_KEY, 1).await;
                    self.stats
                        .increment_counter(&format!("gent:validator_rejected:{}", e.name), 1)
                        .await;
                }
            }
            _ => {}
        }
    }

    /// Evaluate this context's limits against its current stats (§4.5).
    /// A no-op once an exceeded limit is already set. On breach,
    /// records the exceeded limit, publishes a limit-exceeded event,
    /// then cancels — in that order, so subscribers see the stat value
    /// while it is still current.
    pub(crate) async fn check_limits(self: &Arc<Self>) {
        if self.exceeded_limit().is_some() {
            return;
        }
        let limits = self.limits.lock().unwrap().clone();
        let counters = self.stats.snapshot_counters();
        let gauges = self.stats.snapshot_gauges();

        let breach = find_breach(&limits, &counters, &gauges);

        let Some((matched_limit, matched_key, current)) = breach else {
            return;
        };

        let exceeded = LimitExceeded {
            key: matched_key.clone(),
            max: matched_limit.max,
            current,
        };
        let set_now = {
            let mut inner = self.inner.lock().unwrap();
            if inner.exceeded_limit.is_some() {
                false
            } else {
                inner.exceeded_limit = Some(exceeded.clone());
                true
            }
        };
        if !set_now {
            return;
        }

        self.publish_limit_exceeded_for(matched_limit, current, matched_key).await;
        self.cancel(format!("limit exceeded: {exceeded}"));
    }

    /// Increment the protected iteration counter and reset
    /// per-iteration gauges, then publish the before-iteration event.
    /// The counter bump happens before base-field population so the
    /// event's own `base.iteration` reflects the iteration it opens,
    /// not the one that just ended.
    pub async fn publish_before_iteration(self: &Arc<Self>) -> Event {
        self.iteration.fetch_add(1, Ordering::SeqCst);
        self.stats.increment_counter_internal(ITERATIONS_KEY, 1).await;
        self.stats.reset_gauge(LAST_ITERATION_INPUT_TOKENS_GAUGE).await;
        self.stats.reset_gauge(LAST_ITERATION_OUTPUT_TOKENS_GAUGE).await;
        let event = Event::BeforeIteration(BeforeIteration {
            base: self.new_base("before_iteration"),
        });
        self.publish(event).await
    }

    /// Publish the one-shot before-execution event.
    pub async fn publish_before_execution(&self) -> Event {
        let event = Event::BeforeExecution(BeforeExecution {
            base: self.new_base("before_execution"),
        });
        self.publish(event).await
    }

    /// Publish the one-shot after-execution event.
    pub async fn publish_after_execution(&self, reason: TerminationReason, error: Option<String>) -> Event {
        let event = Event::AfterExecution(AfterExecution {
            base: self.new_base("after_execution"),
            termination_reason: reason,
            error,
        });
        self.publish(event).await
    }

    /// Publish the after-iteration event.
    pub async fn publish_after_iteration(&self, result: IterationOutcome, duration: Duration) -> Event {
        let event = Event::AfterIteration(AfterIteration {
            base: self.new_base("after_iteration"),
            result,
            duration,
        });
        self.publish(event).await
    }

    /// Publish before-model-call and return the request as subscribers
    /// left it — this is what the caller must actually send.
    pub async fn publish_before_model_call(&self, model_id: impl Into<String>, request: Value) -> Value {
        let event = Event::BeforeModelCall(BeforeModelCall {
            base: self.new_base("before_model_call"),
            model_id: model_id.into(),
            request,
        });
        match self.publish(event).await {
            Event::BeforeModelCall(e) => e.request,
            _ => unreachable!("publish preserves variant"),
        }
    }

    /// Publish after-model-call. Updates token counters and
    /// per-iteration token gauges.
    pub async fn publish_after_model_call(
        &self,
        model_id: impl Into<String>,
        request: Value,
        response: Value,
        input_tokens: u64,
        output_tokens: u64,
        duration: Duration,
        error: Option<String>,
    ) -> Event {
        let event = Event::AfterModelCall(AfterModelCall {
            base: self.new_base("after_model_call"),
            model_id: model_id.into(),
            request,
            response,
            input_tokens,
            output_tokens,
            duration,
            error,
        });
        self.publish(event).await
    }

    /// Publish before-tool-call and return the args as subscribers
    /// left them.
    pub async fn publish_before_tool_call(&self, tool_name: impl Into<String>, args: Value) -> Value {
        let event = Event::BeforeToolCall(BeforeToolCall {
            base: self.new_base("before_tool_call"),
            tool_name: tool_name.into(),
            args,
        });
        match self.publish(event).await {
            Event::BeforeToolCall(e) => e.args,
            _ => unreachable!("publish preserves variant"),
        }
    }

    /// Publish after-tool-call. On error, increments error counters
    /// and the consecutive-tool-error gauge.
    pub async fn publish_after_tool_call(
        &self,
        tool_name: impl Into<String>,
        args: Value,
        output: Value,
        duration: Duration,
        error: Option<String>,
    ) -> Event {
        let event = Event::AfterToolCall(AfterToolCall {
            base: self.new_base("after_tool_call"),
            tool_name: tool_name.into(),
            args,
            output,
            duration,
            error,
        });
        self.publish(event).await
    }

    /// Publish a parse-error event. Increments the kind's total and
    /// consecutive-error counters. Callers (a [`TextFormat`](crate::contracts::TextFormat)
    /// or [`ToolChain`](crate::contracts::ToolChain)) are responsible
    /// for calling [`ExecutionContext::reset_parse_error_consecutive`]
    /// on their next successful parse.
    pub async fn publish_parse_error(&self, kind: ParseErrorKind, raw: impl Into<String>, error: impl Into<String>) -> Event {
        let event = Event::ParseError(ParseErrorEvent {
            base: self.new_base("parse_error"),
            kind,
            raw: raw.into(),
            error: error.into(),
        });
        self.publish(event).await
    }

    /// Reset the consecutive-error gauge for a parse-error kind. Call
    /// this on a successful parse.
    pub async fn reset_parse_error_consecutive(&self, kind: ParseErrorKind) {
        self.stats.reset_gauge(parse_error_key(kind)).await;
    }

    /// Reset the consecutive-tool-error gauge. Call this on a
    /// successful tool call.
    pub async fn reset_tool_error_consecutive(&self) {
        self.stats.reset_gauge(TOOL_ERROR_CONSECUTIVE_KEY).await;
    }

    /// Publish a validator-called event.
    pub async fn publish_validator_called(&self, name: impl Into<String>, answer: impl Into<String>) -> Event {
        let event = Event::ValidatorCalled(ValidatorCalled {
            base: self.new_base("validator_called"),
            name: name.into(),
            answer: answer.into(),
        });
        self.publish(event).await
    }

    /// Publish a validator-result event. On rejection, increments the
    /// rejection counters.
    pub async fn publish_validator_result(
        &self,
        name: impl Into<String>,
        answer: impl Into<String>,
        accepted: bool,
        feedback: Option<String>,
    ) -> Event {
        let event = Event::ValidatorResult(ValidatorResultEvent {
            base: self.new_base("validator_result"),
            name: name.into(),
            answer: answer.into(),
            accepted,
            feedback,
        });
        self.publish(event).await
    }

    /// Publish a generic error event.
    pub async fn publish_error(&self, error: impl Into<String>) -> Event {
        let event = Event::Error(ErrorEvent {
            base: self.new_base("error"),
            error: error.into(),
        });
        self.publish(event).await
    }

    /// Publish a compaction event.
    pub async fn publish_compaction(&self, before: Value, after: Value) -> Event {
        let event = Event::Compaction(CompactionEvent {
            base: self.new_base("compaction"),
            before,
            after,
        });
        self.publish(event).await
    }

    pub(crate) async fn publish_limit_exceeded_for(&self, limit: Limit, current: u64, matched_key: String) -> Event {
        let event = Event::LimitExceeded(LimitExceededEvent {
            base: self.new_base("limit_exceeded"),
            limit,
            current,
            matched_key,
        });
        self.publish(event).await
    }

    /// Publish an ad hoc named observation.
    pub async fn publish_common(&self, name: impl Into<String>, description: impl Into<String>, data: Value) -> Event {
        let event = Event::Common(CommonEvent {
            base: self.new_base("common"),
            name: name.into(),
            description: description.into(),
            data,
        });
        self.publish(event).await
    }

    /// Publish an ad hoc named observation with a before/after diff.
    pub async fn publish_common_diff(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        data: Value,
        before: Option<Value>,
        after: Option<Value>,
    ) -> Event {
        let event = Event::CommonDiff(CommonDiffEvent {
            base: self.new_base("common_diff"),
            name: name.into(),
            description: description.into(),
            data,
            before,
            after,
        });
        self.publish(event).await
    }

    /// Set termination exactly once: records the reason and end time,
    /// publishes after-execution, and closes streams. A no-op on any
    /// call after the first.
    pub(crate) async fn set_termination(&self, reason: TerminationReason) {
        let already_set = {
            let mut inner = self.inner.lock().unwrap();
            if inner.termination_reason.is_some() {
                true
            } else {
                inner.termination_reason = Some(reason);
                inner.end_time = Some(Instant::now());
                false
            }
        };
        if already_set {
            return;
        }
        let error = self.inner.lock().unwrap().error.clone();
        self.publish_after_execution(reason, error).await;
        self.close_streams();
    }
}

/// A negative counter has no meaningful "current value" against a
/// `u64` limit — clamp to zero rather than letting a negative delta
/// (a legal `ExecutionStats::increment_counter` call) wrap around into
/// a spurious breach.
fn counter_as_u64(value: i64) -> u64 {
    value.max(0) as u64
}

/// Pure function form of the §4.5 limit-evaluation algorithm, kept
/// free of locking concerns so it is trivial to test in isolation.
///
/// Returns the breached `Limit` itself (needed to populate
/// [`LimitExceededEvent::limit`](crate::event::LimitExceededEvent::limit)),
/// the specific stat key that crossed the threshold (for a prefix
/// limit, this is the matching key, not the prefix), and the value
/// observed there.
fn find_breach(
    limits: &[Limit],
    counters: &HashMap<String, i64>,
    gauges: &HashMap<String, f64>,
) -> Option<(Limit, String, u64)> {
    for limit in limits {
        match limit.kind {
            LimitKind::Exact => {
                if let Some(&value) = counters.get(&limit.key) {
                    let value = counter_as_u64(value);
                    if value > limit.max {
                        return Some((limit.clone(), limit.key.clone(), value));
                    }
                }
                if let Some(&value) = gauges.get(&limit.key) {
                    if value as u64 > limit.max {
                        return Some((limit.clone(), limit.key.clone(), value as u64));
                    }
                }
            }
            LimitKind::Prefix => {
                // Must check every matching key for a breach, not just
                // the first one iteration happens to visit — HashMap
                // order is unspecified, and an earlier non-breaching
                // key must not shadow a later breaching one. Bindings
                // are plain identifiers (no nested `&pattern`) so the
                // closure body dereferences explicitly instead of
                // layering an explicit deref under `find`'s implicit
                // `&Item` borrow.
                let counter_hit = counters
                    .iter()
                    .filter(|(k, _)| k.starts_with(&limit.key))
                    .map(|(k, v)| (k, counter_as_u64(*v)))
                    .find(|(_, v)| *v > limit.max);
                if let Some((key, value)) = counter_hit {
                    return Some((limit.clone(), key.clone(), value));
                }

                let gauge_hit = gauges
                    .iter()
                    .filter(|(k, _)| k.starts_with(&limit.key))
                    .map(|(k, v)| (k, *v as u64))
                    .find(|(_, v)| *v > limit.max);
                if let Some((key, value)) = gauge_hit {
                    return Some((limit.clone(), key.clone(), value));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn context_is_send_sync() {
        _assert_send_sync::<ExecutionContext>();
    }

    #[test]
    fn find_breach_fires_on_strict_greater_than() {
        let limits = vec![Limit::exact("gent:iterations", 2)];
        let mut counters = HashMap::new();
        counters.insert("gent:iterations".to_string(), 2);
        assert!(find_breach(&limits, &counters, &HashMap::new()).is_none());
        counters.insert("gent:iterations".to_string(), 3);
        let breach = find_breach(&limits, &counters, &HashMap::new()).unwrap();
        assert_eq!(breach.0.max, 2);
        assert_eq!(breach.1, "gent:iterations");
        assert_eq!(breach.2, 3);
    }

    #[test]
    fn find_breach_prefix_resolves_matched_key() {
        let limits = vec![Limit::prefix("gent:tool_calls:", 5)];
        let mut counters = HashMap::new();
        counters.insert("gent:tool_calls:search".to_string(), 6);
        let breach = find_breach(&limits, &counters, &HashMap::new()).unwrap();
        assert_eq!(breach.1, "gent:tool_calls:search");
    }

    #[test]
    fn find_breach_prefix_scans_every_matching_key_not_just_the_first() {
        let limits = vec![Limit::prefix("gent:tool_calls:", 5)];
        let mut counters = HashMap::new();
        // Neither key is breaching on its own relative to iteration
        // order assumptions; "fetch" is the one that actually breaches.
        counters.insert("gent:tool_calls:search".to_string(), 2);
        counters.insert("gent:tool_calls:fetch".to_string(), 10);
        let breach = find_breach(&limits, &counters, &HashMap::new()).unwrap();
        assert_eq!(breach.0.max, 5);
        assert_eq!(breach.1, "gent:tool_calls:fetch");
        assert_eq!(breach.2, 10);
    }

    #[test]
    fn find_breach_ignores_negative_counters_instead_of_wrapping() {
        let limits = vec![Limit::exact("gent:custom", 5)];
        let mut counters = HashMap::new();
        counters.insert("gent:custom".to_string(), -1);
        assert!(find_breach(&limits, &counters, &HashMap::new()).is_none());
    }

    #[tokio::test]
    async fn complete_child_removes_it_from_the_live_children_list() {
        let root = ExecutionContext::new_root(None, "root", Box::new(NoopData));
        let child = root.spawn_child("worker", Box::new(NoopData)).await;
        assert_eq!(root.children().len(), 1);

        root.complete_child(&child, TerminationReason::Success, Duration::from_millis(1))
            .await;
        assert!(root.children().is_empty());
    }

    #[test]
    fn zero_max_fires_on_first_increment() {
        let limits = vec![Limit::exact("gent:x", 0)];
        let mut counters = HashMap::new();
        counters.insert("gent:x".to_string(), 1);
        assert!(find_breach(&limits, &counters, &HashMap::new()).is_some());
    }

    #[derive(Default)]
    struct NoopData;

    impl LoopData for NoopData {
        fn task(&self) -> &Value {
            static TASK: Value = Value::Null;
            &TASK
        }
        fn iteration_history(&self) -> &[crate::contracts::IterationRecord] {
            &[]
        }
        fn add_iteration_history(&mut self, _iteration: crate::contracts::IterationRecord) {}
        fn scratchpad(&self) -> &[crate::contracts::IterationRecord] {
            &[]
        }
        fn set_scratchpad(&mut self, _iterations: Vec<crate::contracts::IterationRecord>) {}
        fn set_execution_context(&mut self, _ctx: Weak<ExecutionContext>) {}
    }

    /// §8 round-trip law: "spawn-child then complete-child records
    /// exactly one spawn event and one complete event on the parent."
    #[tokio::test]
    async fn spawn_then_complete_child_records_exactly_one_pair() {
        let root = ExecutionContext::new_root(None, "root", Box::new(NoopData));
        let child = root.spawn_child("worker", Box::new(NoopData)).await;

        root.complete_child(&child, TerminationReason::Success, Duration::from_millis(5))
            .await;

        let spawned = root
            .event_log()
            .into_iter()
            .filter(|event| matches!(event, Event::Common(e) if e.name == "context.spawned"))
            .count();
        let completed = root
            .event_log()
            .into_iter()
            .filter(|event| matches!(event, Event::Common(e) if e.name == "context.completed"))
            .count();

        assert_eq!(spawned, 1);
        assert_eq!(completed, 1);
    }
}
