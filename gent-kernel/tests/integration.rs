//! Integration tests for the execution kernel's end-to-end scenarios.
//!
//! Each test below exercises one of the concrete scenarios worked out
//! while designing the kernel: aggregate limits across parallel
//! children, streaming fan-in with source paths, a slow stream
//! consumer not blocking the producer, a subscriber mutating a
//! before-model-call request, consecutive parse errors with a reset,
//! and a runaway event-recursion abort.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use gent_kernel::context::ExecutionContext;
use gent_kernel::contracts::{IterationRecord, LoopData};
use gent_kernel::error::KernelError;
use gent_kernel::event::{Event, ParseErrorKind, Subscriber};
use gent_kernel::limits::Limit;
use gent_kernel::stream::StreamChunk;
use gent_kernel::EventPublisher;

#[derive(Default)]
struct TestData {
    ctx: Option<Weak<ExecutionContext>>,
    history: Vec<IterationRecord>,
    scratchpad: Vec<IterationRecord>,
}

impl LoopData for TestData {
    fn task(&self) -> &Value {
        static TASK: Value = Value::Null;
        &TASK
    }
    fn iteration_history(&self) -> &[IterationRecord] {
        &self.history
    }
    fn add_iteration_history(&mut self, iteration: IterationRecord) {
        self.history.push(iteration);
    }
    fn scratchpad(&self) -> &[IterationRecord] {
        &self.scratchpad
    }
    fn set_scratchpad(&mut self, iterations: Vec<IterationRecord>) {
        self.scratchpad = iterations;
    }
    fn set_execution_context(&mut self, ctx: Weak<ExecutionContext>) {
        self.ctx = Some(ctx);
    }
}

fn root() -> Arc<ExecutionContext> {
    ExecutionContext::new_root(None, "main", Box::new(TestData::default()))
}

/// Scenario B — aggregate token limit across parallel children: each
/// child's propagated increment lands on the root, and the root's
/// limit fires once the aggregate crosses the threshold.
#[tokio::test]
async fn aggregate_token_limit_across_children() {
    let root = root();
    root.set_limits(vec![Limit::exact("gent:input_tokens", 250)]);

    let mut children = Vec::new();
    for i in 0..3 {
        children.push(
            root.spawn_child(format!("child-{i}"), Box::new(TestData::default()))
                .await,
        );
    }

    for child in &children {
        child
            .publish_after_model_call(
                "test-model",
                Value::Null,
                Value::Null,
                100,
                0,
                Duration::from_millis(1),
                None,
            )
            .await;
    }

    let exceeded = root.exceeded_limit().expect("root limit should have fired");
    assert_eq!(exceeded.key, "gent:input_tokens");
    assert_eq!(root.stats().get_counter("gent:input_tokens"), Some(300));
}

/// Scenario D — streaming fan-in: a child's chunk reaches a
/// subscribe-all subscription on the root, carrying the full
/// ancestor source path.
#[tokio::test]
async fn streaming_fan_in_carries_source_path() {
    let root = root();
    let (mut rx, _handle) = root.subscribe_all();

    let child = root.spawn_child("research", Box::new(TestData::default())).await;
    child.publish_before_iteration().await;

    child.emit_chunk(StreamChunk {
        content: "hello".to_string(),
        ..Default::default()
    });

    let chunk = rx.recv().await.expect("chunk should be delivered");
    assert_eq!(chunk.content, "hello");
    assert_eq!(
        chunk.source_path,
        format!("{}/{}/{}/{}", root.name(), root.iteration(), child.name(), child.iteration())
    );
}

/// Scenario E — a slow subscriber never blocks the producer: emitting
/// 100 chunks completes near-instantly regardless of consumer speed,
/// because the hub delegates to the unbounded buffer.
#[tokio::test]
async fn slow_consumer_does_not_block_producer() {
    let root = root();
    let (mut rx, _handle) = root.subscribe_all();

    let start = Instant::now();
    for i in 0..100 {
        root.emit_chunk(StreamChunk {
            content: i.to_string(),
            ..Default::default()
        });
    }
    assert!(
        start.elapsed() < Duration::from_millis(50),
        "producer should never block on a slow consumer"
    );

    let mut received = 0;
    while received < 100 {
        rx.recv().await.expect("all 100 chunks should eventually arrive");
        received += 1;
    }
}

/// Scenario F — a before-model-call subscriber mutates the request;
/// the mutated value is what the caller sees after dispatch returns.
struct AppendsMarkerSubscriber;

#[async_trait]
impl Subscriber for AppendsMarkerSubscriber {
    async fn on_event(&self, event: &mut Event) -> Result<(), KernelError> {
        if let Event::BeforeModelCall(before) = event {
            if let Value::Object(map) = &mut before.request {
                map.insert("injected".to_string(), Value::Bool(true));
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn subscriber_mutates_before_model_call_request() {
    let root = root();
    let publisher = Arc::new(EventPublisher::new(10));
    publisher.subscribe(Arc::new(AppendsMarkerSubscriber));
    root.set_event_publisher(publisher);

    let mutated = root
        .publish_before_model_call("test-model", serde_json::json!({}))
        .await;

    assert_eq!(mutated.get("injected"), Some(&Value::Bool(true)));
}

/// Scenario C — three consecutive format parse errors terminate the
/// context; a reset in between two pairs of errors prevents it.
#[tokio::test]
async fn consecutive_parse_errors_terminate() {
    let root = root();
    for _ in 0..3 {
        root.publish_parse_error(ParseErrorKind::Format, "raw", "bad parse").await;
    }
    let exceeded = root.exceeded_limit().expect("three consecutive errors should breach the default limit");
    assert_eq!(exceeded.key, "gent:format_parse_error_consecutive");
}

#[tokio::test]
async fn parse_error_reset_prevents_termination() {
    let root = root();
    root.publish_parse_error(ParseErrorKind::Format, "raw", "bad parse").await;
    root.publish_parse_error(ParseErrorKind::Format, "raw", "bad parse").await;
    root.reset_parse_error_consecutive(ParseErrorKind::Format).await;
    root.publish_parse_error(ParseErrorKind::Format, "raw", "bad parse").await;
    root.publish_parse_error(ParseErrorKind::Format, "raw", "bad parse").await;

    assert!(root.exceeded_limit().is_none());
}

/// Scenario G — a subscriber that republishes before-iteration from
/// within its own `on_event` overflows the recursion bound and aborts.
struct RecursingSubscriber(Mutex<Option<Arc<ExecutionContext>>>);

#[async_trait]
impl Subscriber for RecursingSubscriber {
    async fn on_event(&self, event: &mut Event) -> Result<(), KernelError> {
        if matches!(event, Event::BeforeIteration(_)) {
            let ctx = self.0.lock().unwrap().clone();
            if let Some(ctx) = ctx {
                ctx.publish_before_iteration().await;
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn event_recursion_overflow_aborts() {
    let root = root();
    let publisher = Arc::new(EventPublisher::new(3));
    root.set_event_publisher(publisher.clone());
    publisher.subscribe(Arc::new(RecursingSubscriber(Mutex::new(Some(root.clone())))));

    let ctx = root.clone();
    let handle = tokio::spawn(async move {
        ctx.publish_before_iteration().await;
    });

    assert!(
        handle.await.is_err(),
        "unbounded subscriber recursion should abort the task"
    );
}
