//! The executor (C7): drives an [`AgentLoopBody`] to completion, one
//! iteration at a time, per the state machine in the module docs below.
//!
//! ```text
//!  [start] → check-cancellation → compaction? → before-iteration → loop.Next → after-iteration → check-terminate?
//!       │                     │                  │                            │
//!       │                     │                  │                            ├── terminate → set-termination(success) → [end]
//!       │                     │                  │                            └── continue  → [start]
//!       │                     │                  └── error → set-termination(compaction-failed) → [end]
//!       └── cancelled → set-termination(limit-exceeded | context-canceled) → [end]
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;

use crate::compaction::{CompactionPipeline, CompactionStrategy, CompactionTrigger};
use crate::contracts::{AgentLoopBody, LoopAction};
use crate::context::{ExecutionContext, ExecutionResult};
use crate::error::KernelError;
use crate::event::{EventPublisher, EventPublisherConfig, IterationOutcome};

/// Why an execution stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The loop body asked to terminate and no limit was breached.
    Success,
    /// The loop body returned an error and no limit was breached.
    Error,
    /// A configured [`Limit`](crate::limits::Limit) was exceeded. Takes
    /// priority over a concurrent body error or success (§9 open
    /// question: resolved in favor of limit-exceeded).
    LimitExceeded,
    /// The context was cancelled externally (e.g. by a parent).
    ContextCanceled,
    /// The configured [`CompactionStrategy`] returned an error.
    CompactionFailed,
}

/// Programmatic knobs for an [`Executor`]. There is no file or
/// environment config (spec §6) — callers build one of these directly.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How deep a subscriber may nest publishes from within its own
    /// `on_event` before the kernel aborts as a programming error.
    pub max_event_recursion_depth: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            max_event_recursion_depth: 10,
        }
    }
}

/// Drives a single [`ExecutionContext`] through repeated
/// think-act-observe iterations until the loop body terminates, errors,
/// a limit is breached, or the context is cancelled.
///
/// Stateless beyond its configuration and optional compaction pipeline
/// — one `Executor` can drive any number of contexts sequentially (or
/// concurrently, each against its own context).
pub struct Executor {
    config: ExecutorConfig,
    compaction: Option<CompactionPipeline>,
}

impl Executor {
    /// Build an executor with the given configuration and no
    /// compaction pipeline.
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Executor {
            config,
            compaction: None,
        }
    }

    /// Configure compaction. `trigger` and `strategy` must both be
    /// `Some` or both `None` — a half-configured pipeline is always a
    /// bug (§4.8).
    ///
    /// # Panics
    ///
    /// Panics if exactly one of `trigger`/`strategy` is `Some`.
    pub fn set_compaction(
        &mut self,
        trigger: Option<Arc<dyn CompactionTrigger>>,
        strategy: Option<Arc<dyn CompactionStrategy>>,
    ) {
        self.compaction = match (trigger, strategy) {
            (Some(trigger), Some(strategy)) => Some(CompactionPipeline { trigger, strategy }),
            (None, None) => None,
            _ => panic!("compaction trigger and strategy must be configured together"),
        };
    }

    /// Run `body` against `ctx` to completion.
    ///
    /// Binds the event publisher (one-shot — a context already bound
    /// keeps its existing publisher), publishes the one-shot
    /// before-execution event, drives iterations, then calls
    /// [`ExecutionContext::set_termination`] exactly once so the
    /// after-execution event and stream closure fire on every exit
    /// path — including a panic inside the loop body, which is caught
    /// here and turned into a terminal error rather than left to unwind
    /// past `set_termination`/`close_streams` (§4.7: "after-execution
    /// event and stream close are published in a deferred cleanup so
    /// they fire on every exit path, including panics").
    pub async fn run(
        &self,
        ctx: &Arc<ExecutionContext>,
        mut body: Box<dyn AgentLoopBody>,
    ) -> ExecutionResult {
        ctx.set_event_publisher(Arc::new(EventPublisher::from_config(EventPublisherConfig {
            max_recursion_depth: self.config.max_event_recursion_depth,
        })));
        ctx.publish_before_execution().await;

        let reason = match AssertUnwindSafe(self.drive(ctx, body.as_mut())).catch_unwind().await {
            Ok(reason) => reason,
            Err(payload) => {
                ctx.set_error(format!("agent loop body panicked: {}", panic_message(&payload)));
                if ctx.exceeded_limit().is_some() {
                    TerminationReason::LimitExceeded
                } else {
                    TerminationReason::Error
                }
            }
        };

        ctx.set_termination(reason).await;
        ctx.result()
            .expect("set_termination always populates the result")
    }

    async fn drive(&self, ctx: &Arc<ExecutionContext>, body: &mut dyn AgentLoopBody) -> TerminationReason {
        loop {
            if ctx.cancellation_token().is_cancelled() {
                return if ctx.exceeded_limit().is_some() {
                    TerminationReason::LimitExceeded
                } else {
                    TerminationReason::ContextCanceled
                };
            }

            // Compaction runs at the start of every iteration except
            // the first — a fresh scratchpad needs no pruning.
            if ctx.iteration() > 0 {
                if let Some(pipeline) = &self.compaction {
                    match pipeline.trigger.should_compact(ctx).await {
                        Ok(true) => match pipeline.strategy.compact(ctx).await {
                            Ok(()) => pipeline.trigger.notify_compacted(ctx).await,
                            Err(err) => {
                                ctx.set_error(KernelError::Other(err));
                                return TerminationReason::CompactionFailed;
                            }
                        },
                        Ok(false) => {}
                        Err(err) => {
                            ctx.set_error(KernelError::Other(err));
                            return TerminationReason::CompactionFailed;
                        }
                    }
                }
            }

            ctx.publish_before_iteration().await;

            let start = Instant::now();
            let outcome = body.next(ctx).await;
            let duration = start.elapsed();

            match outcome {
                Ok(LoopAction::Continue { next_prompt: _ }) => {
                    ctx.publish_after_iteration(IterationOutcome::Continue, duration).await;
                    // Cancellation/limit state from this iteration is
                    // re-checked at the top of the next loop, not here
                    // — a limit breached mid-iteration still lets this
                    // iteration's after-iteration event land first.
                }
                Ok(LoopAction::Terminate { output }) => {
                    ctx.publish_after_iteration(IterationOutcome::Terminate, duration).await;
                    ctx.set_output(output);
                    return if ctx.exceeded_limit().is_some() {
                        TerminationReason::LimitExceeded
                    } else {
                        TerminationReason::Success
                    };
                }
                Err(err) => {
                    ctx.set_error(KernelError::Body(err));
                    return if ctx.exceeded_limit().is_some() {
                        TerminationReason::LimitExceeded
                    } else {
                        TerminationReason::Error
                    };
                }
            }
        }
    }
}

/// Best-effort extraction of a human-readable message from a caught
/// panic payload — covers the two payload shapes `panic!` actually
/// produces (`&'static str` and `String`); anything else falls back to
/// a fixed message rather than guessing at its `Debug` output.
fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::contracts::{IterationRecord, LoopData};
    use crate::content::ContentPart;
    use crate::limits::Limit;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Weak;

    #[derive(Default)]
    struct TestData {
        ctx: Option<Weak<ExecutionContext>>,
        history: Vec<IterationRecord>,
        scratchpad: Vec<IterationRecord>,
    }

    impl LoopData for TestData {
        fn task(&self) -> &serde_json::Value {
            static TASK: serde_json::Value = serde_json::Value::Null;
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

    struct AlwaysContinue {
        calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl AgentLoopBody for AlwaysContinue {
        async fn next(
            &mut self,
            _ctx: &ExecutionContext,
        ) -> Result<LoopAction, Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LoopAction::Continue {
                next_prompt: serde_json::Value::Null,
            })
        }
    }

    struct TerminatesImmediately;

    #[async_trait]
    impl AgentLoopBody for TerminatesImmediately {
        async fn next(
            &mut self,
            _ctx: &ExecutionContext,
        ) -> Result<LoopAction, Box<dyn std::error::Error + Send + Sync>> {
            Ok(LoopAction::Terminate {
                output: vec![ContentPart::text("done")],
            })
        }
    }

    struct PanicsImmediately;

    #[async_trait]
    impl AgentLoopBody for PanicsImmediately {
        async fn next(
            &mut self,
            _ctx: &ExecutionContext,
        ) -> Result<LoopAction, Box<dyn std::error::Error + Send + Sync>> {
            panic!("loop body exploded");
        }
    }

    #[tokio::test]
    async fn panicking_body_still_terminates_and_closes_streams() {
        let ctx = ExecutionContext::new_root(None, "main", Box::new(TestData::default()));
        let (mut rx, _handle) = ctx.subscribe_all();
        let executor = Executor::new(ExecutorConfig::default());

        let result = executor.run(&ctx, Box::new(PanicsImmediately)).await;

        assert_eq!(result.termination_reason, TerminationReason::Error);
        assert!(result.error.unwrap().contains("loop body exploded"));
        assert!(matches!(
            ctx.event_log().last(),
            Some(crate::event::Event::AfterExecution(_))
        ));
        // The stream hub was closed as part of cleanup: the receiver
        // observes end-of-stream rather than hanging.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn terminates_on_success() {
        let ctx = ExecutionContext::new_root(None, "main", Box::new(TestData::default()));
        let executor = Executor::new(ExecutorConfig::default());
        let result = executor.run(&ctx, Box::new(TerminatesImmediately)).await;
        assert_eq!(result.termination_reason, TerminationReason::Success);
        assert_eq!(result.output, vec![ContentPart::text("done")]);
    }

    #[tokio::test]
    async fn iteration_limit_terminates_on_next_boundary() {
        let ctx = ExecutionContext::new_root(None, "main", Box::new(TestData::default()));
        ctx.set_limits(vec![Limit::exact("gent:iterations", 2)]);
        let calls = Arc::new(AtomicU64::new(0));
        let executor = Executor::new(ExecutorConfig::default());
        let result = executor
            .run(&ctx, Box::new(AlwaysContinue { calls: calls.clone() }))
            .await;
        assert_eq!(result.termination_reason, TerminationReason::LimitExceeded);
        assert_eq!(result.exceeded_limit.unwrap().key, "gent:iterations");
        // The body runs the iteration that crosses the limit (3) before
        // the next loop's cancellation check terminates the run.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn executor_set_compaction_requires_both_or_neither() {
        let result = std::panic::catch_unwind(|| {
            let mut executor = Executor::new(ExecutorConfig::default());
            executor.set_compaction(None, Some(Arc::new(NoopStrategy)));
        });
        assert!(result.is_err());
    }

    struct NoopStrategy;

    #[async_trait]
    impl CompactionStrategy for NoopStrategy {
        async fn compact(&self, _ctx: &ExecutionContext) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }
}
