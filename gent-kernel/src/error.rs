//! Error types for the execution kernel.

use std::fmt;

/// The key and bound of a [`Limit`](crate::limits::Limit) that was exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitExceeded {
    /// The stat key the limit was evaluated against.
    pub key: String,
    /// The configured maximum.
    pub max: u64,
    /// The value observed at the moment the limit was evaluated.
    pub current: u64,
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "limit exceeded for {}: {} > {}",
            self.key, self.current, self.max
        )
    }
}

/// Errors surfaced by the execution kernel.
///
/// Mirrors the terminal reasons an [`Executor`](crate::executor::Executor)
/// can stop with (see [`crate::executor::TerminationReason`]), plus the
/// fail-fast cases that can occur before or outside a run: a body error
/// propagated from an [`AgentLoopBody`](crate::contracts::AgentLoopBody),
/// a runaway event recursion, or a context already cancelled at call time.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// A configured limit was exceeded.
    #[error("{0}")]
    LimitExceeded(LimitExceeded),

    /// The execution was cancelled, either directly or via a parent context.
    #[error("execution cancelled")]
    Cancelled,

    /// An event subscriber was invoked while already `max_recursion_depth`
    /// events deep in the same publish chain.
    #[error("event recursion depth exceeded ({0})")]
    EventRecursionExceeded(u32),

    /// A [`Subscriber`](crate::event::Subscriber) returned an error.
    #[error("subscriber error: {0}")]
    Subscriber(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The loop body returned an error.
    #[error("loop body error: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Any other kernel failure.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl KernelError {
    /// Construct a [`KernelError::LimitExceeded`] from its parts.
    pub fn limit_exceeded(key: impl Into<String>, max: u64, current: u64) -> Self {
        KernelError::LimitExceeded(LimitExceeded {
            key: key.into(),
            max,
            current,
        })
    }
}
