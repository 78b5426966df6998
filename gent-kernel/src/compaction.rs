//! Compaction trigger/strategy contracts (C8).
//!
//! The kernel only orchestrates compaction; it does not implement a
//! strategy. Concrete triggers (token-budget-based, turn-count-based)
//! and strategies (sliding window, summarization) are external
//! collaborators.

use async_trait::async_trait;

use crate::context::ExecutionContext;

/// Decides whether compaction should run before an iteration.
#[async_trait]
pub trait CompactionTrigger: Send + Sync {
    /// Whether compaction should run before the upcoming iteration.
    async fn should_compact(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>>;

    /// Called after a successful compaction so delta-based triggers
    /// can snapshot their baseline.
    async fn notify_compacted(&self, ctx: &ExecutionContext);
}

/// Performs compaction: reads the scratchpad via the loop-data
/// interface, computes a replacement, and writes it back, publishing a
/// diff event through the context.
#[async_trait]
pub trait CompactionStrategy: Send + Sync {
    /// Compact the context's scratchpad in place.
    async fn compact(&self, ctx: &ExecutionContext) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A configured trigger/strategy pair. Half-configuring compaction
/// (one set without the other) is always a bug — see
/// [`Executor::set_compaction`](crate::executor::Executor::set_compaction).
pub(crate) struct CompactionPipeline {
    pub(crate) trigger: std::sync::Arc<dyn CompactionTrigger>,
    pub(crate) strategy: std::sync::Arc<dyn CompactionStrategy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn contracts_are_object_safe() {
        _assert_send_sync::<std::sync::Arc<dyn CompactionTrigger>>();
        _assert_send_sync::<std::sync::Arc<dyn CompactionStrategy>>();
    }
}
