//! Hierarchical execution statistics (C3): counters propagate
//! increments to the parent context in real time; gauges stay local.
//! Every mutation triggers a limit check on the owning context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::context::ExecutionContext;
use crate::limits::ITERATIONS_KEY;

/// Per-context counters and gauges, linked into the context tree for
/// propagation (counters) and limit evaluation (both).
pub struct ExecutionStats {
    counters: Mutex<HashMap<String, i64>>,
    gauges: Mutex<HashMap<String, f64>>,
    owner: Weak<ExecutionContext>,
    parent: Option<Arc<ExecutionStats>>,
}

impl ExecutionStats {
    /// Construct stats for a context. `owner` is a back-reference used
    /// only to trigger limit checks; `parent` links this context's
    /// counters into its ancestor's for propagation.
    pub(crate) fn new(owner: Weak<ExecutionContext>, parent: Option<Arc<ExecutionStats>>) -> Self {
        ExecutionStats {
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            owner,
            parent,
        }
    }

    /// Add `delta` to a counter, propagating the same delta to every
    /// ancestor's stats. The `gent:iterations` key is protected: this
    /// call is a silent no-op for it (only
    /// [`ExecutionContext::publish_before_iteration`](crate::context::ExecutionContext::publish_before_iteration)
    /// may mutate it).
    pub async fn increment_counter(&self, key: &str, delta: i64) {
        if key == ITERATIONS_KEY {
            return;
        }
        self.increment_counter_internal(key, delta).await;
    }

    /// Like [`increment_counter`](Self::increment_counter) but bypasses
    /// the reserved-key guard. Used internally for the iteration
    /// counter itself.
    pub(crate) fn increment_counter_internal<'a>(
        &'a self,
        key: &'a str,
        delta: i64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            {
                let mut counters = self.counters.lock().unwrap();
                *counters.entry(key.to_string()).or_insert(0) += delta;
            }
            if let Some(owner) = self.owner.upgrade() {
                owner.check_limits().await;
            }
            if let Some(parent) = &self.parent {
                parent.increment_counter_internal(key, delta).await;
            }
        })
    }

    /// Overwrite a counter's value. Does not propagate to ancestors.
    pub async fn set_counter(&self, key: &str, value: i64) {
        if key == ITERATIONS_KEY {
            return;
        }
        {
            let mut counters = self.counters.lock().unwrap();
            counters.insert(key.to_string(), value);
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.check_limits().await;
        }
    }

    /// Add `delta` to a gauge. Gauges never propagate.
    pub async fn increment_gauge(&self, key: &str, delta: f64) {
        {
            let mut gauges = self.gauges.lock().unwrap();
            *gauges.entry(key.to_string()).or_insert(0.0) += delta;
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.check_limits().await;
        }
    }

    /// Overwrite a gauge's value. Never propagates.
    pub async fn set_gauge(&self, key: &str, value: f64) {
        {
            let mut gauges = self.gauges.lock().unwrap();
            gauges.insert(key.to_string(), value);
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.check_limits().await;
        }
    }

    /// Reset a gauge to zero, e.g. a consecutive-error gauge on the
    /// first success after a run of failures.
    pub async fn reset_gauge(&self, key: &str) {
        self.set_gauge(key, 0.0).await;
    }

    /// Read a counter's current value.
    pub fn get_counter(&self, key: &str) -> Option<i64> {
        self.counters.lock().unwrap().get(key).copied()
    }

    /// Read a gauge's current value.
    pub fn get_gauge(&self, key: &str) -> Option<f64> {
        self.gauges.lock().unwrap().get(key).copied()
    }

    /// A point-in-time copy of all counters, for limit evaluation.
    pub(crate) fn snapshot_counters(&self) -> HashMap<String, i64> {
        self.counters.lock().unwrap().clone()
    }

    /// A point-in-time copy of all gauges, for limit evaluation.
    pub(crate) fn snapshot_gauges(&self) -> HashMap<String, f64> {
        self.gauges.lock().unwrap().clone()
    }
}
