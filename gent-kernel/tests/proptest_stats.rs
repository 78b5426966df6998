//! Property-based tests: counter propagation invariants.

use std::sync::Arc;

use proptest::prelude::*;

use gent_kernel::context::ExecutionContext;
use gent_kernel::contracts::LoopData;

#[derive(Default)]
struct NoopData;

impl LoopData for NoopData {
    fn task(&self) -> &serde_json::Value {
        static TASK: serde_json::Value = serde_json::Value::Null;
        &TASK
    }
    fn iteration_history(&self) -> &[gent_kernel::contracts::IterationRecord] {
        &[]
    }
    fn add_iteration_history(&mut self, _iteration: gent_kernel::contracts::IterationRecord) {}
    fn scratchpad(&self) -> &[gent_kernel::contracts::IterationRecord] {
        &[]
    }
    fn set_scratchpad(&mut self, _iterations: Vec<gent_kernel::contracts::IterationRecord>) {}
    fn set_execution_context(&mut self, _ctx: std::sync::Weak<ExecutionContext>) {}
}

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

proptest! {
    #[test]
    fn root_counter_equals_sum_of_descendant_mutations(
        deltas in proptest::collection::vec(1_i64..20, 1..15),
    ) {
        rt().block_on(async {
            let root = ExecutionContext::new_root(None, "root", Box::new(NoopData));
            let child = root.spawn_child("child", Box::new(NoopData)).await;
            let grandchild = child.spawn_child("grandchild", Box::new(NoopData)).await;

            let mut expected_total = 0_i64;
            for (i, delta) in deltas.iter().enumerate() {
                let owner = match i % 3 {
                    0 => &root,
                    1 => &child,
                    _ => &grandchild,
                };
                owner.stats().increment_counter("gent:custom", *delta).await;
                expected_total += delta;
            }

            prop_assert_eq!(root.stats().get_counter("gent:custom"), Some(expected_total));
            Ok(())
        })?;
    }

    #[test]
    fn limit_with_zero_max_fires_on_first_increment(delta in 1_i64..50) {
        rt().block_on(async {
            let root = ExecutionContext::new_root(None, "root", Box::new(NoopData));
            root.set_limits(vec![gent_kernel::limits::Limit::exact("gent:custom", 0)]);
            root.stats().increment_counter("gent:custom", delta).await;
            prop_assert!(root.exceeded_limit().is_some());
            Ok(())
        })?;
    }
}

#[test]
fn exceeded_limit_is_immutable_once_set() {
    let rt = rt();
    rt.block_on(async {
        let root = ExecutionContext::new_root(None, "root", Box::new(NoopData));
        root.set_limits(vec![gent_kernel::limits::Limit::exact("gent:custom", 1)]);
        root.stats().increment_counter("gent:custom", 5).await;
        let first = root.exceeded_limit().unwrap();
        root.stats().increment_counter("gent:custom", 5).await;
        let second = root.exceeded_limit().unwrap();
        assert_eq!(first, second);
    });
}
