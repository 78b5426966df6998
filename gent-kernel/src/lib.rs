//! # gent-kernel — the execution kernel for LLM agent loops
//!
//! This crate is the plumbing that makes a think-act-observe agent
//! loop reliable and observable. It is framework-agnostic about *what*
//! the agent does (ReAct, plan-and-execute, a custom graph) and
//! concerns itself only with four tightly coupled subsystems:
//!
//! | Subsystem | Module | What it does |
//! |-----------|--------|--------------|
//! | Execution context | [`context`] | Hierarchical, thread-safe ambient state: cancellation, stats, events, streaming, result |
//! | Hierarchical stats | [`stats`], [`limits`] | Propagating counters + local gauges, with automatic limit enforcement |
//! | Unified events | [`event`] | One publish/subscribe channel for lifecycle, model, tool, parse, validator, and limit events |
//! | Streaming hub | [`stream`], [`buffer`] | Non-blocking fan-in of model output chunks across the context tree |
//!
//! An [`Executor`](executor::Executor) drives a user-supplied
//! [`AgentLoopBody`](contracts::AgentLoopBody) through repeated
//! iterations against an [`ExecutionContext`](context::ExecutionContext)
//! until it produces an answer, an error, a cancellation, a compaction
//! failure, or a configured limit is exceeded.
//!
//! ## What this crate does not do
//!
//! Prompt templates, the ReAct loop body itself, tool parsers, text
//! format codecs, LLM HTTP wrappers, schema validation, and CLI/demo
//! programs are all external collaborators. The kernel specifies only
//! the contracts it consumes from them — see [`contracts`].
//!
//! ## Dependency notes
//!
//! Event payloads (`request`, `response`, `args`, `output`) are
//! `serde_json::Value` rather than generic types: the kernel never
//! inspects their shape, and JSON keeps them trivially loggable and
//! diffable without a generic parameter infecting every event type.

#![deny(missing_docs)]

pub mod buffer;
pub mod compaction;
pub mod content;
pub mod context;
pub mod contracts;
pub mod duration;
pub mod error;
pub mod event;
pub mod executor;
pub mod limits;
pub mod stats;
pub mod stream;
pub mod subscribers;

pub use content::ContentPart;
pub use context::{ExecutionContext, ExecutionResult};
pub use duration::TimestampMs;
pub use error::{KernelError, LimitExceeded};
pub use event::{Event, EventBase, EventPublisher, EventPublisherConfig, Subscriber};
pub use executor::{Executor, ExecutorConfig, TerminationReason};
pub use limits::{Limit, LimitKind};
pub use stats::ExecutionStats;
pub use stream::{StreamChunk, StreamHub, SubscriptionHandle};
