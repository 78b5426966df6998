//! Per-context stream hub (C2): fan-out of model output chunks to
//! subscribers filtered by stream id, topic id, or all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::buffer::UnboundedBuffer;

/// A fragment of model output, with enough metadata to place it in the
/// context tree it came from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamChunk {
    /// Content delta (may be empty, e.g. for an error-only chunk).
    pub content: String,
    /// Reasoning/thinking delta, if the model surfaces one.
    pub reasoning_content: Option<String>,
    /// Set if the underlying provider call failed mid-stream.
    pub error: Option<String>,
    /// Slash-joined `name/iteration` for the emitting context and every
    /// ancestor, e.g. `main/2/research/1`. Filled in by
    /// [`ExecutionContext::emit_chunk`](crate::context::ExecutionContext::emit_chunk)
    /// if left empty.
    pub source_path: String,
    /// Identifies a logical stream within a context (e.g. per-model-call).
    pub stream_id: Option<String>,
    /// Identifies a logical topic cutting across streams.
    pub topic_id: Option<String>,
}

#[derive(Debug, Clone)]
enum Scope {
    All,
    Stream(String),
    Topic(String),
}

struct Subscription {
    scope: Scope,
    buffer: UnboundedBuffer<StreamChunk>,
}

/// A handle returned from subscribing. Dropping it does not
/// unsubscribe — call [`unsubscribe`](SubscriptionHandle::unsubscribe)
/// explicitly, mirroring the receive channel's independent lifetime.
pub struct SubscriptionHandle {
    id: u64,
    hub: std::sync::Weak<StreamHubInner>,
}

impl SubscriptionHandle {
    /// Stop delivery to this subscription and remove it from the hub's
    /// indices. Idempotent: a second call is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(hub) = self.hub.upgrade() {
            let mut subs = hub.subscriptions.lock().unwrap();
            if let Some(sub) = subs.remove(&self.id) {
                sub.buffer.close();
            }
        }
    }
}

struct StreamHubInner {
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Per-context registry of stream subscriptions, and the fan-out point
/// for emitted chunks.
pub struct StreamHub {
    inner: std::sync::Arc<StreamHubInner>,
}

impl StreamHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        StreamHub {
            inner: std::sync::Arc::new(StreamHubInner {
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn subscribe(&self, scope: Scope) -> (mpsc::UnboundedReceiver<StreamChunk>, SubscriptionHandle) {
        let (buffer, rx) = UnboundedBuffer::new();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if self.inner.closed.load(Ordering::Acquire) {
            buffer.close();
        } else {
            self.inner
                .subscriptions
                .lock()
                .unwrap()
                .insert(id, Subscription { scope, buffer });
        }
        (
            rx,
            SubscriptionHandle {
                id,
                hub: std::sync::Arc::downgrade(&self.inner),
            },
        )
    }

    /// Subscribe to every chunk emitted through this hub.
    pub fn subscribe_all(&self) -> (mpsc::UnboundedReceiver<StreamChunk>, SubscriptionHandle) {
        self.subscribe(Scope::All)
    }

    /// Subscribe to chunks carrying the given stream id. An empty id
    /// returns a subscription that never matches anything.
    pub fn subscribe_to_stream(
        &self,
        stream_id: impl Into<String>,
    ) -> (mpsc::UnboundedReceiver<StreamChunk>, SubscriptionHandle) {
        let stream_id = stream_id.into();
        if stream_id.is_empty() {
            return self.subscribe(Scope::Stream(String::new()));
        }
        self.subscribe(Scope::Stream(stream_id))
    }

    /// Subscribe to chunks carrying the given topic id. An empty id
    /// returns a subscription that never matches anything.
    pub fn subscribe_to_topic(
        &self,
        topic_id: impl Into<String>,
    ) -> (mpsc::UnboundedReceiver<StreamChunk>, SubscriptionHandle) {
        let topic_id = topic_id.into();
        if topic_id.is_empty() {
            return self.subscribe(Scope::Topic(String::new()));
        }
        self.subscribe(Scope::Topic(topic_id))
    }

    /// Fan the chunk out to every matching local subscription. Never
    /// blocks, and does nothing once the hub is closed.
    pub fn emit(&self, chunk: StreamChunk) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let subs = self.inner.subscriptions.lock().unwrap();
        for sub in subs.values() {
            let matches = match &sub.scope {
                Scope::All => true,
                Scope::Stream(id) => {
                    !id.is_empty() && chunk.stream_id.as_deref() == Some(id.as_str())
                }
                Scope::Topic(id) => {
                    !id.is_empty() && chunk.topic_id.as_deref() == Some(id.as_str())
                }
            };
            if matches {
                sub.buffer.send(chunk.clone());
            }
        }
    }

    /// Close the hub: every subscription's buffer is closed and the
    /// index is cleared. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut subs = self.inner.subscriptions.lock().unwrap();
        for sub in subs.values() {
            sub.buffer.close();
        }
        subs.clear();
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}
