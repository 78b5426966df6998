//! Non-blocking single-producer/single-consumer buffer (C1).
//!
//! `Send` never blocks the caller. Memory is the consumer's
//! responsibility: a subscriber that never drains its receiver grows
//! the buffer without bound. This is deliberate — LLM streams must
//! never stall on a slow reader.

use std::sync::Mutex;

use tokio::sync::mpsc;

/// An unbounded, closeable channel.
///
/// Wraps [`mpsc::UnboundedSender`] to add idempotent, explicit closing:
/// after [`UnboundedBuffer::close`], further sends are silent no-ops
/// rather than errors. Dropping the sender lets the receiver drain
/// whatever was already queued before observing the channel as closed,
/// which is what gives `close` its "drain then close" behavior for
/// free.
pub struct UnboundedBuffer<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

impl<T> UnboundedBuffer<T> {
    /// Create a buffer and its matching receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            UnboundedBuffer {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Queue an item. Never blocks. A no-op once closed.
    pub fn send(&self, item: T) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            // The receiver may already be gone (consumer dropped); that's
            // the consumer's problem, not the producer's — same "never
            // block, never fail loudly" contract as a live send.
            let _ = tx.send(item);
        }
    }

    /// Close the buffer. Idempotent. Items already queued are still
    /// delivered to the receiver; it observes the end of stream only
    /// after draining them.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }

    /// Whether this buffer has been closed.
    pub fn is_closed(&self) -> bool {
        self.sender.lock().unwrap().is_none()
    }
}
