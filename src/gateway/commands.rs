//! Outbound command frames and the queue that serializes them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// An outbound `{op, d}` envelope.
///
/// The transport layer does not interpret op codes; payloads are opaque JSON
/// provided by higher-level event logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    /// Gateway op code
    pub op: u8,
    /// Command payload
    #[serde(rename = "d")]
    pub payload: Value,
}

impl CommandFrame {
    /// Build a command envelope
    #[must_use]
    pub fn new(op: u8, payload: Value) -> Self {
        Self { op, payload }
    }
}

/// FIFO buffer for commands submitted while the transport is not ready.
///
/// Commands sent while disconnected (or mid-reconnect) are held in order and
/// flushed as one batch on the transition to connected; the buffer survives
/// reconnects and is dropped only on shutdown.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    frames: VecDeque<CommandFrame>,
}

impl CommandQueue {
    pub(crate) fn enqueue(&mut self, frame: CommandFrame) {
        log::debug!("Queued gateway command op {} ({} queued)", frame.op, self.frames.len() + 1);
        self.frames.push_back(frame);
    }

    /// Put a frame back at the head, preserving order after a failed send
    pub(crate) fn requeue_front(&mut self, frame: CommandFrame) {
        self.frames.push_front(frame);
    }

    pub(crate) fn dequeue(&mut self) -> Option<CommandFrame> {
        self.frames.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_serialization() {
        let frame = CommandFrame::new(2, json!({"token": "t"}));
        let text = serde_json::to_string(&frame).unwrap();
        assert_eq!(text, r#"{"op":2,"d":{"token":"t"}}"#);
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut queue = CommandQueue::default();
        queue.enqueue(CommandFrame::new(1, json!(1)));
        queue.enqueue(CommandFrame::new(2, json!(2)));
        queue.requeue_front(CommandFrame::new(0, json!(0)));

        let ops: Vec<u8> = std::iter::from_fn(|| queue.dequeue()).map(|f| f.op).collect();
        assert_eq!(ops, vec![0, 1, 2]);
    }

    #[test]
    fn test_queue_clear() {
        let mut queue = CommandQueue::default();
        queue.enqueue(CommandFrame::new(1, json!(null)));
        queue.clear();
        assert_eq!(queue.len(), 0);
    }
}
