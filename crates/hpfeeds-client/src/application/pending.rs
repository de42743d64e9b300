//! Queue of operations issued before the session reached `Ready`.
//!
//! Subscribing, unsubscribing and publishing are fire-and-forget.  A caller
//! may issue them right after constructing a session, long before the broker
//! has sent INFO.  [`PendingOperations`] keeps them in issue order and hands
//! them back exactly once, when the session drains it after AUTH.

use std::collections::VecDeque;

use bytes::Bytes;
use hpfeeds_core::protocol::Frame;

/// A client request that becomes one frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, payload: Bytes },
}

impl Operation {
    /// Builds the frame for this operation as sent by `ident`.
    pub fn into_frame(self, ident: &str) -> Frame {
        let ident = ident.to_string();
        match self {
            Self::Subscribe { channel } => Frame::Subscribe { ident, channel },
            Self::Unsubscribe { channel } => Frame::Unsubscribe { ident, channel },
            Self::Publish { channel, payload } => Frame::Publish {
                ident,
                channel,
                payload,
            },
        }
    }
}

/// FIFO of operations waiting for the session to become ready.
#[derive(Debug, Default)]
pub struct PendingOperations {
    queue: VecDeque<Operation>,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Operation) {
        self.queue.push_back(op);
    }

    /// Removes and returns every queued operation, oldest first.
    pub fn drain(&mut self) -> Vec<Operation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(channel: &str) -> Operation {
        Operation::Subscribe {
            channel: channel.to_string(),
        }
    }

    #[test]
    fn test_drain_returns_operations_in_issue_order() {
        // Arrange
        let mut pending = PendingOperations::new();
        pending.push(sub("a"));
        pending.push(Operation::Publish {
            channel: "a".to_string(),
            payload: Bytes::from_static(b"1"),
        });
        pending.push(Operation::Unsubscribe {
            channel: "a".to_string(),
        });

        // Act
        let drained = pending.drain();

        // Assert
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], sub("a"));
        assert!(matches!(drained[1], Operation::Publish { .. }));
        assert!(matches!(drained[2], Operation::Unsubscribe { .. }));
    }

    #[test]
    fn test_drain_empties_the_queue() {
        let mut pending = PendingOperations::new();
        pending.push(sub("a"));
        pending.drain();
        assert!(pending.is_empty());
        assert!(pending.drain().is_empty(), "operations are replayed only once");
    }

    #[test]
    fn test_into_frame_stamps_session_ident() {
        let frame = Operation::Publish {
            channel: "test-chan".to_string(),
            payload: Bytes::from_static(b"test message"),
        }
        .into_frame("test");

        assert_eq!(
            frame,
            Frame::Publish {
                ident: "test".to_string(),
                channel: "test-chan".to_string(),
                payload: Bytes::from_static(b"test message"),
            }
        );
    }

    #[test]
    fn test_subscribe_and_unsubscribe_map_to_matching_opcodes() {
        assert!(matches!(sub("c").into_frame("i"), Frame::Subscribe { .. }));
        let unsub = Operation::Unsubscribe {
            channel: "c".to_string(),
        };
        assert!(matches!(unsub.into_frame("i"), Frame::Unsubscribe { .. }));
    }
}
