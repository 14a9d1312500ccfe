//! Per-session event buffering.
//!
//! Provides a pure state layer that holds events until a consumer attaches,
//! separated from the registry's async loop so the buffering rules can be
//! unit tested without the actor.

use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::warn;

use super::events::QueueEvent;

/// Maximum number of events buffered before a consumer attaches (default).
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;

/// Receiving side handed to an attached consumer.
pub type EventReceiver = mpsc::UnboundedReceiver<QueueEvent>;

/// Sending side held by the queue while a consumer is attached.
pub type EventSender = mpsc::UnboundedSender<QueueEvent>;

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Delivered straight to the attached consumer.
    Delivered,
    /// Buffered at the given position (1-indexed).
    Buffered { position: usize },
    /// Buffered after dropping the oldest buffered event.
    DroppedOldest,
}

/// FIFO of session events with a consumer-ready flag.
///
/// While no consumer is ready, events are buffered. `mark_ready` drains the
/// buffer to the consumer in order, after which pushes bypass the buffer.
/// Every decision between buffering and delivering is made under `&mut self`,
/// so the owner serializes pushes against attach and detach.
pub struct EventQueue {
    /// Events waiting for a consumer, oldest first.
    buffer: VecDeque<QueueEvent>,
    /// Attached consumer, if any.
    consumer: Option<EventSender>,
    /// Whether pushes go straight to the consumer.
    ready: bool,
    /// Maximum number of buffered events.
    capacity: usize,
    /// Events dropped because the buffer was full.
    dropped: u64,
}

impl EventQueue {
    /// Creates a queue with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_QUEUE_CAPACITY)
    }

    /// Creates a queue that buffers at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            consumer: None,
            ready: false,
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Pushes an event, delivering it or buffering it.
    pub fn push(&mut self, event: QueueEvent) -> PushOutcome {
        if self.ready {
            if let Some(consumer) = &self.consumer {
                match consumer.send(event) {
                    Ok(()) => return PushOutcome::Delivered,
                    Err(mpsc::error::SendError(event)) => {
                        // Consumer went away; keep the event for the next one.
                        self.detach();
                        return self.buffer_event(event);
                    }
                }
            }
            self.ready = false;
        }
        self.buffer_event(event)
    }

    /// Attaches a consumer, delivers everything buffered in order, then
    /// switches to direct delivery.
    ///
    /// Returns the number of buffered events delivered. If the consumer is
    /// already closed the queue stays in buffering mode with nothing lost.
    pub fn mark_ready(&mut self, consumer: EventSender) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.buffer.pop_front() {
            if let Err(mpsc::error::SendError(event)) = consumer.send(event) {
                self.buffer.push_front(event);
                self.consumer = None;
                self.ready = false;
                return delivered;
            }
            delivered += 1;
        }

        self.consumer = Some(consumer);
        self.ready = true;
        delivered
    }

    /// Detaches the consumer and starts a new buffering phase.
    pub fn detach(&mut self) {
        self.consumer = None;
        self.ready = false;
    }

    /// Returns whether pushes currently go straight to a consumer.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Returns the number of buffered events.
    pub fn pending_count(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the number of events dropped on overflow.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Returns the buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn buffer_event(&mut self, event: QueueEvent) -> PushOutcome {
        if self.buffer.len() >= self.capacity {
            if let Some(oldest) = self.buffer.pop_front() {
                self.dropped += 1;
                warn!(
                    "Event buffer full ({} events), dropping oldest '{}' event",
                    self.capacity,
                    oldest.kind()
                );
            }
            self.buffer.push_back(event);
            return PushOutcome::DroppedOldest;
        }

        self.buffer.push_back(event);
        PushOutcome::Buffered {
            position: self.buffer.len(),
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
