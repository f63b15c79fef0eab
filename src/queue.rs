use crate::protocol::{MessageId, Payload};
use heapless::spsc::Queue;
use static_assertions::const_assert;

/// Number of ring slots. One slot is kept free to tell full from empty, so
/// at most `QUEUE_SIZE - 1` entries are outstanding.
pub const QUEUE_SIZE: usize = 32;

const_assert!(QUEUE_SIZE > 1);

/// Index into the engine's read-slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadTicket(pub(crate) u8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: MessageId,
    pub payload: Payload,
    pub ticket: Option<ReadTicket>,
}

impl QueueEntry {
    /// A plain command or write.
    pub fn new(id: MessageId, payload: Payload) -> Self {
        Self { id, payload, ticket: None }
    }

    /// A zero-length request whose reply belongs to `ticket`.
    pub fn read(id: MessageId, ticket: ReadTicket) -> Self {
        Self {
            id,
            payload: Payload::new(),
            ticket: Some(ticket),
        }
    }

    /// A zero-length entry with a ticket is a parameter read request.
    pub fn is_read(&self) -> bool {
        self.ticket.is_some() && self.payload.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("message queue full")]
pub struct QueueFull;

/// Outbound command ring.
///
/// The head stays in place while it is being transmitted and is only removed
/// by [`MessageQueue::retire`] once its life cycle (sent and acknowledged, or
/// timed out) is over.
#[derive(Debug)]
pub struct MessageQueue {
    entries: Queue<QueueEntry, QUEUE_SIZE>,
    total_enqueued: u32,
    total_retired: u32,
    total_rejected: u32,
}

impl MessageQueue {
    /// An empty ring with all counters at zero.
    pub fn new() -> Self {
        Self {
            entries: Queue::new(),
            total_enqueued: 0,
            total_retired: 0,
            total_rejected: 0,
        }
    }

    /// Append `entry` at the tail. A full ring rejects the new entry and
    /// leaves every queued one untouched.
    pub fn push(&mut self, entry: QueueEntry) -> Result<(), QueueFull> {
        match self.entries.enqueue(entry) {
            Ok(()) => {
                self.total_enqueued = self.total_enqueued.wrapping_add(1);
                Ok(())
            }
            Err(_) => {
                self.total_rejected = self.total_rejected.wrapping_add(1);
                Err(QueueFull)
            }
        }
    }

    /// The oldest entry; while a command is in flight this is that command.
    pub fn head(&self) -> Option<&QueueEntry> {
        self.entries.peek()
    }

    /// Remove the head entry, ending its life cycle.
    pub fn retire(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.dequeue();
        if entry.is_some() {
            self.total_retired = self.total_retired.wrapping_add(1);
        }
        entry
    }

    /// Entries outstanding, the in-flight head included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the next [`MessageQueue::push`] would be rejected.
    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    /// Usable slots, `QUEUE_SIZE - 1`.
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Walk the entries from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Lifetime counters plus the current fill level.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.total_enqueued,
            retired: self.total_retired,
            rejected: self.total_rejected,
            pending: self.len() as u8,
        }
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters reported through [`crate::EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueueStats {
    pub enqueued: u32,
    pub retired: u32,
    pub rejected: u32,
    pub pending: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::api;

    fn entry(device: u8) -> QueueEntry {
        QueueEntry::new(api::VOLT_EN.with_device(device), Payload::new())
    }

    #[test]
    fn test_capacity_keeps_one_slot_free() {
        let mut queue = MessageQueue::new();
        assert_eq!(queue.capacity(), QUEUE_SIZE - 1);

        for i in 0..(QUEUE_SIZE - 1) {
            assert!(queue.push(entry((i % 63) as u8 + 1)).is_ok());
        }
        assert!(queue.is_full());
        assert_eq!(queue.push(entry(1)), Err(QueueFull));
        assert_eq!(queue.stats().rejected, 1);
    }

    #[test]
    fn test_head_stays_until_retired() {
        let mut queue = MessageQueue::new();
        queue.push(entry(1)).unwrap();
        queue.push(entry(2)).unwrap();

        assert_eq!(queue.head().unwrap().id.device(), 1);
        assert_eq!(queue.head().unwrap().id.device(), 1);

        let retired = queue.retire().unwrap();
        assert_eq!(retired.id.device(), 1);
        assert_eq!(queue.head().unwrap().id.device(), 2);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let mut queue = MessageQueue::new();
        for round in 0..3u8 {
            for i in 0..20u8 {
                queue.push(entry(i + 1)).unwrap();
            }
            for i in 0..20u8 {
                assert_eq!(queue.retire().unwrap().id.device(), i + 1, "round {}", round);
            }
        }
        assert!(queue.is_empty());
        assert_eq!(queue.stats().retired, 60);
    }

    #[test]
    fn test_full_queue_never_overwrites() {
        let mut queue = MessageQueue::new();
        for i in 0..(QUEUE_SIZE - 1) {
            queue.push(entry(i as u8 + 1)).unwrap();
        }
        let _ = queue.push(entry(63));
        assert_eq!(queue.head().unwrap().id.device(), 1);
        assert!(queue.iter().all(|e| e.id.device() != 63));
    }

    #[test]
    fn test_read_entries() {
        let read = QueueEntry::read(api::SPD_PC.with_device(3), ReadTicket(4));
        assert!(read.is_read());
        assert!(!entry(3).is_read());
    }
}
