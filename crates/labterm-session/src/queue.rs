//! FIFO buffer for commands entered while no session is open.

use std::collections::VecDeque;

use chrono::Utc;
use uuid::Uuid;

use crate::types::PendingCommand;

#[derive(Debug, Default, Clone)]
pub struct CommandQueue {
    items: VecDeque<PendingCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command verbatim. Returns the queued entry.
    pub fn enqueue(&mut self, text: impl Into<String>) -> PendingCommand {
        let pending = PendingCommand {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            enqueued_at: Utc::now(),
        };
        self.items.push_back(pending.clone());
        pending
    }

    /// Remove and return every queued command, oldest first.
    pub fn drain(&mut self) -> Vec<PendingCommand> {
        self.items.drain(..).collect()
    }

    /// Put commands back at the front, keeping their relative order ahead of
    /// anything queued meanwhile.
    pub fn requeue_front(&mut self, commands: Vec<PendingCommand>) {
        for pending in commands.into_iter().rev() {
            self.items.push_front(pending);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    pub fn pending(&self) -> Vec<PendingCommand> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[PendingCommand]) -> Vec<&str> {
        items.iter().map(|p| p.text.as_str()).collect()
    }

    #[test]
    fn drains_in_enqueue_order() {
        let mut q = CommandQueue::new();
        q.enqueue("c1");
        q.enqueue("c2");
        q.enqueue("c3");
        assert_eq!(q.len(), 3);
        let drained = q.drain();
        assert_eq!(texts(&drained), vec!["c1", "c2", "c3"]);
        assert!(q.is_empty());
    }

    #[test]
    fn keeps_text_verbatim() {
        let mut q = CommandQueue::new();
        let pending = q.enqueue("  show run | include hostname ");
        assert_eq!(pending.text, "  show run | include hostname ");
        assert!(!pending.id.is_empty());
    }

    #[test]
    fn requeue_front_preserves_order_ahead_of_new_items() {
        let mut q = CommandQueue::new();
        q.enqueue("c1");
        q.enqueue("c2");
        let drained = q.drain();
        q.enqueue("c3");
        q.requeue_front(drained);
        assert_eq!(texts(&q.pending()), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn clear_reports_dropped_count() {
        let mut q = CommandQueue::new();
        q.enqueue("a");
        q.enqueue("b");
        assert_eq!(q.clear(), 2);
        assert_eq!(q.clear(), 0);
    }
}
