use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::Message;

/// Per-worker messaging endpoint: one in-progress outbound message per peer
/// coordinator plus the lock-free in/out queues the transport moves whole
/// messages through. Flushing releases a populated batch and immediately
/// allocates its replacement, so the hot path never allocates per piece.
pub struct Mailbox {
    pub coordinator_id: usize,
    pub worker_id: usize,
    pub messages: Vec<Message>,
    pub in_queue: Arc<SegQueue<Message>>,
    pub out_queue: Arc<SegQueue<Message>>,
}

impl Mailbox {
    pub fn new(
        coordinator_id: usize,
        worker_id: usize,
        coordinator_num: usize,
        in_queue: Arc<SegQueue<Message>>,
        out_queue: Arc<SegQueue<Message>>,
    ) -> Self {
        let mut mailbox = Self {
            coordinator_id,
            worker_id,
            messages: Vec::with_capacity(coordinator_num),
            in_queue,
            out_queue,
        };
        for dest in 0..coordinator_num {
            mailbox.messages.push(mailbox.init_message(dest));
        }
        mailbox
    }

    fn init_message(&self, dest_node_id: usize) -> Message {
        let mut message = Message::new();
        message.set_source_node(self.coordinator_id);
        message.set_dest_node(dest_node_id);
        message.set_worker_id(self.worker_id);
        message
    }

    pub fn message_to(&mut self, dest_node_id: usize) -> &mut Message {
        &mut self.messages[dest_node_id]
    }

    /// Releases every populated non-self batch to the outbound queue.
    /// Returns the number of messages flushed.
    pub fn flush_messages(&mut self) -> usize {
        let mut flushed = 0;
        for i in 0..self.messages.len() {
            if i == self.coordinator_id {
                continue;
            }
            if self.messages[i].piece_count() == 0 {
                continue;
            }
            let fresh = self.init_message(i);
            let message = std::mem::replace(&mut self.messages[i], fresh);
            self.out_queue.push(message);
            flushed += 1;
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageType;

    fn mailbox(coordinator_id: usize) -> Mailbox {
        Mailbox::new(
            coordinator_id,
            0,
            3,
            Arc::new(SegQueue::new()),
            Arc::new(SegQueue::new()),
        )
    }

    #[test]
    fn flush_skips_self_and_empty_batches() {
        let mut mb = mailbox(1);
        mb.message_to(0).push_piece(MessageType::SearchRequest, 0, 0, b"x");
        mb.message_to(1).push_piece(MessageType::SearchRequest, 0, 0, b"y");
        assert_eq!(mb.flush_messages(), 1);
        let released = mb.out_queue.pop().unwrap();
        assert_eq!(released.dest_node(), 0);
        assert_eq!(released.source_node(), 1);
        // the slot was replaced with an empty batch addressed the same way
        assert_eq!(mb.messages[0].piece_count(), 0);
        assert_eq!(mb.messages[0].dest_node(), 0);
        // the self slot is never released
        assert_eq!(mb.messages[1].piece_count(), 1);
        assert!(mb.out_queue.pop().is_none());
    }
}
