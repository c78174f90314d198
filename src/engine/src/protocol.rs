use message::{Mailbox, Message, MessagePiece, MessageType};
use storage::{Database, Table};

use crate::replication;
use crate::tid;
use crate::transaction::Transaction;

/// Handler for one inbound piece. Responses are written into the batch
/// addressed back at the piece's source node; handlers that resolve a
/// pending response update the in-flight transaction through the
/// `key_offset` carried on the wire.
pub type MessageHandler =
    fn(&MessagePiece<'_>, &mut Message, &Database, Option<&mut Transaction>);

/// The commit-protocol seam between the executor and a concrete protocol.
/// The executor injects the messaging context into every primitive instead
/// of binding closures into the transaction.
pub trait Protocol: Send + 'static {
    /// Resolves one read-set entry: local search, or a remote search
    /// message plus a pending response.
    fn read_request(&mut self, txn: &mut Transaction, key_offset: usize, mailbox: &mut Mailbox);

    fn commit(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox) -> bool;

    fn abort(&mut self, txn: &mut Transaction, mailbox: &mut Mailbox);

    fn handlers(&self) -> &'static [MessageHandler];
}

/// Consistent optimistic read of one record: the metadata word is sampled
/// around the value copy and the copy retried until both samples agree and
/// the record is unlocked.
pub fn search_record(table: &dyn Table, key: u64) -> Option<(u64, String)> {
    let row = table.search(key)?;
    loop {
        let before = row.tid.load(std::sync::atomic::Ordering::Acquire);
        if tid::is_locked(before) {
            std::hint::spin_loop();
            continue;
        }
        let value = row.value.read().clone();
        let after = row.tid.load(std::sync::atomic::Ordering::Acquire);
        if before == after {
            return Some((before, value));
        }
    }
}

/// Drains the inbound queue, dispatching each piece through the protocol's
/// handler table. The operation-replication control tag bypasses the table.
/// Returns the number of pieces processed.
pub fn process_inbound(
    db: &Database,
    handlers: &[MessageHandler],
    mailbox: &mut Mailbox,
    mut txn: Option<&mut Transaction>,
) -> usize {
    let mut size = 0;
    while let Some(message) = mailbox.in_queue.pop() {
        let source = message.source_node();
        for piece in message.iter() {
            if piece.msg_type == MessageType::OperationReplication {
                replication::operation_replication_handler(&piece, db);
                continue;
            }
            let handler = handlers[piece.msg_type as usize];
            handler(&piece, mailbox.message_to(source), db, txn.as_deref_mut());
        }
        size += message.piece_count();
        mailbox.flush_messages();
    }
    size
}

/// Flushes the outbound batches and, when asked to, pumps the inbound queue
/// until every pending response has arrived. The pump keeps serving peer
/// requests, so no worker ever blocks the cluster while it waits.
pub fn sync_messages(
    db: &Database,
    handlers: &[MessageHandler],
    mailbox: &mut Mailbox,
    txn: &mut Transaction,
    wait_response: bool,
) {
    mailbox.flush_messages();
    if wait_response {
        while txn.pending_responses > 0 {
            process_inbound(db, handlers, mailbox, Some(&mut *txn));
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemTable;

    #[test]
    fn search_record_returns_word_and_value() {
        let mut table = MemTable::new(0, 0, 2);
        table.insert(7, "ab".to_string());
        let metadata = Table::search_metadata(&table, 7).unwrap();
        tid::lock(metadata);
        tid::unlock_with_commit(metadata, 3);
        let (word, value) = search_record(&table, 7).unwrap();
        assert_eq!(tid::get_wts(word), 3);
        assert_eq!(value, "ab");
        assert!(search_record(&table, 8).is_none());
    }
}
