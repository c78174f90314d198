use bytes::{Buf, BufMut};
use engine::protocol::MessageHandler;
use engine::tid;
use engine::transaction::Transaction;
use message::{factory, Message, MessagePiece, MessageType, N_MESSAGE_TYPES};
use storage::Database;

/// Indexed by `MessageType`. 2PL acquires locks at access time, so a lock
/// response doubles as the read response: it carries the value read under
/// the freshly taken lock. Search and validation tags are never on the wire.
pub static HANDLERS: [MessageHandler; N_MESSAGE_TYPES] = [
    unexpected_message_handler,
    unexpected_message_handler,
    lock_request_handler,
    lock_response_handler,
    unexpected_message_handler,
    unexpected_message_handler,
    abort_request_handler,
    write_request_handler,
    write_response_handler,
    replicate_request_handler,
    replicate_response_handler,
    release_lock_request_handler,
    unexpected_message_handler,
];

// lock response with the value at the tail
fn new_read_lock_response_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
    key_offset: u32,
    latest_tid: u64,
    success: bool,
    value: &str,
) -> usize {
    let mut payload = Vec::with_capacity(13 + value.len());
    payload.put_u32_le(key_offset);
    payload.put_u64_le(latest_tid);
    payload.put_u8(success as u8);
    payload.put_slice(value.as_bytes());
    message.push_piece(MessageType::LockResponse, table_id, partition_id, &payload)
}

fn parse_read_lock_response(mut payload: &[u8]) -> (u32, u64, bool, String) {
    let key_offset = payload.get_u32_le();
    let latest_tid = payload.get_u64_le();
    let success = payload.get_u8() != 0;
    (
        key_offset,
        latest_tid,
        success,
        String::from_utf8_lossy(payload).into_owned(),
    )
}

fn lock_request_handler(
    piece: &MessagePiece<'_>,
    response: &mut Message,
    db: &Database,
    _txn: Option<&mut Transaction>,
) {
    let (key, key_offset) = factory::parse_lock_request(piece.payload);
    let table = db.find_table(piece.table_id, piece.partition_id);
    let metadata = table.search_metadata(key).expect("lock of a missing row");
    let (latest_tid, success) = tid::lock(metadata);
    let value = if success {
        table.search_value(key).expect("row vanished under its lock")
    } else {
        String::new()
    };
    new_read_lock_response_message(
        response,
        piece.table_id,
        piece.partition_id,
        key_offset,
        latest_tid,
        success,
        &value,
    );
}

fn lock_response_handler(
    piece: &MessagePiece<'_>,
    _response: &mut Message,
    _db: &Database,
    txn: Option<&mut Transaction>,
) {
    let txn = txn.expect("lock response without an in-flight transaction");
    let (key_offset, latest_tid, success, value) = parse_read_lock_response(piece.payload);
    if success {
        let read_key = &mut txn.read_set[key_offset as usize];
        read_key.set_write_lock_bit();
        read_key.tid = latest_tid;
        read_key.value = value;
        read_key.set_execution_processed_bit();
    } else {
        txn.abort_lock = true;
    }
    txn.pending_responses -= 1;
}

fn abort_request_handler(
    piece: &MessagePiece<'_>,
    _response: &mut Message,
    db: &Database,
    _txn: Option<&mut Transaction>,
) {
    let key = factory::parse_abort_request(piece.payload);
    let table = db.find_table(piece.table_id, piece.partition_id);
    let metadata = table.search_metadata(key).expect("abort of a missing row");
    tid::unlock(metadata);
}

fn write_request_handler(
    piece: &MessagePiece<'_>,
    response: &mut Message,
    db: &Database,
    _txn: Option<&mut Transaction>,
) {
    let (key, value) = factory::parse_write_request(piece.payload);
    let table = db.find_table(piece.table_id, piece.partition_id);
    // the requester took the lock at access time
    table.update(key, value);
    factory::new_write_response_message(response, piece.table_id, piece.partition_id);
}

fn write_response_handler(
    _piece: &MessagePiece<'_>,
    _response: &mut Message,
    _db: &Database,
    txn: Option<&mut Transaction>,
) {
    let txn = txn.expect("write response without an in-flight transaction");
    txn.pending_responses -= 1;
}

fn replicate_request_handler(
    piece: &MessagePiece<'_>,
    response: &mut Message,
    db: &Database,
    _txn: Option<&mut Transaction>,
) {
    let (key, commit_wts, value) = factory::parse_replication_request(piece.payload);
    let table = db.find_table(piece.table_id, piece.partition_id);
    let metadata = table
        .search_metadata(key)
        .expect("replication of a missing row");
    let last_tid = tid::lock_wait(metadata);
    if tid::get_wts(last_tid) < commit_wts {
        table.update(key, value);
        tid::unlock_with_commit(metadata, commit_wts);
    } else {
        tid::unlock(metadata);
    }
    factory::new_replication_response_message(response, piece.table_id, piece.partition_id);
}

fn replicate_response_handler(
    _piece: &MessagePiece<'_>,
    _response: &mut Message,
    _db: &Database,
    txn: Option<&mut Transaction>,
) {
    let txn = txn.expect("replication response without an in-flight transaction");
    txn.pending_responses -= 1;
}

fn release_lock_request_handler(
    piece: &MessagePiece<'_>,
    _response: &mut Message,
    db: &Database,
    _txn: Option<&mut Transaction>,
) {
    let (key, commit_wts, stamp_commit) = factory::parse_release_lock_request(piece.payload);
    let table = db.find_table(piece.table_id, piece.partition_id);
    let metadata = table
        .search_metadata(key)
        .expect("release of a missing row");
    if stamp_commit {
        tid::unlock_with_commit(metadata, commit_wts);
    } else {
        tid::unlock(metadata);
    }
}

fn unexpected_message_handler(
    piece: &MessagePiece<'_>,
    _response: &mut Message,
    _db: &Database,
    _txn: Option<&mut Transaction>,
) {
    unreachable!("unexpected message type {:?}", piece.msg_type);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storage::MemTable;

    fn one_row_db() -> Database {
        let mut table = MemTable::new(0, 0, 2);
        table.insert(1, "v1".to_string());
        let mut db = Database::new();
        db.add_table(vec![Arc::new(table)]);
        db
    }

    #[test]
    fn remote_lock_carries_the_value() {
        let db = one_row_db();
        let mut request = Message::new();
        factory::new_lock_message(&mut request, 0, 0, 1, 0);
        let mut response = Message::new();
        lock_request_handler(&request.iter().next().unwrap(), &mut response, &db, None);

        let mut txn = Transaction::new(0, 0, 1);
        txn.search_for_read(0, 0, 1);
        txn.pending_responses = 1;
        let mut unused = Message::new();
        lock_response_handler(
            &response.iter().next().unwrap(),
            &mut unused,
            &db,
            Some(&mut txn),
        );
        assert!(txn.read_set[0].get_write_lock_bit());
        assert_eq!(txn.read_set[0].value, "v1");
        assert_eq!(txn.pending_responses, 0);

        // the lock is held on the master until release
        let metadata = db.find_table(0, 0).search_metadata(1).unwrap();
        assert!(tid::is_locked(metadata.load(std::sync::atomic::Ordering::Relaxed)));

        // a competing lock request is refused with an empty value
        let mut response = Message::new();
        lock_request_handler(&request.iter().next().unwrap(), &mut response, &db, None);
        let (_, _, success, value) =
            parse_read_lock_response(response.iter().next().unwrap().payload);
        assert!(!success);
        assert!(value.is_empty());
    }
}
