use engine::protocol::{search_record, MessageHandler};
use engine::tid;
use engine::transaction::Transaction;
use message::{factory, Message, MessagePiece, N_MESSAGE_TYPES};
use storage::Database;

/// Indexed by `MessageType`. The operation-replication control tag is
/// dispatched before this table and must never land here.
pub static HANDLERS: [MessageHandler; N_MESSAGE_TYPES] = [
    search_request_handler,
    search_response_handler,
    lock_request_handler,
    lock_response_handler,
    read_validation_request_handler,
    read_validation_response_handler,
    abort_request_handler,
    write_request_handler,
    write_response_handler,
    replicate_request_handler,
    replicate_response_handler,
    release_lock_request_handler,
    unexpected_message_handler,
];

fn search_request_handler(
    piece: &MessagePiece<'_>,
    response: &mut Message,
    db: &Database,
    _txn: Option<&mut Transaction>,
) {
    let (key, key_offset) = factory::parse_search_request(piece.payload);
    let table = db.find_table(piece.table_id, piece.partition_id);
    let (tid_word, value) = search_record(table, key).expect("search of a missing row");
    factory::new_search_response_message(
        response,
        piece.table_id,
        piece.partition_id,
        key_offset,
        tid_word,
        &value,
    );
}

fn search_response_handler(
    piece: &MessagePiece<'_>,
    _response: &mut Message,
    _db: &Database,
    txn: Option<&mut Transaction>,
) {
    let txn = txn.expect("search response without an in-flight transaction");
    let (key_offset, tid_word, value) = factory::parse_search_response(piece.payload);
    let read_key = &mut txn.read_set[key_offset as usize];
    read_key.tid = tid_word;
    read_key.value = value;
    read_key.set_execution_processed_bit();
    txn.pending_responses -= 1;
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
    factory::new_lock_response_message(
        response,
        piece.table_id,
        piece.partition_id,
        key_offset,
        latest_tid,
        success,
    );
}

fn lock_response_handler(
    piece: &MessagePiece<'_>,
    _response: &mut Message,
    _db: &Database,
    txn: Option<&mut Transaction>,
) {
    let txn = txn.expect("lock response without an in-flight transaction");
    let (key_offset, latest_tid, success) = factory::parse_lock_response(piece.payload);
    let (table_id, partition_id, key) = {
        let write_key = &txn.write_set[key_offset as usize];
        (write_key.table_id, write_key.partition_id, write_key.key)
    };
    if success {
        let write_key = &mut txn.write_set[key_offset as usize];
        write_key.set_write_lock_bit();
        write_key.tid = latest_tid;
        // stale read detection, same rule as the local lock path
        if let Some(read_index) = txn.get_read_key(table_id, partition_id, key) {
            let tid_on_read = txn.read_set[read_index].tid;
            if tid::get_wts(latest_tid) != tid::get_wts(tid_on_read) {
                txn.abort_lock = true;
            }
        }
    } else {
        txn.abort_lock = true;
    }
    txn.pending_responses -= 1;
}

fn read_validation_request_handler(
    piece: &MessagePiece<'_>,
    response: &mut Message,
    db: &Database,
    _txn: Option<&mut Transaction>,
) {
    let (key, key_offset, read_tid, _commit_ts) =
        factory::parse_read_validation_request(piece.payload);
    let table = db.find_table(piece.table_id, piece.partition_id);
    let metadata = table
        .search_metadata(key)
        .expect("validation of a missing row");
    let success = tid::validate_silo(metadata, read_tid);
    factory::new_read_validation_response_message(
        response,
        piece.table_id,
        piece.partition_id,
        key_offset,
        success,
        read_tid,
    );
}

fn read_validation_response_handler(
    piece: &MessagePiece<'_>,
    _response: &mut Message,
    _db: &Database,
    txn: Option<&mut Transaction>,
) {
    let txn = txn.expect("validation response without an in-flight transaction");
    let (key_offset, success, _written_tid) =
        factory::parse_read_validation_response(piece.payload);
    if success {
        txn.read_set[key_offset as usize].set_read_validation_success_bit();
    } else {
        txn.abort_read_validation = true;
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
    // the requester holds the record lock until its release message
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
    // replications can arrive out of order; stale ones are dropped
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
    fn lock_request_locks_and_reports_the_old_word() {
        let db = one_row_db();
        let mut request = Message::new();
        factory::new_lock_message(&mut request, 0, 0, 1, 0);
        let mut response = Message::new();
        lock_request_handler(&request.iter().next().unwrap(), &mut response, &db, None);

        let piece = response.iter().next().unwrap();
        let (key_offset, latest_tid, success) = factory::parse_lock_response(piece.payload);
        assert_eq!(key_offset, 0);
        assert!(success);
        assert_eq!(tid::get_wts(latest_tid), 0);
        // the lock is held on behalf of the requester
        let word = db
            .find_table(0, 0)
            .search_metadata(1)
            .unwrap()
            .load(std::sync::atomic::Ordering::Relaxed);
        assert!(tid::is_locked(word));

        // a second lock request fails
        let mut response = Message::new();
        lock_request_handler(&request.iter().next().unwrap(), &mut response, &db, None);
        let (_, _, success) = factory::parse_lock_response(response.iter().next().unwrap().payload);
        assert!(!success);
    }

    #[test]
    fn lock_response_detects_a_stale_read() {
        let db = one_row_db();
        let mut txn = Transaction::new(0, 0, 1);
        let offset = txn.search_for_update(0, 0, 1);
        txn.read_set[offset].tid = tid::make_tid(0, 0);
        txn.update(0, 0, 1, "new".to_string());
        txn.pending_responses = 1;

        // the master reports a newer version than the one we read
        let mut message = Message::new();
        factory::new_lock_response_message(&mut message, 0, 0, 0, tid::make_tid(4, 4), true);
        let mut response = Message::new();
        lock_response_handler(
            &message.iter().next().unwrap(),
            &mut response,
            &db,
            Some(&mut txn),
        );
        assert!(txn.abort_lock);
        assert!(txn.write_set[0].get_write_lock_bit());
        assert_eq!(txn.pending_responses, 0);
    }

    #[test]
    fn write_then_release_applies_and_stamps() {
        let db = one_row_db();
        let metadata = db.find_table(0, 0).search_metadata(1).unwrap();
        tid::lock(metadata);

        let mut write = Message::new();
        factory::new_write_message(&mut write, 0, 0, 1, "applied");
        let mut response = Message::new();
        write_request_handler(&write.iter().next().unwrap(), &mut response, &db, None);
        assert_eq!(response.iter().next().unwrap().msg_type, message::MessageType::WriteResponse);

        let mut release = Message::new();
        factory::new_release_lock_message(&mut release, 0, 0, 1, 6, true);
        let mut unused = Message::new();
        release_lock_request_handler(&release.iter().next().unwrap(), &mut unused, &db, None);

        assert_eq!(db.find_table(0, 0).search_value(1).unwrap(), "applied");
        let word = metadata.load(std::sync::atomic::Ordering::Relaxed);
        assert!(!tid::is_locked(word));
        assert_eq!(tid::get_wts(word), 6);
    }

    #[test]
    fn stale_replication_is_dropped() {
        let db = one_row_db();
        let metadata = db.find_table(0, 0).search_metadata(1).unwrap();
        tid::lock(metadata);
        tid::unlock_with_commit(metadata, 8);

        let mut replicate = Message::new();
        factory::new_replication_message(&mut replicate, 0, 0, 1, "old", 3);
        let mut response = Message::new();
        replicate_request_handler(&replicate.iter().next().unwrap(), &mut response, &db, None);

        assert_eq!(db.find_table(0, 0).search_value(1).unwrap(), "v1");
        assert_eq!(tid::get_wts(metadata.load(std::sync::atomic::Ordering::Relaxed)), 8);
    }
}
