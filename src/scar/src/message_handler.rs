use engine::protocol::{search_record, MessageHandler};
use engine::tid;
use engine::transaction::Transaction;
use message::{factory, Message, MessagePiece, N_MESSAGE_TYPES};
use storage::Database;

/// Indexed by `MessageType`.
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
        // blind-write guard: the version locked must be the version read
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
    let (key, key_offset, read_tid, commit_ts) =
        factory::parse_read_validation_request(piece.payload);
    let table = db.find_table(piece.table_id, piece.partition_id);
    let metadata = table
        .search_metadata(key)
        .expect("validation of a missing row");
    // may extend the record's rts in place on the master
    let mut written_tid = read_tid;
    let success = tid::validate_read_key(metadata, read_tid, commit_ts, &mut written_tid);
    factory::new_read_validation_response_message(
        response,
        piece.table_id,
        piece.partition_id,
        key_offset,
        success,
        written_tid,
    );
}

fn read_validation_response_handler(
    piece: &MessagePiece<'_>,
    _response: &mut Message,
    _db: &Database,
    txn: Option<&mut Transaction>,
) {
    let txn = txn.expect("validation response without an in-flight transaction");
    let (key_offset, success, written_tid) =
        factory::parse_read_validation_response(piece.payload);
    if success {
        let read_key = &mut txn.read_set[key_offset as usize];
        read_key.set_read_validation_success_bit();
        if written_tid != read_key.tid {
            read_key.set_wts_change_in_read_validation_bit();
            read_key.tid = written_tid;
        }
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

    fn one_row_db(wts: u64) -> Database {
        let mut table = MemTable::new(0, 0, 2);
        table.insert(1, "v1".to_string());
        let mut db = Database::new();
        db.add_table(vec![Arc::new(table)]);
        let metadata = db.find_table(0, 0).search_metadata(1).unwrap();
        tid::lock(metadata);
        tid::unlock_with_commit(metadata, wts);
        db
    }

    #[test]
    fn remote_validation_extends_rts_on_the_master() {
        let db = one_row_db(5);
        let mut request = Message::new();
        factory::new_read_validation_message(&mut request, 0, 0, 1, 0, tid::make_tid(5, 5), 8);
        let mut response = Message::new();
        read_validation_request_handler(&request.iter().next().unwrap(), &mut response, &db, None);

        let (key_offset, success, written_tid) =
            factory::parse_read_validation_response(response.iter().next().unwrap().payload);
        assert_eq!(key_offset, 0);
        assert!(success);
        assert_eq!(tid::get_wts(written_tid), 5);
        assert_eq!(tid::get_rts(written_tid), 8);
        let word = db
            .find_table(0, 0)
            .search_metadata(1)
            .unwrap()
            .load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(tid::get_rts(word), 8);
    }

    #[test]
    fn remote_validation_rejects_a_changed_version() {
        let db = one_row_db(9);
        let mut request = Message::new();
        factory::new_read_validation_message(&mut request, 0, 0, 1, 0, tid::make_tid(5, 5), 10);
        let mut response = Message::new();
        read_validation_request_handler(&request.iter().next().unwrap(), &mut response, &db, None);
        let (_, success, _) =
            factory::parse_read_validation_response(response.iter().next().unwrap().payload);
        assert!(!success);
    }

    #[test]
    fn validation_response_records_the_extension() {
        let db = one_row_db(5);
        let mut txn = Transaction::new(0, 0, 1);
        let offset = txn.search_for_read(0, 0, 1);
        txn.read_set[offset].tid = tid::make_tid(5, 5);
        txn.pending_responses = 1;

        let extended = tid::make_tid(5, 8);
        let mut message = Message::new();
        factory::new_read_validation_response_message(&mut message, 0, 0, 0, true, extended);
        let mut unused = Message::new();
        read_validation_response_handler(
            &message.iter().next().unwrap(),
            &mut unused,
            &db,
            Some(&mut txn),
        );
        assert!(txn.read_set[0].get_read_validation_success_bit());
        assert!(txn.read_set[0].get_wts_change_in_read_validation_bit());
        assert_eq!(txn.read_set[0].tid, extended);
        assert_eq!(txn.pending_responses, 0);
    }
}
