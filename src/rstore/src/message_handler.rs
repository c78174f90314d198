use engine::protocol::{search_record, MessageHandler};
use engine::tid;
use engine::transaction::Transaction;
use message::{factory, Message, MessagePiece, N_MESSAGE_TYPES};
use storage::Database;

/// Indexed by `MessageType`. Within a phase every access is a local master
/// access, so only search (reads served off a replica) and replication
/// apply travel between nodes; the locking and validation tags of the
/// optimistic protocols never appear.
pub static HANDLERS: [MessageHandler; N_MESSAGE_TYPES] = [
    search_request_handler,
    search_response_handler,
    unexpected_message_handler,
    unexpected_message_handler,
    unexpected_message_handler,
    unexpected_message_handler,
    unexpected_message_handler,
    unexpected_message_handler,
    unexpected_message_handler,
    replicate_request_handler,
    unexpected_message_handler,
    unexpected_message_handler,
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

/// Fire-and-forget apply; no response piece.
fn replicate_request_handler(
    piece: &MessagePiece<'_>,
    _response: &mut Message,
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
}

fn unexpected_message_handler(
    piece: &MessagePiece<'_>,
    _response: &mut Message,
    _db: &Database,
    _txn: Option<&mut Transaction>,
) {
    unreachable!("unexpected message type {:?}", piece.msg_type);
}
