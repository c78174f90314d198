//! Payload builders and parsers for the wire tags. Variable-length values
//! always sit at the tail of a payload so they need no length prefix.

use bytes::{Buf, BufMut};

use crate::{Message, MessageType};

pub fn new_search_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
    key: u64,
    key_offset: u32,
) -> usize {
    let mut payload = Vec::with_capacity(12);
    payload.put_u64_le(key);
    payload.put_u32_le(key_offset);
    message.push_piece(MessageType::SearchRequest, table_id, partition_id, &payload)
}

pub fn parse_search_request(mut payload: &[u8]) -> (u64, u32) {
    (payload.get_u64_le(), payload.get_u32_le())
}

pub fn new_search_response_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
    key_offset: u32,
    tid: u64,
    value: &str,
) -> usize {
    let mut payload = Vec::with_capacity(12 + value.len());
    payload.put_u32_le(key_offset);
    payload.put_u64_le(tid);
    payload.put_slice(value.as_bytes());
    message.push_piece(MessageType::SearchResponse, table_id, partition_id, &payload)
}

pub fn parse_search_response(mut payload: &[u8]) -> (u32, u64, String) {
    let key_offset = payload.get_u32_le();
    let tid = payload.get_u64_le();
    (key_offset, tid, String::from_utf8_lossy(payload).into_owned())
}

pub fn new_lock_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
    key: u64,
    key_offset: u32,
) -> usize {
    let mut payload = Vec::with_capacity(12);
    payload.put_u64_le(key);
    payload.put_u32_le(key_offset);
    message.push_piece(MessageType::LockRequest, table_id, partition_id, &payload)
}

pub fn parse_lock_request(mut payload: &[u8]) -> (u64, u32) {
    (payload.get_u64_le(), payload.get_u32_le())
}

pub fn new_lock_response_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
    key_offset: u32,
    latest_tid: u64,
    success: bool,
) -> usize {
    let mut payload = Vec::with_capacity(13);
    payload.put_u32_le(key_offset);
    payload.put_u64_le(latest_tid);
    payload.put_u8(success as u8);
    message.push_piece(MessageType::LockResponse, table_id, partition_id, &payload)
}

pub fn parse_lock_response(mut payload: &[u8]) -> (u32, u64, bool) {
    let key_offset = payload.get_u32_le();
    let latest_tid = payload.get_u64_le();
    (key_offset, latest_tid, payload.get_u8() != 0)
}

pub fn new_read_validation_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
    key: u64,
    key_offset: u32,
    tid: u64,
    commit_ts: u64,
) -> usize {
    let mut payload = Vec::with_capacity(28);
    payload.put_u64_le(key);
    payload.put_u32_le(key_offset);
    payload.put_u64_le(tid);
    payload.put_u64_le(commit_ts);
    message.push_piece(
        MessageType::ReadValidationRequest,
        table_id,
        partition_id,
        &payload,
    )
}

pub fn parse_read_validation_request(mut payload: &[u8]) -> (u64, u32, u64, u64) {
    (
        payload.get_u64_le(),
        payload.get_u32_le(),
        payload.get_u64_le(),
        payload.get_u64_le(),
    )
}

pub fn new_read_validation_response_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
    key_offset: u32,
    success: bool,
    written_tid: u64,
) -> usize {
    let mut payload = Vec::with_capacity(13);
    payload.put_u32_le(key_offset);
    payload.put_u8(success as u8);
    payload.put_u64_le(written_tid);
    message.push_piece(
        MessageType::ReadValidationResponse,
        table_id,
        partition_id,
        &payload,
    )
}

pub fn parse_read_validation_response(mut payload: &[u8]) -> (u32, bool, u64) {
    let key_offset = payload.get_u32_le();
    let success = payload.get_u8() != 0;
    (key_offset, success, payload.get_u64_le())
}

pub fn new_abort_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
    key: u64,
) -> usize {
    let mut payload = Vec::with_capacity(8);
    payload.put_u64_le(key);
    message.push_piece(MessageType::AbortRequest, table_id, partition_id, &payload)
}

pub fn parse_abort_request(mut payload: &[u8]) -> u64 {
    payload.get_u64_le()
}

pub fn new_write_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
    key: u64,
    value: &str,
) -> usize {
    let mut payload = Vec::with_capacity(8 + value.len());
    payload.put_u64_le(key);
    payload.put_slice(value.as_bytes());
    message.push_piece(MessageType::WriteRequest, table_id, partition_id, &payload)
}

pub fn parse_write_request(mut payload: &[u8]) -> (u64, String) {
    let key = payload.get_u64_le();
    (key, String::from_utf8_lossy(payload).into_owned())
}

pub fn new_write_response_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
) -> usize {
    message.push_piece(MessageType::WriteResponse, table_id, partition_id, &[])
}

pub fn new_replication_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
    key: u64,
    value: &str,
    commit_wts: u64,
) -> usize {
    let mut payload = Vec::with_capacity(16 + value.len());
    payload.put_u64_le(key);
    payload.put_u64_le(commit_wts);
    payload.put_slice(value.as_bytes());
    message.push_piece(MessageType::ReplicateRequest, table_id, partition_id, &payload)
}

pub fn parse_replication_request(mut payload: &[u8]) -> (u64, u64, String) {
    let key = payload.get_u64_le();
    let commit_wts = payload.get_u64_le();
    (key, commit_wts, String::from_utf8_lossy(payload).into_owned())
}

pub fn new_replication_response_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
) -> usize {
    message.push_piece(MessageType::ReplicateResponse, table_id, partition_id, &[])
}

pub fn new_release_lock_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
    key: u64,
    commit_wts: u64,
    stamp_commit: bool,
) -> usize {
    let mut payload = Vec::with_capacity(17);
    payload.put_u64_le(key);
    payload.put_u64_le(commit_wts);
    payload.put_u8(stamp_commit as u8);
    message.push_piece(MessageType::ReleaseLockRequest, table_id, partition_id, &payload)
}

pub fn parse_release_lock_request(mut payload: &[u8]) -> (u64, u64, bool) {
    let key = payload.get_u64_le();
    let commit_wts = payload.get_u64_le();
    (key, commit_wts, payload.get_u8() != 0)
}

pub fn new_operation_replication_message(
    message: &mut Message,
    table_id: usize,
    partition_id: usize,
    operation: &[u8],
) -> usize {
    message.push_piece(
        MessageType::OperationReplication,
        table_id,
        partition_id,
        operation,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_round_trip() {
        let mut m = Message::new();
        new_search_message(&mut m, 0, 1, 99, 4);
        let piece = m.iter().next().unwrap();
        assert_eq!(piece.msg_type, MessageType::SearchRequest);
        assert_eq!(parse_search_request(piece.payload), (99, 4));
    }

    #[test]
    fn search_response_round_trip() {
        let mut m = Message::new();
        new_search_response_message(&mut m, 0, 1, 2, 77, "value-bytes");
        let piece = m.iter().next().unwrap();
        let (offset, tid, value) = parse_search_response(piece.payload);
        assert_eq!((offset, tid), (2, 77));
        assert_eq!(value, "value-bytes");
    }

    #[test]
    fn lock_and_validation_round_trip() {
        let mut m = Message::new();
        new_lock_response_message(&mut m, 0, 0, 3, 1 << 32, false);
        new_read_validation_message(&mut m, 0, 0, 8, 1, 42, 50);
        new_read_validation_response_message(&mut m, 0, 0, 1, true, 42);
        let mut it = m.iter();
        assert_eq!(parse_lock_response(it.next().unwrap().payload), (3, 1 << 32, false));
        assert_eq!(
            parse_read_validation_request(it.next().unwrap().payload),
            (8, 1, 42, 50)
        );
        assert_eq!(
            parse_read_validation_response(it.next().unwrap().payload),
            (1, true, 42)
        );
    }

    #[test]
    fn replication_and_release_round_trip() {
        let mut m = Message::new();
        new_replication_message(&mut m, 0, 0, 5, "v2", 9);
        new_release_lock_message(&mut m, 0, 0, 5, 9, true);
        let mut it = m.iter();
        assert_eq!(
            parse_replication_request(it.next().unwrap().payload),
            (5, 9, "v2".to_string())
        );
        assert_eq!(parse_release_lock_request(it.next().unwrap().payload), (5, 9, true));
    }

    #[test]
    fn empty_value_write_round_trip() {
        let mut m = Message::new();
        new_write_message(&mut m, 0, 0, 11, "");
        let (key, value) = parse_write_request(m.iter().next().unwrap().payload);
        assert_eq!(key, 11);
        assert!(value.is_empty());
    }
}
