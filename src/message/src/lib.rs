use bytes::{Buf, BufMut, BytesMut};

pub mod factory;
pub mod mailbox;

pub use mailbox::Mailbox;

/// Wire tags. Request/response pairs share a prefix; `OperationReplication`
/// is a control tag routed ahead of the per-protocol handler tables.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    SearchRequest = 0,
    SearchResponse = 1,
    LockRequest = 2,
    LockResponse = 3,
    ReadValidationRequest = 4,
    ReadValidationResponse = 5,
    AbortRequest = 6,
    WriteRequest = 7,
    WriteResponse = 8,
    ReplicateRequest = 9,
    ReplicateResponse = 10,
    ReleaseLockRequest = 11,
    OperationReplication = 12,
}

pub const N_MESSAGE_TYPES: usize = 13;

impl MessageType {
    pub fn from_u16(tag: u16) -> Option<MessageType> {
        use MessageType::*;
        Some(match tag {
            0 => SearchRequest,
            1 => SearchResponse,
            2 => LockRequest,
            3 => LockResponse,
            4 => ReadValidationRequest,
            5 => ReadValidationResponse,
            6 => AbortRequest,
            7 => WriteRequest,
            8 => WriteResponse,
            9 => ReplicateRequest,
            10 => ReplicateResponse,
            11 => ReleaseLockRequest,
            12 => OperationReplication,
            _ => return None,
        })
    }
}

// header: source u16 | dest u16 | worker u16 | piece_count u16 | total_length u32
pub const HEADER_SIZE: usize = 12;
// piece header: type u16 | table_id u16 | partition_id u16 | length u32
const PIECE_HEADER_SIZE: usize = 10;

/// A framed multi-piece message. Single owner: the producer batches pieces
/// into it, then releases it whole to the outbound queue.
pub struct Message {
    data: BytesMut,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    pub fn new() -> Self {
        let mut data = BytesMut::with_capacity(256);
        data.put_bytes(0, HEADER_SIZE);
        let mut message = Self { data };
        message.set_total_length(HEADER_SIZE as u32);
        message
    }

    fn get_u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    fn set_u16_at(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn source_node(&self) -> usize {
        self.get_u16_at(0) as usize
    }

    pub fn set_source_node(&mut self, id: usize) {
        self.set_u16_at(0, id as u16);
    }

    pub fn dest_node(&self) -> usize {
        self.get_u16_at(2) as usize
    }

    pub fn set_dest_node(&mut self, id: usize) {
        self.set_u16_at(2, id as u16);
    }

    pub fn worker_id(&self) -> usize {
        self.get_u16_at(4) as usize
    }

    pub fn set_worker_id(&mut self, id: usize) {
        self.set_u16_at(4, id as u16);
    }

    pub fn piece_count(&self) -> usize {
        self.get_u16_at(6) as usize
    }

    fn set_piece_count(&mut self, count: u16) {
        self.set_u16_at(6, count);
    }

    pub fn total_length(&self) -> u32 {
        u32::from_le_bytes(self.data[8..12].try_into().unwrap())
    }

    fn set_total_length(&mut self, len: u32) {
        self.data[8..12].copy_from_slice(&len.to_le_bytes());
    }

    /// Appends one piece and returns the number of bytes added.
    pub fn push_piece(
        &mut self,
        msg_type: MessageType,
        table_id: usize,
        partition_id: usize,
        payload: &[u8],
    ) -> usize {
        self.data.put_u16_le(msg_type as u16);
        self.data.put_u16_le(table_id as u16);
        self.data.put_u16_le(partition_id as u16);
        self.data.put_u32_le(payload.len() as u32);
        self.data.put_slice(payload);
        self.set_piece_count(self.piece_count() as u16 + 1);
        self.set_total_length(self.data.len() as u32);
        PIECE_HEADER_SIZE + payload.len()
    }

    pub fn iter(&self) -> PieceIter<'_> {
        PieceIter {
            message: self,
            offset: HEADER_SIZE,
        }
    }
}

/// Borrowed view over one piece of a message.
pub struct MessagePiece<'a> {
    pub msg_type: MessageType,
    pub table_id: usize,
    pub partition_id: usize,
    pub payload: &'a [u8],
}

pub struct PieceIter<'a> {
    message: &'a Message,
    offset: usize,
}

impl<'a> Iterator for PieceIter<'a> {
    type Item = MessagePiece<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.message.data.len() {
            return None;
        }
        let mut header = &self.message.data[self.offset..self.offset + PIECE_HEADER_SIZE];
        let msg_type = MessageType::from_u16(header.get_u16_le()).expect("unknown message tag");
        let table_id = header.get_u16_le() as usize;
        let partition_id = header.get_u16_le() as usize;
        let length = header.get_u32_le() as usize;
        let start = self.offset + PIECE_HEADER_SIZE;
        self.offset = start + length;
        Some(MessagePiece {
            msg_type,
            table_id,
            partition_id,
            payload: &self.message.data[start..start + length],
        })
    }
}
