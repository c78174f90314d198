const READ_REQUEST: u32 = 1 << 0;
const LOCAL_INDEX_READ: u32 = 1 << 1;
const WRITE_LOCK: u32 = 1 << 2;
const EXECUTION_PROCESSED: u32 = 1 << 3;
const READ_VALIDATION_SUCCESS: u32 = 1 << 4;
const WTS_CHANGE_IN_READ_VALIDATION: u32 = 1 << 5;

/// One read or write participation of a transaction. Values are owned: a
/// read entry receives the bytes when the request resolves, a write entry
/// carries the bytes to install.
#[derive(Clone, Debug, Default)]
pub struct RWKey {
    pub table_id: usize,
    pub partition_id: usize,
    pub key: u64,
    pub value: String,
    pub tid: u64,
    flags: u32,
}

impl RWKey {
    pub fn new(table_id: usize, partition_id: usize, key: u64) -> Self {
        Self {
            table_id,
            partition_id,
            key,
            ..Default::default()
        }
    }

    pub fn set_read_request_bit(&mut self) {
        self.flags |= READ_REQUEST;
    }

    pub fn clear_read_request_bit(&mut self) {
        self.flags &= !READ_REQUEST;
    }

    pub fn get_read_request_bit(&self) -> bool {
        self.flags & READ_REQUEST != 0
    }

    pub fn set_local_index_read_bit(&mut self) {
        self.flags |= LOCAL_INDEX_READ;
    }

    pub fn get_local_index_read_bit(&self) -> bool {
        self.flags & LOCAL_INDEX_READ != 0
    }

    pub fn set_write_lock_bit(&mut self) {
        self.flags |= WRITE_LOCK;
    }

    pub fn clear_write_lock_bit(&mut self) {
        self.flags &= !WRITE_LOCK;
    }

    pub fn get_write_lock_bit(&self) -> bool {
        self.flags & WRITE_LOCK != 0
    }

    pub fn set_execution_processed_bit(&mut self) {
        self.flags |= EXECUTION_PROCESSED;
    }

    pub fn clear_execution_processed_bit(&mut self) {
        self.flags &= !EXECUTION_PROCESSED;
    }

    pub fn get_execution_processed_bit(&self) -> bool {
        self.flags & EXECUTION_PROCESSED != 0
    }

    pub fn set_read_validation_success_bit(&mut self) {
        self.flags |= READ_VALIDATION_SUCCESS;
    }

    pub fn get_read_validation_success_bit(&self) -> bool {
        self.flags & READ_VALIDATION_SUCCESS != 0
    }

    pub fn set_wts_change_in_read_validation_bit(&mut self) {
        self.flags |= WTS_CHANGE_IN_READ_VALIDATION;
    }

    pub fn get_wts_change_in_read_validation_bit(&self) -> bool {
        self.flags & WTS_CHANGE_IN_READ_VALIDATION != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_independent() {
        let mut key = RWKey::new(0, 1, 42);
        key.set_read_request_bit();
        key.set_write_lock_bit();
        assert!(key.get_read_request_bit());
        assert!(key.get_write_lock_bit());
        assert!(!key.get_local_index_read_bit());
        key.clear_read_request_bit();
        assert!(!key.get_read_request_bit());
        assert!(key.get_write_lock_bit());
    }
}
