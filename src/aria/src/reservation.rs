use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

// slot word: epoch in the high half, tid_offset + 1 in the low half;
// zero means unreserved. Entries from earlier epochs are simply stale and
// get overwritten, so nothing is cleared between epochs.
fn encode(epoch: u32, tid_offset: usize) -> u64 {
    ((epoch as u64) << 32) | (tid_offset as u64 + 1)
}

fn slot_epoch(word: u64) -> u32 {
    (word >> 32) as u32
}

fn slot_offset(word: u64) -> usize {
    (word as u32 as usize) - 1
}

#[derive(Default)]
struct Slot {
    read: AtomicU64,
    write: AtomicU64,
}

/// Per-record reservation slots for Aria's execution phase, keyed by
/// (table, partition, key). The lowest tid_offset within the current epoch
/// wins a slot.
#[derive(Default)]
pub struct ReservationTable {
    slots: DashMap<(usize, usize, u64), Slot>,
}

impl ReservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn reserve(slot: &AtomicU64, epoch: u32, tid_offset: usize) {
        let mine = encode(epoch, tid_offset);
        loop {
            let current = slot.load(Ordering::Acquire);
            if current != 0 && slot_epoch(current) == epoch && slot_offset(current) <= tid_offset {
                // an equal or earlier transaction already holds it
                return;
            }
            if slot
                .compare_exchange(current, mine, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn reserver(slot: &AtomicU64, epoch: u32) -> Option<usize> {
        let current = slot.load(Ordering::Acquire);
        if current == 0 || slot_epoch(current) != epoch {
            return None;
        }
        Some(slot_offset(current))
    }

    pub fn reserve_read(
        &self,
        table_id: usize,
        partition_id: usize,
        key: u64,
        epoch: u32,
        tid_offset: usize,
    ) {
        let slot = self
            .slots
            .entry((table_id, partition_id, key))
            .or_default();
        Self::reserve(&slot.read, epoch, tid_offset);
    }

    pub fn reserve_write(
        &self,
        table_id: usize,
        partition_id: usize,
        key: u64,
        epoch: u32,
        tid_offset: usize,
    ) {
        let slot = self
            .slots
            .entry((table_id, partition_id, key))
            .or_default();
        Self::reserve(&slot.write, epoch, tid_offset);
    }

    pub fn read_reserver(
        &self,
        table_id: usize,
        partition_id: usize,
        key: u64,
        epoch: u32,
    ) -> Option<usize> {
        self.slots
            .get(&(table_id, partition_id, key))
            .and_then(|slot| Self::reserver(&slot.read, epoch))
    }

    pub fn write_reserver(
        &self,
        table_id: usize,
        partition_id: usize,
        key: u64,
        epoch: u32,
    ) -> Option<usize> {
        self.slots
            .get(&(table_id, partition_id, key))
            .and_then(|slot| Self::reserver(&slot.write, epoch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_offset_wins() {
        let table = ReservationTable::new();
        table.reserve_write(0, 0, 1, 1, 5);
        assert_eq!(table.write_reserver(0, 0, 1, 1), Some(5));
        table.reserve_write(0, 0, 1, 1, 9);
        assert_eq!(table.write_reserver(0, 0, 1, 1), Some(5));
        table.reserve_write(0, 0, 1, 1, 2);
        assert_eq!(table.write_reserver(0, 0, 1, 1), Some(2));
    }

    #[test]
    fn read_and_write_slots_are_independent() {
        let table = ReservationTable::new();
        table.reserve_read(0, 0, 1, 1, 3);
        assert_eq!(table.read_reserver(0, 0, 1, 1), Some(3));
        assert_eq!(table.write_reserver(0, 0, 1, 1), None);
    }

    #[test]
    fn stale_epochs_do_not_leak() {
        let table = ReservationTable::new();
        table.reserve_write(0, 0, 1, 1, 4);
        // a new epoch sees an empty slot and a fresh reservation overwrites
        assert_eq!(table.write_reserver(0, 0, 1, 2), None);
        table.reserve_write(0, 0, 1, 2, 7);
        assert_eq!(table.write_reserver(0, 0, 1, 2), Some(7));
    }

    #[test]
    fn offset_zero_is_reservable() {
        let table = ReservationTable::new();
        table.reserve_write(0, 0, 9, 1, 0);
        assert_eq!(table.write_reserver(0, 0, 9, 1), Some(0));
    }
}
