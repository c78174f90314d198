use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::RwLock;

/// One record: the value cell plus the packed metadata word. The RwLock only
/// arbitrates raw byte access; protocol-level exclusion goes through the
/// lock bit of `tid`, and writers must hold that bit before calling
/// `Table::update`.
pub struct Row {
    pub tid: AtomicU64,
    pub value: RwLock<String>,
}

impl Row {
    pub fn new(value: String) -> Self {
        Self {
            tid: AtomicU64::new(0),
            value: RwLock::new(value),
        }
    }
}

pub trait Table: Send + Sync {
    fn table_id(&self) -> usize;
    fn partition_id(&self) -> usize;
    fn search(&self, key: u64) -> Option<&Row>;
    fn search_metadata(&self, key: u64) -> Option<&AtomicU64>;
    fn search_value(&self, key: u64) -> Option<String>;
    /// Overwrites the value bytes. The caller holds the record lock.
    fn update(&self, key: u64, value: String);
    fn value_size(&self) -> usize;
}

/// Hash table over a fixed keyspace; rows are inserted at load time only.
pub struct MemTable {
    table_id: usize,
    partition_id: usize,
    value_size: usize,
    rows: HashMap<u64, Row>,
}

impl MemTable {
    pub fn new(table_id: usize, partition_id: usize, value_size: usize) -> Self {
        Self {
            table_id,
            partition_id,
            value_size,
            rows: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: u64, value: String) {
        self.rows.insert(key, Row::new(value));
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Table for MemTable {
    fn table_id(&self) -> usize {
        self.table_id
    }

    fn partition_id(&self) -> usize {
        self.partition_id
    }

    fn search(&self, key: u64) -> Option<&Row> {
        self.rows.get(&key)
    }

    fn search_metadata(&self, key: u64) -> Option<&AtomicU64> {
        self.rows.get(&key).map(|row| &row.tid)
    }

    fn search_value(&self, key: u64) -> Option<String> {
        self.rows.get(&key).map(|row| row.value.read().clone())
    }

    fn update(&self, key: u64, value: String) {
        let row = self.rows.get(&key).expect("update of a missing row");
        *row.value.write() = value;
    }

    fn value_size(&self) -> usize {
        self.value_size
    }
}

/// All tables of one coordinator, indexed by (table id, partition id).
/// Every coordinator holds rows for every partition; the partitioner decides
/// which of them it masters and which are replicas.
#[derive(Default)]
pub struct Database {
    tables: Vec<Vec<Arc<dyn Table>>>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, partitions: Vec<Arc<dyn Table>>) -> usize {
        self.tables.push(partitions);
        self.tables.len() - 1
    }

    pub fn find_table(&self, table_id: usize, partition_id: usize) -> &dyn Table {
        self.tables[table_id][partition_id].as_ref()
    }

    pub fn table_num(&self) -> usize {
        self.tables.len()
    }

    pub fn partition_num(&self) -> usize {
        self.tables.first().map_or(0, |t| t.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn search_and_update() {
        let mut table = MemTable::new(0, 0, 4);
        table.insert(1, "aaaa".to_string());
        assert_eq!(table.search_value(1).unwrap(), "aaaa");
        assert!(table.search_value(2).is_none());
        table.update(1, "bbbb".to_string());
        assert_eq!(table.search_value(1).unwrap(), "bbbb");
        assert_eq!(table.value_size(), 4);
    }

    #[test]
    fn metadata_is_shared_with_the_row() {
        let mut table = MemTable::new(0, 0, 4);
        table.insert(9, "x".to_string());
        table.search_metadata(9).unwrap().store(77, Ordering::Relaxed);
        assert_eq!(table.search(9).unwrap().tid.load(Ordering::Relaxed), 77);
    }

    #[test]
    fn database_indexing() {
        let mut db = Database::new();
        let mut p0 = MemTable::new(0, 0, 4);
        p0.insert(1, "v".to_string());
        let p1 = MemTable::new(0, 1, 4);
        let id = db.add_table(vec![Arc::new(p0), Arc::new(p1)]);
        assert_eq!(id, 0);
        assert_eq!(db.partition_num(), 2);
        assert_eq!(db.find_table(0, 0).search_value(1).unwrap(), "v");
        assert!(db.find_table(0, 1).search_value(1).is_none());
    }
}
