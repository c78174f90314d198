//! Placement: which coordinator masters a partition and where its replicas
//! live. Pure functions of the partition id and cluster size, safe to share
//! across workers.

pub trait Partitioner: Send + Sync {
    fn coordinator_id(&self) -> usize;
    fn total_coordinators(&self) -> usize;
    fn replica_num(&self) -> usize;
    fn master_coordinator(&self, partition_id: usize) -> usize;
    fn is_partition_replicated_on(&self, partition_id: usize, coordinator_id: usize) -> bool;

    fn has_master_partition(&self, partition_id: usize) -> bool {
        self.master_coordinator(partition_id) == self.coordinator_id()
    }
}

/// Masters striped round-robin, k replicas on the consecutive coordinators.
pub struct HashReplicatedPartitioner {
    coordinator_id: usize,
    coordinator_num: usize,
    replica_num: usize,
}

impl HashReplicatedPartitioner {
    pub fn new(coordinator_id: usize, coordinator_num: usize, replica_num: usize) -> Self {
        assert!(replica_num >= 1 && replica_num <= coordinator_num);
        Self {
            coordinator_id,
            coordinator_num,
            replica_num,
        }
    }
}

impl Partitioner for HashReplicatedPartitioner {
    fn coordinator_id(&self) -> usize {
        self.coordinator_id
    }

    fn total_coordinators(&self) -> usize {
        self.coordinator_num
    }

    fn replica_num(&self) -> usize {
        self.replica_num
    }

    fn master_coordinator(&self, partition_id: usize) -> usize {
        partition_id % self.coordinator_num
    }

    fn is_partition_replicated_on(&self, partition_id: usize, coordinator_id: usize) -> bool {
        let master = self.master_coordinator(partition_id);
        let distance = (coordinator_id + self.coordinator_num - master) % self.coordinator_num;
        distance < self.replica_num
    }
}

/// S-phase placement: partitions striped across coordinators, every
/// coordinator holding a full replica set.
pub struct RStoreSPartitioner {
    coordinator_id: usize,
    coordinator_num: usize,
}

impl RStoreSPartitioner {
    pub fn new(coordinator_id: usize, coordinator_num: usize) -> Self {
        Self {
            coordinator_id,
            coordinator_num,
        }
    }
}

impl Partitioner for RStoreSPartitioner {
    fn coordinator_id(&self) -> usize {
        self.coordinator_id
    }

    fn total_coordinators(&self) -> usize {
        self.coordinator_num
    }

    fn replica_num(&self) -> usize {
        self.coordinator_num
    }

    fn master_coordinator(&self, partition_id: usize) -> usize {
        partition_id % self.coordinator_num
    }

    fn is_partition_replicated_on(&self, _partition_id: usize, _coordinator_id: usize) -> bool {
        true
    }
}

/// C-phase placement: the phase runs on one node, so every partition is
/// mastered locally and everyone else applies replication.
pub struct RStoreCPartitioner {
    coordinator_id: usize,
    coordinator_num: usize,
}

impl RStoreCPartitioner {
    pub fn new(coordinator_id: usize, coordinator_num: usize) -> Self {
        Self {
            coordinator_id,
            coordinator_num,
        }
    }
}

impl Partitioner for RStoreCPartitioner {
    fn coordinator_id(&self) -> usize {
        self.coordinator_id
    }

    fn total_coordinators(&self) -> usize {
        self.coordinator_num
    }

    fn replica_num(&self) -> usize {
        self.coordinator_num
    }

    fn master_coordinator(&self, _partition_id: usize) -> usize {
        self.coordinator_id
    }

    fn is_partition_replicated_on(&self, _partition_id: usize, _coordinator_id: usize) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_replicated_masters_and_replicas() {
        let p = HashReplicatedPartitioner::new(1, 4, 2);
        assert_eq!(p.master_coordinator(0), 0);
        assert_eq!(p.master_coordinator(5), 1);
        assert!(p.has_master_partition(5));
        assert!(!p.has_master_partition(0));
        // partition 0: master 0, replica 1
        assert!(p.is_partition_replicated_on(0, 0));
        assert!(p.is_partition_replicated_on(0, 1));
        assert!(!p.is_partition_replicated_on(0, 2));
        // wraps around the ring
        assert!(p.is_partition_replicated_on(3, 3));
        assert!(p.is_partition_replicated_on(3, 0));
        assert!(!p.is_partition_replicated_on(3, 1));
    }

    #[test]
    fn every_partition_has_replica_num_replicas() {
        let p = HashReplicatedPartitioner::new(0, 3, 2);
        for partition in 0..9 {
            let count = (0..3)
                .filter(|c| p.is_partition_replicated_on(partition, *c))
                .count();
            assert_eq!(count, 2);
            assert!(p.is_partition_replicated_on(partition, p.master_coordinator(partition)));
        }
    }

    #[test]
    fn s_partitioner_stripes_masters() {
        let p = RStoreSPartitioner::new(2, 3);
        assert!(p.has_master_partition(2));
        assert!(p.has_master_partition(5));
        assert!(!p.has_master_partition(4));
        assert!(p.is_partition_replicated_on(4, 2));
        assert_eq!(p.replica_num(), 3);
    }

    #[test]
    fn c_partitioner_masters_everything_locally() {
        let p = RStoreCPartitioner::new(0, 3);
        for partition in 0..12 {
            assert!(p.has_master_partition(partition));
        }
        assert_eq!(p.replica_num(), 3);
    }
}
