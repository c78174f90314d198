use std::sync::Arc;

use common::config::Context;
use common::make_txn_id;
use common::random::Random;
use engine::transaction::{Operation, Transaction};
use engine::Workload;
use storage::{Database, MemTable, Table};

pub const YCSB_TABLE_ID: usize = 0;

pub fn zeta(n: u64, theta: f64) -> f64 {
    let mut sum = 0.0;
    for i in 1..(n + 1) {
        sum += f64::powf(1.0 / i as f64, theta);
    }
    sum
}

/// Zipfian key chooser over a partition's keyspace. The zeta terms only
/// depend on the keyspace size, so they are computed once and reused for
/// every transaction.
pub struct ZipfDistribution {
    n: u64,
    theta: f64,
    zeta_2_theta: f64,
    denom: f64,
}

impl ZipfDistribution {
    pub fn new(n: u64, theta: f64) -> Self {
        Self {
            n,
            theta,
            zeta_2_theta: zeta(2, theta),
            denom: zeta(n, theta),
        }
    }

    pub fn value(&self, random: &mut Random) -> u64 {
        if self.theta == 0.0 {
            return random.uniform_dist(0, self.n - 1);
        }
        let zetan = self.denom;
        let u = random.next_double();
        let uz = u * zetan;
        if uz < 1.0 {
            return 0;
        }
        if uz < 1.0 + f64::powf(0.5, self.theta) {
            return 1;
        }
        let alpha = 1.0 / (1.0 - self.theta);
        let eta = (1.0 - f64::powf(2.0 / self.n as f64, 1.0 - self.theta))
            / (1.0 - self.zeta_2_theta / zetan);
        let mut v = (self.n as f64 * f64::powf(eta * u - eta + 1.0, alpha)) as u64;
        if v >= self.n {
            v = self.n - 1;
        }
        v
    }
}

pub struct YcsbWorkload {
    coordinator_id: usize,
    worker_id: usize,
    next_seq: u64,
    zipf: Option<ZipfDistribution>,
}

impl YcsbWorkload {
    pub fn new(coordinator_id: usize, worker_id: usize) -> Self {
        Self {
            coordinator_id,
            worker_id,
            next_seq: 0,
            zipf: None,
        }
    }
}

impl Workload for YcsbWorkload {
    fn next_transaction(
        &mut self,
        context: &Context,
        partition_id: usize,
        random: &mut Random,
    ) -> Transaction {
        let zipf = self
            .zipf
            .get_or_insert_with(|| ZipfDistribution::new(context.keys_per_partition, context.zipf_theta));

        self.next_seq += 1;
        let id = make_txn_id(self.coordinator_id, self.worker_id, self.next_seq);
        let mut transaction = Transaction::new(self.coordinator_id, partition_id, id);

        let mut chosen: Vec<(usize, u64)> = Vec::with_capacity(context.keys_per_transaction);
        for _ in 0..context.keys_per_transaction {
            let access_partition = if context.partition_num > 1
                && random.uniform_dist(1, 100) <= context.cross_ratio
            {
                // pick some other partition; its master may be remote
                let mut p = random.uniform_dist(0, context.partition_num as u64 - 1) as usize;
                if p == partition_id {
                    p = (p + 1) % context.partition_num;
                }
                p
            } else {
                partition_id
            };

            // keys within one transaction are distinct
            let key = loop {
                let candidate = zipf.value(random);
                if !chosen.contains(&(access_partition, candidate)) {
                    break candidate;
                }
            };
            chosen.push((access_partition, key));

            let operation = if random.uniform_dist(1, 100) <= context.read_ratio {
                Operation::Read {
                    table_id: YCSB_TABLE_ID,
                    partition_id: access_partition,
                    key,
                }
            } else {
                Operation::Update {
                    table_id: YCSB_TABLE_ID,
                    partition_id: access_partition,
                    key,
                    value: random.rand_str(context.value_size),
                }
            };
            transaction.plan.push(operation);
        }
        transaction
    }
}

/// Populates every partition's keyspace. The generator is seeded per
/// partition, so every coordinator loads byte-identical replicas.
pub fn load_database(context: &Context) -> Database {
    let mut db = Database::new();
    let mut partitions: Vec<Arc<dyn Table>> = Vec::with_capacity(context.partition_num);
    for partition_id in 0..context.partition_num {
        let mut table = MemTable::new(YCSB_TABLE_ID, partition_id, context.value_size);
        let mut random = Random::new(partition_id as u64 + 1);
        for key in 0..context.keys_per_partition {
            table.insert(key, random.rand_str(context.value_size));
        }
        partitions.push(Arc::new(table));
    }
    db.add_table(partitions);
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_context() -> Context {
        Context {
            partition_num: 2,
            keys_per_partition: 100,
            keys_per_transaction: 8,
            value_size: 10,
            read_ratio: 50,
            cross_ratio: 20,
            ..Default::default()
        }
    }

    #[test]
    fn same_seed_same_plan() {
        let context = small_context();
        let mut workload = YcsbWorkload::new(0, 0);
        let mut random = Random::new(77);
        let seed = random.get_seed();
        let first = workload.next_transaction(&context, 0, &mut random);
        random.set_seed(seed);
        let second = workload.next_transaction(&context, 0, &mut random);
        assert_eq!(first.plan.len(), second.plan.len());
        for (a, b) in first.plan.iter().zip(second.plan.iter()) {
            assert_eq!(format!("{:?}", a), format!("{:?}", b));
        }
    }

    #[test]
    fn keys_are_distinct_within_a_transaction() {
        let context = small_context();
        let mut workload = YcsbWorkload::new(0, 0);
        let mut random = Random::new(5);
        for _ in 0..50 {
            let txn = workload.next_transaction(&context, 1, &mut random);
            let mut seen = Vec::new();
            for op in &txn.plan {
                let pk = match op {
                    Operation::Read {
                        partition_id, key, ..
                    }
                    | Operation::LocalIndexRead {
                        partition_id, key, ..
                    }
                    | Operation::Update {
                        partition_id, key, ..
                    } => (*partition_id, *key),
                    Operation::Rollback => continue,
                };
                assert!(!seen.contains(&pk));
                assert!(pk.1 < context.keys_per_partition);
                seen.push(pk);
            }
        }
    }

    #[test]
    fn read_ratio_extremes() {
        let mut context = small_context();
        context.read_ratio = 100;
        let mut workload = YcsbWorkload::new(0, 0);
        let mut random = Random::new(11);
        let txn = workload.next_transaction(&context, 0, &mut random);
        assert!(txn
            .plan
            .iter()
            .all(|op| matches!(op, Operation::Read { .. })));

        context.read_ratio = 0;
        let mut workload = YcsbWorkload::new(0, 0);
        let txn = workload.next_transaction(&context, 0, &mut random);
        assert!(txn
            .plan
            .iter()
            .all(|op| matches!(op, Operation::Update { .. })));
    }

    #[test]
    fn zipf_values_stay_in_range() {
        let zipf = ZipfDistribution::new(64, 0.9);
        let mut random = Random::new(3);
        for _ in 0..1000 {
            assert!(zipf.value(&mut random) < 64);
        }
    }

    #[test]
    fn load_is_deterministic_across_coordinators() {
        let mut context = small_context();
        context.keys_per_partition = 20;
        let a = load_database(&context);
        let b = load_database(&context);
        for partition in 0..context.partition_num {
            for key in 0..context.keys_per_partition {
                assert_eq!(
                    a.find_table(YCSB_TABLE_ID, partition).search_value(key),
                    b.find_table(YCSB_TABLE_ID, partition).search_value(key)
                );
            }
        }
        assert_eq!(a.partition_num(), 2);
    }
}
