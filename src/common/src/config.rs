use serde::Deserialize;

pub static DEFAULT_PORT: u16 = 20000;

/// Runtime configuration shared by every worker on a coordinator.
#[derive(Clone, Debug)]
pub struct Context {
    pub protocol: String,
    pub coordinator_num: usize,
    pub partition_num: usize,
    pub worker_num: usize,
    pub replica_num: usize,
    pub server_addrs: Vec<String>,
    // seconds the benchmark runs before the stop flag flips
    pub exec_time: u64,
    pub batch_flush: usize,

    // ycsb knobs
    pub keys_per_partition: u64,
    pub keys_per_transaction: usize,
    pub read_ratio: u64,
    pub cross_ratio: u64,
    pub zipf_theta: f64,
    pub value_size: usize,

    // behaviour flags
    pub operation_replication: bool,

    // rstore
    pub c_phase_query_num: usize,
    pub s_phase_query_num: usize,

    // aria
    pub aria_batch_size: usize,
    pub aria_reordering: bool,
    pub aria_fallback: bool,
    pub n_lock_manager: usize,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            protocol: String::from("Silo"),
            coordinator_num: 1,
            partition_num: 4,
            worker_num: 4,
            replica_num: 1,
            server_addrs: vec![format!("127.0.0.1:{}", DEFAULT_PORT)],
            exec_time: 10,
            batch_flush: 50,
            keys_per_partition: 200_000,
            keys_per_transaction: 10,
            read_ratio: 80,
            cross_ratio: 10,
            zipf_theta: 0.0,
            value_size: 100,
            operation_replication: false,
            c_phase_query_num: 1000,
            s_phase_query_num: 5000,
            aria_batch_size: 100,
            aria_reordering: true,
            aria_fallback: true,
            n_lock_manager: 1,
        }
    }
}

impl Context {
    pub fn partition_num_per_node(&self) -> usize {
        self.partition_num / self.coordinator_num
    }

    pub fn total_worker_num(&self) -> usize {
        self.coordinator_num * self.worker_num
    }
}

/// Optional yaml overrides, merged on top of the CLI defaults.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub protocol: Option<String>,
    pub threads: Option<usize>,
    pub partition_num: Option<usize>,
    pub replica_num: Option<usize>,
    pub exec_time: Option<u64>,
    pub keys_per_partition: Option<u64>,
    pub keys_per_transaction: Option<usize>,
    pub read_ratio: Option<u64>,
    pub cross_ratio: Option<u64>,
    pub zipf_theta: Option<f64>,
    pub operation_replication: Option<bool>,
}

impl ConfigFile {
    pub fn apply(self, context: &mut Context) {
        if let Some(protocol) = self.protocol {
            context.protocol = protocol;
        }
        if let Some(threads) = self.threads {
            context.worker_num = threads;
        }
        if let Some(partition_num) = self.partition_num {
            context.partition_num = partition_num;
        }
        if let Some(replica_num) = self.replica_num {
            context.replica_num = replica_num;
        }
        if let Some(exec_time) = self.exec_time {
            context.exec_time = exec_time;
        }
        if let Some(keys) = self.keys_per_partition {
            context.keys_per_partition = keys;
        }
        if let Some(keys) = self.keys_per_transaction {
            context.keys_per_transaction = keys;
        }
        if let Some(ratio) = self.read_ratio {
            context.read_ratio = ratio;
        }
        if let Some(ratio) = self.cross_ratio {
            context.cross_ratio = ratio;
        }
        if let Some(theta) = self.zipf_theta {
            context.zipf_theta = theta;
        }
        if let Some(flag) = self.operation_replication {
            context.operation_replication = flag;
        }
    }
}
