use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::config::Context;
use common::percentile::Percentile;
use common::random::Random;
use common::worker_seed;
use crossbeam_queue::SegQueue;
use message::{Mailbox, Message};
use storage::Database;
use tracing::info;

use crate::protocol::{process_inbound, sync_messages, Protocol};
use crate::transaction::Transaction;
use crate::worker::WorkerStats;
use crate::{TransactionResult, Workload};

/// The worker loop: generate → execute → commit/abort/retry, interleaved
/// with draining the inbound queue. One OS thread runs one executor.
pub struct Executor<P: Protocol, W: Workload> {
    pub coordinator_id: usize,
    pub id: usize,
    context: Context,
    db: Arc<Database>,
    stop_flag: Arc<AtomicBool>,
    pub random: Random,
    pub protocol: P,
    workload: W,
    pub stats: Arc<WorkerStats>,
    latency: Percentile,
    pub mailbox: Mailbox,
    transaction: Option<Transaction>,
}

impl<P: Protocol, W: Workload> Executor<P, W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator_id: usize,
        id: usize,
        db: Arc<Database>,
        context: Context,
        stop_flag: Arc<AtomicBool>,
        protocol: P,
        workload: W,
        stats: Arc<WorkerStats>,
        in_queue: Arc<SegQueue<Message>>,
        out_queue: Arc<SegQueue<Message>>,
    ) -> Self {
        let mailbox = Mailbox::new(
            coordinator_id,
            id,
            context.coordinator_num,
            in_queue,
            out_queue,
        );
        Self {
            coordinator_id,
            id,
            db,
            random: Random::new(worker_seed(coordinator_id, id)),
            context,
            stop_flag,
            protocol,
            workload,
            stats,
            latency: Percentile::new(),
            mailbox,
            transaction: None,
        }
    }

    pub fn start(&mut self) {
        info!("executor {} starts", self.id);

        let mut retry_transaction = false;

        while !self.stop_flag.load(Ordering::Relaxed) {
            self.process_request();

            let last_seed = self.random.get_seed();

            let mut transaction = if retry_transaction {
                let mut transaction = self.transaction.take().expect("no transaction to retry");
                transaction.reset();
                transaction
            } else {
                let partition_id = self.pick_partition();
                self.workload
                    .next_transaction(&self.context, partition_id, &mut self.random)
            };

            let result = self.execute(&mut transaction);
            match result {
                TransactionResult::ReadyToCommit => {
                    let committed = self.protocol.commit(&mut transaction, &mut self.mailbox);
                    self.stats
                        .n_network_size
                        .fetch_add(transaction.network_size as u64, Ordering::Relaxed);
                    if committed {
                        self.stats.n_commit.fetch_add(1, Ordering::Relaxed);
                        self.latency
                            .add(transaction.start_time.elapsed().as_micros() as u64);
                        retry_transaction = false;
                    } else {
                        if transaction.abort_lock {
                            self.stats.n_abort_lock.fetch_add(1, Ordering::Relaxed);
                        } else {
                            debug_assert!(transaction.abort_read_validation);
                            self.stats
                                .n_abort_read_validation
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        self.random.set_seed(last_seed);
                        retry_transaction = true;
                    }
                }
                TransactionResult::Abort => {
                    // access-time lock failure (2PL); locks taken so far are
                    // released before the rerun
                    self.protocol.abort(&mut transaction, &mut self.mailbox);
                    self.stats.n_abort_lock.fetch_add(1, Ordering::Relaxed);
                    self.random.set_seed(last_seed);
                    retry_transaction = true;
                }
                TransactionResult::AbortNoRetry => {
                    self.protocol.abort(&mut transaction, &mut self.mailbox);
                    self.stats.n_abort_no_retry.fetch_add(1, Ordering::Relaxed);
                    retry_transaction = false;
                }
            }
            self.transaction = Some(transaction);
        }

        self.on_exit();
    }

    fn on_exit(&mut self) {
        info!(
            "executor {} exits, latency: {}us (50%) {}us (75%) {}us (99%), {} samples",
            self.id,
            self.latency.nth(50.0),
            self.latency.nth(75.0),
            self.latency.nth(99.0),
            self.latency.size()
        );
    }

    /// Runs the transaction body and resolves its reads: local partitions
    /// are searched in place, remote ones turn into search messages awaited
    /// through the inbound pump.
    pub fn execute(&mut self, transaction: &mut Transaction) -> TransactionResult {
        let result = transaction.execute();
        if result != TransactionResult::ReadyToCommit {
            return result;
        }

        // pending reads are dequeued newest-first
        for i in (0..transaction.read_set.len()).rev() {
            if !transaction.read_set[i].get_read_request_bit() {
                break;
            }
            transaction.read_set[i].clear_read_request_bit();
            self.protocol
                .read_request(transaction, i, &mut self.mailbox);
        }
        sync_messages(
            &self.db,
            self.protocol.handlers(),
            &mut self.mailbox,
            transaction,
            true,
        );

        if transaction.abort_no_retry {
            return TransactionResult::AbortNoRetry;
        }
        if transaction.abort_lock {
            // 2PL takes its locks during execution and may fail here
            return TransactionResult::Abort;
        }
        TransactionResult::ReadyToCommit
    }

    pub fn process_request(&mut self) -> usize {
        process_inbound(
            &self.db,
            self.protocol.handlers(),
            &mut self.mailbox,
            self.transaction.as_mut(),
        )
    }

    fn pick_partition(&mut self) -> usize {
        let partition_num_per_node = self.context.partition_num_per_node();
        let i = self.random.uniform_dist(0, partition_num_per_node as u64 - 1) as usize;
        i * self.context.coordinator_num + self.coordinator_id
    }
}
