use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use aria::executor::{AriaExecutor, AriaManager};
use aria::AriaState;
use common::config::Context;
use crossbeam_queue::SegQueue;
use engine::executor::Executor;
use engine::partitioner::{HashReplicatedPartitioner, Partitioner};
use engine::protocol::Protocol;
use engine::worker::WorkerStats;
use message::Message;
use rstore::executor::RStoreExecutor;
use rstore::manager::Manager;
use scar::Scar;
use silo::Silo;
use storage::Database;
use tracing::info;
use twopl::TwoPL;
use ycsb::YcsbWorkload;

pub mod router;

use router::Router;

/// Aggregate outcome counters for one run.
#[derive(Debug, Default, Clone, Copy)]
pub struct Summary {
    pub n_commit: u64,
    pub n_abort_lock: u64,
    pub n_abort_read_validation: u64,
    pub n_abort_no_retry: u64,
    pub n_network_size: u64,
}

impl Summary {
    fn collect(stats: &[Arc<WorkerStats>]) -> Self {
        let mut summary = Summary::default();
        for s in stats {
            summary.n_commit += s.n_commit.load(Ordering::Relaxed);
            summary.n_abort_lock += s.n_abort_lock.load(Ordering::Relaxed);
            summary.n_abort_read_validation += s.n_abort_read_validation.load(Ordering::Relaxed);
            summary.n_abort_no_retry += s.n_abort_no_retry.load(Ordering::Relaxed);
            summary.n_network_size += s.n_network_size.load(Ordering::Relaxed);
        }
        summary
    }
}

struct ClusterQueues {
    in_queues: Vec<Vec<Arc<SegQueue<Message>>>>,
    out_queues: Vec<Vec<Arc<SegQueue<Message>>>>,
}

fn build_queues(context: &Context) -> ClusterQueues {
    let make = |_: usize| -> Vec<Arc<SegQueue<Message>>> {
        (0..context.worker_num)
            .map(|_| Arc::new(SegQueue::new()))
            .collect()
    };
    ClusterQueues {
        in_queues: (0..context.coordinator_num).map(make).collect(),
        out_queues: (0..context.coordinator_num).map(make).collect(),
    }
}

fn flat(queues: &[Vec<Arc<SegQueue<Message>>>]) -> Vec<Arc<SegQueue<Message>>> {
    queues.iter().flatten().cloned().collect()
}

/// Runs the whole cluster in this process for `context.exec_time` seconds.
/// Every coordinator in `server_addrs` gets its own database replica and
/// worker threads; the router plays the transport.
pub fn run(context: Context) -> anyhow::Result<Summary> {
    info!(
        "starting {} with {} coordinators, {} workers each, {} partitions",
        context.protocol, context.coordinator_num, context.worker_num, context.partition_num
    );
    match context.protocol.as_str() {
        "Silo" => run_workers(context, Silo::new),
        "Scar" => run_workers(context, Scar::new),
        "TwoPL" => run_workers(context, TwoPL::new),
        "RStore" => run_rstore(context),
        "Aria" => run_aria(context),
        other => bail!("unknown protocol {}", other),
    }
}

fn run_workers<P: Protocol>(
    context: Context,
    new_protocol: fn(Arc<Database>, Context, Arc<dyn Partitioner>) -> P,
) -> anyhow::Result<Summary> {
    if context.partition_num % context.coordinator_num != 0 {
        bail!("partition_num must divide evenly across coordinators");
    }

    let stop_flag = Arc::new(AtomicBool::new(false));
    // workers keep serving peer requests between stop and shutdown so that
    // nobody is left waiting on a response that will never come
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let queues = build_queues(&context);
    let mut stats: Vec<Arc<WorkerStats>> = Vec::new();
    let mut handles = Vec::new();

    for coordinator_id in 0..context.coordinator_num {
        let db = Arc::new(ycsb::load_database(&context));
        for id in 0..context.worker_num {
            let partitioner: Arc<dyn Partitioner> = Arc::new(HashReplicatedPartitioner::new(
                coordinator_id,
                context.coordinator_num,
                context.replica_num,
            ));
            let worker_stats = Arc::new(WorkerStats::new());
            stats.push(worker_stats.clone());
            let mut executor = Executor::new(
                coordinator_id,
                id,
                db.clone(),
                context.clone(),
                stop_flag.clone(),
                new_protocol(db.clone(), context.clone(), partitioner),
                YcsbWorkload::new(coordinator_id, id),
                worker_stats,
                queues.in_queues[coordinator_id][id].clone(),
                queues.out_queues[coordinator_id][id].clone(),
            );
            let shutdown_flag = shutdown_flag.clone();
            handles.push(std::thread::spawn(move || {
                executor.start();
                while !shutdown_flag.load(Ordering::Relaxed) {
                    executor.process_request();
                    std::thread::yield_now();
                }
            }));
        }
    }

    let router = Arc::new(Router::new(
        flat(&queues.out_queues),
        queues.in_queues.clone(),
        shutdown_flag.clone(),
    ));
    let router_handle = {
        let router = router.clone();
        std::thread::spawn(move || router.start())
    };

    std::thread::sleep(Duration::from_secs(context.exec_time));
    stop_flag.store(true, Ordering::Relaxed);
    // grace period for in-flight commit rounds to drain
    std::thread::sleep(Duration::from_millis(500));
    shutdown_flag.store(true, Ordering::Relaxed);

    for handle in handles {
        handle.join().expect("worker thread panicked");
    }
    router_handle.join().expect("router thread panicked");

    finish(&context, &stats)
}

fn run_rstore(context: Context) -> anyhow::Result<Summary> {
    if context.partition_num % context.worker_num != 0 {
        bail!("rstore needs partition_num to divide across workers");
    }
    if context.partition_num % context.coordinator_num != 0 {
        bail!("partition_num must divide evenly across coordinators");
    }

    let stop_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let queues = build_queues(&context);
    let manager = Arc::new(Manager::new(
        stop_flag.clone(),
        context.total_worker_num() as u32,
        context.worker_num as u32,
    ));
    let mut stats: Vec<Arc<WorkerStats>> = Vec::new();
    let mut handles = Vec::new();

    for coordinator_id in 0..context.coordinator_num {
        let db = Arc::new(ycsb::load_database(&context));
        for id in 0..context.worker_num {
            let worker_stats = Arc::new(WorkerStats::new());
            stats.push(worker_stats.clone());
            let mut executor = RStoreExecutor::new(
                coordinator_id,
                id,
                db.clone(),
                context.clone(),
                manager.worker_status.clone(),
                manager.n_complete_workers.clone(),
                manager.n_started_workers.clone(),
                YcsbWorkload::new(coordinator_id, id),
                worker_stats,
                queues.in_queues[coordinator_id][id].clone(),
                queues.out_queues[coordinator_id][id].clone(),
            );
            handles.push(std::thread::spawn(move || executor.start()));
        }
    }

    let router = Arc::new(Router::new(
        flat(&queues.out_queues),
        queues.in_queues.clone(),
        shutdown_flag.clone(),
    ));
    let router_handle = {
        let router = router.clone();
        std::thread::spawn(move || router.start())
    };

    let timer = {
        let stop_flag = stop_flag.clone();
        let exec_time = context.exec_time;
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(exec_time));
            stop_flag.store(true, Ordering::Relaxed);
        })
    };

    // the phase manager runs on the coordinator main thread
    manager.start();

    timer.join().expect("timer thread panicked");
    for handle in handles {
        handle.join().expect("worker thread panicked");
    }
    shutdown_flag.store(true, Ordering::Relaxed);
    router_handle.join().expect("router thread panicked");

    finish(&context, &stats)
}

fn run_aria(context: Context) -> anyhow::Result<Summary> {
    if context.coordinator_num != 1 {
        // deterministic batches exchange no messages; aria runs node-local
        bail!("aria runs on a single coordinator");
    }
    if context.n_lock_manager == 0 || context.n_lock_manager > context.worker_num {
        bail!("n_lock_manager must be in 1..=worker_num");
    }

    let stop_flag = Arc::new(AtomicBool::new(false));
    let state = Arc::new(AriaState::new());
    let db = Arc::new(ycsb::load_database(&context));
    let mut stats: Vec<Arc<WorkerStats>> = Vec::new();
    let mut handles = Vec::new();

    for id in 0..context.worker_num {
        let worker_stats = Arc::new(WorkerStats::new());
        stats.push(worker_stats.clone());
        let mut executor = AriaExecutor::new(
            0,
            id,
            db.clone(),
            context.clone(),
            state.clone(),
            YcsbWorkload::new(0, id),
            worker_stats,
        );
        handles.push(std::thread::spawn(move || executor.start()));
    }

    let timer = {
        let stop_flag = stop_flag.clone();
        let exec_time = context.exec_time;
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(exec_time));
            stop_flag.store(true, Ordering::Relaxed);
        })
    };

    let manager = AriaManager::new(state, stop_flag, context.worker_num as u32);
    manager.start();

    timer.join().expect("timer thread panicked");
    for handle in handles {
        handle.join().expect("worker thread panicked");
    }

    finish(&context, &stats)
}

fn finish(context: &Context, stats: &[Arc<WorkerStats>]) -> anyhow::Result<Summary> {
    let summary = Summary::collect(stats);
    info!(
        "{}: {} commits ({:.0} txn/s), {} lock aborts, {} validation aborts, {} no-retry aborts, {} bytes sent",
        context.protocol,
        summary.n_commit,
        summary.n_commit as f64 / context.exec_time.max(1) as f64,
        summary.n_abort_lock,
        summary.n_abort_read_validation,
        summary.n_abort_no_retry,
        summary.n_network_size
    );
    Ok(summary)
}
