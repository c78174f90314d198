use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use engine::ExecutorStatus;
use tracing::info;

/// Single-producer phase barrier. Coordinator 0's main thread owns the
/// transitions C_PHASE -> STOP -> S_PHASE -> STOP -> ... and EXIT; every
/// worker observes the status atomic in a yield-spin and reports progress
/// through the started/complete counters.
pub struct Manager {
    pub worker_status: Arc<AtomicU32>,
    pub n_started_workers: Arc<AtomicU32>,
    pub n_complete_workers: Arc<AtomicU32>,
    stop_flag: Arc<AtomicBool>,
    // every worker in the cluster participates in the barrier
    n_total_workers: u32,
    // only coordinator 0's workers generate work in the c-phase
    n_master_workers: u32,
}

impl Manager {
    pub fn new(stop_flag: Arc<AtomicBool>, n_total_workers: u32, n_master_workers: u32) -> Self {
        Self {
            worker_status: Arc::new(AtomicU32::new(ExecutorStatus::Stop as u32)),
            n_started_workers: Arc::new(AtomicU32::new(0)),
            n_complete_workers: Arc::new(AtomicU32::new(0)),
            stop_flag,
            n_total_workers,
            n_master_workers,
        }
    }

    fn wait_started(&self, expected: u32) {
        while self.n_started_workers.load(Ordering::Acquire) < expected {
            std::thread::yield_now();
        }
    }

    fn wait_complete(&self, expected: u32) {
        while self.n_complete_workers.load(Ordering::Acquire) < expected {
            std::thread::yield_now();
        }
    }

    fn set_status(&self, status: ExecutorStatus) {
        self.worker_status.store(status as u32, Ordering::Release);
    }

    pub fn start(&self) {
        info!("phase manager starts");
        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                self.set_status(ExecutorStatus::Exit);
                break;
            }

            // c-phase: coordinator 0 generates cross-partition work, the
            // other nodes drain replication until STOP
            self.n_started_workers.store(0, Ordering::Release);
            self.n_complete_workers.store(0, Ordering::Release);
            self.set_status(ExecutorStatus::CPhase);
            self.wait_started(self.n_total_workers);
            self.wait_complete(self.n_master_workers);
            self.set_status(ExecutorStatus::Stop);
            self.wait_complete(self.n_total_workers);

            // s-phase: every coordinator runs single-partition work
            self.n_started_workers.store(0, Ordering::Release);
            self.n_complete_workers.store(0, Ordering::Release);
            self.set_status(ExecutorStatus::SPhase);
            self.wait_started(self.n_total_workers);
            self.wait_complete(self.n_total_workers);

            // replication drain after the s-phase; the counter restarts so
            // the drain gets its own completion round
            self.n_complete_workers.store(0, Ordering::Release);
            self.set_status(ExecutorStatus::Stop);
            self.wait_complete(self.n_total_workers);
        }
        info!("phase manager exits");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // the worker side of the barrier, stripped of transaction work
    fn worker_loop(manager: &Manager, coordinator_id: usize) -> (u32, u32) {
        let mut c_phases = 0;
        let mut s_phases = 0;
        loop {
            loop {
                match ExecutorStatus::from_u32(manager.worker_status.load(Ordering::Acquire)) {
                    ExecutorStatus::Exit => return (c_phases, s_phases),
                    ExecutorStatus::CPhase => break,
                    _ => std::thread::yield_now(),
                }
            }

            if coordinator_id == 0 {
                manager.n_started_workers.fetch_add(1, Ordering::AcqRel);
                c_phases += 1;
                manager.n_complete_workers.fetch_add(1, Ordering::AcqRel);
            } else {
                manager.n_started_workers.fetch_add(1, Ordering::AcqRel);
                while ExecutorStatus::from_u32(manager.worker_status.load(Ordering::Acquire))
                    != ExecutorStatus::Stop
                {
                    std::thread::yield_now();
                }
                manager.n_complete_workers.fetch_add(1, Ordering::AcqRel);
            }

            while ExecutorStatus::from_u32(manager.worker_status.load(Ordering::Acquire))
                != ExecutorStatus::SPhase
            {
                std::thread::yield_now();
            }
            manager.n_started_workers.fetch_add(1, Ordering::AcqRel);
            s_phases += 1;
            manager.n_complete_workers.fetch_add(1, Ordering::AcqRel);

            while ExecutorStatus::from_u32(manager.worker_status.load(Ordering::Acquire))
                != ExecutorStatus::Stop
            {
                std::thread::yield_now();
            }
            manager.n_complete_workers.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[test]
    fn phase_cycle_runs_each_phase_once_per_round() {
        let stop = Arc::new(AtomicBool::new(false));
        // two workers on coordinator 0, one remote worker
        let manager = Arc::new(Manager::new(stop.clone(), 3, 2));

        let mut handles = Vec::new();
        for coordinator in [0usize, 0, 1] {
            let manager = manager.clone();
            handles.push(std::thread::spawn(move || worker_loop(&manager, coordinator)));
        }

        let driver = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.start())
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        driver.join().unwrap();

        let results: Vec<(u32, u32)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // coordinator 0's workers ran the c-phase, everyone ran the s-phase
        assert_eq!(results[0].0, results[1].0);
        assert!(results[0].0 >= 1);
        assert_eq!(results[2].0, 0);
        let rounds = results[0].0;
        for (_, s) in &results {
            assert_eq!(*s, rounds);
        }
        assert_eq!(
            ExecutorStatus::from_u32(manager.worker_status.load(Ordering::Acquire)),
            ExecutorStatus::Exit
        );
        // the last transition to STOP saw every worker complete
        assert_eq!(manager.n_complete_workers.load(Ordering::Acquire), 3);
    }
}
