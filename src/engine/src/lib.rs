pub mod executor;
pub mod partitioner;
pub mod protocol;
pub mod replication;
pub mod rwkey;
pub mod tid;
pub mod transaction;
pub mod worker;

use common::config::Context;
use common::random::Random;

use crate::transaction::Transaction;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionResult {
    ReadyToCommit,
    Abort,
    AbortNoRetry,
}

/// Phase barrier states shared between the coordinator main thread and the
/// phase-driven executors (RStore and Aria).
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorStatus {
    Stop = 0,
    CPhase = 1,
    SPhase = 2,
    AriaRead = 3,
    AriaCommit = 4,
    AriaFallback = 5,
    Exit = 6,
}

impl ExecutorStatus {
    pub fn from_u32(status: u32) -> ExecutorStatus {
        match status {
            0 => ExecutorStatus::Stop,
            1 => ExecutorStatus::CPhase,
            2 => ExecutorStatus::SPhase,
            3 => ExecutorStatus::AriaRead,
            4 => ExecutorStatus::AriaCommit,
            5 => ExecutorStatus::AriaFallback,
            6 => ExecutorStatus::Exit,
            _ => unreachable!("unknown executor status {}", status),
        }
    }
}

/// Workload-facing contract: hand the executor the next transaction scoped
/// to a partition this coordinator masters. Generators draw exclusively
/// from `random` so a restored seed replays the same transaction.
pub trait Workload: Send {
    fn next_transaction(
        &mut self,
        context: &Context,
        partition_id: usize,
        random: &mut Random,
    ) -> Transaction;
}
