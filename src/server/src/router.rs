use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use message::Message;
use tracing::info;

/// In-process reference transport: moves whole framed messages from every
/// worker's outbound queue to the destination worker's inbound queue, using
/// the routing fields of the message header. A socket transport would do
/// exactly this across machines.
pub struct Router {
    out_queues: Vec<Arc<SegQueue<Message>>>,
    in_queues: Vec<Vec<Arc<SegQueue<Message>>>>,
    stop_flag: Arc<AtomicBool>,
    n_routed: AtomicUsize,
}

impl Router {
    pub fn new(
        out_queues: Vec<Arc<SegQueue<Message>>>,
        in_queues: Vec<Vec<Arc<SegQueue<Message>>>>,
        stop_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            out_queues,
            in_queues,
            stop_flag,
            n_routed: AtomicUsize::new(0),
        }
    }

    fn sweep(&self) -> usize {
        let mut moved = 0;
        for queue in &self.out_queues {
            while let Some(msg) = queue.pop() {
                let dest = msg.dest_node();
                let worker = msg.worker_id();
                self.in_queues[dest][worker].push(msg);
                moved += 1;
            }
        }
        moved
    }

    pub fn start(&self) {
        loop {
            let moved = self.sweep();
            self.n_routed.fetch_add(moved, Ordering::Relaxed);
            if moved == 0 {
                if self.stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                std::thread::yield_now();
            }
        }
        info!("router exits, {} messages routed", self.n_routed.load(Ordering::Relaxed));
    }
}
