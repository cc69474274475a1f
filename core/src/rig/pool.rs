//! Bounded worker pool for node-parallel operations.
//!
//! `run_bounded` runs a closure over every item on at most `max_workers`
//! scoped threads. Each item has its own result channel, so one node's failure
//! never hides another's result, and results come back in item order.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Mutex};

/// Apply `f` to every item with bounded parallelism; results in input order.
///
/// `f` receives the item's index. A panicking call yields no result for its
/// item, which is reported as `None`.
pub fn run_bounded<T, R, F>(items: Vec<T>, max_workers: usize, f: F) -> Vec<Option<R>>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let workers = max_workers.max(1).min(items.len());

    let mut receivers = Vec::with_capacity(items.len());
    let mut queue = VecDeque::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let (sender, receiver) = mpsc::channel();
        receivers.push(receiver);
        queue.push_back((index, item, sender));
    }
    let queue = Mutex::new(queue);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let next = queue
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .pop_front();
                let (index, item, sender) = match next {
                    Some(job) => job,
                    None => break,
                };
                match panic::catch_unwind(AssertUnwindSafe(|| f(index, item))) {
                    Ok(result) => {
                        let _ = sender.send(result);
                    }
                    Err(_) => log::error!("worker for item {} panicked", index),
                }
            });
        }
    });

    receivers.into_iter().map(|r| r.recv().ok()).collect()
}
