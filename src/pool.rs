use std::collections::VecDeque;
use std::sync::{Mutex, mpsc};
use std::thread;

use crate::cancel::CancelToken;

/// Runs `work` over `items` on at most `workers` scoped threads pulling from
/// one shared queue. Returns `(index, result)` pairs in completion order;
/// items not started before cancellation have no entry.
pub fn run_bounded<T, R, W>(
    items: &[T],
    workers: usize,
    cancel: &CancelToken,
    work: W,
) -> Vec<(usize, R)>
where
    T: Sync,
    R: Send,
    W: Fn(&T) -> R + Sync,
{
    let workers = workers.max(1).min(items.len());
    let queue = Mutex::new((0..items.len()).collect::<VecDeque<_>>());
    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            let work = &work;
            scope.spawn(move || {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = match queue.lock() {
                        Ok(mut queue) => queue.pop_front(),
                        Err(_) => None,
                    };
                    let Some(index) = next else {
                        break;
                    };
                    if tx.send((index, work(&items[index]))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(tx);
    rx.into_iter().collect()
}
