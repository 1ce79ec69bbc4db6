//! Randomized stress test for the pessimistic queue (spec §4.6, "Queue
//! FIFO" testable property in spec §8), in the spirit of the teacher's own
//! `benchmarks/stress2` randomized workload generator.

use std::sync::Arc;
use std::thread;

use rand::Rng;

use stm_core::{Queue, Runtime, TransactionContext};

/// Many threads race to push randomly-sized batches onto one queue (each
/// push contends for the queue's single pessimistic lock and retries on
/// conflict via the `retry!` boundary); afterward, draining the queue in
/// one transaction must yield exactly as many values as were pushed, with
/// no loss or duplication — the FIFO-safety half of spec §8's "Queue FIFO"
/// property.
#[test]
fn concurrent_pushers_lose_no_items_and_drain_is_exhaustive() {
    let rt = Runtime::new();
    let queue: Arc<Queue<u32>> = Queue::new(10_000);
    let threads: usize = 6;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let rt = Arc::clone(&rt);
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let batch: usize = rng.gen_range(5..20);
                for i in 0..batch {
                    let value = (t * 1000 + i) as u32;
                    stm_core::retry!(&rt, |txn| {
                        queue.push(&mut txn, value);
                        Ok(())
                    });
                }
                batch
            })
        })
        .collect();

    let total_pushed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    // All pusher threads have joined, so draining here is single-threaded:
    // no concurrent transaction can hold the queue's lock, and pop cannot
    // abort.
    let mut drained = 0usize;
    loop {
        let mut txn = TransactionContext::begin(&rt);
        let popped = queue.pop(&mut txn).expect("uncontended pop never errors");
        assert!(txn.try_commit());
        match popped {
            Some(_) => drained += 1,
            None => break,
        }
    }

    assert_eq!(drained, total_pushed);
}
