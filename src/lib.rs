//! A multi-version concurrency control transactional memory kernel.
//!
//! Provides lock-free MVCC version chains with epoch-based garbage
//! collection, a per-transaction optimistic commit protocol with an
//! opacity-preserving variant, and a pessimistic transactional queue for
//! strict FIFO access. Concrete data-structure adapters beyond the builtin
//! `Cell<T>` and `Queue<T>`, durability, and distributed coordination are
//! out of scope; see `Adapter` in `item` for the contract external adapters
//! implement.

extern crate crossbeam_epoch as epoch;

pub mod error;
pub mod item;
pub mod object;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod tid;
pub mod transaction;
pub mod version;

pub use error::{Error, TxResult};
pub use item::{AdapterObject, CommitView, ItemFlags, TransactionItem};
pub use object::MvccObject;
pub use queue::Queue;
pub use registry::{GcTarget, Registry, RegistryHandle, ThreadRtid};
pub use runtime::Runtime;
pub use tid::{epoch_of, CommitTid, EpochService};
pub use transaction::{Cell, IsolationMode, TransactionContext, TxState};
pub use version::{status, Version};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// End-to-end scenario 1 (iterator-vs-writer style write/delete
    /// interleaving): a later start-tid reader that tries to commit after a
    /// concurrent writer has already published must abort, and commit-tids
    /// stay strictly ordered by actual commit order.
    #[test]
    fn concurrent_writer_forces_late_committer_to_abort() {
        let rt = Runtime::new();
        let k = Cell::new(1u32);
        let k3 = Cell::new(3u32);

        let mut t1 = TransactionContext::begin(&rt);
        k.write(&mut t1, 1);
        k3.write(&mut t1, 3);
        assert!(t1.try_commit());
        let commit_t1 = t1.commit_tid().unwrap();

        // T3 starts observing k3 before T2 deletes it.
        let mut t3 = TransactionContext::begin(&rt);
        let _ = k3.read(&mut t3);

        let mut t2 = TransactionContext::begin(&rt);
        let _ = k3.read(&mut t2);
        k3.write(&mut t2, 0);
        assert!(t2.try_commit());
        let commit_t2 = t2.commit_tid().unwrap();

        k3.write(&mut t3, 99);
        assert!(!t3.try_commit());
        assert!(commit_t1 < commit_t2);
    }

    /// End-to-end scenario 2: a reader that spans several cells aborts at
    /// commit if a concurrent writer beat it to one of the cells it read.
    #[test]
    fn reader_over_array_aborts_on_concurrent_write() {
        let rt = Runtime::new();
        let cells: Vec<_> = (0..10u32).map(Cell::new).collect();

        let mut reader = TransactionContext::begin(&rt);
        let mut max = 0u32;
        for c in &cells {
            max = max.max(c.read(&mut reader));
        }

        let mut writer = TransactionContext::begin(&rt);
        cells[4].write(&mut writer, 10);
        assert!(writer.try_commit());

        assert_eq!(max, 9);
        // Reader's write set is empty, but it still must re-validate cell[4]
        // at commit since it read it.
        assert!(!reader.try_commit());
    }

    /// End-to-end scenario 5: two read-only transactions on the same cell
    /// both succeed; a writer that commits while a third transaction still
    /// holds a read on the same cell forces that reader to abort.
    #[test]
    fn concurrent_readers_then_writer_aborts_reader() {
        let rt = Runtime::new();
        let cell = Cell::new(5u32);

        let mut r1 = TransactionContext::begin(&rt);
        let _ = cell.read(&mut r1);
        let mut r2 = TransactionContext::begin(&rt);
        let _ = cell.read(&mut r2);
        assert!(r1.try_commit());
        assert!(r2.try_commit());

        let mut r3 = TransactionContext::begin(&rt);
        let _ = cell.read(&mut r3);
        let mut w = TransactionContext::begin(&rt);
        cell.write(&mut w, 6);
        assert!(w.try_commit());
        assert!(!r3.try_commit());
    }

    #[test]
    fn threads_racing_on_one_cell_exactly_one_wins_per_round() {
        let rt = Runtime::new();
        let cell = Cell::new(0u32);
        let rounds: u32 = 20;

        for round in 0..rounds {
            let barrier = Arc::new(std::sync::Barrier::new(4));
            let handles: Vec<_> = (0..4u32)
                .map(|n| {
                    let rt = rt.clone();
                    let cell = cell.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        let mut txn = TransactionContext::begin(&rt);
                        let _ = cell.read(&mut txn);
                        cell.write(&mut txn, round * 10 + n);
                        txn.try_commit()
                    })
                })
                .collect();
            let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(results.iter().filter(|&&ok| ok).count(), 1);
        }
    }
}
