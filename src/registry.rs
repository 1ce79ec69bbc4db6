//! MVCC Registry & GC (spec §4.5): the process-wide list of live version
//! chains and the periodic sweep that reclaims versions older than the
//! minimum active read-tid.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crossbeam_epoch::{self as epoch, Guard};

use crate::tid::CommitTid;

/// Implemented by any chain head that the registry can sweep. Kept small
/// and object-safe so the registry can hold heterogeneous chains (cells,
/// arrays, map buckets, ...) behind one `dyn GcTarget` list, mirroring the
/// "process-wide list of registry entries" spec §4.5 describes.
pub trait GcTarget: Send + Sync {
    fn gc(&self, gc_tid: CommitTid, guard: &Guard);
}

struct RegistryEntry {
    valid: AtomicBool,
    target: Weak<dyn GcTarget>,
}

/// A handle returned when an object registers with a [`Registry`]. Dropping
/// it marks the registry entry invalid, matching spec §4.5's "unregisters at
/// destruction" — the next sweep (or the registry's own bookkeeping) prunes
/// the slot.
pub struct RegistryHandle {
    entry: Arc<RegistryEntry>,
}

impl Drop for RegistryHandle {
    fn drop(&mut self) {
        self.entry.valid.store(false, Ordering::Release);
    }
}

/// Per-thread read-tid low-watermark: the smallest start-tid of any
/// currently active transaction on that thread, `None` when idle (spec
/// §4.1). A thread can have more than one transaction active at once (a
/// long-running reader with nested or sequential transactions begun on the
/// same thread while it is still open), so this tracks every active
/// start-tid, not just the most recent one; `enter`/`exit` are pushes/pops
/// rather than a single overwrite-or-clear slot.
#[derive(Debug, Default)]
pub struct ThreadRtid(Mutex<Vec<u64>>);

impl ThreadRtid {
    fn new() -> Arc<ThreadRtid> {
        Arc::new(ThreadRtid(Mutex::new(Vec::new())))
    }

    /// Records `tid` as an active start-tid on this thread.
    pub fn enter(&self, tid: CommitTid) {
        self.0.lock().unwrap().push(tid.raw());
    }

    /// Removes one occurrence of `tid` from this thread's active set,
    /// restoring the watermark to the next-lowest still-active start-tid
    /// (or idle, if none remain) rather than clearing it to zero.
    pub fn exit(&self, tid: CommitTid) {
        let mut active = self.0.lock().unwrap();
        if let Some(pos) = active.iter().rposition(|&t| t == tid.raw()) {
            active.swap_remove(pos);
        }
    }

    /// The smallest currently active start-tid on this thread, or `None` if
    /// idle.
    fn min_active(&self) -> Option<u64> {
        self.0.lock().unwrap().iter().copied().min()
    }
}

/// Process-wide concurrent list of live chains plus the set of registered
/// per-thread read-tids used to compute the GC watermark.
pub struct Registry {
    entries: RwLock<Vec<Arc<RegistryEntry>>>,
    thread_rtids: RwLock<Vec<Arc<ThreadRtid>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            entries: RwLock::new(Vec::new()),
            thread_rtids: RwLock::new(Vec::new()),
        }
    }

    /// Registers a chain head for periodic GC. The returned handle must be
    /// kept alive for as long as the chain should be swept; dropping it
    /// (or dropping the chain itself, which invalidates the `Weak`)
    /// unregisters it.
    pub fn register(&self, target: Weak<dyn GcTarget>) -> RegistryHandle {
        let entry = Arc::new(RegistryEntry {
            valid: AtomicBool::new(true),
            target,
        });
        self.entries.write().unwrap().push(entry.clone());
        RegistryHandle { entry }
    }

    /// Registers a new thread's rtid slot. Cheap enough to call once per
    /// thread lazily on first transaction begin (see
    /// [`crate::runtime::Runtime::thread_rtid`]).
    pub fn register_thread(&self) -> Arc<ThreadRtid> {
        let rtid = ThreadRtid::new();
        self.thread_rtids.write().unwrap().push(rtid.clone());
        rtid
    }

    /// Computes `gc_tid = min(active per-thread rtids, process rtid)`,
    /// ignoring idle threads, per spec §4.5 step 1.
    fn compute_gc_tid(&self) -> Option<CommitTid> {
        let rtids = self.thread_rtids.read().unwrap();
        rtids
            .iter()
            .filter_map(|r| r.min_active())
            .min()
            .map(CommitTid::from_raw)
    }

    /// Runs one GC sweep (spec §4.5). `compute_gc_tid` returns `None` only
    /// when every registered thread is idle, i.e. no transaction is active
    /// anywhere; only then is it safe to sweep every chain up to the epoch
    /// service's latest tid via `process_tid`, since nothing else constrains
    /// reclamation.
    pub fn run_gc_cycle(&self, process_tid: CommitTid) {
        let gc_tid = self.compute_gc_tid().unwrap_or(process_tid);
        log::debug!("GC cycle at gc_tid={:?}", gc_tid.raw());
        let guard = epoch::pin();
        let mut entries = self.entries.write().unwrap();
        entries.retain(|entry| {
            if !entry.valid.load(Ordering::Acquire) {
                return false;
            }
            match entry.target.upgrade() {
                Some(target) => {
                    target.gc(gc_tid, &guard);
                    true
                }
                None => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MvccObject;
    use std::sync::Arc;

    #[test]
    fn unregistering_on_drop_prunes_entry() {
        let registry = Registry::new();
        let obj: Arc<MvccObject<u32>> = Arc::new(MvccObject::new(0));
        let handle = registry.register(Arc::downgrade(&obj) as Weak<dyn GcTarget>);
        assert_eq!(registry.entries.read().unwrap().len(), 1);
        drop(handle);
        registry.run_gc_cycle(CommitTid::from_raw(100));
        assert_eq!(registry.entries.read().unwrap().len(), 0);
    }

    #[test]
    fn gc_tid_ignores_idle_threads() {
        let registry = Registry::new();
        let t1 = registry.register_thread();
        let t2 = registry.register_thread();
        t1.enter(CommitTid::from_raw(10));
        // t2 stays idle
        assert_eq!(registry.compute_gc_tid(), Some(CommitTid::from_raw(10)));
        t2.enter(CommitTid::from_raw(3));
        assert_eq!(registry.compute_gc_tid(), Some(CommitTid::from_raw(3)));
    }

    #[test]
    fn gc_tid_reflects_minimum_over_overlapping_transactions_on_one_thread() {
        let registry = Registry::new();
        let t1 = registry.register_thread();
        t1.enter(CommitTid::from_raw(5));
        t1.enter(CommitTid::from_raw(8));
        assert_eq!(registry.compute_gc_tid(), Some(CommitTid::from_raw(5)));
        // Ending the later transaction must not clobber the earlier one's
        // watermark back to idle.
        t1.exit(CommitTid::from_raw(8));
        assert_eq!(registry.compute_gc_tid(), Some(CommitTid::from_raw(5)));
        t1.exit(CommitTid::from_raw(5));
        assert_eq!(registry.compute_gc_tid(), None);
    }
}
