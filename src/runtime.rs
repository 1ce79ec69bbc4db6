//! Runtime handle bundling the epoch service and the GC registry.
//!
//! Spec.md's Design Notes (§9) call global mutable state (the Registry and
//! Timestamp Service) out as something a systems-language reimplementation
//! should prefer to thread through explicitly rather than hide behind
//! statics. `Runtime` is that explicit handle: a host constructs one and
//! passes `&Runtime` to every [`crate::TransactionContext::begin`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::registry::{Registry, ThreadRtid};
use crate::tid::{CommitTid, EpochService};

/// Owns one [`EpochService`] and one [`Registry`], and optionally a
/// background thread that advances the epoch on a fixed interval.
pub struct Runtime {
    epochs: EpochService,
    registry: Registry,
    advancer: OnceLock<EpochAdvancer>,
}

struct EpochAdvancer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for EpochAdvancer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Runtime {
    /// Builds a runtime with no background epoch advancer; callers must
    /// invoke [`Runtime::advance_epoch_once`] themselves (e.g. from an
    /// embedding application's own housekeeping loop).
    pub fn new() -> Arc<Runtime> {
        Arc::new(Runtime {
            epochs: EpochService::new(),
            registry: Registry::new(),
            advancer: OnceLock::new(),
        })
    }

    /// Builds a runtime with a background thread that advances the epoch
    /// every `interval` and runs a GC sweep right after. The thread is
    /// joined when the `Runtime` is dropped.
    pub fn with_epoch_advancer(interval: Duration) -> Arc<Runtime> {
        let rt = Runtime::new();
        let stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(&rt);
        let stop_clone = stop.clone();
        let handle = std::thread::Builder::new()
            .name("stm-epoch-advancer".into())
            .spawn(move || {
                while !stop_clone.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    match weak.upgrade() {
                        Some(rt) => rt.advance_epoch_once(),
                        None => break,
                    }
                }
            })
            .expect("failed to spawn epoch advancer thread");
        let _ = rt.advancer.set(EpochAdvancer { stop, handle: Some(handle) });
        rt
    }

    pub fn next_tid(&self) -> CommitTid {
        self.epochs.next_tid()
    }

    /// Peeks the most recently allocated tid without allocating a new one;
    /// used by opaque transactions to detect intervening commits cheaply.
    pub fn next_tid_peek(&self) -> CommitTid {
        self.epochs.last_tid()
    }

    pub fn current_epoch(&self) -> u64 {
        self.epochs.current_epoch()
    }

    /// Advances the process epoch once and runs a GC sweep, per spec §4.1
    /// ("invoked periodically ... and once on demand").
    pub fn advance_epoch_once(&self) {
        self.epochs.advance_epoch_once();
        self.registry.run_gc_cycle(self.epochs.next_tid());
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Lazily registers the calling thread's rtid slot with this runtime's
    /// registry and returns it. The teacher's own `Tx` holds its epoch guard
    /// for its whole lifetime (`epoch: Guard` in `crates/mvcc/src/tx.rs`);
    /// this plays the equivalent per-thread bookkeeping role for GC
    /// watermarking.
    ///
    /// Keyed by this `Runtime`'s address rather than a single process-wide
    /// slot: a thread that uses more than one `Runtime` over its lifetime
    /// (e.g. successive `Runtime::new()` calls in a loop) must get a
    /// distinct `ThreadRtid` registered with each runtime's own registry,
    /// not silently reuse whichever runtime it touched first.
    pub fn thread_rtid(&self) -> Arc<ThreadRtid> {
        let key = self as *const Runtime as usize;
        THREAD_RTIDS.with(|cell| {
            let mut slots = cell.borrow_mut();
            if let Some((_, rtid)) = slots.iter().find(|(k, _)| *k == key) {
                return rtid.clone();
            }
            let rtid = self.registry.register_thread();
            slots.push((key, rtid.clone()));
            rtid
        })
    }
}

thread_local! {
    static THREAD_RTIDS: std::cell::RefCell<Vec<(usize, Arc<ThreadRtid>)>> =
        const { std::cell::RefCell::new(Vec::new()) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_tid_and_epoch_progress() {
        let rt = Runtime::new();
        let a = rt.next_tid();
        rt.advance_epoch_once();
        let b = rt.next_tid();
        assert!(b > a);
        assert_eq!(rt.current_epoch(), 2);
    }

    #[test]
    fn background_advancer_joins_on_drop() {
        let rt = Runtime::with_epoch_advancer(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(30));
        assert!(rt.current_epoch() > 1);
        drop(rt);
    }
}
