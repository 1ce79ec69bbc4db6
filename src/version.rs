//! Version Record (spec §3, §4.2): a single node in a per-object version
//! chain.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Shared};

use crate::tid::CommitTid;

/// Status bits a [`Version`] can carry. Legal combinations are `PENDING`,
/// `COMMITTED`, `PENDING | DELETED`, `COMMITTED | DELETED`, and `ABORTED`
/// (mutually exclusive with everything else) — see spec §3.
pub mod status {
    pub const PENDING: u8 = 0b0_0001;
    pub const COMMITTED: u8 = 0b0_0010;
    pub const DELETED: u8 = 0b0_0100;
    pub const ABORTED: u8 = 0b0_1000;
    /// Commutative-combiner update pending flattening (spec §9 DELTA).
    pub const DELTA: u8 = 0b1_0000;
}

/// One node in a version chain. `wtid` is conceptually immutable once the
/// node is published (reachable from a reader's perspective at `COMMITTED`),
/// but is written twice during the commit protocol before that point: once
/// with the transaction's start-tid as a conservative placeholder at
/// construction time (used by [`crate::object::MvccObject::cp_lock`]'s
/// `prev.rtid <= tid` check during the Lock phase, which runs before the
/// real commit-tid exists — see DESIGN.md), and once with the real
/// commit-tid during the Assign-commit-tid phase. Both writes happen from
/// the single owning transaction before any CAS makes the *next* write
/// visible, so no torn read is observable.
pub struct Version<T> {
    wtid: AtomicU64,
    rtid: AtomicU64,
    status: AtomicU8,
    prev: Atomic<Version<T>>,
    value: T,
}

impl<T> Version<T> {
    /// Constructs the always-visible initial version of a fresh object,
    /// already committed at tid 0.
    pub fn initial(value: T) -> Version<T> {
        Version {
            wtid: AtomicU64::new(0),
            rtid: AtomicU64::new(0),
            status: AtomicU8::new(status::COMMITTED),
            prev: Atomic::null(),
            value,
        }
    }

    /// Constructs a fresh `PENDING` version with `placeholder_tid` as its
    /// provisional write-tid. `prev` must be the chain's current head at the
    /// time of construction; [`MvccObject::cp_lock`](crate::object::MvccObject::cp_lock)
    /// will fail if the head has moved since.
    pub fn new_pending(placeholder_tid: CommitTid, value: T) -> Version<T> {
        Version {
            wtid: AtomicU64::new(placeholder_tid.raw()),
            rtid: AtomicU64::new(placeholder_tid.raw()),
            status: AtomicU8::new(status::PENDING),
            prev: Atomic::null(),
            value,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn wtid(&self) -> CommitTid {
        CommitTid::from_raw(self.wtid.load(Ordering::Acquire))
    }

    pub fn rtid(&self) -> CommitTid {
        CommitTid::from_raw(self.rtid.load(Ordering::Acquire))
    }

    pub fn status(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    pub fn has_status(&self, bits: u8) -> bool {
        self.status() & bits == bits
    }

    pub fn is_pending(&self) -> bool {
        self.has_status(status::PENDING)
    }

    pub fn is_committed(&self) -> bool {
        self.has_status(status::COMMITTED)
    }

    pub fn is_aborted(&self) -> bool {
        self.has_status(status::ABORTED)
    }

    pub fn is_delta(&self) -> bool {
        self.has_status(status::DELTA)
    }

    /// Stamps the real commit-tid, overwriting the placeholder set at
    /// construction. Only valid while `PENDING` and only ever called by the
    /// owning transaction, single-threaded with respect to this node.
    pub(crate) fn stamp_commit_tid(&self, tid: CommitTid) {
        debug_assert!(self.is_pending(), "commit-tid stamped onto a non-pending version");
        self.wtid.store(tid.raw(), Ordering::Release);
    }

    /// `set_prev` (spec §4.2): allowed only while `PENDING`; fails if
    /// `p.wtid > self.wtid`.
    pub(crate) fn set_prev<'g>(&self, guard: &'g Guard, p: Shared<'g, Version<T>>) -> bool {
        if !self.is_pending() {
            return false;
        }
        if !p.is_null() {
            let prev_wtid = unsafe { p.deref() }.wtid();
            if prev_wtid > self.wtid() {
                return false;
            }
        }
        self.prev.store(p, Ordering::Release);
        let _ = guard;
        true
    }

    pub(crate) fn prev<'g>(&self, guard: &'g Guard) -> Shared<'g, Version<T>> {
        self.prev.load(Ordering::Acquire, guard)
    }

    /// CAS on the `prev` link. Used by [`crate::registry`]'s GC sweep to
    /// detach the reclaimable tail of a chain (spec §4.5 step 3).
    pub(crate) fn cas_prev<'g>(
        &self,
        guard: &'g Guard,
        current: Shared<'g, Version<T>>,
        new: Shared<'g, Version<T>>,
    ) -> Result<(), ()> {
        self.prev
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
            .map(|_| ())
            .map_err(|_| ())
    }

    /// `bump_rtid` (spec §4.2): monotone CAS, retried on contention.
    pub(crate) fn bump_rtid(&self, new: CommitTid) {
        let mut observed = self.rtid.load(Ordering::Acquire);
        loop {
            if observed >= new.raw() {
                return;
            }
            match self.rtid.compare_exchange_weak(
                observed,
                new.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => observed = actual,
            }
        }
    }

    /// `commit` (spec §4.2): sets `COMMITTED`, preserving `DELETED`; no
    /// effect on `ABORTED`.
    pub(crate) fn commit(&self) {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current & status::ABORTED != 0 {
                return;
            }
            let next = status::COMMITTED | (current & !status::PENDING);
            match self.status.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// `abort` (spec §4.2): sets `ABORTED`; no effect if already `COMMITTED`.
    pub(crate) fn abort(&self) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current & status::COMMITTED != 0 {
                return false;
            }
            match self.status.compare_exchange_weak(
                current,
                status::ABORTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// `mark_deleted` (spec §4.2): adds `DELETED` unless `ABORTED`.
    pub(crate) fn mark_deleted(&self) {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current & status::ABORTED != 0 {
                return;
            }
            let next = current | status::DELETED;
            if next == current {
                return;
            }
            match self.status.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// `wait_if_pending` (spec §4.2): spins until the status is no longer
    /// `PENDING`, backing off under contention.
    pub(crate) fn wait_if_pending(&self) {
        let backoff = crossbeam_utils::Backoff::new();
        while self.is_pending() {
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }
}

impl<T> Drop for Version<T> {
    fn drop(&mut self) {
        // The chain, not individual nodes, owns destruction order; GC is
        // responsible for detaching `prev` links before a node is dropped,
        // so we must not follow `prev` here (it may already be dangling by
        // the time a deferred drop runs).
        let guard = unsafe { epoch::unprotected() };
        self.prev.store(Shared::null(), Ordering::Relaxed);
        let _ = guard;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_preserves_deleted() {
        let v = Version::new_pending(CommitTid::from_raw(1), 0u32);
        v.mark_deleted();
        v.commit();
        assert!(v.is_committed());
        assert!(v.has_status(status::DELETED));
    }

    #[test]
    fn abort_is_terminal_and_ignores_commit() {
        let v = Version::new_pending(CommitTid::from_raw(1), 0u32);
        assert!(v.abort());
        v.commit();
        assert!(v.is_aborted());
        assert!(!v.is_committed());
    }

    #[test]
    fn commit_blocks_later_abort() {
        let v = Version::new_pending(CommitTid::from_raw(1), 0u32);
        v.commit();
        assert!(!v.abort());
        assert!(v.is_committed());
    }

    #[test]
    fn bump_rtid_is_monotone() {
        let v = Version::new_pending(CommitTid::from_raw(5), 0u32);
        v.bump_rtid(CommitTid::from_raw(10));
        v.bump_rtid(CommitTid::from_raw(3));
        assert_eq!(v.rtid(), CommitTid::from_raw(10));
    }
}
