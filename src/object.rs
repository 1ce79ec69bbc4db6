//! MVCC Object (spec §4.3): the head of a version chain for one logical
//! cell.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::error::Error;
use crate::registry::GcTarget;
use crate::tid::CommitTid;
use crate::version::Version;

/// Head of a version chain. Reachable from `head` via `prev`, the chain is
/// totally ordered by `wtid` descending, and at least one `COMMITTED`
/// version (the tid-0 initial value) is always reachable.
pub struct MvccObject<T> {
    head: Atomic<Version<T>>,
}

impl<T: Send + Sync + 'static> MvccObject<T> {
    /// Builds a fresh object whose initial version is already committed at
    /// tid 0, as spec §3's MVCC Object invariant requires.
    pub fn new(initial: T) -> MvccObject<T> {
        MvccObject {
            head: Atomic::new(Version::initial(initial)),
        }
    }

    /// `find_visible` (spec §4.3): walks the chain from `head`, returning
    /// the first version with `wtid <= tid` and status `COMMITTED`
    /// (ignoring the `DELETED` flag for presence — callers that care about
    /// tombstones check `has_status(status::DELETED)` themselves). If
    /// `wait` is true, spins on `PENDING` nodes so the result is monotone
    /// even while a writer holds a smaller tid than `tid`.
    ///
    /// Only fails if the chain is exhausted, which implies a bug: the
    /// initial tid-0 committed version satisfies every `tid >= 0`.
    pub fn find_visible<'g>(
        &self,
        tid: CommitTid,
        wait: bool,
        guard: &'g Guard,
    ) -> Shared<'g, Version<T>> {
        let mut cur = self.head.load(Ordering::Acquire, guard);
        loop {
            if cur.is_null() {
                panic!("{}", Error::Invariant("find_visible: version chain exhausted without a visible version"));
            }
            let node = unsafe { cur.deref() };
            if wait {
                node.wait_if_pending();
            }
            if node.wtid() <= tid && node.is_committed() {
                return cur;
            }
            cur = node.prev(guard);
        }
    }

    /// Allocates a fresh `PENDING` version for a staged write, snapshotting
    /// the chain's current head as its `prev` link. The node is not yet
    /// reachable from `head`; [`cp_lock`](Self::cp_lock) publishes it during
    /// the commit protocol's Lock phase.
    pub fn stage_pending<'g>(
        &self,
        placeholder_tid: CommitTid,
        value: T,
        guard: &'g Guard,
    ) -> Owned<Version<T>> {
        let version = Version::new_pending(placeholder_tid, value);
        let current_head = self.head.load(Ordering::Acquire, guard);
        version.set_prev(guard, current_head);
        Owned::new(version)
    }

    /// `cp_lock` (spec §4.3): pre-install CAS. Requires `v.status ==
    /// PENDING` and `v.prev == current head`; CASes `head` from `v.prev` to
    /// `v`. On success, verifies `v.prev.rtid <= tid`, since otherwise the
    /// new version would retroactively invalidate a reader that already
    /// observed the prior version. Any failure aborts `v` (if it was
    /// published) or simply drops it (if the CAS itself lost).
    ///
    /// `tid` here is the transaction's start-tid, a conservative placeholder
    /// used because the Lock phase runs before the final commit-tid is
    /// allocated (spec §4.4 step 2 precedes step 3) — see DESIGN.md.
    pub fn cp_lock<'g>(
        &self,
        tid: CommitTid,
        v: Owned<Version<T>>,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Version<T>>> {
        let expected_prev = v.prev(guard);
        match self.head.compare_exchange(expected_prev, v, Ordering::AcqRel, Ordering::Acquire, guard) {
            Ok(published) => {
                if !expected_prev.is_null() {
                    let prev_node = unsafe { expected_prev.deref() };
                    if prev_node.rtid() > tid {
                        unsafe { published.deref() }.abort();
                        return None;
                    }
                }
                Some(published)
            }
            Err(err) => {
                // The CAS never took effect, so `err.new` is still solely
                // owned by us; dropping it is enough, no one else can have
                // observed it as PENDING.
                drop(err.new);
                None
            }
        }
    }

    /// `cp_check` (spec §4.3): read-set validation. Raises `observed`'s rtid
    /// high-watermark to at least `tid`, then confirms `find_visible(tid,
    /// wait=false)` still equals `observed`. If not, aborts `observed`'s
    /// writer (if any) and reports failure.
    pub fn cp_check<'g>(&self, tid: CommitTid, observed: Shared<'g, Version<T>>, guard: &'g Guard) -> bool {
        let node = unsafe { observed.deref() };
        node.bump_rtid(tid);
        let current = self.find_visible(tid, false, guard);
        current == observed
    }

    /// `cp_install` (spec §4.3): flips `v.status` from `PENDING` to
    /// `COMMITTED`. Publishable because `head` already points at `v` by the
    /// time commit is called.
    pub fn cp_install(&self, v: Shared<'_, Version<T>>) {
        unsafe { v.deref() }.commit();
    }

    /// `abort_pending` (spec §4.3): if head is `PENDING`, aborts it;
    /// otherwise a no-op.
    pub fn abort_pending(&self, guard: &Guard) {
        let head = self.head.load(Ordering::Acquire, guard);
        if !head.is_null() {
            let node = unsafe { head.deref() };
            if node.is_pending() {
                node.abort();
            }
        }
    }

    /// Reads the current head without waiting, for diagnostics/tests.
    pub fn head_raw<'g>(&self, guard: &'g Guard) -> Shared<'g, Version<T>> {
        self.head.load(Ordering::Acquire, guard)
    }
}

impl<T: Send + Sync + 'static> GcTarget for MvccObject<T> {
    /// GC cycle step (spec §4.5 steps 2-4), run by
    /// [`crate::registry::Registry`] once per sweep: walk from head to the
    /// newest version with `wtid <= gc_tid` that is `COMMITTED` and not
    /// `DELTA`, detach everything older, and defer-destroy the detached
    /// chain.
    fn gc(&self, gc_tid: CommitTid, guard: &Guard) {
        let head = self.head.load(Ordering::Acquire, guard);
        if head.is_null() {
            return;
        }
        let mut h = head;
        loop {
            let node = unsafe { h.deref() };
            let visible = node.is_committed() && !node.is_delta() && node.wtid() <= gc_tid;
            if visible {
                break;
            }
            let prev = node.prev(guard);
            if prev.is_null() {
                // Nothing older than the tid-0 initial version; it is always
                // visible, so we should never walk past it.
                break;
            }
            h = prev;
        }
        let node = unsafe { h.deref() };
        let garbage = node.prev(guard);
        if garbage.is_null() {
            return;
        }
        // Detach so later cycles know where this one stopped, per spec §4.5
        // step 3. A failed CAS means a concurrent sweep already did this;
        // nothing left for us to do.
        if node.cas_prev(guard, garbage, Shared::null()).is_err() {
            return;
        }
        let mut cur = garbage;
        while !cur.is_null() {
            let cur_node = unsafe { cur.deref() };
            let next = cur_node.prev(guard);
            unsafe {
                guard.defer_destroy(cur);
            }
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    #[test]
    fn initial_version_visible_at_any_tid() {
        let obj = MvccObject::new(42u32);
        let guard = epoch::pin();
        let v = obj.find_visible(CommitTid::from_raw(9_999), true, &guard);
        assert_eq!(unsafe { v.deref() }.value(), &42);
    }

    #[test]
    fn commit_protocol_publishes_new_version() {
        let obj = MvccObject::new(1u32);
        let guard = epoch::pin();
        let start = CommitTid::from_raw(1);
        let pending = obj.stage_pending(start, 2u32, &guard);
        let published = obj.cp_lock(start, pending, &guard).expect("lock should succeed");
        let commit_tid = CommitTid::from_raw(5);
        assert!(obj.cp_check(commit_tid, obj.find_visible(start, false, &guard), &guard));
        obj.cp_install(published);
        let visible = obj.find_visible(commit_tid, true, &guard);
        assert_eq!(unsafe { visible.deref() }.value(), &2);
    }

    #[test]
    fn chain_is_monotonically_decreasing_by_wtid() {
        let obj = MvccObject::new(0u32);
        let guard = epoch::pin();
        for i in 1..10u64 {
            let tid = CommitTid::from_raw(i);
            let pending = obj.stage_pending(tid, i as u32, &guard);
            let published = obj.cp_lock(tid, pending, &guard).unwrap();
            obj.cp_install(published);
        }
        let mut cur = obj.head_raw(&guard);
        let mut last = u64::MAX;
        while !cur.is_null() {
            let node = unsafe { cur.deref() };
            assert!(node.wtid().raw() < last);
            last = node.wtid().raw();
            cur = node.prev(&guard);
        }
    }

    #[test]
    fn second_writer_loses_lock_race() {
        let obj = MvccObject::new(0u32);
        let guard = epoch::pin();
        let t1 = CommitTid::from_raw(1);
        let t2 = CommitTid::from_raw(2);
        let p1 = obj.stage_pending(t1, 1u32, &guard);
        let p2 = obj.stage_pending(t2, 2u32, &guard);
        let published1 = obj.cp_lock(t1, p1, &guard).expect("first writer locks");
        obj.cp_install(published1);
        assert!(obj.cp_lock(t2, p2, &guard).is_none());
    }
}
