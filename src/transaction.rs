//! Transaction Context (spec §3, §4.4): per-thread transaction state and the
//! six-phase commit protocol, plus `Cell<T>`, the scalar MVCC adapter that
//! drives a single [`crate::object::MvccObject`] through the `AdapterObject`
//! contract in `item.rs`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Guard, Shared};

use crate::item::{AdapterObject, CommitView, TransactionItem};
use crate::object::MvccObject;
use crate::registry::GcTarget;
use crate::runtime::Runtime;
use crate::tid::CommitTid;

/// Opacity policy, selected per transaction at `begin` (spec §9: "implement
/// as a compile-time parameter on the Version type... two implementations
/// sharing the same public operations" — here it is a runtime enum on
/// `TransactionContext` instead, since the commit protocol is shared code and
/// a runtime branch costs nothing on this hot path relative to the CAS loops
/// around it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    /// Validate only at commit (spec §4.4 baseline).
    NonOpaque,
    /// Additionally revalidate the whole read set whenever the process has
    /// committed something since the transaction's last check (spec §4.4
    /// Opacity extension).
    Opaque,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committing,
    Committed,
    Aborted,
}

/// Per-thread transaction state (spec §3 Transaction Context).
pub struct TransactionContext<'r> {
    runtime: &'r Arc<Runtime>,
    guard: Guard,
    start_tid: CommitTid,
    commit_tid: Option<CommitTid>,
    horizon: CommitTid,
    mode: IsolationMode,
    items: Vec<TransactionItem>,
    state: TxState,
}

impl<'r> TransactionContext<'r> {
    /// `begin()` (spec §6): starts a non-opaque transaction and records the
    /// calling thread's rtid as `start_tid`.
    pub fn begin(runtime: &'r Arc<Runtime>) -> TransactionContext<'r> {
        Self::begin_with_mode(runtime, IsolationMode::NonOpaque)
    }

    pub fn begin_opaque(runtime: &'r Arc<Runtime>) -> TransactionContext<'r> {
        Self::begin_with_mode(runtime, IsolationMode::Opaque)
    }

    fn begin_with_mode(runtime: &'r Arc<Runtime>, mode: IsolationMode) -> TransactionContext<'r> {
        let guard = epoch::pin();
        let start_tid = runtime.next_tid();
        runtime.thread_rtid().enter(start_tid);
        TransactionContext {
            runtime,
            guard,
            start_tid,
            commit_tid: None,
            horizon: start_tid,
            mode,
            items: Vec::new(),
            state: TxState::Active,
        }
    }

    pub fn start_tid(&self) -> CommitTid {
        self.start_tid
    }

    /// Valid only after a successful `try_commit`.
    pub fn commit_tid(&self) -> Option<CommitTid> {
        self.commit_tid
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    /// `item(owner, key)` (spec §6): finds or allocates the canonical item
    /// for (owner, key), preserving insertion order and deduplicating by
    /// `(adapter identity, key)`.
    pub fn item(&mut self, adapter: &Arc<dyn AdapterObject>, key: i64) -> usize {
        let identity = adapter.identity();
        if let Some(pos) = self
            .items
            .iter()
            .position(|it| it.adapter.identity() == identity && it.key() == key)
        {
            return pos;
        }
        self.items.push(TransactionItem::new(adapter.clone(), key));
        self.items.len() - 1
    }

    pub fn item_at(&self, idx: usize) -> &TransactionItem {
        &self.items[idx]
    }

    pub fn item_at_mut(&mut self, idx: usize) -> &mut TransactionItem {
        &mut self.items[idx]
    }

    /// Opacity bookkeeping (spec §4.4 Opacity extension): called by an
    /// adapter right after observing a new version. If the process has
    /// committed anything since this transaction's current horizon, every
    /// previously-read item is revalidated at the new horizon; a mismatch
    /// aborts immediately rather than letting execution continue on an
    /// inconsistent snapshot.
    pub(crate) fn opaque_guard(&mut self) -> bool {
        if self.mode != IsolationMode::Opaque {
            return true;
        }
        let latest = self.runtime.next_tid_peek();
        if latest <= self.horizon {
            return true;
        }
        for i in 0..self.items.len() {
            let item = &self.items[i];
            if !item.has_read() {
                continue;
            }
            let adapter = item.adapter.clone();
            if !adapter.revalidate(item, latest, &self.guard) {
                self.state = TxState::Aborted;
                self.runtime.thread_rtid().exit(self.start_tid);
                return false;
            }
        }
        self.horizon = latest;
        true
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    /// `try_commit()` (spec §4.4): runs the six-phase protocol. Returns
    /// `false` (after fully rolling back) on any conflict.
    pub fn try_commit(&mut self) -> bool {
        if self.state != TxState::Active {
            return false;
        }
        self.state = TxState::Committing;

        // Lock phase: canonical order avoids deadlock (pointer order of
        // objects, key order within an object).
        self.items
            .sort_by_key(|it| (it.adapter.identity(), it.key()));

        let view = CommitView::new(self.start_tid, &self.guard);
        let mut locked = 0usize;
        let mut ok = true;
        for i in 0..self.items.len() {
            if self.items[i].has_write() {
                let adapter = self.items[i].adapter.clone();
                if !adapter.lock(&mut self.items[i], &view) {
                    ok = false;
                    break;
                }
            }
            locked = i + 1;
        }

        if !ok {
            self.rollback(&view, locked);
            return false;
        }

        // Assign commit-tid.
        let commit_tid = self.runtime.next_tid();
        self.commit_tid = Some(commit_tid);
        view.set_tid(commit_tid);

        // Check phase.
        for item in &self.items {
            if item.has_read() {
                if !item.adapter.check(item, &view) {
                    self.rollback(&view, self.items.len());
                    return false;
                }
            }
        }

        // Install phase.
        for item in &mut self.items {
            if item.has_write() {
                item.adapter.clone().install(item, &view);
            }
        }

        // Unlock phase.
        for item in &self.items {
            item.adapter.unlock(item);
        }
        for item in &self.items {
            item.adapter.cleanup(item, true);
        }

        self.state = TxState::Committed;
        self.runtime.thread_rtid().exit(self.start_tid);
        true
    }

    /// Rolls back every item that reached the lock phase (or all of them, if
    /// called after the lock phase fully succeeded), then transitions to
    /// ABORTED.
    fn rollback(&mut self, view: &CommitView, locked_upto: usize) {
        for item in self.items[..locked_upto].iter() {
            if item.has_write() {
                item.adapter.unlock(item);
            }
        }
        for item in &self.items {
            item.adapter.cleanup(item, false);
        }
        let _ = view;
        self.state = TxState::Aborted;
        self.runtime.thread_rtid().exit(self.start_tid);
    }

    /// `abort()` (spec §6): aborts unconditionally, from anywhere in the
    /// transaction body.
    pub fn abort(&mut self) {
        if self.state == TxState::Active || self.state == TxState::Committing {
            let view = CommitView::new(self.start_tid, &self.guard);
            self.rollback(&view, self.items.len());
        }
    }
}

/// Scalar MVCC cell: the one builtin adapter the core ships, both as a
/// minimal usable data structure and as a worked example of the
/// `AdapterObject` contract (spec §6).
pub struct Cell<T> {
    object: MvccObject<T>,
    id: usize,
    self_ref: std::sync::Weak<Cell<T>>,
}

static CELL_IDS: AtomicUsize = AtomicUsize::new(1);

impl<T: Clone + Send + Sync + 'static> Cell<T> {
    pub fn new(initial: T) -> Arc<Cell<T>> {
        Arc::new_cyclic(|self_ref| Cell {
            object: MvccObject::new(initial),
            id: CELL_IDS.fetch_add(1, Ordering::Relaxed),
            self_ref: self_ref.clone(),
        })
    }

    fn arc(&self) -> Arc<Cell<T>> {
        self.self_ref.upgrade().expect("cell outlives its own Arc")
    }

    /// Registers this cell's chain with `runtime`'s GC registry. The caller
    /// must keep the returned handle alive for as long as the cell should be
    /// swept.
    pub fn register(&self, runtime: &Runtime) -> crate::registry::RegistryHandle {
        let weak: std::sync::Weak<dyn crate::registry::GcTarget> =
            self.self_ref.clone() as std::sync::Weak<dyn crate::registry::GcTarget>;
        runtime.registry().register(weak)
    }

    /// Reads the cell's value as of the transaction's snapshot, recording
    /// the observed version in the cell's item.
    pub fn read(&self, txn: &mut TransactionContext) -> T {
        let adapter: Arc<dyn AdapterObject> = self.arc();
        let idx = txn.item(&adapter, 0);
        if let Some(v) = txn.item_at(idx).write_value_ref::<T>() {
            return v.clone();
        }
        if txn.mode() == IsolationMode::Opaque {
            txn.opaque_guard();
        }
        let tid = if txn.mode() == IsolationMode::Opaque {
            txn.horizon
        } else {
            txn.start_tid()
        };
        let (value, raw) = {
            let guard = txn.guard();
            let visible = self.object.find_visible(tid, true, guard);
            let value = unsafe { visible.deref() }.value().clone();
            (value, visible.as_raw() as usize)
        };
        txn.item_at_mut(idx).observe(raw);
        value
    }

    /// Stages a write, visible to subsequent reads of the same item in this
    /// transaction (read-your-own-writes), applied at commit.
    pub fn write(&self, txn: &mut TransactionContext, value: T) {
        let adapter: Arc<dyn AdapterObject> = self.arc();
        let idx = txn.item(&adapter, 0);
        txn.item_at_mut(idx).add_write(value);
    }
}

impl<T: Clone + Send + Sync + 'static> GcTarget for Cell<T> {
    fn gc(&self, gc_tid: CommitTid, guard: &Guard) {
        self.object.gc(gc_tid, guard)
    }
}

impl<T: Clone + Send + Sync + 'static> AdapterObject for Cell<T> {
    fn lock(&self, item: &mut TransactionItem, view: &CommitView) -> bool {
        let guard = view.guard();
        let Some(boxed) = item.write_value_ref::<T>().cloned() else {
            return true;
        };
        let pending = self.object.stage_pending(view.tid(), boxed, guard);
        match self.object.cp_lock(view.tid(), pending, guard) {
            Some(published) => {
                item.installed = Some(published.as_raw() as usize);
                true
            }
            None => false,
        }
    }

    fn check(&self, item: &TransactionItem, view: &CommitView) -> bool {
        let Some(raw) = item.observed else {
            return true;
        };
        let guard = view.guard();
        let observed: Shared<'_, crate::version::Version<T>> =
            Shared::from(raw as *const crate::version::Version<T>);
        self.object.cp_check(view.tid(), observed, guard)
    }

    fn install(&self, item: &mut TransactionItem, view: &CommitView) {
        let Some(raw) = item.installed else { return };
        let published: Shared<'_, crate::version::Version<T>> =
            Shared::from(raw as *const crate::version::Version<T>);
        unsafe { published.deref() }.stamp_commit_tid(view.tid());
        self.object.cp_install(published);
    }

    fn unlock(&self, _item: &TransactionItem) {
        // The MVCC object has no separate lock: the head CAS in `cp_lock`
        // both locks and publishes in one step, so there is nothing left to
        // release here.
    }

    fn cleanup(&self, item: &TransactionItem, committed: bool) {
        if !committed && item.installed.is_some() {
            self.object.abort_pending(unsafe { epoch::unprotected() });
        }
    }

    fn identity(&self) -> usize {
        self.id
    }

    fn revalidate(&self, item: &TransactionItem, new_horizon: CommitTid, guard: &Guard) -> bool {
        let Some(raw) = item.observed else { return true };
        let observed: Shared<'_, crate::version::Version<T>> =
            Shared::from(raw as *const crate::version::Version<T>);
        let current = self.object.find_visible(new_horizon, false, guard);
        current == observed
    }
}
