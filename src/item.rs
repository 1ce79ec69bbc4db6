//! Transaction Item (spec §3, §6): the per-(object, key) access record a
//! [`crate::TransactionContext`] keeps in its item set, and the generic
//! `Adapter` callback contract data-structure implementations satisfy.

use std::any::Any;
use std::cell::Cell;
use std::sync::Arc;

use crossbeam_epoch::Guard;

use crate::tid::CommitTid;

/// Flags on a [`TransactionItem`]: the two protocol-level bits (`READ`,
/// `WRITE`) plus eight adapter-defined bits, matching spec §3's "up to 8
/// user flags for adapter-specific semantics".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemFlags(u16);

impl ItemFlags {
    pub const READ: ItemFlags = ItemFlags(1 << 0);
    pub const WRITE: ItemFlags = ItemFlags(1 << 1);
    pub const USER0: ItemFlags = ItemFlags(1 << 2);
    pub const USER1: ItemFlags = ItemFlags(1 << 3);
    pub const USER2: ItemFlags = ItemFlags(1 << 4);
    pub const USER3: ItemFlags = ItemFlags(1 << 5);
    pub const USER4: ItemFlags = ItemFlags(1 << 6);
    pub const USER5: ItemFlags = ItemFlags(1 << 7);
    pub const USER6: ItemFlags = ItemFlags(1 << 8);
    pub const USER7: ItemFlags = ItemFlags(1 << 9);

    pub const NONE: ItemFlags = ItemFlags(0);

    pub fn contains(self, bits: ItemFlags) -> bool {
        self.0 & bits.0 == bits.0
    }

    pub fn insert(&mut self, bits: ItemFlags) {
        self.0 |= bits.0;
    }

    pub fn remove(&mut self, bits: ItemFlags) {
        self.0 &= !bits.0;
    }
}

impl std::ops::BitOr for ItemFlags {
    type Output = ItemFlags;
    fn bitor(self, rhs: ItemFlags) -> ItemFlags {
        ItemFlags(self.0 | rhs.0)
    }
}

/// Implemented by every data-structure adapter (a scalar `Cell<T>`, the
/// pessimistic `Queue<T>`, or any future array/map adapter) so the commit
/// protocol in [`crate::transaction`] can drive arbitrary adapters through
/// one non-generic vtable (spec §6's "Shared (per adapter instance)
/// callbacks").
pub trait AdapterObject: Send + Sync {
    /// `lock(item, txn)`: acquire whatever protects the item; returning
    /// `false` forces an abort.
    fn lock(&self, item: &mut TransactionItem, view: &CommitView) -> bool;
    /// `check(item, txn)`: validate the observed version/state against
    /// current.
    fn check(&self, item: &TransactionItem, view: &CommitView) -> bool;
    /// `install(item, txn)`: apply the staged write, publishing using
    /// `txn.commit_tid()`.
    fn install(&self, item: &mut TransactionItem, view: &CommitView);
    /// `unlock(item)`: release whatever `lock` acquired.
    fn unlock(&self, item: &TransactionItem);
    /// `cleanup(item, committed)`: always invoked last; release residual
    /// resources.
    fn cleanup(&self, item: &TransactionItem, committed: bool);
    /// A stable identity used to order items into the canonical lock order
    /// (spec §4.4 step 2: "pointer order of objects, key order within an
    /// object") so concurrent transactions acquire locks in a consistent
    /// order and cannot deadlock.
    fn identity(&self) -> usize;
    /// Re-checks that `item`'s previously observed version is still the
    /// visible one at `new_horizon`. Used only by opaque transactions (spec
    /// §4.4 Opacity extension) to revalidate the whole read set when the
    /// process has committed something since the transaction's last check.
    fn revalidate(&self, item: &TransactionItem, new_horizon: CommitTid, guard: &Guard) -> bool;
}

/// Per-(object, key) access record (spec §3 Transaction Item).
pub struct TransactionItem {
    pub(crate) adapter: Arc<dyn AdapterObject>,
    pub(crate) key: i64,
    pub(crate) flags: ItemFlags,
    /// Type-erased staged write value; adapters downcast this themselves
    /// (spec §9's "small-buffer-optimized tagged slot" — here, just a
    /// `Box<dyn Any>`, since the crate does not need a custom allocator).
    pub(crate) write: Option<Box<dyn Any + Send>>,
    /// Raw bits of the `Shared<'g, Version<T>>` this item observed on a
    /// read, valid for as long as the transaction's epoch guard stays
    /// pinned. `None` if this item has never been read.
    pub(crate) observed: Option<usize>,
    /// Raw bits of the `Shared<'g, Version<T>>` published during the Lock
    /// phase, `None` until `lock` succeeds.
    pub(crate) installed: Option<usize>,
}

impl TransactionItem {
    pub(crate) fn new(adapter: Arc<dyn AdapterObject>, key: i64) -> TransactionItem {
        TransactionItem {
            adapter,
            key,
            flags: ItemFlags::NONE,
            write: None,
            observed: None,
            installed: None,
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn flags(&self) -> ItemFlags {
        self.flags
    }

    pub fn add_flags(&mut self, bits: ItemFlags) {
        self.flags.insert(bits);
    }

    pub fn clear_flags(&mut self, bits: ItemFlags) {
        self.flags.remove(bits);
    }

    pub fn has_read(&self) -> bool {
        self.flags.contains(ItemFlags::READ)
    }

    pub fn has_write(&self) -> bool {
        self.flags.contains(ItemFlags::WRITE)
    }

    pub fn observe(&mut self, ptr: usize) {
        self.observed = Some(ptr);
        self.flags.insert(ItemFlags::READ);
    }

    pub fn add_write<T: Send + 'static>(&mut self, value: T) {
        self.write = Some(Box::new(value));
        self.flags.insert(ItemFlags::WRITE);
    }

    pub fn clear_write(&mut self) {
        self.write = None;
        self.flags.remove(ItemFlags::WRITE);
    }

    pub fn write_value<T: 'static>(&mut self) -> Option<&mut T> {
        self.write.as_mut().and_then(|b| b.downcast_mut::<T>())
    }

    pub fn write_value_ref<T: 'static>(&self) -> Option<&T> {
        self.write.as_ref().and_then(|b| b.downcast_ref::<T>())
    }
}

/// View of the in-flight commit handed to every [`AdapterObject`] callback.
/// `tid()` returns the transaction's start-tid during the Lock phase (spec
/// §4.4 step 2, which precedes commit-tid assignment) and the final
/// commit-tid from the Assign-commit-tid phase onward.
pub struct CommitView<'g> {
    tid: Cell<u64>,
    guard: &'g Guard,
}

impl<'g> CommitView<'g> {
    pub(crate) fn new(start_tid: CommitTid, guard: &'g Guard) -> CommitView<'g> {
        CommitView {
            tid: Cell::new(start_tid.raw()),
            guard,
        }
    }

    pub(crate) fn set_tid(&self, tid: CommitTid) {
        self.tid.set(tid.raw());
    }

    pub fn tid(&self) -> CommitTid {
        CommitTid::from_raw(self.tid.get())
    }

    pub fn guard(&self) -> &'g Guard {
        self.guard
    }
}
