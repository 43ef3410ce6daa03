mod inner;

use inner::MapInner;
pub use inner::RuntimeStats;
use std::{
    cmp::Ordering,
    path::{Path, PathBuf},
    sync::Arc,
};

/// A contiguous file-backed mapped region shared by one or more exes.
///
/// Identity (equality, ordering, hashing) is the `(path, offset, length)`
/// triple; runtime statistics do not participate. The handle is cheap to
/// clone.
#[derive(Debug, Default, Clone, Eq, PartialEq, Hash)]
pub struct Map {
    inner: Arc<MapInner>,
}

impl Map {
    pub fn new(path: impl Into<PathBuf>, offset: u64, length: u64, update_time: u64) -> Self {
        Self {
            inner: Arc::new(MapInner::new(path, offset, length, update_time)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn offset(&self) -> u64 {
        self.inner.offset
    }

    pub fn length(&self) -> u64 {
        self.inner.length
    }

    pub fn update_time(&self) -> u64 {
        self.inner.update_time
    }

    pub fn seq(&self) -> Option<u64> {
        self.inner.runtime.lock().seq
    }

    pub fn set_seq(&self, seq: u64) {
        self.inner.runtime.lock().seq.replace(seq);
    }

    pub fn lnprob(&self) -> f64 {
        self.inner.runtime.lock().lnprob
    }

    pub fn zero_lnprob(&self) {
        self.inner.runtime.lock().lnprob = 0.0;
    }

    pub fn set_lnprob(&self, lnprob: f64) {
        self.inner.runtime.lock().lnprob = lnprob;
    }

    pub fn block(&self) -> Option<u64> {
        self.inner.runtime.lock().block
    }

    /// Current reference count (number of exemaps holding this map).
    pub fn refcount(&self) -> u32 {
        self.inner.runtime.lock().refcount
    }

    /// Increment the refcount and return the new value.
    pub(crate) fn ref_inc(&self) -> u32 {
        let mut runtime = self.inner.runtime.lock();
        runtime.refcount += 1;
        runtime.refcount
    }

    /// Decrement the refcount and return the new value.
    pub(crate) fn ref_dec(&self) -> u32 {
        let mut runtime = self.inner.runtime.lock();
        debug_assert!(runtime.refcount > 0, "map unref below zero");
        runtime.refcount = runtime.refcount.saturating_sub(1);
        runtime.refcount
    }

    /// Resolve and cache the on-disk location of the start of the map.
    ///
    /// With `use_inode` the inode number is used directly; otherwise the
    /// first logical block is queried through the FIBMAP ioctl, falling back
    /// to the inode when the filesystem refuses. Failures leave the block at
    /// zero so the lookup is not retried every cycle.
    pub fn set_block(&self, use_inode: bool) -> Result<(), crate::Error> {
        self.inner.set_block(use_inode)
    }

    /// Ordering used by the path sort strategy: path, then offset, with
    /// longer maps first so coalescing sees the widest request first.
    pub(crate) fn path_order(&self, other: &Self) -> Ordering {
        self.path()
            .cmp(other.path())
            .then_with(|| self.offset().cmp(&other.offset()))
            .then_with(|| other.length().cmp(&self.length()))
    }

    /// Ordering used by the inode/block sort strategies.
    pub(crate) fn block_order(&self, other: &Self) -> Ordering {
        self.block()
            .cmp(&other.block())
            .then_with(|| self.path_order(other))
    }
}
