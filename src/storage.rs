use crossbeam_epoch::{self as epoch, Atomic};
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::StackError;

/// Number of cells in the first bucket.
pub(crate) const FIRST_BUCKET_SIZE: usize = 2;

/// Number of bucket table entries. Bucket `k` holds `2^(k+1)` cells, so the
/// table addresses `2^32 - 2` cells in total; asking for more is a hard
/// capacity failure, not a growth request.
pub(crate) const MAX_BUCKETS: usize = 31;

/// Heap payload of one storage cell.
///
/// The inner value is `ManuallyDrop` because ownership of the `T` leaves the
/// slot when it is popped while the allocation itself stays behind in the
/// cell as a stale CAS comparand. Dropping a `Slot` therefore never drops the
/// `T`; whoever still owns the value is responsible for it.
pub(crate) struct Slot<T> {
    pub(crate) value: ManuallyDrop<T>,
}

impl<T> Slot<T> {
    pub(crate) fn new(value: T) -> Self {
        Slot {
            value: ManuallyDrop::new(value),
        }
    }
}

/// Segmented cell storage: a fixed table of lazily allocated buckets whose
/// sizes grow geometrically.
///
/// Logical indices form one gap-free sequence across buckets, and the
/// power-of-two sizing lets `cell` map an index to its bucket and offset with
/// pure bit math. Growing never relocates a previously allocated cell, which
/// is what allows concurrent readers to hold cell references without any
/// coordination beyond the per-cell CAS.
pub(crate) struct SegmentedStorage<T> {
    buckets: [AtomicPtr<Atomic<Slot<T>>>; MAX_BUCKETS],
}

/// Position of the highest set bit, counted from the least significant end.
fn highest_bit(n: usize) -> u32 {
    debug_assert!(n != 0);
    usize::BITS - 1 - n.leading_zeros()
}

impl<T> SegmentedStorage<T> {
    /// Creates storage with bucket 0 already allocated.
    pub(crate) fn new() -> Self {
        let storage = SegmentedStorage {
            buckets: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        };
        storage.install(0);
        storage
    }

    /// Index of the bucket holding logical index `index`.
    pub(crate) fn bucket_of(index: usize) -> usize {
        (highest_bit(index + FIRST_BUCKET_SIZE) - highest_bit(FIRST_BUCKET_SIZE)) as usize
    }

    /// Ensures the bucket covering `index` is allocated, with all cells empty.
    ///
    /// Idempotent and safe to race: every caller returns `Ok` once the bucket
    /// exists, but only one racer's allocation is installed; the losers free
    /// theirs. Fails with [`StackError::CapacityExceeded`] once the required
    /// bucket index reaches the end of the table.
    pub(crate) fn reserve(&self, index: usize) -> Result<(), StackError> {
        let bucket = Self::bucket_of(index);
        if bucket >= MAX_BUCKETS {
            return Err(StackError::CapacityExceeded);
        }
        if self.buckets[bucket].load(Ordering::Acquire).is_null() {
            self.install(bucket);
        }
        Ok(())
    }

    fn install(&self, bucket: usize) {
        let len = 1usize << (bucket + 1);
        let cells: Box<[Atomic<Slot<T>>]> = (0..len).map(|_| Atomic::null()).collect();
        let fresh = Box::into_raw(cells) as *mut Atomic<Slot<T>>;

        if self.buckets[bucket]
            .compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Lost the install race. Our bucket was never published, so its
            // cells are all null and the slice can be freed outright.
            unsafe { free_bucket(fresh, len) };
        }
    }

    /// The cell at logical `index`. The bucket must have been reserved.
    ///
    /// `pos = index + FIRST_BUCKET_SIZE` places index 0 at the first cell of
    /// bucket 0; the highest set bit of `pos` selects the bucket and the
    /// remaining low bits are the offset within it.
    pub(crate) fn cell(&self, index: usize) -> &Atomic<Slot<T>> {
        let pos = index + FIRST_BUCKET_SIZE;
        let hi = highest_bit(pos);
        let bucket = (hi - highest_bit(FIRST_BUCKET_SIZE)) as usize;
        let offset = pos ^ (1usize << hi);

        let base = self.buckets[bucket].load(Ordering::Acquire);
        assert!(!base.is_null(), "bucket {bucket} accessed before allocation");
        // SAFETY: `base` points at a live array of `2^(bucket+1)` cells and
        // `offset` is the low bits of `pos` below bit `hi`, so it is in range.
        unsafe { &*base.add(offset) }
    }
}

// SAFETY: the bucket table and cells are only mutated through atomics, and
// the `Slot` payloads move between threads as whole values.
unsafe impl<T: Send> Send for SegmentedStorage<T> {}
unsafe impl<T: Send> Sync for SegmentedStorage<T> {}

impl<T> Drop for SegmentedStorage<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can touch the storage, so
        // an unprotected guard is fine and every published slot pointer is
        // reachable from exactly one cell.
        let guard = unsafe { epoch::unprotected() };
        for (bucket, entry) in self.buckets.iter().enumerate() {
            let base = entry.load(Ordering::Relaxed);
            if base.is_null() {
                continue;
            }
            let len = 1usize << (bucket + 1);
            for offset in 0..len {
                let cell = unsafe { &*base.add(offset) };
                let slot = cell.load(Ordering::Relaxed, guard);
                if !slot.is_null() {
                    // Frees the allocation only; `ManuallyDrop` keeps any
                    // moved-out `T` from being dropped twice. Live values are
                    // dropped by `Stack::drop` before the storage goes away.
                    drop(unsafe { slot.into_owned() });
                }
            }
            unsafe { free_bucket(base, len) };
        }
    }
}

unsafe fn free_bucket<T>(base: *mut Atomic<Slot<T>>, len: usize) {
    let slice = ptr::slice_from_raw_parts_mut(base, len);
    drop(unsafe { Box::from_raw(slice) });
}
