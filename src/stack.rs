use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::backoff::ExpBackoff;
use crate::storage::{SegmentedStorage, Slot};

/// Error types that can occur during stack operations
#[derive(Debug, PartialEq, Eq)]
pub enum StackError {
    /// The fixed bucket table is exhausted (about 2^32 cells). Not
    /// recoverable: storage never shrinks and never grows past the table.
    CapacityExceeded,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::CapacityExceeded => write!(f, "stack capacity ceiling exceeded"),
        }
    }
}

impl std::error::Error for StackError {}

/// One announced single-cell write: CAS the cell at `location` from `old` to
/// `new`, exactly once, by whichever thread gets there first.
///
/// Embedding this in the [`Descriptor`] is what lets one CAS publish a size
/// change and a cell write together: installing the descriptor announces the
/// write, and any thread that later observes it applies the write before
/// making progress of its own.
///
/// There is no generation tag on `old`, so a thread delayed between reading a
/// descriptor and helping can in principle CAS a stale comparand into a cell
/// that was popped and repushed in the meantime (the classic ABA window of
/// the original design). Epoch retirement of displaced slots keeps the
/// memory itself alive while any such thread is pinned.
struct WriteDescriptor<T> {
    old: *const Slot<T>,
    new: *const Slot<T>,
    location: usize,
    pending: AtomicBool,
}

impl<T> WriteDescriptor<T> {
    fn new(old: *const Slot<T>, new: *const Slot<T>, location: usize) -> Self {
        WriteDescriptor {
            old,
            new,
            location,
            pending: AtomicBool::new(true),
        }
    }
}

/// Immutable snapshot of the logical stack state: the element count and the
/// write (if any) still pending as of this snapshot.
///
/// The handle to the current descriptor is the only globally shared mutable
/// reference in the structure; every push and pop is one CAS on it. Replaced
/// descriptors are retired through the epoch guard since a reader may be
/// preempted while still holding one.
struct Descriptor<T> {
    size: usize,
    writer: Option<WriteDescriptor<T>>,
}

/// Outcome of one pop attempt. Contention and emptiness are distinct: a
/// failed CAS means retry, an observed zero size means the stack had nothing
/// to give at that snapshot.
enum PopAttempt<T> {
    Popped(T),
    Contended,
    Empty,
}

/// A lock-free, unbounded, array-backed stack.
///
/// All coordination happens through single-word CAS: one on the shared
/// [`Descriptor`] handle per logical transition, plus one per-cell CAS for
/// the deferred write a push announces. Threads that find a pending write
/// finish it before proceeding, so a stalled pusher never wedges the
/// structure. Storage grows in geometric buckets and existing elements are
/// never relocated.
///
/// Progress, not fairness: a contended operation backs off and retries
/// indefinitely, and no ordering among concurrent callers is promised.
///
/// # Examples
/// ```
/// use descriptor_stack::Stack;
///
/// let stack = Stack::new();
/// stack.push(1).unwrap();
/// assert_eq!(stack.len(), 1);
/// assert_eq!(stack.try_pop(), Some(1));
/// assert_eq!(stack.try_pop(), None);
/// ```
pub struct Stack<T> {
    storage: SegmentedStorage<T>,
    desc: Atomic<Descriptor<T>>,
    ops: AtomicUsize,
}

// SAFETY: values only move between threads as whole `T`s; descriptors and
// cells are only touched through atomics. No `&T` to a particular element is
// ever shared across threads by the stack itself.
unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stack<T> {
    /// Creates a new empty stack. The capacity ceiling (about 2^32 cells) is
    /// fixed at construction.
    pub fn new() -> Self {
        Stack {
            storage: SegmentedStorage::new(),
            desc: Atomic::new(Descriptor {
                size: 0,
                writer: None,
            }),
            ops: AtomicUsize::new(0),
        }
    }

    /// Pushes a value onto the stack, retrying (with backoff) until the
    /// descriptor CAS commits.
    ///
    /// The only failure is the fatal [`StackError::CapacityExceeded`]
    /// ceiling; contention is invisible to the caller.
    pub fn push(&self, value: T) -> Result<(), StackError> {
        // One allocation per value, reused across retries.
        let new_slot = Box::into_raw(Box::new(Slot::new(value))) as *const Slot<T>;
        let mut backoff = ExpBackoff::new();
        loop {
            let guard = epoch::pin();
            match self.try_push(new_slot, &guard) {
                Ok(true) => {
                    self.ops.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Ok(false) => backoff.wait(),
                Err(err) => {
                    // The slot was never published; reclaim it and the value.
                    unsafe {
                        let mut slot = Box::from_raw(new_slot as *mut Slot<T>);
                        ManuallyDrop::drop(&mut slot.value);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Removes and returns the top element, retrying (with backoff) until
    /// one is available.
    ///
    /// An empty stack is not an error here: the call waits for a concurrent
    /// push, exactly as it waits out a failed CAS. Use [`Stack::try_pop`]
    /// for the non-blocking variant.
    pub fn pop(&self) -> T {
        let mut backoff = ExpBackoff::new();
        loop {
            let guard = epoch::pin();
            match self.try_pop_inner(&guard) {
                PopAttempt::Popped(value) => {
                    self.ops.fetch_add(1, Ordering::Relaxed);
                    return value;
                }
                PopAttempt::Contended | PopAttempt::Empty => backoff.wait(),
            }
        }
    }

    /// Non-blocking pop: spins through contention but returns `None` the
    /// moment an attempt observes an empty snapshot.
    pub fn try_pop(&self) -> Option<T> {
        let mut backoff = ExpBackoff::new();
        loop {
            let guard = epoch::pin();
            match self.try_pop_inner(&guard) {
                PopAttempt::Popped(value) => {
                    self.ops.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                PopAttempt::Empty => return None,
                PopAttempt::Contended => backoff.wait(),
            }
        }
    }

    /// Best-effort element count from a single descriptor read.
    ///
    /// While a push's write is still pending its slot is not yet settled, so
    /// the snapshot reports one less than the descriptor's count. The value
    /// may be stale by the time the caller looks at it.
    pub fn len(&self) -> usize {
        let guard = epoch::pin();
        // SAFETY: the descriptor handle is never null.
        let desc = unsafe { self.desc.load(Ordering::Acquire, &guard).deref() };
        match &desc.writer {
            Some(w) if w.pending.load(Ordering::Acquire) => desc.size - 1,
            _ => desc.size,
        }
    }

    /// Returns true if a snapshot of the stack saw no settled elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of successfully completed push and pop calls. Diagnostics only.
    pub fn op_count(&self) -> usize {
        self.ops.load(Ordering::Relaxed)
    }

    /// Raw diagnostic read of the cell at `index`, bypassing all size checks.
    ///
    /// # Safety
    ///
    /// `index` must be below [`Stack::len`] at a moment when no concurrent
    /// pop can remove it: cells above the current size keep stale slots whose
    /// values have already been moved out, and cloning one reads moved (or
    /// freed) data. The bucket covering `index` must have been allocated.
    pub unsafe fn get_unchecked(&self, index: usize) -> Option<T>
    where
        T: Clone,
    {
        let guard = epoch::pin();
        let slot = self.storage.cell(index).load(Ordering::Acquire, &guard);
        unsafe { slot.as_ref() }.map(|s| T::clone(&s.value))
    }

    /// Applies the pending write carried by `desc`, if any.
    ///
    /// Any thread may call this on the currently installed descriptor
    /// (helping); the cell CAS applies at most once, and the pending flag is
    /// cleared regardless of which thread's CAS did it. Idempotent.
    fn finish_pending(&self, desc: &Descriptor<T>, guard: &Guard) {
        let Some(w) = &desc.writer else { return };
        if !w.pending.load(Ordering::Acquire) {
            return;
        }
        let cell = self.storage.cell(w.location);
        if cell
            .compare_exchange(
                Shared::from(w.old),
                Shared::from(w.new),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
            && !w.old.is_null()
        {
            // The displaced occupant was a stale leftover from an earlier
            // pop of this index; its value already moved out, only the
            // allocation remains to retire.
            unsafe { guard.defer_destroy(Shared::from(w.old)) };
        }
        w.pending.store(false, Ordering::Release);
    }

    /// One push attempt: help, reserve, announce, CAS. `Ok(false)` is a lost
    /// race; only the capacity ceiling is an error.
    fn try_push(&self, new_slot: *const Slot<T>, guard: &Guard) -> Result<bool, StackError> {
        let current = self.desc.load(Ordering::Acquire, guard);
        // SAFETY: the descriptor handle is never null and `current` is
        // protected by `guard`.
        let current_ref = unsafe { current.deref() };
        self.finish_pending(current_ref, guard);

        let target = current_ref.size;
        self.storage.reserve(target)?;
        let old = self.storage.cell(target).load(Ordering::Acquire, guard);

        let next = Owned::new(Descriptor {
            size: target + 1,
            writer: Some(WriteDescriptor::new(old.as_raw(), new_slot, target)),
        });

        match self
            .desc
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(installed) => {
                // Eager completion: the winning pusher applies its own write
                // rather than leaving it for a helper.
                self.finish_pending(unsafe { installed.deref() }, guard);
                // SAFETY: `current` is now unreachable from the handle, and
                // every thread that read it earlier is pinned.
                unsafe { guard.defer_destroy(current) };
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// One pop attempt. Pop needs no deferred write: the cell's value is
    /// abandoned in place and only the size moves.
    fn try_pop_inner(&self, guard: &Guard) -> PopAttempt<T> {
        let current = self.desc.load(Ordering::Acquire, guard);
        // SAFETY: the descriptor handle is never null.
        let current_ref = unsafe { current.deref() };
        self.finish_pending(current_ref, guard);

        let size = current_ref.size;
        if size == 0 {
            return PopAttempt::Empty;
        }
        let top = size - 1;
        let slot = self.storage.cell(top).load(Ordering::Acquire, guard);

        let next = Owned::new(Descriptor {
            size: top,
            writer: None,
        });
        match self
            .desc
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(_) => {
                // SAFETY: `current` is detached and all earlier readers are
                // pinned.
                unsafe { guard.defer_destroy(current) };
                // SAFETY: `top` was below the published size, so its write
                // completed before that descriptor could be replaced, and the
                // successful descriptor CAS makes this thread the sole popper
                // of this element. The slot allocation stays in the cell; only
                // the value moves out.
                let slot_ref = unsafe { slot.deref() };
                let value = ManuallyDrop::into_inner(unsafe { ptr::read(&slot_ref.value) });
                PopAttempt::Popped(value)
            }
            Err(_) => PopAttempt::Contended,
        }
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread is operating on the
        // stack, so an unprotected guard is fine and retirements run at once.
        let guard = unsafe { epoch::unprotected() };
        let current = self.desc.load(Ordering::Relaxed, guard);
        unsafe {
            let current_ref = current.deref();
            // Settle any write the last push announced, then drop the live
            // values in place. Storage frees the allocations afterwards.
            self.finish_pending(current_ref, guard);
            for index in 0..current_ref.size {
                let slot = self.storage.cell(index).load(Ordering::Relaxed, guard);
                drop(ManuallyDrop::into_inner(ptr::read(&slot.deref().value)));
            }
            drop(current.into_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn push_then_pop_round_trip() {
        let stack = Stack::new();
        stack.push(10).unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.pop(), 10);
        assert_eq!(stack.len(), 0);
        assert!(stack.is_empty());
    }

    #[test]
    fn pops_come_out_in_reverse_push_order() {
        let stack = Stack::new();
        for i in 0..100 {
            stack.push(i).unwrap();
        }
        for i in (0..100).rev() {
            assert_eq!(stack.pop(), i);
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn len_tracks_pushes_and_pops() {
        let stack = Stack::new();
        for i in 0..50 {
            stack.push(i).unwrap();
            assert_eq!(stack.len(), i + 1);
        }
        for i in 0..20 {
            stack.pop();
            assert_eq!(stack.len(), 49 - i);
        }
        assert_eq!(stack.len(), 30);
    }

    #[test]
    fn try_pop_reports_empty() {
        let stack = Stack::new();
        assert_eq!(stack.try_pop(), None);
        stack.push(String::from("alpha")).unwrap();
        assert_eq!(stack.try_pop(), Some(String::from("alpha")));
        assert_eq!(stack.try_pop(), None);
    }

    #[test]
    fn op_counter_counts_completed_calls() {
        let stack = Stack::new();
        stack.push(1).unwrap();
        stack.push(2).unwrap();
        stack.push(3).unwrap();
        stack.pop();
        stack.pop();
        assert_eq!(stack.op_count(), 5);
    }

    #[test]
    fn diagnostic_read_sees_live_cells() {
        let stack = Stack::new();
        for i in 0..10 {
            stack.push(i).unwrap();
        }
        for i in 0..10 {
            assert_eq!(unsafe { stack.get_unchecked(i) }, Some(i));
        }
    }

    #[test]
    fn completed_writes_are_idempotent() {
        let stack = Stack::new();
        stack.push(7).unwrap();

        let guard = epoch::pin();
        let desc = unsafe { stack.desc.load(Ordering::Acquire, &guard).deref() };
        let w = desc.writer.as_ref().unwrap();
        // The pusher completed its own write eagerly.
        assert!(!w.pending.load(Ordering::Acquire));

        let before = stack.storage.cell(0).load(Ordering::Acquire, &guard).as_raw();
        stack.finish_pending(desc, &guard);
        stack.finish_pending(desc, &guard);
        let after = stack.storage.cell(0).load(Ordering::Acquire, &guard).as_raw();
        assert_eq!(before, after);

        // A helper that re-observes the flag finds the write already applied
        // and only clears the flag again.
        w.pending.store(true, Ordering::Release);
        stack.finish_pending(desc, &guard);
        assert!(!w.pending.load(Ordering::Acquire));
        assert_eq!(
            stack.storage.cell(0).load(Ordering::Acquire, &guard).as_raw(),
            after
        );
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn len_subtracts_a_push_still_pending() {
        let stack = Stack::new();
        stack.push(7).unwrap();

        let guard = epoch::pin();
        let desc = unsafe { stack.desc.load(Ordering::Acquire, &guard).deref() };
        let w = desc.writer.as_ref().unwrap();

        // While the announced write is unapplied, its slot is not settled and
        // must not be counted.
        w.pending.store(true, Ordering::Release);
        assert_eq!(stack.len(), 0);
        assert!(stack.is_empty());

        w.pending.store(false, Ordering::Release);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn two_pushers_drain_to_exact_multiset() {
        let stack = Arc::new(Stack::new());
        let mut handles = Vec::new();
        for t in 0..2usize {
            let stack = Arc::clone(&stack);
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    stack.push(t * 1000 + i).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut drained: Vec<usize> = (0..2000).map(|_| stack.pop()).collect();
        drained.sort_unstable();
        let expected: Vec<usize> = (0..2000).collect();
        assert_eq!(drained, expected);
        assert!(stack.is_empty());
    }

    #[test]
    fn concurrent_mix_loses_and_duplicates_nothing() {
        let stack = Arc::new(Stack::new());
        let mut handles = Vec::new();
        for t in 0..4usize {
            let stack = Arc::clone(&stack);
            handles.push(thread::spawn(move || {
                let mut popped = Vec::new();
                for i in 0..500 {
                    stack.push(t * 500 + i).unwrap();
                    if i % 3 == 0 {
                        if let Some(v) = stack.try_pop() {
                            popped.push(v);
                        }
                    }
                }
                popped
            }));
        }

        let mut seen: Vec<usize> = Vec::new();
        for handle in handles {
            seen.extend(handle.join().unwrap());
        }
        // Pops can never outnumber pushes.
        assert!(seen.len() <= 2000);
        while let Some(v) = stack.try_pop() {
            seen.push(v);
        }

        let unique: HashSet<usize> = seen.iter().copied().collect();
        assert_eq!(unique.len(), seen.len(), "a value was popped twice");
        assert_eq!(seen.len(), 2000, "a pushed value was lost");
        assert!(seen.iter().all(|&v| v < 2000));
    }

    #[test]
    fn pop_on_empty_blocks_until_a_push_arrives() {
        let stack = Arc::new(Stack::new());
        let popper = {
            let stack = Arc::clone(&stack);
            thread::spawn(move || stack.pop())
        };
        thread::sleep(Duration::from_millis(50));
        stack.push(42).unwrap();
        assert_eq!(popper.join().unwrap(), 42);
    }

    #[test]
    fn values_drop_exactly_once() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let stack = Stack::new();
            for _ in 0..5 {
                stack.push(Counted(Arc::clone(&drops))).unwrap();
            }
            // Two values leave through pop and drop here; cells keep their
            // stale slots behind.
            stack.pop();
            stack.pop();
            assert_eq!(drops.load(Ordering::Relaxed), 2);
            // Repush over the stale cells.
            stack.push(Counted(Arc::clone(&drops))).unwrap();
        }
        // 2 popped + 4 live at drop.
        assert_eq!(drops.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn growth_crosses_bucket_boundaries_without_moving_elements() {
        let stack = Stack::new();
        for i in 0..100 {
            stack.push(i).unwrap();
        }
        // Elements written before later buckets were allocated still read
        // back in place.
        for i in (0..100).rev() {
            assert_eq!(stack.pop(), i);
        }
    }
}
