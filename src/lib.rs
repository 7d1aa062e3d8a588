//! An unbounded, lock-free, array-backed stack.
//!
//! Every logical state transition is a single CAS on one shared descriptor
//! handle; a push additionally announces a deferred
//! single-cell write that any thread will finish on the pusher's behalf
//! (helping), which is what keeps the structure lock-free when a pusher
//! stalls. Storage is segmented into geometrically growing buckets, so the
//! array grows without ever relocating an element. Contended operations back
//! off exponentially and retry; progress is guaranteed, ordering across
//! threads is not.

mod backoff;
mod stack;
mod storage;

pub use stack::Stack;
pub use stack::StackError;
