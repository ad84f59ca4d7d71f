//! Wait-free hash tables with linearizable moment-in-time views, built on an
//! epoch-based memory manager that doubles as a write-ordering service.
//!
//! The crate has three layers:
//!
//! - [`mmm`]: epoch-based safe reclamation. Every shared record carries a
//!   hidden header holding its committed *write epoch*; the epoch counter is
//!   both the reclamation clock and the total order of writes, which is what
//!   lets readers linearize to a definite instant.
//! - [`Woolhat`]: a lock-free, wait-free ordered hash table. Each bucket keeps
//!   a push-only chain of record versions, so a reader holding an epoch
//!   reservation can walk back to the newest record at or before its epoch and
//!   obtain a true moment-in-time view of the whole table.
//! - [`Witchhat`]: the same table without per-record history. Cheaper, same
//!   migration and helping machinery, but views are only approximate.
//!
//! Tables never see keys: callers hash externally and operate on opaque
//! 128-bit [`HashValue`]s. Equality is identity on all 128 bits.
//!
//! Threads participate through an explicit [`ThreadCtx`] obtained from a
//! [`Domain`]. The context owns the thread's epoch reservation slot and its
//! retirement list; dropping it returns both. Tables created on the same
//! domain share one epoch timeline, which is what makes
//! [`Woolhat::view_epoch`] usable for set operations spanning several tables.

pub mod mmm;
pub mod witchhat;
pub mod woolhat;

pub use mmm::{Domain, Epoch, ThreadCtx, EPOCH_UNRESERVED};
pub use witchhat::Witchhat;
pub use woolhat::Woolhat;

#[cfg(loom)]
pub(crate) mod sync {
    pub(crate) use loom::sync::{atomic, Arc, Mutex};
}
#[cfg(not(loom))]
pub(crate) mod sync {
    pub(crate) use std::sync::{atomic, Arc, Mutex};
}

/// Smallest store size, as a log2 bucket count.
pub const MIN_SIZE_LOG: usize = 4;

/// Size of the epoch reservation array; the hard cap on concurrently
/// registered threads.
pub const THREADS_MAX: usize = 4096;

/// Log2 of the retirement-count period between reclamation scans.
pub const RETIRE_FREQ_LOG: u32 = 7;

/// Migration-induced retries a mutator tolerates before requesting help.
pub const RETRY_THRESHOLD: usize = 7;

/// An opaque 128-bit hash identity.
///
/// The table stores no keys; two operations address the same logical entry
/// exactly when their hash values are bit-identical. The all-zero value is
/// reserved to mean "bucket unclaimed" and is rejected here, so callers using
/// a hash function with a reachable zero output must remap it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashValue(u128);

impl HashValue {
    /// Wraps raw hash bits.
    ///
    /// # Panics
    ///
    /// Panics if `bits` is zero.
    pub fn new(bits: u128) -> Self {
        assert!(bits != 0, "the all-zero hash value is reserved");
        HashValue(bits)
    }

    /// The low 64 bits, used for bucket indexing.
    pub const fn low(self) -> u64 {
        self.0 as u64
    }

    pub const fn as_u128(self) -> u128 {
        self.0
    }
}

impl From<(u64, u64)> for HashValue {
    fn from((hi, lo): (u64, u64)) -> Self {
        HashValue::new(((hi as u128) << 64) | lo as u128)
    }
}
