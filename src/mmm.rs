//! MMM, the miniature memory manager: epoch-based safe reclamation where the
//! epoch counter is also the linearization clock.
//!
//! Every shared record is allocated with a [`Header`] as its first field. The
//! header carries the record's committed *write epoch* (zero until committed)
//! and its *create epoch* (the sort key for ordered iteration). Committing is
//! a fetch-add on the global epoch followed by a CAS of the write epoch from
//! zero, so each committed record owns a unique point on the timeline and any
//! thread that depends on an uncommitted record can help it commit.
//!
//! Readers reserve an epoch in a per-thread slot before touching shared
//! memory. A retired record is freed only once every live reservation is
//! strictly newer than its retirement epoch, so a reader can keep following
//! `next` pointers through record chains without ever touching freed memory.
//!
//! Reclamation is local: each thread keeps its own retirement list and scans
//! it every `1 << RETIRE_FREQ_LOG` retirements. Threads that exit with
//! unreclaimable retirements park them on the domain's orphan list, which is
//! swept opportunistically and drained when the domain itself is dropped.

use std::marker::PhantomData;

use crossbeam_utils::CachePadded;
use slab::Slab;

use crate::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use crate::{RETIRE_FREQ_LOG, RETRY_THRESHOLD};

/// A point on the global write timeline.
pub type Epoch = u64;

/// Reservation-slot sentinel: this thread is not reading.
pub const EPOCH_UNRESERVED: Epoch = u64::MAX;

/// Set in a reservation slot by a reader that lost the reservation race too
/// many times and wants a writer to install an epoch on its behalf.
const RESERVATION_HELP: Epoch = 1 << 63;

/// The top two bits of a reservation are flag space, not epoch.
const EPOCH_FLAG_MASK: Epoch = 0b11 << 62;

const RETIRE_SCAN_MASK: u64 = (1 << RETIRE_FREQ_LOG) - 1;

// Loom models at most a handful of threads; keep the reservation scan short
// there so the model space stays tractable.
#[cfg(loom)]
const RESERVATION_SLOTS: usize = 8;
#[cfg(not(loom))]
const RESERVATION_SLOTS: usize = crate::THREADS_MAX;

/// Hidden per-record bookkeeping.
///
/// Lives at offset zero of every reclaimable allocation (see [`Reclaim`]), so
/// a type-erased `*mut Header` is also the allocation address.
#[repr(C)]
pub(crate) struct Header {
    write_epoch: AtomicU64,
    create_epoch: AtomicU64,
}

impl Header {
    /// An uncommitted header; the owner must commit exactly once via
    /// [`Domain::commit`] (or rely on a helper doing it first).
    pub(crate) fn new() -> Header {
        Header {
            write_epoch: AtomicU64::new(0),
            create_epoch: AtomicU64::new(0),
        }
    }

    /// A header committed at allocation time. For records that never serve as
    /// linearization points, where a pre-assigned epoch is fine.
    pub(crate) fn new_committed(domain: &Domain) -> Header {
        Header {
            write_epoch: AtomicU64::new(domain.issue_epoch()),
            create_epoch: AtomicU64::new(0),
        }
    }

    /// Zero until the record is committed.
    pub(crate) fn write_epoch(&self) -> Epoch {
        self.write_epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn create_epoch(&self) -> Epoch {
        self.create_epoch.load(Ordering::Relaxed)
    }

    /// Install the sort key. Idempotent: every helper derives the same value
    /// from the immutable chain below, so the first CAS wins and the rest
    /// agree with it.
    pub(crate) fn set_create_epoch(&self, epoch: Epoch) {
        let _ = self.create_epoch.compare_exchange(
            0,
            epoch,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }
}

/// Marker for types managed by MMM.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with a [`Header`] as the first field, so
/// that a pointer to the value and a pointer to its header are
/// interchangeable. Values are dropped type-erased on whatever thread
/// performs the reclamation scan.
pub(crate) unsafe trait Reclaim: Sized + Send {
    fn header(&self) -> &Header;
}

unsafe fn drop_retired<T: Reclaim>(header: *mut Header) {
    drop(unsafe { Box::from_raw(header.cast::<T>()) });
}

/// One entry on a retirement list: the type-erased record, the epoch at which
/// it became unreachable, and its monomorphized destructor.
pub(crate) struct Retired {
    header: *mut Header,
    retire_epoch: Epoch,
    drop_fn: unsafe fn(*mut Header),
}

impl Retired {
    pub(crate) fn new<T: Reclaim>(ptr: *mut T, retire_epoch: Epoch) -> Retired {
        let header = ptr.cast::<Header>();
        debug_assert!(std::ptr::eq(
            unsafe { (*ptr).header() } as *const Header,
            header as *const Header
        ));
        Retired {
            header,
            retire_epoch,
            drop_fn: drop_retired::<T>,
        }
    }

    /// True (after freeing) when no live reservation can still reach the
    /// record. `min` is the minimum over all current reservations.
    fn try_free(&self, min: Epoch) -> bool {
        if self.retire_epoch < min {
            unsafe { (self.drop_fn)(self.header) };
            true
        } else {
            false
        }
    }
}

// SAFETY: every `Reclaim` implementor is `Send`, so its destructor may run on
// whichever thread ends up reclaiming it.
unsafe impl Send for Retired {}

/// The shared state of one reclamation domain: the epoch counter, the
/// reservation array, and thread registration.
///
/// Tables constructed on the same domain share one epoch timeline; that is
/// required for cross-table epoch views and otherwise harmless.
pub struct Domain {
    epoch: CachePadded<AtomicU64>,
    /// Count of reservation slots currently carrying [`RESERVATION_HELP`].
    help_required: CachePadded<AtomicU64>,
    reservations: Box<[AtomicU64]>,
    slots: Mutex<Slab<()>>,
    /// Retirements surrendered by exiting threads and dropped tables.
    orphans: Mutex<Vec<Retired>>,
}

impl Domain {
    /// Creates a domain with an empty timeline. Epochs start at 1; zero means
    /// "uncommitted" everywhere a write epoch is stored.
    pub fn new() -> Arc<Domain> {
        let reservations = (0..RESERVATION_SLOTS)
            .map(|_| AtomicU64::new(EPOCH_UNRESERVED))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Domain {
            epoch: CachePadded::new(AtomicU64::new(1)),
            help_required: CachePadded::new(AtomicU64::new(0)),
            reservations,
            slots: Mutex::new(Slab::new()),
            orphans: Mutex::new(Vec::new()),
        })
    }

    /// Registers the calling thread, issuing it a reservation slot.
    ///
    /// Slots are recycled through a free list as contexts are dropped.
    ///
    /// # Panics
    ///
    /// Panics when more than [`crate::THREADS_MAX`] contexts are live at
    /// once.
    pub fn register(self: &Arc<Self>) -> ThreadCtx {
        let slot = self.slots.lock().unwrap().insert(());
        assert!(
            slot < RESERVATION_SLOTS,
            "thread registration exhausted ({} live contexts)",
            RESERVATION_SLOTS
        );
        ThreadCtx {
            domain: self.clone(),
            slot,
            op_depth: 0,
            retired: Vec::new(),
            retire_count: 0,
            _marker: PhantomData,
        }
    }

    pub(crate) fn current_epoch(&self) -> Epoch {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Advances the global epoch and returns the freshly issued value.
    ///
    /// Writers pass through here for every commit, which is why this is also
    /// where stalled readers get helped: as long as a reader is waiting with
    /// the help bit set, whoever issues the next epoch installs one for it.
    pub(crate) fn issue_epoch(&self) -> Epoch {
        if self.help_required.load(Ordering::SeqCst) > 0 {
            self.help_reservations();
        }
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn help_reservations(&self) {
        let current = self.epoch.load(Ordering::SeqCst);
        for slot in self.reservations.iter() {
            let v = slot.load(Ordering::SeqCst);
            if v == EPOCH_UNRESERVED || v & RESERVATION_HELP == 0 {
                continue;
            }
            if slot
                .compare_exchange(v, current, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.help_required.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Commits `header` to a fresh epoch. Returns the committed epoch, which
    /// is someone else's value if a helper got there first — that race is
    /// benign by construction.
    pub(crate) fn commit(&self, header: &Header) -> Epoch {
        let epoch = self.issue_epoch();
        match header
            .write_epoch
            .compare_exchange(0, epoch, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => epoch,
            Err(committed) => committed,
        }
    }

    /// Commits `header` only if nobody has yet; cheap when already committed.
    pub(crate) fn help_commit(&self, header: &Header) -> Epoch {
        let committed = header.write_epoch();
        if committed != 0 {
            committed
        } else {
            self.commit(header)
        }
    }

    fn min_reservation(&self) -> Epoch {
        let mut min = Epoch::MAX;
        for slot in self.reservations.iter() {
            let v = slot.load(Ordering::SeqCst);
            if v == EPOCH_UNRESERVED {
                continue;
            }
            min = min.min(v & !EPOCH_FLAG_MASK);
        }
        min
    }

    /// Accepts retirements from a context or table that is going away.
    pub(crate) fn adopt_orphans(&self, retired: &mut Vec<Retired>) {
        if !retired.is_empty() {
            self.orphans.lock().unwrap().append(retired);
        }
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        // The domain outlives every context and table on it, so at this point
        // no reservation exists and every orphan is reclaimable.
        let mut orphans = self.orphans.lock().unwrap();
        for r in orphans.drain(..) {
            unsafe { (r.drop_fn)(r.header) };
        }
    }
}

/// A thread's participation handle: its reservation slot and its private
/// retirement list.
///
/// Obtained from [`Domain::register`] and passed explicitly into every table
/// operation. `ThreadCtx` is `Send` (a thread may be moved) but not `Sync`;
/// one context serves exactly one thread at a time.
pub struct ThreadCtx {
    domain: Arc<Domain>,
    slot: usize,
    op_depth: usize,
    retired: Vec<Retired>,
    retire_count: u64,
    // pointer so we get !Send/!Sync without the `unsafe impl`s below.
    _marker: PhantomData<*const ()>,
}

// SAFETY: the retirement list only ever holds `Reclaim` (hence `Send`) records
// and the slot index stays valid wherever the context travels. The missing
// `Sync` is the point: `&mut self` methods assume exclusive use.
unsafe impl Send for ThreadCtx {}

impl ThreadCtx {
    /// The domain identity, for the table/context affinity check.
    pub(crate) fn domain_ptr(&self) -> *const Domain {
        &*self.domain
    }

    fn reservation(&self) -> &AtomicU64 {
        &self.domain.reservations[self.slot]
    }

    /// Begins a read/write operation: publish the current epoch as this
    /// thread's reservation. Anything retired from here on stays allocated
    /// until [`Self::end_op`]. A reservation that lands a little stale is
    /// safe — it only keeps more memory alive.
    ///
    /// Calls nest; only the outermost call writes the slot.
    pub(crate) fn begin_op(&mut self) {
        if self.op_depth == 0 {
            let e = self.domain.epoch.load(Ordering::SeqCst);
            self.reservation().store(e, Ordering::SeqCst);
        }
        self.op_depth += 1;
    }

    /// Begins an operation linearized at the returned epoch: the reservation
    /// must equal an epoch the counter actually rested at.
    ///
    /// The reservation is retried while the counter churns; past
    /// [`RETRY_THRESHOLD`] failures the thread parks the help bit in its slot
    /// and lets the writers driving the churn install the epoch instead,
    /// which bounds the wait by the number of active writers.
    pub(crate) fn begin_linearized_op(&mut self) -> Epoch {
        if self.op_depth > 0 {
            // Already reserved; the enclosing reservation is the (older,
            // still valid) linearization point.
            self.op_depth += 1;
            return self.reservation().load(Ordering::SeqCst) & !EPOCH_FLAG_MASK;
        }

        let mut reserved = None;
        for _ in 0..RETRY_THRESHOLD {
            let e = self.domain.epoch.load(Ordering::SeqCst);
            self.reservation().store(e, Ordering::SeqCst);
            if self.domain.epoch.load(Ordering::SeqCst) == e {
                reserved = Some(e);
                break;
            }
        }

        let e = match reserved {
            Some(e) => e,
            None => self.reserve_with_help(),
        };
        self.op_depth += 1;
        e
    }

    /// Slow path of [`Self::begin_linearized_op`].
    fn reserve_with_help(&mut self) -> Epoch {
        let last = self.domain.epoch.load(Ordering::SeqCst);
        self.reservation()
            .store(RESERVATION_HELP | last, Ordering::SeqCst);
        self.domain.help_required.fetch_add(1, Ordering::SeqCst);

        loop {
            let v = self.reservation().load(Ordering::SeqCst);
            if v & RESERVATION_HELP == 0 {
                // A writer installed our epoch and took our help request down.
                return v;
            }
            let e = self.domain.epoch.load(Ordering::SeqCst);
            if self
                .reservation()
                .compare_exchange(v, e, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // We resolved it ourselves; the request is still counted.
                self.domain.help_required.fetch_sub(1, Ordering::SeqCst);
                return e;
            }
            core::hint::spin_loop();
        }
    }

    /// Ends the operation begun by the matching `begin_*` call; the outermost
    /// call releases the reservation.
    pub(crate) fn end_op(&mut self) {
        debug_assert!(self.op_depth > 0);
        self.op_depth -= 1;
        if self.op_depth == 0 {
            self.reservation().store(EPOCH_UNRESERVED, Ordering::SeqCst);
        }
    }

    pub(crate) fn in_op(&self) -> bool {
        self.op_depth > 0
    }

    /// Runs `f` inside one linearized reservation window and hands it the
    /// linearization epoch.
    ///
    /// This is the composition point for multi-table snapshots: every
    /// [`crate::Woolhat::view_epoch`] call made from `f` with this epoch is
    /// linearized at the same instant.
    ///
    /// ```
    /// # use woolhat::{Domain, HashValue, Woolhat};
    /// let domain = Domain::new();
    /// let mut ctx = domain.register();
    /// let a: Woolhat<u32> = Woolhat::new(&domain);
    /// let b: Woolhat<u32> = Woolhat::new(&domain);
    /// a.put(&mut ctx, HashValue::new(7), 1);
    /// let (va, vb) = ctx.with_linearized(|ctx, epoch| {
    ///     (a.view_epoch(ctx, epoch, false), b.view_epoch(ctx, epoch, false))
    /// });
    /// assert_eq!(va.len(), 1);
    /// assert_eq!(vb.len(), 0);
    /// ```
    pub fn with_linearized<R>(&mut self, f: impl FnOnce(&mut ThreadCtx, Epoch) -> R) -> R {
        let epoch = self.begin_linearized_op();
        let r = f(self, epoch);
        self.end_op();
        r
    }

    /// Marks `ptr` unreachable-from-now: stamps it with the current epoch and
    /// queues it on this thread's list. The actual free happens in a later
    /// scan, once no reservation is old enough to reach it.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live `Box`-allocated record that has been unlinked
    /// from the shared structure exactly once (a record must not be retired
    /// twice, and must not be freed by any other path afterwards).
    pub(crate) unsafe fn retire<T: Reclaim>(&mut self, ptr: *mut T) {
        let epoch = self.domain.current_epoch();
        self.retired.push(Retired::new(ptr, epoch));
        self.retire_count += 1;
        if self.retire_count & RETIRE_SCAN_MASK == 0 {
            self.collect();
        }
    }

    /// One reclamation pass over this thread's list, plus an opportunistic
    /// sweep of the domain orphans if nobody else is in there.
    fn collect(&mut self) {
        let min = self.domain.min_reservation();
        self.retired.retain(|r| !r.try_free(min));

        if let Ok(mut orphans) = self.domain.orphans.try_lock() {
            orphans.retain(|r| !r.try_free(min));
        }
    }
}

impl Drop for ThreadCtx {
    fn drop(&mut self) {
        debug_assert_eq!(self.op_depth, 0, "ThreadCtx dropped mid-operation");
        self.collect();
        let mut leftover = std::mem::take(&mut self.retired);
        self.domain.adopt_orphans(&mut leftover);
        self.reservation().store(EPOCH_UNRESERVED, Ordering::SeqCst);
        self.domain.slots.lock().unwrap().remove(self.slot);
    }
}
