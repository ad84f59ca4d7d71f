//! A lock-free, wait-free hash table with linearizable moment-in-time views.
//!
//! Buckets are claimed by a single 128-bit CAS on the hash word; once claimed,
//! a bucket's hash never changes for the life of the store. The rest of the
//! bucket is one machine word: the head of a push-only chain of record
//! versions, with the `MOVING` / `MOVED` / `DELETE_HELP` flags packed into the
//! pointer's alignment bits. Every mutation is a single CAS of that word, so
//! no operation ever exposes partial state.
//!
//! Wait-freedom comes from three helping protocols layered on the epoch
//! manager in [`crate::mmm`]:
//!
//! - any thread that depends on an uncommitted record commits it;
//! - a remover that loses its install CAS flags the bucket with
//!   `DELETE_HELP`, after which every writer installs the deletion before its
//!   own record;
//! - a mutator that keeps losing to migrations asks for help through the
//!   table's help counter, and migrations under help pressure always double
//!   the store, which bounds how often anyone can lose.
//!
//! History chains plus committed write epochs are what make views
//! linearizable: a reader reserves an epoch and walks each chain down to the
//! newest record at or before it.

use std::marker::PhantomData;
use std::ptr;

use portable_atomic::AtomicU128;

use crate::mmm::{Domain, Epoch, Header, Reclaim, Retired, ThreadCtx};
use crate::sync::{
    atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use crate::{HashValue, MIN_SIZE_LOG, RETRY_THRESHOLD};

/// Bucket is being migrated; no new record may be installed.
const MOVING: usize = 0b001;
/// Bucket's contents are present in the successor store (or were dead).
const MOVED: usize = 0b010;
/// A remover lost its install race; writers must install its deletion first.
const DELETE_HELP: usize = 0b100;

const FLAG_MASK: usize = 0b111;

/// One version of a bucket's contents. `next` points at the displaced
/// version and is immutable once the record is published; chains are
/// push-only, and the epoch manager keeps displaced versions alive for as
/// long as any reader could walk down to them.
#[repr(C)]
struct Record<T> {
    header: Header,
    next: *mut Record<T>,
    /// `None` marks a deletion record.
    item: Option<T>,
}

// SAFETY: `next` chains are immutable shared data owned by the table; the raw
// pointer carries no thread affinity beyond what `T` itself imposes.
unsafe impl<T: Send> Send for Record<T> {}
unsafe impl<T: Send + Sync> Sync for Record<T> {}

// SAFETY: `#[repr(C)]` with the header first.
unsafe impl<T: Send> Reclaim for Record<T> {
    fn header(&self) -> &Header {
        &self.header
    }
}

impl<T> Record<T> {
    fn deleted(&self) -> bool {
        self.item.is_none()
    }

    /// The iteration sort key: this record's own write epoch if it started a
    /// fresh lineage, otherwise the create epoch of the oldest live ancestor.
    ///
    /// Computed lazily and installed by CAS-from-zero, so a viewer racing the
    /// installer derives the identical value from the immutable chain.
    fn sort_epoch(&self) -> Epoch {
        let create = self.header.create_epoch();
        if create != 0 {
            return create;
        }
        let inherited = match unsafe { self.next.as_ref() } {
            Some(below) if !below.deleted() => below.sort_epoch(),
            _ => self.header.write_epoch(),
        };
        self.header.set_create_epoch(inherited);
        inherited
    }
}

/// A bucket's mutable word: head-of-chain pointer plus flag bits, packed so
/// the pair swaps atomically.
struct State<T> {
    bits: usize,
    _marker: PhantomData<*mut Record<T>>,
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for State<T> {}

impl<T> State<T> {
    const EMPTY: State<T> = State {
        bits: 0,
        _marker: PhantomData,
    };

    fn new(head: *mut Record<T>, flags: usize) -> State<T> {
        debug_assert_eq!(head as usize & FLAG_MASK, 0);
        debug_assert_eq!(flags & !FLAG_MASK, 0);
        State {
            bits: head as usize | flags,
            _marker: PhantomData,
        }
    }

    fn from_bits(bits: usize) -> State<T> {
        State {
            bits,
            _marker: PhantomData,
        }
    }

    fn bits(self) -> usize {
        self.bits
    }

    fn head(self) -> *mut Record<T> {
        (self.bits & !FLAG_MASK) as *mut Record<T>
    }

    fn moving(self) -> bool {
        self.bits & MOVING != 0
    }

    fn moved(self) -> bool {
        self.bits & MOVED != 0
    }

    fn delete_help(self) -> bool {
        self.bits & DELETE_HELP != 0
    }
}

struct Bucket<T> {
    /// Zero until claimed; immutable afterwards.
    hv: AtomicU128,
    state: AtomicUsize,
    _marker: PhantomData<*mut Record<T>>,
}

// SAFETY: all access to a bucket goes through its atomics.
unsafe impl<T: Send> Send for Bucket<T> {}
unsafe impl<T: Send + Sync> Sync for Bucket<T> {}

impl<T> Bucket<T> {
    fn new() -> Bucket<T> {
        Bucket {
            hv: AtomicU128::new(0),
            state: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    fn state(&self) -> State<T> {
        State::from_bits(self.state.load(Ordering::SeqCst))
    }

    fn cas_state(&self, current: State<T>, new: State<T>) -> Result<(), State<T>> {
        self.state
            .compare_exchange(current.bits(), new.bits(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(State::from_bits)
    }

    /// ORs flag bits into the state, leaving the head untouched. Returns the
    /// resulting state.
    fn or_flags(&self, flags: usize) -> State<T> {
        State::from_bits(self.state.fetch_or(flags, Ordering::SeqCst) | flags)
    }
}

/// Outcome of an acquiring probe.
enum Acquired<'a, T> {
    Bucket(&'a Bucket<T>),
    /// Our claim pushed the store to its threshold; migrate and retry.
    Grew,
    /// Every slot probed without a claim; the store must be replaced.
    Full,
}

#[repr(C)]
struct Store<T> {
    header: Header,
    last_slot: u64,
    threshold: usize,
    /// Buckets whose hash has been claimed, tombstoned included.
    used_count: AtomicUsize,
    next_store: AtomicPtr<Store<T>>,
    buckets: Box<[Bucket<T>]>,
}

// SAFETY: header-first `#[repr(C)]`; a store is retired at most once, after
// it stops being the table's current store.
unsafe impl<T: Send + Sync> Reclaim for Store<T> {
    fn header(&self) -> &Header {
        &self.header
    }
}

impl<T> Store<T> {
    fn boxed(domain: &Domain, size: usize) -> Box<Store<T>> {
        debug_assert!(size.is_power_of_two());
        let buckets = (0..size)
            .map(|_| Bucket::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Store {
            // stores are not linearization points, so they take their epoch
            // eagerly
            header: Header::new_committed(domain),
            last_slot: size as u64 - 1,
            threshold: size - (size >> 2),
            used_count: AtomicUsize::new(0),
            next_store: AtomicPtr::new(ptr::null_mut()),
            buckets,
        })
    }

    fn size(&self) -> usize {
        self.last_slot as usize + 1
    }

    fn bucket_at(&self, low: u64, step: u64) -> &Bucket<T> {
        &self.buckets[(low.wrapping_add(step) & self.last_slot) as usize]
    }

    /// Read-only probe: stops at the first never-claimed slot.
    fn find(&self, hash: HashValue) -> Option<&Bucket<T>> {
        let h = hash.as_u128();
        for step in 0..=self.last_slot {
            let bucket = self.bucket_at(hash.low(), step);
            let hv = bucket.hv.load(Ordering::Acquire);
            if hv == 0 {
                return None;
            }
            if hv == h {
                return Some(bucket);
            }
        }
        None
    }

    /// Probe that claims the first never-claimed slot for `hash`.
    fn acquire(&self, hash: HashValue) -> Acquired<'_, T> {
        let h = hash.as_u128();
        for step in 0..=self.last_slot {
            let bucket = self.bucket_at(hash.low(), step);
            let hv = bucket.hv.load(Ordering::Acquire);
            if hv == h {
                return Acquired::Bucket(bucket);
            }
            if hv != 0 {
                continue;
            }
            match bucket
                .hv
                .compare_exchange(0, h, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => {
                    let used = self.used_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if used >= self.threshold {
                        return Acquired::Grew;
                    }
                    return Acquired::Bucket(bucket);
                }
                Err(current) if current == h => return Acquired::Bucket(bucket),
                Err(_) => continue,
            }
        }
        Acquired::Full
    }

    /// Migration-time claim in the successor. Infallible: the successor is
    /// sized so every live source bucket fits below its threshold.
    fn copy_target(&self, hv: u128) -> &Bucket<T> {
        let low = hv as u64;
        for step in 0..=self.last_slot {
            let bucket = self.bucket_at(low, step);
            let current = bucket.hv.load(Ordering::Acquire);
            if current == hv {
                return bucket;
            }
            if current != 0 {
                continue;
            }
            match bucket
                .hv
                .compare_exchange(0, hv, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => return bucket,
                Err(current) if current == hv => return bucket,
                Err(_) => continue,
            }
        }
        unreachable!("successor store too small for the live buckets")
    }
}

/// What a store-level operation asks the table-level loop to do next.
enum Step<R, P> {
    Done(R),
    /// The store is being (or has been) replaced; retry in the successor,
    /// handing any owned value back through the payload.
    Retry(P),
}

/// A lock-free, wait-free hash table mapping 128-bit hash identities to
/// values, with linearizable whole-table views.
///
/// Values are stored by value and handed out as clones; `Arc<V>` is the
/// natural payload when cloning is not cheap. All operations take the calling
/// thread's [`ThreadCtx`], which must come from the same [`Domain`] the table
/// was built on.
pub struct Woolhat<T: Send + Sync + 'static> {
    domain: Arc<Domain>,
    store: AtomicPtr<Store<T>>,
    item_count: AtomicUsize,
    /// Mutators that have exhausted their retry budget; migrations double the
    /// store while this is non-zero.
    help_needed: AtomicU64,
}

// SAFETY: all shared state is behind atomics; values cross threads only as
// `T: Send + Sync` allows.
unsafe impl<T: Send + Sync> Send for Woolhat<T> {}
unsafe impl<T: Send + Sync> Sync for Woolhat<T> {}

impl<T: Clone + Send + Sync + 'static> Woolhat<T> {
    /// A table with the minimum store size.
    pub fn new(domain: &Arc<Domain>) -> Woolhat<T> {
        Self::with_size(domain, MIN_SIZE_LOG)
    }

    /// A table with `1 << log2_buckets` initial buckets (clamped to the
    /// minimum size).
    pub fn with_size(domain: &Arc<Domain>, log2_buckets: usize) -> Woolhat<T> {
        let size = 1usize << log2_buckets.max(MIN_SIZE_LOG);
        let store = Box::into_raw(Store::boxed(domain, size));
        Woolhat {
            domain: domain.clone(),
            store: AtomicPtr::new(store),
            item_count: AtomicUsize::new(0),
            help_needed: AtomicU64::new(0),
        }
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> usize {
        self.item_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bucket count of the current store.
    pub fn capacity(&self, ctx: &mut ThreadCtx) -> usize {
        self.check_ctx(ctx);
        ctx.begin_op();
        let size = unsafe { &*self.current() }.size();
        ctx.end_op();
        size
    }

    /// Returns the value for `hash`, if present.
    pub fn get(&self, ctx: &mut ThreadCtx, hash: HashValue) -> Option<T> {
        self.check_ctx(ctx);
        ctx.begin_op();
        let found = self.store_get(unsafe { &*self.current() }, hash);
        ctx.end_op();
        found
    }

    /// Inserts or overwrites, returning the displaced value if the entry was
    /// present.
    ///
    /// A put that loses an overwrite race is still a success — it is ordered
    /// as "wrote, then was immediately overwritten" — and in that case the
    /// value handed back is the caller's own, never installed. Callers that
    /// manage payload identity can rely on getting exactly one value back
    /// whenever `Some` is returned.
    pub fn put(&self, ctx: &mut ThreadCtx, hash: HashValue, item: T) -> Option<T> {
        self.mutate(ctx, item, |this, ctx, store, item| {
            this.store_put(ctx, store, hash, item)
        })
    }

    /// Inserts only if no live entry exists. On failure the value comes back
    /// in the `Err`.
    pub fn add(&self, ctx: &mut ThreadCtx, hash: HashValue, item: T) -> Result<(), T> {
        self.mutate(ctx, item, |this, ctx, store, item| {
            this.store_add(ctx, store, hash, item)
        })
    }

    /// Overwrites only if a live entry exists. `Ok` carries the displaced
    /// value (the caller's own, for a lost overwrite race); `Err` hands the
    /// value back on not-found.
    pub fn replace(&self, ctx: &mut ThreadCtx, hash: HashValue, item: T) -> Result<T, T> {
        self.mutate(ctx, item, |this, ctx, store, item| {
            this.store_replace(ctx, store, hash, item)
        })
    }

    /// Removes the entry, returning its value if one was live.
    pub fn remove(&self, ctx: &mut ThreadCtx, hash: HashValue) -> Option<T> {
        self.mutate(ctx, (), |this, ctx, store, ()| {
            this.store_remove(ctx, store, hash)
        })
    }

    /// A moment-in-time snapshot of the whole table: every live entry with
    /// its sort epoch. With `sort`, entries come back ascending by sort epoch,
    /// which is insertion order (an overwrite keeps its lineage's original
    /// position; a reinsert after removal moves to the end).
    pub fn view(&self, ctx: &mut ThreadCtx, sort: bool) -> Vec<(T, Epoch)> {
        self.check_ctx(ctx);
        let epoch = ctx.begin_linearized_op();
        let entries = self.view_inner(epoch, sort);
        ctx.end_op();
        entries.into_iter().map(|(_, item, e)| (item, e)).collect()
    }

    /// The view primitive for multi-table snapshots: linearizes at a caller-
    /// supplied epoch and includes each entry's hash.
    ///
    /// Must run inside [`ThreadCtx::with_linearized`] (which supplies a valid
    /// `epoch`); the reservation is what keeps the walked chains alive.
    pub fn view_epoch(
        &self,
        ctx: &mut ThreadCtx,
        epoch: Epoch,
        sort: bool,
    ) -> Vec<(HashValue, T, Epoch)> {
        self.check_ctx(ctx);
        assert!(
            ctx.in_op(),
            "view_epoch must run inside a linearized window"
        );
        self.view_inner(epoch, sort)
    }

    fn check_ctx(&self, ctx: &ThreadCtx) {
        assert!(
            ptr::eq(&*self.domain, ctx.domain_ptr()),
            "ThreadCtx was registered on a different Domain"
        );
    }

    fn current(&self) -> *mut Store<T> {
        self.store.load(Ordering::SeqCst)
    }

    /// The common mutator harness: run the store-level operation against the
    /// current store, retrying across migrations, escalating to a help
    /// request once the retry budget is spent.
    fn mutate<R, P>(
        &self,
        ctx: &mut ThreadCtx,
        payload: P,
        mut op: impl FnMut(&Woolhat<T>, &mut ThreadCtx, &Store<T>, P) -> Step<R, P>,
    ) -> R {
        self.check_ctx(ctx);
        ctx.begin_op();
        let mut payload = payload;
        let mut retries = 0usize;
        let mut helping = false;
        let result = loop {
            let store = unsafe { &*self.current() };
            match op(self, ctx, store, payload) {
                Step::Done(r) => break r,
                Step::Retry(p) => {
                    payload = p;
                    retries += 1;
                    if retries == RETRY_THRESHOLD && !helping {
                        self.help_needed.fetch_add(1, Ordering::SeqCst);
                        helping = true;
                    }
                }
            }
        };
        if helping {
            self.help_needed.fetch_sub(1, Ordering::SeqCst);
        }
        ctx.end_op();
        result
    }

    fn store_get(&self, store: &Store<T>, hash: HashValue) -> Option<T> {
        let bucket = store.find(hash)?;
        let head = unsafe { bucket.state().head().as_ref() }?;
        if head.deleted() {
            return None;
        }
        // commit now so every later reader agrees on this value's epoch
        self.domain.help_commit(&head.header);
        head.item.clone()
    }

    fn store_put(
        &self,
        ctx: &mut ThreadCtx,
        store: &Store<T>,
        hash: HashValue,
        item: T,
    ) -> Step<Option<T>, T> {
        let bucket = match store.acquire(hash) {
            Acquired::Bucket(b) => b,
            Acquired::Grew | Acquired::Full => {
                self.migrate(ctx, store);
                return Step::Retry(item);
            }
        };

        let mut state = bucket.state();
        loop {
            if state.moving() {
                self.migrate(ctx, store);
                return Step::Retry(item);
            }
            let head_ptr = state.head();
            let head = unsafe { head_ptr.as_ref() };
            if let Some(h) = head {
                if state.delete_help() && !h.deleted() {
                    state = self.install_deletion(ctx, bucket, state);
                    continue;
                }
                self.domain.help_commit(&h.header);
            }
            let fresh_start = head.map_or(true, Record::deleted);

            let record = Box::into_raw(Box::new(Record {
                header: Header::new(),
                next: head_ptr,
                item: Some(item),
            }));
            match bucket.cas_state(state, State::new(record, 0)) {
                Ok(()) => {
                    let record = unsafe { &*record };
                    let epoch = self.domain.commit(&record.header);
                    let create = if fresh_start {
                        epoch
                    } else {
                        unsafe { (*head_ptr).sort_epoch() }
                    };
                    record.header.set_create_epoch(create);

                    let prev = if fresh_start {
                        self.item_count.fetch_add(1, Ordering::SeqCst);
                        None
                    } else {
                        unsafe { (*head_ptr).item.clone() }
                    };
                    if !head_ptr.is_null() {
                        // SAFETY: we displaced it; exactly one thread does
                        unsafe { ctx.retire(head_ptr) };
                    }
                    self.help_migrate_if_crowded(ctx, store);
                    return Step::Done(prev);
                }
                Err(actual) => {
                    // never published; reclaim the value before deciding
                    let item = unsafe { Box::from_raw(record) }.item.unwrap();
                    if actual.moving() {
                        self.migrate(ctx, store);
                        return Step::Retry(item);
                    }
                    // we wrote first and were immediately overwritten; the
                    // caller gets its own value back as the displaced one
                    return Step::Done(Some(item));
                }
            }
        }
    }

    fn store_add(
        &self,
        ctx: &mut ThreadCtx,
        store: &Store<T>,
        hash: HashValue,
        item: T,
    ) -> Step<Result<(), T>, T> {
        let bucket = match store.acquire(hash) {
            Acquired::Bucket(b) => b,
            Acquired::Grew | Acquired::Full => {
                self.migrate(ctx, store);
                return Step::Retry(item);
            }
        };

        let mut state = bucket.state();
        loop {
            if state.moving() {
                self.migrate(ctx, store);
                return Step::Retry(item);
            }
            let head_ptr = state.head();
            if let Some(h) = unsafe { head_ptr.as_ref() } {
                if !h.deleted() {
                    if state.delete_help() {
                        // the pending delete goes in first; then the bucket is
                        // free for us
                        state = self.install_deletion(ctx, bucket, state);
                        continue;
                    }
                    return Step::Done(Err(item));
                }
            }

            let record = Box::into_raw(Box::new(Record {
                header: Header::new(),
                next: head_ptr,
                item: Some(item),
            }));
            match bucket.cas_state(state, State::new(record, 0)) {
                Ok(()) => {
                    let record = unsafe { &*record };
                    let epoch = self.domain.commit(&record.header);
                    record.header.set_create_epoch(epoch);
                    self.item_count.fetch_add(1, Ordering::SeqCst);
                    if !head_ptr.is_null() {
                        // SAFETY: we displaced the tombstone
                        unsafe { ctx.retire(head_ptr) };
                    }
                    self.help_migrate_if_crowded(ctx, store);
                    return Step::Done(Ok(()));
                }
                Err(actual) => {
                    let item = unsafe { Box::from_raw(record) }.item.unwrap();
                    if actual.moving() {
                        self.migrate(ctx, store);
                        return Step::Retry(item);
                    }
                    // racing adds fail
                    return Step::Done(Err(item));
                }
            }
        }
    }

    fn store_replace(
        &self,
        ctx: &mut ThreadCtx,
        store: &Store<T>,
        hash: HashValue,
        item: T,
    ) -> Step<Result<T, T>, T> {
        let Some(bucket) = store.find(hash) else {
            return Step::Done(Err(item));
        };

        let mut state = bucket.state();
        loop {
            if state.moving() {
                self.migrate(ctx, store);
                return Step::Retry(item);
            }
            let head_ptr = state.head();
            let Some(head) = (unsafe { head_ptr.as_ref() }) else {
                return Step::Done(Err(item));
            };
            if head.deleted() {
                return Step::Done(Err(item));
            }
            if state.delete_help() {
                // help the delete land, then report the entry gone
                self.install_deletion(ctx, bucket, state);
                return Step::Done(Err(item));
            }
            self.domain.help_commit(&head.header);

            let record = Box::into_raw(Box::new(Record {
                header: Header::new(),
                next: head_ptr,
                item: Some(item),
            }));
            match bucket.cas_state(state, State::new(record, 0)) {
                Ok(()) => {
                    let record = unsafe { &*record };
                    self.domain.commit(&record.header);
                    record.header.set_create_epoch(head.sort_epoch());
                    let prev = head.item.clone().unwrap();
                    // SAFETY: we displaced it
                    unsafe { ctx.retire(head_ptr) };
                    self.help_migrate_if_crowded(ctx, store);
                    return Step::Done(Ok(prev));
                }
                Err(actual) => {
                    let item = unsafe { Box::from_raw(record) }.item.unwrap();
                    if actual.moving() {
                        self.migrate(ctx, store);
                        return Step::Retry(item);
                    }
                    // lost overwrite: ordered as written-then-overwritten
                    return Step::Done(Ok(item));
                }
            }
        }
    }

    fn store_remove(
        &self,
        ctx: &mut ThreadCtx,
        store: &Store<T>,
        hash: HashValue,
    ) -> Step<Option<T>, ()> {
        let Some(bucket) = store.find(hash) else {
            return Step::Done(None);
        };

        let mut state = bucket.state();
        loop {
            if state.moving() {
                self.migrate(ctx, store);
                return Step::Retry(());
            }
            let head_ptr = state.head();
            let Some(head) = (unsafe { head_ptr.as_ref() }) else {
                return Step::Done(None);
            };
            if head.deleted() {
                // someone's deletion is already in; we linearize after it
                return Step::Done(None);
            }
            self.domain.help_commit(&head.header);

            let deletion = Box::into_raw(Box::new(Record {
                header: Header::new(),
                next: head_ptr,
                item: None,
            }));
            match bucket.cas_state(state, State::new(deletion, 0)) {
                Ok(()) => {
                    let deletion = unsafe { &*deletion };
                    let epoch = self.domain.commit(&deletion.header);
                    deletion.header.set_create_epoch(epoch);
                    let prev = head.item.clone();
                    self.item_count.fetch_sub(1, Ordering::SeqCst);
                    // SAFETY: we displaced it
                    unsafe { ctx.retire(head_ptr) };
                    self.help_migrate_if_crowded(ctx, store);
                    return Step::Done(prev);
                }
                Err(actual) => {
                    drop(unsafe { Box::from_raw(deletion) });
                    if actual.moving() {
                        self.migrate(ctx, store);
                        return Step::Retry(());
                    }
                    if actual.head() == head_ptr {
                        // flags churn only: raise the help flag and keep
                        // trying while the head stands still
                        state = bucket.or_flags(DELETE_HELP);
                    } else {
                        state = actual;
                    }
                }
            }
        }
    }

    /// Installs a deletion record over the live head in `state`, on behalf of
    /// the remover that raised `DELETE_HELP`. Returns the state to continue
    /// from, whether or not our install won.
    fn install_deletion(
        &self,
        ctx: &mut ThreadCtx,
        bucket: &Bucket<T>,
        state: State<T>,
    ) -> State<T> {
        let head_ptr = state.head();
        debug_assert!(!head_ptr.is_null());
        self.domain.help_commit(unsafe { &(*head_ptr).header });

        let deletion = Box::into_raw(Box::new(Record {
            header: Header::new(),
            next: head_ptr,
            item: None,
        }));
        match bucket.cas_state(state, State::new(deletion, 0)) {
            Ok(()) => {
                let installed = unsafe { &*deletion };
                let epoch = self.domain.commit(&installed.header);
                installed.header.set_create_epoch(epoch);
                // the installing thread is the one that counts the delete
                self.item_count.fetch_sub(1, Ordering::SeqCst);
                // SAFETY: we displaced it
                unsafe { ctx.retire(head_ptr) };
                State::new(deletion, 0)
            }
            Err(actual) => {
                drop(unsafe { Box::from_raw(deletion) });
                actual
            }
        }
    }

    fn help_migrate_if_crowded(&self, ctx: &mut ThreadCtx, store: &Store<T>) {
        if store.used_count.load(Ordering::SeqCst) >= store.threshold {
            self.migrate(ctx, store);
        }
    }

    /// Replaces `store` with a right-sized successor. Safe to call from any
    /// number of threads at once: every phase is idempotent and every helper
    /// attempts the identical CAS sequence, so whoever is scheduled makes the
    /// same progress.
    fn migrate(&self, ctx: &mut ThreadCtx, store: &Store<T>) {
        // Phase 1: freeze. After MOVING is set a bucket's head can never
        // change, so the live count every helper computes below is identical.
        let mut live = 0usize;
        for bucket in store.buckets.iter() {
            let state = bucket.or_flags(MOVING);
            match unsafe { state.head().as_ref() } {
                Some(h) if !h.deleted() => live += 1,
                _ => {
                    bucket.or_flags(MOVED);
                }
            }
        }

        // Phase 2: agree on the successor.
        let mut next = store.next_store.load(Ordering::SeqCst);
        if next.is_null() {
            let candidate = Box::into_raw(Store::boxed(&self.domain, self.next_size(store, live)));
            match store.next_store.compare_exchange(
                ptr::null_mut(),
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => next = candidate,
                Err(winner) => {
                    // ours was never visible
                    drop(unsafe { Box::from_raw(candidate) });
                    next = winner;
                }
            }
        }
        let next_ref = unsafe { &*next };

        // Phase 3: copy every unmoved live bucket. Probe order and CAS
        // expectations are deterministic, so concurrent helpers converge on
        // one placement per hash.
        for bucket in store.buckets.iter() {
            let state = bucket.state();
            if state.moved() {
                continue;
            }
            let head_ptr = state.head();
            match unsafe { head_ptr.as_ref() } {
                Some(h) if !h.deleted() => {}
                _ => {
                    bucket.or_flags(MOVED);
                    continue;
                }
            }
            let hv = bucket.hv.load(Ordering::Acquire);
            let target = next_ref.copy_target(hv);
            let _ = target.cas_state(State::EMPTY, State::new(head_ptr, 0));
            bucket.or_flags(MOVED);
        }

        // Phase 4: publish the used count, swing the table, retire the
        // source. Only the thread whose store swap lands retires it.
        let _ = next_ref
            .used_count
            .compare_exchange(0, live, Ordering::SeqCst, Ordering::SeqCst);
        let source = store as *const Store<T> as *mut Store<T>;
        if self
            .store
            .compare_exchange(source, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // SAFETY: unlinked from the table exactly once, here
            unsafe { ctx.retire(source) };
        }
    }

    fn next_size(&self, store: &Store<T>, live: usize) -> usize {
        let size = store.size();
        if self.help_needed.load(Ordering::SeqCst) > 0 {
            // a struggling mutator asked for headroom; growth is what bounds
            // its remaining retries
            return size * 2;
        }
        if live >= size / 2 {
            size * 2
        } else if live <= size / 4 {
            (size / 2).max(1 << MIN_SIZE_LOG)
        } else {
            size
        }
    }

    fn view_inner(&self, epoch: Epoch, sort: bool) -> Vec<(HashValue, T, Epoch)> {
        let store = unsafe { &*self.current() };
        let mut entries = Vec::new();
        for bucket in store.buckets.iter() {
            let Some(head) = (unsafe { bucket.state().head().as_ref() }) else {
                continue;
            };
            self.domain.help_commit(&head.header);

            // newest version at or before the linearization epoch
            let mut record = Some(head);
            while let Some(r) = record {
                if r.header.write_epoch() <= epoch {
                    break;
                }
                record = unsafe { r.next.as_ref() };
            }
            let Some(r) = record else { continue };
            let Some(item) = r.item.clone() else { continue };
            let hv = HashValue::new(bucket.hv.load(Ordering::Acquire));
            entries.push((hv, item, r.sort_epoch()));
        }
        if sort {
            entries.sort_by_key(|&(_, _, e)| e);
        }
        entries
    }
}

impl<T: Send + Sync + 'static> Drop for Woolhat<T> {
    fn drop(&mut self) {
        // `&mut self` means no operation is in flight, so no migration is
        // either; heads and the store itself go to the domain as orphans and
        // are freed once every straggling reservation ends.
        let store_ptr = self.store.load(Ordering::SeqCst);
        let store = unsafe { &*store_ptr };
        debug_assert!(store.next_store.load(Ordering::SeqCst).is_null());

        let epoch = self.domain.current_epoch();
        let mut orphans = Vec::new();
        for bucket in store.buckets.iter() {
            let head = bucket.state().head();
            if !head.is_null() {
                orphans.push(Retired::new(head, epoch));
            }
        }
        orphans.push(Retired::new(store_ptr, epoch));
        self.domain.adopt_orphans(&mut orphans);
    }
}
