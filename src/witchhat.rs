//! Woolhat's cheaper sibling: the same claim-by-CAS buckets, the same
//! migration protocol, the same retry-budget helping, but no record history.
//! Each bucket holds at most one committed record; overwrites displace it and
//! removes clear it. Without history there is nothing to linearize whole-table
//! reads against, so [`Witchhat::view`] is an approximate snapshot rather than
//! a moment-in-time one.
//!
//! Records take their write epoch at allocation: with no chain walk deciding
//! visibility, nothing is gained by deferring the commit.

use std::marker::PhantomData;
use std::ptr;

use portable_atomic::AtomicU128;

use crate::mmm::{Domain, Epoch, Header, Reclaim, Retired, ThreadCtx};
use crate::sync::{
    atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use crate::{HashValue, MIN_SIZE_LOG, RETRY_THRESHOLD};

const MOVING: usize = 0b01;
const MOVED: usize = 0b10;
const FLAG_MASK: usize = 0b11;

#[repr(C)]
struct WitchRecord<T> {
    header: Header,
    item: T,
}

// SAFETY: `#[repr(C)]` with the header first.
unsafe impl<T: Send> Reclaim for WitchRecord<T> {
    fn header(&self) -> &Header {
        &self.header
    }
}

/// Head pointer plus migration flags in one atomic word.
struct State<T> {
    bits: usize,
    _marker: PhantomData<*mut WitchRecord<T>>,
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

    fn new(head: *mut WitchRecord<T>, flags: usize) -> State<T> {
        debug_assert_eq!(head as usize & FLAG_MASK, 0);
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

    fn head(self) -> *mut WitchRecord<T> {
        (self.bits & !FLAG_MASK) as *mut WitchRecord<T>
    }

    fn moving(self) -> bool {
        self.bits & MOVING != 0
    }

    fn moved(self) -> bool {
        self.bits & MOVED != 0
    }
}

struct Bucket<T> {
    hv: AtomicU128,
    state: AtomicUsize,
    _marker: PhantomData<*mut WitchRecord<T>>,
}

// SAFETY: all access goes through the atomics.
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

    fn or_flags(&self, flags: usize) -> State<T> {
        State::from_bits(self.state.fetch_or(flags, Ordering::SeqCst) | flags)
    }
}

enum Acquired<'a, T> {
    Bucket(&'a Bucket<T>),
    Grew,
    Full,
}

#[repr(C)]
struct Store<T> {
    header: Header,
    last_slot: u64,
    threshold: usize,
    used_count: AtomicUsize,
    next_store: AtomicPtr<Store<T>>,
    buckets: Box<[Bucket<T>]>,
}

// SAFETY: header-first `#[repr(C)]`.
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

enum Step<R, P> {
    Done(R),
    Retry(P),
}

/// A lock-free hash table without history: the last write wins and that is
/// all a bucket remembers. Shares woolhat's migration and helping machinery;
/// trades linearizable views for one fewer pointer chase per operation.
pub struct Witchhat<T: Send + Sync + 'static> {
    domain: Arc<Domain>,
    store: AtomicPtr<Store<T>>,
    item_count: AtomicUsize,
    help_needed: AtomicU64,
}

// SAFETY: shared state is behind atomics; values cross threads only as
// `T: Send + Sync` allows.
unsafe impl<T: Send + Sync> Send for Witchhat<T> {}
unsafe impl<T: Send + Sync> Sync for Witchhat<T> {}

impl<T: Clone + Send + Sync + 'static> Witchhat<T> {
    pub fn new(domain: &Arc<Domain>) -> Witchhat<T> {
        Self::with_size(domain, MIN_SIZE_LOG)
    }

    pub fn with_size(domain: &Arc<Domain>, log2_buckets: usize) -> Witchhat<T> {
        let size = 1usize << log2_buckets.max(MIN_SIZE_LOG);
        let store = Box::into_raw(Store::boxed(domain, size));
        Witchhat {
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

    pub fn get(&self, ctx: &mut ThreadCtx, hash: HashValue) -> Option<T> {
        self.check_ctx(ctx);
        ctx.begin_op();
        let store = unsafe { &*self.current() };
        let found = store
            .find(hash)
            .and_then(|bucket| unsafe { bucket.state().head().as_ref() })
            .map(|record| record.item.clone());
        ctx.end_op();
        found
    }

    /// Inserts or overwrites. The lost-overwrite convention matches
    /// [`crate::Woolhat::put`]: a racing loser is ordered as
    /// written-then-overwritten and gets its own value back.
    pub fn put(&self, ctx: &mut ThreadCtx, hash: HashValue, item: T) -> Option<T> {
        self.mutate(ctx, item, |this, ctx, store, item| {
            this.store_put(ctx, store, hash, item)
        })
    }

    /// Inserts only if absent; hands the value back in `Err` otherwise.
    pub fn add(&self, ctx: &mut ThreadCtx, hash: HashValue, item: T) -> Result<(), T> {
        self.mutate(ctx, item, |this, ctx, store, item| {
            this.store_add(ctx, store, hash, item)
        })
    }

    /// Overwrites only if present.
    pub fn replace(&self, ctx: &mut ThreadCtx, hash: HashValue, item: T) -> Result<T, T> {
        self.mutate(ctx, item, |this, ctx, store, item| {
            this.store_replace(ctx, store, hash, item)
        })
    }

    pub fn remove(&self, ctx: &mut ThreadCtx, hash: HashValue) -> Option<T> {
        self.mutate(ctx, (), |this, ctx, store, ()| {
            this.store_remove(ctx, store, hash)
        })
    }

    /// A best-effort snapshot of the current store: live entries with their
    /// write epochs, optionally sorted by epoch. Entries written while the
    /// snapshot runs may or may not appear; there is no single instant the
    /// result corresponds to.
    pub fn view(&self, ctx: &mut ThreadCtx, sort: bool) -> Vec<(T, Epoch)> {
        self.check_ctx(ctx);
        ctx.begin_op();
        let store = unsafe { &*self.current() };
        let mut entries = Vec::new();
        for bucket in store.buckets.iter() {
            if let Some(record) = unsafe { bucket.state().head().as_ref() } {
                entries.push((record.item.clone(), record.header.write_epoch()));
            }
        }
        ctx.end_op();
        if sort {
            entries.sort_by_key(|&(_, e)| e);
        }
        entries
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

    fn mutate<R, P>(
        &self,
        ctx: &mut ThreadCtx,
        payload: P,
        mut op: impl FnMut(&Witchhat<T>, &mut ThreadCtx, &Store<T>, P) -> Step<R, P>,
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

        let state = bucket.state();
        if state.moving() {
            self.migrate(ctx, store);
            return Step::Retry(item);
        }
        let head_ptr = state.head();

        let record = Box::into_raw(Box::new(WitchRecord {
            header: Header::new_committed(&self.domain),
            item,
        }));
        match bucket.cas_state(state, State::new(record, 0)) {
            Ok(()) => {
                let prev = if head_ptr.is_null() {
                    self.item_count.fetch_add(1, Ordering::SeqCst);
                    None
                } else {
                    let prev = unsafe { (*head_ptr).item.clone() };
                    // SAFETY: we displaced it; exactly one thread does
                    unsafe { ctx.retire(head_ptr) };
                    Some(prev)
                };
                self.help_migrate_if_crowded(ctx, store);
                Step::Done(prev)
            }
            Err(actual) => {
                let item = unsafe { Box::from_raw(record) }.item;
                if actual.moving() {
                    self.migrate(ctx, store);
                    return Step::Retry(item);
                }
                // written-then-overwritten; the caller reclaims its own value
                Step::Done(Some(item))
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

        let state = bucket.state();
        if state.moving() {
            self.migrate(ctx, store);
            return Step::Retry(item);
        }
        if !state.head().is_null() {
            return Step::Done(Err(item));
        }

        let record = Box::into_raw(Box::new(WitchRecord {
            header: Header::new_committed(&self.domain),
            item,
        }));
        match bucket.cas_state(state, State::new(record, 0)) {
            Ok(()) => {
                self.item_count.fetch_add(1, Ordering::SeqCst);
                self.help_migrate_if_crowded(ctx, store);
                Step::Done(Ok(()))
            }
            Err(actual) => {
                let item = unsafe { Box::from_raw(record) }.item;
                if actual.moving() {
                    self.migrate(ctx, store);
                    return Step::Retry(item);
                }
                Step::Done(Err(item))
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

        let state = bucket.state();
        if state.moving() {
            self.migrate(ctx, store);
            return Step::Retry(item);
        }
        let head_ptr = state.head();
        if head_ptr.is_null() {
            return Step::Done(Err(item));
        }

        let record = Box::into_raw(Box::new(WitchRecord {
            header: Header::new_committed(&self.domain),
            item,
        }));
        match bucket.cas_state(state, State::new(record, 0)) {
            Ok(()) => {
                let prev = unsafe { (*head_ptr).item.clone() };
                // SAFETY: we displaced it
                unsafe { ctx.retire(head_ptr) };
                self.help_migrate_if_crowded(ctx, store);
                Step::Done(Ok(prev))
            }
            Err(actual) => {
                let item = unsafe { Box::from_raw(record) }.item;
                if actual.moving() {
                    self.migrate(ctx, store);
                    return Step::Retry(item);
                }
                Step::Done(Ok(item))
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
            if head_ptr.is_null() {
                return Step::Done(None);
            }
            match bucket.cas_state(state, State::EMPTY) {
                Ok(()) => {
                    let prev = unsafe { (*head_ptr).item.clone() };
                    self.item_count.fetch_sub(1, Ordering::SeqCst);
                    // SAFETY: we displaced it
                    unsafe { ctx.retire(head_ptr) };
                    self.help_migrate_if_crowded(ctx, store);
                    return Step::Done(Some(prev));
                }
                Err(actual) => state = actual,
            }
        }
    }

    fn help_migrate_if_crowded(&self, ctx: &mut ThreadCtx, store: &Store<T>) {
        if store.used_count.load(Ordering::SeqCst) >= store.threshold {
            self.migrate(ctx, store);
        }
    }

    /// Same four-phase protocol as woolhat's, with "live" simply meaning a
    /// non-null head.
    fn migrate(&self, ctx: &mut ThreadCtx, store: &Store<T>) {
        let mut live = 0usize;
        for bucket in store.buckets.iter() {
            let state = bucket.or_flags(MOVING);
            if state.head().is_null() {
                bucket.or_flags(MOVED);
            } else {
                live += 1;
            }
        }

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
                    drop(unsafe { Box::from_raw(candidate) });
                    next = winner;
                }
            }
        }
        let next_ref = unsafe { &*next };

        for bucket in store.buckets.iter() {
            let state = bucket.state();
            if state.moved() {
                continue;
            }
            let head_ptr = state.head();
            if head_ptr.is_null() {
                bucket.or_flags(MOVED);
                continue;
            }
            let hv = bucket.hv.load(Ordering::Acquire);
            let target = next_ref.copy_target(hv);
            let _ = target.cas_state(State::EMPTY, State::new(head_ptr, 0));
            bucket.or_flags(MOVED);
        }

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
}

impl<T: Send + Sync + 'static> Drop for Witchhat<T> {
    fn drop(&mut self) {
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
