use crate::hash::{hash, sign_safe_mod};
use crate::GROWTH_THRESHOLD;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use log::{debug, trace};
use parking_lot::Mutex;
use std::hint::spin_loop;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::thread;

// busy-wait rounds on an odd stamp before a reader starts yielding
const SPIN_LIMIT: u32 = 64;

/// One generation of a segment's open-addressing table.
///
/// `keys` and `values` are parallel arrays of the same power-of-two length.
/// A null value pointer marks an empty slot, so every `u64` is a usable key.
/// Value pointers are shared between generations while a resize copies them,
/// which is why dropping a `Table` never drops the values it points to.
pub(crate) struct Table<V> {
    keys: Box<[AtomicU64]>,
    values: Box<[Atomic<V>]>,
}

enum Slot {
    Occupied(usize),
    Vacant(usize),
}

impl<V> Table<V> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Table {
            keys: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            values: (0..capacity).map(|_| Atomic::null()).collect(),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    fn next(&self, idx: usize) -> usize {
        (idx + 1) & (self.capacity() - 1)
    }

    /// Lock-free search. The walk is bounded by the capacity because a reader
    /// may look at a table that is momentarily full right before it expands.
    fn search<'g>(&self, key: u64, h: u64, guard: &'g Guard) -> Option<Shared<'g, V>> {
        let mut idx = sign_safe_mod(h, self.capacity());
        for _ in 0..self.capacity() {
            let value = self.values[idx].load(Ordering::Acquire, guard);
            if value.is_null() {
                return None;
            }
            if self.keys[idx].load(Ordering::Relaxed) == key {
                return Some(value);
            }
            idx = self.next(idx);
        }
        None
    }

    /// Finds `key` or the slot it would be inserted in. Callers hold the
    /// segment lock, under which the table always has at least one empty slot.
    fn locate(&self, key: u64, h: u64, guard: &Guard) -> Slot {
        let mut idx = sign_safe_mod(h, self.capacity());
        loop {
            if self.values[idx].load(Ordering::Relaxed, guard).is_null() {
                return Slot::Vacant(idx);
            }
            if self.keys[idx].load(Ordering::Relaxed) == key {
                return Slot::Occupied(idx);
            }
            idx = self.next(idx);
        }
    }

    /// Places an entry known to be absent, used while filling a fresh table.
    fn insert_unique(&self, key: u64, value: Shared<'_, V>, guard: &Guard) {
        match self.locate(key, hash(key), guard) {
            Slot::Vacant(idx) => {
                self.keys[idx].store(key, Ordering::Relaxed);
                self.values[idx].store(value, Ordering::Relaxed);
            }
            Slot::Occupied(_) => unreachable!("key {} appears twice in one segment", key),
        }
    }

    /// Backward-shift deletion: pulls later members of the collision chain into
    /// the hole at `vacant` until the chain ends, so no tombstone is needed.
    fn shift_back(&self, mut vacant: usize, guard: &Guard) {
        let mask = self.capacity() - 1;
        let mut idx = self.next(vacant);
        loop {
            let value = self.values[idx].load(Ordering::Relaxed, guard);
            if value.is_null() {
                return;
            }
            let key = self.keys[idx].load(Ordering::Relaxed);
            let home = sign_safe_mod(hash(key), self.capacity());
            // the entry may move only if the hole sits between its home and
            // its current slot, otherwise it would become unreachable
            if (vacant.wrapping_sub(home) & mask) < (idx.wrapping_sub(home) & mask) {
                self.keys[vacant].store(key, Ordering::Relaxed);
                self.values[vacant].store(value, Ordering::Relaxed);
                self.values[idx].store(Shared::null(), Ordering::Relaxed);
                vacant = idx;
            }
            idx = self.next(idx);
        }
    }
}

/// An independently locked shard of the map.
///
/// Writers serialize on `lock`. Readers never take it: they load the current
/// table generation and validate their search against `stamp`, which is odd
/// while a backward shift is moving entries in place.
pub(crate) struct Segment<V> {
    lock: Mutex<()>,
    table: Atomic<Table<V>>,
    stamp: AtomicUsize,
    size: AtomicUsize,
    init_capacity: usize,
    idle_factor: Option<f32>,
}

impl<V> Segment<V> {
    pub(crate) fn new(init_capacity: usize, idle_factor: Option<f32>) -> Self {
        Segment {
            lock: Mutex::new(()),
            table: Atomic::new(Table::new(init_capacity)),
            stamp: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            init_capacity,
            idle_factor,
        }
    }

    #[inline]
    fn current<'g>(&self, guard: &'g Guard) -> &'g Table<V> {
        // never null while the segment is alive
        unsafe { self.table.load(Ordering::Acquire, guard).deref() }
    }

    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn capacity(&self) -> usize {
        let guard = epoch::pin();
        self.current(&guard).capacity()
    }

    #[cfg(test)]
    pub(crate) fn init_capacity(&self) -> usize {
        self.init_capacity
    }

    /// Optimistic lookup; retries while a concurrent shift overlaps the search.
    fn find<'g>(&self, key: u64, h: u64, guard: &'g Guard) -> Option<&'g V> {
        loop {
            let stamp = self.stable_stamp();
            let found = self.current(guard).search(key, h, guard);
            fence(Ordering::Acquire);
            if self.stamp.load(Ordering::Relaxed) == stamp {
                // the guard keeps a removed value alive until it is unpinned
                return found.map(|value| unsafe { value.deref() });
            }
            trace!("lookup of key {} overlapped a backward shift, retrying", key);
        }
    }

    /// Waits out an in-progress shift and returns the even stamp. Spins
    /// briefly, then yields so a preempted writer can finish its shift.
    fn stable_stamp(&self) -> usize {
        let mut spins = 0;
        loop {
            let stamp = self.stamp.load(Ordering::Acquire);
            if stamp & 1 == 0 {
                return stamp;
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    fn begin_shift(&self) {
        let stamp = self.stamp.load(Ordering::Relaxed);
        self.stamp.store(stamp.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
    }

    fn end_shift(&self) {
        let stamp = self.stamp.load(Ordering::Relaxed);
        self.stamp.store(stamp.wrapping_add(1), Ordering::Release);
    }

    /// Builds a table of `new_capacity`, moves every live pointer into it and
    /// publishes it with a single swap.
    fn rehash(&self, table: &Table<V>, new_capacity: usize, guard: &Guard) {
        let fresh = Table::new(new_capacity);
        for (key, value) in table.keys.iter().zip(table.values.iter()) {
            let value = value.load(Ordering::Relaxed, guard);
            if !value.is_null() {
                fresh.insert_unique(key.load(Ordering::Relaxed), value, guard);
            }
        }
        let old = self.table.swap(Owned::new(fresh), Ordering::AcqRel, guard);
        unsafe { guard.defer_destroy(old) };
        debug!(
            "segment resized from {} to {} slots with {} entries",
            table.capacity(),
            new_capacity,
            self.len()
        );
    }

    fn insert_at(&self, table: &Table<V>, idx: usize, key: u64, value: V, guard: &Guard) {
        table.keys[idx].store(key, Ordering::Relaxed);
        table.values[idx].store(Owned::new(value), Ordering::Release);
        let size = self.size.load(Ordering::Relaxed) + 1;
        self.size.store(size, Ordering::Relaxed);
        if size > (table.capacity() as f32 * GROWTH_THRESHOLD) as usize {
            self.rehash(table, table.capacity() * 2, guard);
        }
    }

    fn maybe_shrink(&self, table: &Table<V>, size: usize, guard: &Guard) {
        let idle_factor = match self.idle_factor {
            Some(idle_factor) => idle_factor,
            None => return,
        };
        let capacity = table.capacity();
        let half = capacity / 2;
        if size < (capacity as f32 * idle_factor) as usize
            && half >= self.init_capacity
            && size < (half as f32 * GROWTH_THRESHOLD) as usize
        {
            self.rehash(table, half, guard);
        }
    }
}

impl<V> Segment<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn get(&self, key: u64, h: u64) -> Option<V> {
        let guard = epoch::pin();
        self.find(key, h, &guard).cloned()
    }

    pub(crate) fn contains_key(&self, key: u64, h: u64) -> bool {
        let guard = epoch::pin();
        self.find(key, h, &guard).is_some()
    }

    pub(crate) fn insert(&self, key: u64, h: u64, value: V) -> Option<V> {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let table = self.current(&guard);
        match table.locate(key, h, &guard) {
            Slot::Occupied(idx) => {
                let old = table.values[idx].swap(Owned::new(value), Ordering::AcqRel, &guard);
                let previous = unsafe { old.deref() }.clone();
                unsafe { guard.defer_destroy(old) };
                Some(previous)
            }
            Slot::Vacant(idx) => {
                self.insert_at(table, idx, key, value, &guard);
                None
            }
        }
    }

    pub(crate) fn put_if_absent(&self, key: u64, h: u64, value: V) -> Option<V> {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let table = self.current(&guard);
        match table.locate(key, h, &guard) {
            Slot::Occupied(idx) => {
                let current = table.values[idx].load(Ordering::Relaxed, &guard);
                Some(unsafe { current.deref() }.clone())
            }
            Slot::Vacant(idx) => {
                self.insert_at(table, idx, key, value, &guard);
                None
            }
        }
    }

    /// `provider` runs with the segment lock held and must not touch the map.
    pub(crate) fn compute_if_absent<F>(&self, key: u64, h: u64, provider: F) -> V
    where
        F: FnOnce(u64) -> V,
    {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let table = self.current(&guard);
        match table.locate(key, h, &guard) {
            Slot::Occupied(idx) => {
                let current = table.values[idx].load(Ordering::Relaxed, &guard);
                unsafe { current.deref() }.clone()
            }
            Slot::Vacant(idx) => {
                let value = provider(key);
                self.insert_at(table, idx, key, value.clone(), &guard);
                value
            }
        }
    }

    /// Removes `key` when `predicate` accepts its current value.
    pub(crate) fn remove_if<P>(&self, key: u64, h: u64, predicate: P) -> Option<V>
    where
        P: FnOnce(&V) -> bool,
    {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let table = self.current(&guard);
        let idx = match table.locate(key, h, &guard) {
            Slot::Occupied(idx) => idx,
            Slot::Vacant(_) => return None,
        };
        let value = table.values[idx].load(Ordering::Relaxed, &guard);
        let current = unsafe { value.deref() };
        if !predicate(current) {
            return None;
        }
        let removed = current.clone();

        self.begin_shift();
        table.values[idx].store(Shared::null(), Ordering::Relaxed);
        table.shift_back(idx, &guard);
        self.end_shift();
        unsafe { guard.defer_destroy(value) };

        let size = self.size.load(Ordering::Relaxed) - 1;
        self.size.store(size, Ordering::Relaxed);
        self.maybe_shrink(table, size, &guard);
        Some(removed)
    }

    pub(crate) fn clear(&self) {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let old = self.table.swap(
            Owned::new(Table::new(self.init_capacity)),
            Ordering::AcqRel,
            &guard,
        );
        self.size.store(0, Ordering::Relaxed);
        let table = unsafe { old.deref() };
        for slot in table.values.iter() {
            let value = slot.load(Ordering::Relaxed, &guard);
            if !value.is_null() {
                unsafe { guard.defer_destroy(value) };
            }
        }
        debug!(
            "segment cleared, {} slots reset to {}",
            table.capacity(),
            self.init_capacity
        );
        unsafe { guard.defer_destroy(old) };
    }

    /// Copies every live entry through `f` while holding the lock.
    pub(crate) fn snapshot<T, F>(&self, out: &mut Vec<T>, mut f: F)
    where
        F: FnMut(u64, &V) -> T,
    {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let table = self.current(&guard);
        for (key, value) in table.keys.iter().zip(table.values.iter()) {
            let value = value.load(Ordering::Relaxed, &guard);
            if !value.is_null() {
                out.push(f(key.load(Ordering::Relaxed), unsafe { value.deref() }));
            }
        }
    }
}

impl<V> Drop for Segment<V> {
    fn drop(&mut self) {
        // `&mut self` proves no reader or writer is left
        let guard = unsafe { epoch::unprotected() };
        let table = self.table.swap(Shared::null(), Ordering::Relaxed, guard);
        if table.is_null() {
            return;
        }
        let table = unsafe { table.into_owned() };
        for slot in table.values.iter() {
            let value = slot.swap(Shared::null(), Ordering::Relaxed, guard);
            if !value.is_null() {
                drop(unsafe { value.into_owned() });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn segment(init_capacity: usize) -> Segment<String> {
        Segment::new(init_capacity, None)
    }

    fn put(segment: &Segment<String>, key: u64, value: &str) -> Option<String> {
        segment.insert(key, hash(key), value.to_string())
    }

    fn get(segment: &Segment<String>, key: u64) -> Option<String> {
        segment.get(key, hash(key))
    }

    fn remove(segment: &Segment<String>, key: u64) -> Option<String> {
        segment.remove_if(key, hash(key), |_| true)
    }

    fn keys_with_home(home: usize, capacity: usize, count: usize) -> Vec<u64> {
        (0..)
            .filter(|k| sign_safe_mod(hash(*k), capacity) == home)
            .take(count)
            .collect()
    }

    /// Every live entry must be reachable from its home slot without
    /// crossing an empty slot.
    fn assert_chains_contiguous(segment: &Segment<String>) {
        let guard = epoch::pin();
        let table = segment.current(&guard);
        let mut live = 0;
        for idx in 0..table.capacity() {
            if table.values[idx].load(Ordering::Relaxed, &guard).is_null() {
                continue;
            }
            live += 1;
            let key = table.keys[idx].load(Ordering::Relaxed);
            let mut slot = sign_safe_mod(hash(key), table.capacity());
            while slot != idx {
                assert!(
                    !table.values[slot].load(Ordering::Relaxed, &guard).is_null(),
                    "gap at {} before key {} in slot {}",
                    slot,
                    key,
                    idx
                );
                slot = table.next(slot);
            }
        }
        assert_eq!(live, segment.len());
    }

    #[test]
    fn collision_then_delete_keeps_survivor_reachable() {
        let s = segment(16);
        assert_eq!(sign_safe_mod(hash(1), 16), sign_safe_mod(hash(27), 16));

        assert_eq!(put(&s, 1, "value-1"), None);
        assert_eq!(put(&s, 27, "value-2"), None);
        assert_eq!(s.len(), 2);

        assert_eq!(remove(&s, 1).as_deref(), Some("value-1"));
        assert_eq!(s.len(), 1);
        assert_eq!(get(&s, 27).as_deref(), Some("value-2"));
        assert_chains_contiguous(&s);

        assert_eq!(put(&s, 1, "value-1-overwrite"), None);
        assert_eq!(remove(&s, 1).as_deref(), Some("value-1-overwrite"));
        assert_eq!(
            put(&s, 27, "value-2-overwrite").as_deref(),
            Some("value-2")
        );
        assert_eq!(get(&s, 27).as_deref(), Some("value-2-overwrite"));
        assert_eq!(remove(&s, 27).as_deref(), Some("value-2-overwrite"));
        assert_eq!(s.len(), 0);
        assert_eq!(s.capacity(), 16);
    }

    #[test]
    fn shift_wraps_around_the_end() {
        let s = segment(16);
        let keys = keys_with_home(15, 16, 4);
        for key in keys.iter() {
            assert_eq!(put(&s, *key, "v"), None);
        }
        // chain occupies 15, 0, 1, 2
        remove(&s, keys[0]);
        assert_chains_contiguous(&s);
        for key in &keys[1..] {
            assert_eq!(get(&s, *key).as_deref(), Some("v"));
        }
        remove(&s, keys[2]);
        assert_chains_contiguous(&s);
        assert_eq!(get(&s, keys[1]).as_deref(), Some("v"));
        assert_eq!(get(&s, keys[3]).as_deref(), Some("v"));
        assert_eq!(get(&s, keys[2]), None);
    }

    #[test]
    fn shift_skips_entries_already_at_home() {
        let s = segment(16);
        let first = keys_with_home(3, 16, 2);
        let second = keys_with_home(4, 16, 1);
        // slots: 3 -> first[0], 4 -> second[0], 5 -> first[1]
        put(&s, first[0], "a");
        put(&s, second[0], "b");
        put(&s, first[1], "c");

        remove(&s, first[0]);
        assert_chains_contiguous(&s);
        let guard = epoch::pin();
        let table = s.current(&guard);
        assert_eq!(table.keys[3].load(Ordering::Relaxed), first[1]);
        assert_eq!(table.keys[4].load(Ordering::Relaxed), second[0]);
        assert!(table.values[5].load(Ordering::Relaxed, &guard).is_null());
        assert_eq!(get(&s, first[1]).as_deref(), Some("c"));
        assert_eq!(get(&s, second[0]).as_deref(), Some("b"));
    }

    #[test]
    fn absent_key_is_noop() {
        let s = segment(4);
        assert_eq!(remove(&s, 42), None);
        put(&s, 42, "x");
        assert_eq!(s.remove_if(42, hash(42), |v| v == "y"), None);
        assert_eq!(get(&s, 42).as_deref(), Some("x"));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn expands_past_growth_threshold() {
        let s = segment(4);
        put(&s, 1, "v1");
        put(&s, 2, "v2");
        assert_eq!(s.capacity(), 4);
        put(&s, 3, "v3");
        assert_eq!(s.capacity(), 8);
        for key in 1..=3 {
            assert!(get(&s, key).is_some());
        }
        assert_chains_contiguous(&s);
    }

    #[test]
    fn shrinks_one_step_at_a_time() {
        let s: Segment<String> = Segment::new(4, Some(0.25));
        for key in 1..=3 {
            put(&s, key, "v");
        }
        assert_eq!(s.capacity(), 8);
        remove(&s, 1);
        assert_eq!(s.capacity(), 8);
        remove(&s, 2);
        assert_eq!(s.capacity(), 4);
        remove(&s, 3);
        assert_eq!(s.capacity(), 4);
    }

    #[test]
    fn clear_resets_to_initial_capacity() {
        let s = segment(2);
        for key in 0..10 {
            put(&s, key, "v");
        }
        assert!(s.capacity() > 2);
        s.clear();
        assert_eq!(s.capacity(), 2);
        assert_eq!(s.len(), 0);
        assert_eq!(get(&s, 3), None);
        put(&s, 3, "again");
        assert_eq!(get(&s, 3).as_deref(), Some("again"));
    }

    #[test]
    fn compute_if_absent_calls_provider_once() {
        let s: Segment<u32> = Segment::new(4, None);
        let mut calls = 0;
        let v = s.compute_if_absent(7, hash(7), |k| {
            calls += 1;
            k as u32 * 2
        });
        assert_eq!(v, 14);
        let v = s.compute_if_absent(7, hash(7), |_| {
            calls += 1;
            0
        });
        assert_eq!(v, 14);
        assert_eq!(calls, 1);
    }

    #[test]
    fn snapshot_sees_only_live_entries() {
        let s = segment(8);
        for key in 0..5 {
            put(&s, key, "v");
        }
        remove(&s, 2);
        let mut keys = Vec::new();
        s.snapshot(&mut keys, |k, _| k);
        keys.sort_unstable();
        assert_eq!(keys, vec![0, 1, 3, 4]);
    }

    #[test]
    fn many_deletes_keep_chains_contiguous() {
        let s = segment(8);
        for key in 0..200u64 {
            put(&s, key, "v");
        }
        for key in (0..200u64).filter(|k| k % 3 != 0) {
            assert!(remove(&s, key).is_some());
            assert_chains_contiguous(&s);
        }
        for key in 0..200u64 {
            assert_eq!(get(&s, key).is_some(), key % 3 == 0);
        }
    }

    #[test]
    fn reader_waits_out_a_long_shift() {
        use std::sync::atomic::AtomicBool;
        use std::time::Duration;

        let s = segment(16);
        put(&s, 1, "one");
        let before = s.stable_stamp();
        let done = AtomicBool::new(false);

        s.begin_shift();
        thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let found = get(&s, 1);
                done.store(true, Ordering::SeqCst);
                found
            });
            // long enough for the reader to exhaust its spins and start yielding
            thread::sleep(Duration::from_millis(50));
            assert!(!done.load(Ordering::SeqCst));
            s.end_shift();
            assert_eq!(reader.join().unwrap(), Some("one".to_string()));
        });
        assert_eq!(s.stable_stamp(), before.wrapping_add(2));
    }
}
