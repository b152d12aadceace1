use crate::builder::{Builder, Geometry, Options};
use crate::hash::{hash, segment_index};
use crate::segment::Segment;
use log::debug;
use std::fmt::{self, Debug, Formatter};
use std::iter::FromIterator;

/// A concurrent map from `u64` keys to values, striped over a fixed number of
/// independently locked segments.
///
/// Writers lock only the segment owning the key. Readers never lock: `get`
/// observes either the table generation before a resize or the one after it.
/// Aggregates such as [`len`](Self::len) are summed without a global lock and
/// are exact only once writers are quiet.
pub struct ConcurrentLongHashMap<V> {
    segments: Box<[Segment<V>]>,
    options: Options,
}

impl<V> ConcurrentLongHashMap<V> {
    /// Starts a [`Builder`] with default options.
    pub fn builder() -> Builder<V> {
        Builder::new()
    }

    pub(crate) fn with_geometry(options: Options, geometry: Geometry) -> Self {
        debug!(
            "building long map with {} segments of {} slots, auto_shrink={}",
            geometry.segments,
            geometry.init_capacity,
            geometry.idle_factor.is_some()
        );
        let segments = (0..geometry.segments)
            .map(|_| Segment::new(geometry.init_capacity, geometry.idle_factor))
            .collect();
        ConcurrentLongHashMap { segments, options }
    }

    #[inline]
    fn segment_for(&self, h: u64) -> &Segment<V> {
        &self.segments[segment_index(h, self.segments.len())]
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Occupied slots across all segments. Deletion leaves no tombstones, so
    /// this always equals [`len`](Self::len).
    pub fn used_bucket_count(&self) -> usize {
        self.len()
    }

    /// True when no segment holds an entry.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|segment| segment.len() == 0)
    }

    /// Total slots across all segments.
    pub fn capacity(&self) -> usize {
        self.segments.iter().map(Segment::capacity).sum()
    }

    /// Number of independently locked segments, fixed at construction.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The options this map was built from.
    pub fn options(&self) -> &Options {
        &self.options
    }
}

impl<V> ConcurrentLongHashMap<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Returns a clone of the value for `key`.
    ///
    /// Takes no lock. If a removal in the same segment is shifting entries,
    /// the call spins briefly and then yields until the shift ends.
    pub fn get(&self, key: u64) -> Option<V> {
        let h = hash(key);
        self.segment_for(h).get(key, h)
    }

    pub fn contains_key(&self, key: u64) -> bool {
        let h = hash(key);
        self.segment_for(h).contains_key(key, h)
    }

    /// Maps `key` to `value`, returning the value it replaced.
    pub fn insert(&self, key: u64, value: V) -> Option<V> {
        let h = hash(key);
        self.segment_for(h).insert(key, h, value)
    }

    /// Inserts only when `key` is absent. Returns the value already present,
    /// in which case `value` is dropped.
    pub fn put_if_absent(&self, key: u64, value: V) -> Option<V> {
        let h = hash(key);
        self.segment_for(h).put_if_absent(key, h, value)
    }

    /// Returns the value for `key`, inserting `provider(key)` first if absent.
    ///
    /// At most one `provider` call happens per absent key. It runs while the
    /// owning segment is locked, so it must not call back into this map. A
    /// panic in `provider` leaves the map unchanged.
    pub fn compute_if_absent<F>(&self, key: u64, provider: F) -> V
    where
        F: FnOnce(u64) -> V,
    {
        let h = hash(key);
        self.segment_for(h).compute_if_absent(key, h, provider)
    }

    /// Removes `key`, returning the value it mapped to.
    pub fn remove(&self, key: u64) -> Option<V> {
        let h = hash(key);
        self.segment_for(h).remove_if(key, h, |_| true)
    }

    /// Removes `key` only while it maps to `expected`.
    pub fn remove_if_equal(&self, key: u64, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let h = hash(key);
        self.segment_for(h)
            .remove_if(key, h, |current| current == expected)
            .is_some()
    }

    /// Empties every segment and returns each to its initial capacity.
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.clear();
        }
    }

    /// Keys in no particular order. Segments are copied one after another,
    /// so the result is not an atomic view of the whole map.
    pub fn keys(&self) -> Vec<u64> {
        self.collect(|key, _| key)
    }

    /// Clones of every value, with the same per-segment consistency as
    /// [`keys`](Self::keys).
    pub fn values(&self) -> Vec<V> {
        self.collect(|_, value| value.clone())
    }

    /// Key and value pairs, with the same per-segment consistency as
    /// [`keys`](Self::keys).
    pub fn entries(&self) -> Vec<(u64, V)> {
        self.collect(|key, value| (key, value.clone()))
    }

    /// Visits a per-segment copy of the entries; `f` runs without any lock
    /// held and may call back into the map.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(u64, &V),
    {
        let mut batch = Vec::new();
        for segment in self.segments.iter() {
            segment.snapshot(&mut batch, |key, value| (key, value.clone()));
            for (key, value) in batch.drain(..) {
                f(key, &value);
            }
        }
    }

    fn collect<T, F>(&self, mut f: F) -> Vec<T>
    where
        F: FnMut(u64, &V) -> T,
    {
        let mut out = Vec::with_capacity(self.len());
        for segment in self.segments.iter() {
            segment.snapshot(&mut out, &mut f);
        }
        out
    }
}

impl<V> Default for ConcurrentLongHashMap<V> {
    fn default() -> Self {
        Builder::new()
            .build()
            .expect("default options are always valid")
    }
}

impl<V> Debug for ConcurrentLongHashMap<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentLongHashMap")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("segments", &self.segments.len())
            .finish()
    }
}

impl<V> Extend<(u64, V)> for ConcurrentLongHashMap<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn extend<I: IntoIterator<Item = (u64, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<V> FromIterator<(u64, V)> for ConcurrentLongHashMap<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = (u64, V)>>(iter: I) -> Self {
        let mut map = Self::default();
        map.extend(iter);
        map
    }
}
