use crate::error::ConfigError;
use crate::map::ConcurrentLongHashMap;
use crate::GROWTH_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;

const DEFAULT_EXPECTED_ITEMS: usize = 256;
const DEFAULT_CONCURRENCY_LEVEL: usize = 16;
const DEFAULT_MAP_IDLE_FACTOR: f32 = 0.15;
const MIN_SEGMENT_CAPACITY: usize = 2;
const MAX_SEGMENT_CAPACITY: usize = 1 << 30;
// segments are picked from the high 32 hash bits
const MAX_SEGMENTS: usize = 1 << 16;

/// User facing sizing knobs for a [`ConcurrentLongHashMap`].
///
/// Missing fields fall back to their defaults when deserialized, so the
/// struct can be embedded in a larger configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub expected_items: usize,
    pub concurrency_level: usize,
    pub auto_shrink: bool,
    pub map_idle_factor: f32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            expected_items: DEFAULT_EXPECTED_ITEMS,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            auto_shrink: false,
            map_idle_factor: DEFAULT_MAP_IDLE_FACTOR,
        }
    }
}

impl Options {
    /// Checks every constraint and derives the per-segment geometry.
    pub(crate) fn validate(&self) -> Result<Geometry, ConfigError> {
        if self.expected_items == 0 {
            return Err(ConfigError::ExpectedItems(self.expected_items));
        }
        if self.concurrency_level == 0 {
            return Err(ConfigError::ConcurrencyLevel(self.concurrency_level));
        }
        if self.concurrency_level > self.expected_items {
            return Err(ConfigError::ConcurrencyExceedsItems {
                concurrency_level: self.concurrency_level,
                expected_items: self.expected_items,
            });
        }
        if self.auto_shrink
            && !(self.map_idle_factor > 0.0 && self.map_idle_factor < GROWTH_THRESHOLD)
        {
            return Err(ConfigError::IdleFactor(self.map_idle_factor));
        }

        let overflow = ConfigError::CapacityOverflow {
            expected_items: self.expected_items,
            concurrency_level: self.concurrency_level,
        };
        let segments = match self.concurrency_level.checked_next_power_of_two() {
            Some(segments) if segments <= MAX_SEGMENTS => segments,
            _ => return Err(overflow),
        };
        let per_segment = div_ceil(self.expected_items, segments);
        // the float cast saturates, so a huge request fails the check below
        let wanted = (per_segment as f64 / GROWTH_THRESHOLD as f64).ceil() as usize;
        let init_capacity = match wanted.checked_next_power_of_two() {
            Some(capacity) if capacity <= MAX_SEGMENT_CAPACITY => {
                capacity.max(MIN_SEGMENT_CAPACITY)
            }
            _ => return Err(overflow),
        };

        Ok(Geometry {
            segments,
            init_capacity,
            idle_factor: if self.auto_shrink {
                Some(self.map_idle_factor)
            } else {
                None
            },
        })
    }
}

/// Derived, immutable sizing shared by every segment of one map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Geometry {
    pub(crate) segments: usize,
    pub(crate) init_capacity: usize,
    /// `Some` only when auto-shrink is enabled.
    pub(crate) idle_factor: Option<f32>,
}

fn div_ceil(n: usize, d: usize) -> usize {
    n / d + if n % d == 0 { 0 } else { 1 }
}

/// Chainable constructor for [`ConcurrentLongHashMap`].
///
/// ```
/// use long_hash_map::ConcurrentLongHashMap;
///
/// let map = ConcurrentLongHashMap::<String>::builder()
///     .expected_items(2)
///     .concurrency_level(1)
///     .build()
///     .unwrap();
/// assert_eq!(map.capacity(), 4);
/// ```
pub struct Builder<V> {
    options: Options,
    _v: PhantomData<fn() -> V>,
}

impl<V> Builder<V> {
    pub fn new() -> Self {
        Self::from_options(Options::default())
    }

    pub fn from_options(options: Options) -> Self {
        Builder {
            options,
            _v: PhantomData,
        }
    }

    pub fn expected_items(mut self, expected_items: usize) -> Self {
        self.options.expected_items = expected_items;
        self
    }

    pub fn concurrency_level(mut self, concurrency_level: usize) -> Self {
        self.options.concurrency_level = concurrency_level;
        self
    }

    pub fn auto_shrink(mut self, auto_shrink: bool) -> Self {
        self.options.auto_shrink = auto_shrink;
        self
    }

    pub fn map_idle_factor(mut self, map_idle_factor: f32) -> Self {
        self.options.map_idle_factor = map_idle_factor;
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Validates the options and allocates every segment.
    pub fn build(self) -> Result<ConcurrentLongHashMap<V>, ConfigError> {
        let geometry = self.options.validate()?;
        Ok(ConcurrentLongHashMap::with_geometry(self.options, geometry))
    }
}

impl<V> Default for Builder<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Debug for Builder<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("options", &self.options)
            .finish()
    }
}
