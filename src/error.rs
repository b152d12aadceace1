use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// Returned by [`Builder::build`](crate::Builder::build) when the requested
/// geometry cannot produce a valid map.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// `expected_items` must be at least 1.
    ExpectedItems(usize),
    /// `concurrency_level` must be at least 1.
    ConcurrencyLevel(usize),
    /// More segments were requested than items expected.
    ConcurrencyExceedsItems {
        concurrency_level: usize,
        expected_items: usize,
    },
    /// The derived segment count or per-segment capacity is too large to
    /// allocate.
    CapacityOverflow {
        expected_items: usize,
        concurrency_level: usize,
    },
    /// With auto-shrink on, the idle factor must lie strictly between 0 and
    /// the growth threshold.
    IdleFactor(f32),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            ConfigError::ExpectedItems(n) => {
                write!(f, "expected_items must be > 0, got {}", n)
            }
            ConfigError::ConcurrencyLevel(n) => {
                write!(f, "concurrency_level must be > 0, got {}", n)
            }
            ConfigError::ConcurrencyExceedsItems {
                concurrency_level,
                expected_items,
            } => write!(
                f,
                "concurrency_level ({}) must not exceed expected_items ({})",
                concurrency_level, expected_items
            ),
            ConfigError::CapacityOverflow {
                expected_items,
                concurrency_level,
            } => write!(
                f,
                "expected_items ({}) over concurrency_level ({}) exceeds the maximum map size",
                expected_items, concurrency_level
            ),
            ConfigError::IdleFactor(factor) => write!(
                f,
                "map_idle_factor must be in (0, {}) when auto_shrink is on, got {}",
                crate::GROWTH_THRESHOLD,
                factor
            ),
        }
    }
}

impl Error for ConfigError {
    #[inline]
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}
