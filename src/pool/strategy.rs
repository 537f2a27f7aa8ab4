use crate::store::UpstreamKeyRecord;
use rand::seq::SliceRandom;

/// Pluggable candidate reorder applied after the store's
/// `(last_used_at, created_at)` ordering. Enum-based, no trait objects;
/// swapped at runtime through an `ArcSwap` held by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Keep the stalest-first store order: rotation falls out of
    /// `last_used_at` bumping on every selection.
    RoundRobin,
    /// Shuffle candidates, trading strict rotation for contention spread
    /// across deployments sharing one key set.
    Random,
}

impl SelectionStrategy {
    /// Parse a strategy tag; unknown tags fall back to round-robin.
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "random" => Self::Random,
            _ => Self::RoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
        }
    }

    pub fn apply(&self, candidates: &mut [UpstreamKeyRecord]) {
        match self {
            Self::RoundRobin => {}
            Self::Random => candidates.shuffle(&mut rand::thread_rng()),
        }
    }
}
