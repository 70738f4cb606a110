//! LSEQ identifier allocation.
//!
//! Ids are finite sequences of integers in `[1, 65535]`, compared
//! lexicographically with the rule that a shorter prefix sorts before any
//! extension of it. `between` generates a fresh id strictly between two
//! optional neighbors by picking a random value in the open interval at
//! each depth, falling through to the next depth only when that interval is
//! empty (width <= 1).
//!
//! The sentinel values `0` (virtual left boundary) and `65536` (virtual
//! right boundary) represent the document's outer edges. Randomly chosen
//! components are always in `[1, 65535]`; the 0 sentinel can rarely appear
//! as a carried (non-terminal) component when closing a gap against a
//! neighbor whose diverging digit is already the minimum.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Lower bound (inclusive) for a freshly, randomly chosen id component.
/// A carried component (see `between`) can still be `0`; that value is a
/// legitimate, round-trippable part of a real id, not reserved exclusively
/// for the virtual left boundary.
pub const MIN_COMPONENT: u32 = 1;
/// Upper bound (inclusive) for any id component.
pub const MAX_COMPONENT: u32 = 65535;

const VIRTUAL_LEFT: u32 = 0;
const VIRTUAL_RIGHT: u32 = 65536;

/// A dense, totally ordered identifier for a chunk's position in a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LseqId(Vec<u32>);

impl LseqId {
    /// Build an id directly from its components. Only used by replay and
    /// storage round-trips, which already hold validated components.
    pub fn from_components(components: Vec<u32>) -> Self {
        debug_assert!(!components.is_empty(), "LseqId must be nonempty");
        Self(components)
    }

    pub fn components(&self) -> &[u32] {
        &self.0
    }

    /// Render as dot-joined fixed-width five-digit decimal strings, e.g.
    /// `00032768`. The leading zero-padding means lexicographic string
    /// comparison agrees with numeric comparison for a single component.
    pub fn render(&self) -> String {
        self.0
            .iter()
            .map(|c| format!("{:05}", c))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Parse the dot-joined rendering back into an id. A component of `0` is
    /// accepted: `between` can carry it forward as a non-terminal digit, and
    /// it must round-trip like any other component.
    pub fn parse(s: &str) -> Option<Self> {
        let mut components = Vec::new();
        for part in s.split('.') {
            let value: u32 = part.parse().ok()?;
            if value > MAX_COMPONENT {
                return None;
            }
            components.push(value);
        }
        if components.is_empty() {
            None
        } else {
            Some(Self(components))
        }
    }

    fn component_at(&self, depth: usize, virtual_value: u32) -> u32 {
        self.0.get(depth).copied().unwrap_or(virtual_value)
    }
}

impl fmt::Display for LseqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl PartialOrd for LseqId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LseqId {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i);
            let b = other.0.get(i);
            match (a, b) {
                (Some(a), Some(b)) => match a.cmp(b) {
                    Ordering::Equal => continue,
                    ord => return ord,
                },
                // Shorter prefix sorts before any extension of it.
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (None, None) => unreachable!("loop bound is the longer length"),
            }
        }
        Ordering::Equal
    }
}

/// Allocate a new id strictly between `left` and `right`. Either neighbor
/// may be absent, representing the document's left/right boundary.
///
/// Panics (as a programming-error invariant, never a runtime condition) if
/// `left` is not strictly less than `right` when both are present; callers
/// are expected to hold chunks in sorted order so this cannot happen.
pub fn between(left: Option<&LseqId>, right: Option<&LseqId>) -> LseqId {
    if let (Some(l), Some(r)) = (left, right) {
        assert!(l < r, "between() requires left < right");
    }

    let mut rng = rand::thread_rng();
    let mut components = Vec::new();
    let mut depth = 0usize;

    loop {
        let l = left.map(|id| id.component_at(depth, VIRTUAL_LEFT)).unwrap_or(VIRTUAL_LEFT);
        let r = right
            .map(|id| id.component_at(depth, VIRTUAL_RIGHT))
            .unwrap_or(VIRTUAL_RIGHT);

        if r > l + 1 {
            let value = rng.gen_range((l + 1)..r);
            components.push(value);
            return LseqId(components);
        }

        // No room at this depth: carry the left bound forward and descend.
        // `l` is occasionally the virtual 0 here (absent/exhausted left
        // neighbor pinned against a right neighbor whose component at this
        // depth is the minimum, 1) -- there is no component strictly below
        // 1 to use instead, so the carried digit is 0. It never surfaces as
        // a standalone id (the recursion always appends at least one more,
        // genuinely random component after it) and orders correctly against
        // both neighbors.
        components.push(l);
        depth += 1;
    }
}
