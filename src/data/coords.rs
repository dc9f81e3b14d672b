//! Image coordinates.

use crate::acquisition::event::{AxisPositions, CHANNEL_AXIS, POSITION_AXIS, TIME_AXIS, Z_AXIS};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

/// Position of an image in the dataset: axis name to index.
///
/// Terminal markers are carried along but do not take part in equality or
/// hashing, so looking up an image does not require knowing them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Coords {
    axes: BTreeMap<String, u32>,
    terminal: BTreeSet<String>,
}

impl Coords {
    /// Coordinates with no axes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinates from the well-known axes of `positions`; extension axes
    /// are left out.
    pub fn from_standard_axes(positions: &AxisPositions) -> Self {
        Self {
            axes: positions
                .iter()
                .filter(|(axis, _)| AxisPositions::is_standard(axis))
                .map(|(axis, index)| (axis.to_string(), index))
                .collect(),
            terminal: BTreeSet::new(),
        }
    }

    /// Copy with `axis` set to `index`.
    pub fn with_axis(mut self, axis: impl Into<String>, index: u32) -> Self {
        self.axes.insert(axis.into(), index);
        self
    }

    /// Copy with `axis` marked terminal.
    pub fn with_terminal(mut self, axis: impl Into<String>) -> Self {
        self.terminal.insert(axis.into());
        self
    }

    /// Index along `axis`.
    pub fn index(&self, axis: &str) -> Option<u32> {
        self.axes.get(axis).copied()
    }

    #[allow(missing_docs)]
    pub fn time(&self) -> Option<u32> {
        self.index(TIME_AXIS)
    }

    #[allow(missing_docs)]
    pub fn z(&self) -> Option<u32> {
        self.index(Z_AXIS)
    }

    #[allow(missing_docs)]
    pub fn channel(&self) -> Option<u32> {
        self.index(CHANNEL_AXIS)
    }

    #[allow(missing_docs)]
    pub fn stage_position(&self) -> Option<u32> {
        self.index(POSITION_AXIS)
    }

    /// Axis names, sorted.
    pub fn axes(&self) -> impl Iterator<Item = &str> + '_ {
        self.axes.keys().map(String::as_str)
    }

    /// Whether `axis` is set.
    pub fn has_axis(&self, axis: &str) -> bool {
        self.axes.contains_key(axis)
    }

    /// Whether the image holds the last value along `axis`.
    pub fn is_terminal(&self, axis: &str) -> bool {
        self.terminal.contains(axis)
    }
}

impl PartialEq for Coords {
    fn eq(&self, other: &Self) -> bool {
        self.axes == other.axes
    }
}

impl Eq for Coords {}

impl Hash for Coords {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.axes.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_ignores_terminal_markers() {
        let a = Coords::new().with_axis(Z_AXIS, 4).with_terminal(Z_AXIS);
        let b = Coords::new().with_axis(Z_AXIS, 4);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn standard_axes_then_extensions() {
        let mut positions = AxisPositions::default();
        positions.set(TIME_AXIS, 1);
        positions.set("angle", 3);
        let coords = Coords::from_standard_axes(&positions);
        assert_eq!(coords.time(), Some(1));
        assert!(!coords.has_axis("angle"));

        let coords = coords.with_axis("angle", 3);
        assert_eq!(coords.index("angle"), Some(3));
        assert_eq!(coords.axes().collect::<Vec<_>>(), vec!["angle", "time"]);
    }
}
