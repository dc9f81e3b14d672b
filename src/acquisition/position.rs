//! Stage position lists.

use serde::{Deserialize, Serialize};

/// A labelled XY (and optionally Z) stage position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StagePosition {
    /// Position name, e.g. `"Pos0"` or a well label.
    pub label: String,
    /// X stage coordinate in µm.
    pub x_um: f64,
    /// Y stage coordinate in µm.
    pub y_um: f64,
    /// Focus coordinate in µm, if the position pins the focus drive.
    #[serde(default)]
    pub z_um: Option<f64>,
}

impl StagePosition {
    /// XY-only position.
    pub fn new(label: impl Into<String>, x_um: f64, y_um: f64) -> Self {
        Self {
            label: label.into(),
            x_um,
            y_um,
            z_um: None,
        }
    }

    /// Also move the focus drive to `z_um` at this position.
    pub fn with_z(mut self, z_um: f64) -> Self {
        self.z_um = Some(z_um);
        self
    }
}

/// Ordered list of stage positions visited by one sub-acquisition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionList {
    positions: Vec<StagePosition>,
}

impl PositionList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a position.
    pub fn push(&mut self, position: StagePosition) {
        self.positions.push(position);
    }

    /// Number of positions.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the list has no positions.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Position at `index`.
    pub fn get(&self, index: usize) -> Option<&StagePosition> {
        self.positions.get(index)
    }

    /// Iterate in visiting order.
    pub fn iter(&self) -> std::slice::Iter<'_, StagePosition> {
        self.positions.iter()
    }
}

impl From<Vec<StagePosition>> for PositionList {
    fn from(positions: Vec<StagePosition>) -> Self {
        Self { positions }
    }
}

impl FromIterator<StagePosition> for PositionList {
    fn from_iter<I: IntoIterator<Item = StagePosition>>(iter: I) -> Self {
        Self {
            positions: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a PositionList {
    type Item = &'a StagePosition;
    type IntoIter = std::slice::Iter<'a, StagePosition>;

    fn into_iter(self) -> Self::IntoIter {
        self.positions.iter()
    }
}
