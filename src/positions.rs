//! Logical camera position registry.
//!
//! Positions are this system's own small integer IDs, independent of whatever
//! preset tokens the camera vendor hands out. Position 0 is the resting (home)
//! position and is never part of a patrol.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// ID of the resting/home position.
pub const HOME_POSITION: u8 = 0;

/// A logical camera position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: u8,
    pub name: String,
    pub description: String,
    /// Keywords used to match vendor preset display names against this
    /// position (deployment language plus English).
    pub keywords: Vec<String>,
    /// Vendor preset token currently bound to this position, if any.
    pub preset_ref: Option<String>,
}

impl Position {
    fn new(id: u8, name: &str, description: &str, keywords: &[&str]) -> Self {
        Self {
            id,
            name: name.to_string(),
            description: description.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            preset_ref: None,
        }
    }

    /// Whether a vendor preset display name matches this position's keywords.
    pub fn matches_name(&self, preset_name: &str) -> bool {
        let lowered = preset_name.to_lowercase();
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }
}

/// Registry of all logical positions, keyed by ID.
#[derive(Debug, Clone)]
pub struct PositionRegistry {
    positions: BTreeMap<u8, Position>,
}

impl Default for PositionRegistry {
    fn default() -> Self {
        let defaults = [
            Position::new(
                0,
                "Покой",
                "Resting position",
                &["покой", "home", "default", "основна", "център", "center"],
            ),
            Position::new(1, "Изток", "Facing east", &["изток", "east", "дясно", "right"]),
            Position::new(2, "Запад", "Facing west", &["запад", "west", "ляво", "left"]),
            Position::new(3, "Север", "Facing north", &["север", "north", "горе", "up"]),
            Position::new(4, "Юг", "Facing south", &["юг", "south", "долу", "down"]),
        ];

        let mut positions = BTreeMap::new();
        for position in defaults {
            positions.insert(position.id, position);
        }

        Self { positions }
    }
}

impl PositionRegistry {
    /// Look up a position by ID.
    pub fn get(&self, id: u8) -> Option<&Position> {
        self.positions.get(&id)
    }

    /// Whether the registry knows this position ID.
    pub fn contains(&self, id: u8) -> bool {
        self.positions.contains_key(&id)
    }

    /// All positions in ID order.
    pub fn all(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Non-home position IDs in ascending order.
    pub fn patrol_ids(&self) -> Vec<u8> {
        self.positions
            .keys()
            .copied()
            .filter(|id| *id != HOME_POSITION)
            .collect()
    }

    /// Replace the preset binding on a position. Unknown IDs are ignored.
    pub fn set_preset_ref(&mut self, id: u8, token: Option<String>) {
        if let Some(position) = self.positions.get_mut(&id) {
            position.preset_ref = token;
        }
    }

    /// Snapshot of all positions, for status endpoints.
    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }
}
