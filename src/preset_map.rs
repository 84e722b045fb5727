//! Bidirectional mapping between logical positions and vendor preset tokens.
//!
//! The map is rebuilt in full whenever preset discovery runs; stale entries
//! are replaced, never merged. Resolution order:
//!
//! 1. substring match of the vendor preset display name against each
//!    position's keyword list;
//! 2. if that leaves the map incomplete, a full ordinal reassignment —
//!    sorted preset tokens zipped onto the sorted non-home position list;
//! 3. numeric tokens fill any positions still unbound, when the token
//!    itself parses as an in-range position ID.

use std::collections::BTreeMap;

use tracing::debug;

use crate::positions::{HOME_POSITION, PositionRegistry};

/// Position <-> preset token mapping.
#[derive(Debug, Clone, Default)]
pub struct PresetMap {
    by_position: BTreeMap<u8, String>,
    by_token: BTreeMap<String, u8>,
}

impl PresetMap {
    /// Build a fresh map from discovered presets (token -> display name).
    pub fn rebuild(presets: &BTreeMap<String, String>, registry: &PositionRegistry) -> Self {
        let mut map = PresetMap::default();
        if presets.is_empty() {
            return map;
        }

        map.keyword_pass(presets, registry);

        // A partial name match is treated as no match: the vendor may have
        // renamed presets since they were bound, and a half-resolved map
        // would point some positions at the wrong orientation.
        let patrol = registry.patrol_ids();
        let expected = patrol.len().min(presets.len());
        if map.by_position.len() < expected {
            debug!(
                matched = map.by_position.len(),
                expected, "name matching incomplete, falling back to ordinal assignment"
            );
            map = PresetMap::default();
            map.ordinal_pass(presets, &patrol);
        }

        map.numeric_pass(presets, registry);
        map
    }

    fn keyword_pass(&mut self, presets: &BTreeMap<String, String>, registry: &PositionRegistry) {
        for (token, name) in presets {
            for position in registry.all() {
                if self.by_position.contains_key(&position.id) {
                    continue;
                }
                if position.matches_name(name) {
                    self.bind(position.id, token.clone());
                    break;
                }
            }
        }
    }

    fn ordinal_pass(&mut self, presets: &BTreeMap<String, String>, patrol: &[u8]) {
        let tokens = sorted_tokens(presets);
        for (position_id, token) in patrol.iter().zip(tokens) {
            self.bind(*position_id, token);
        }
    }

    fn numeric_pass(&mut self, presets: &BTreeMap<String, String>, registry: &PositionRegistry) {
        for token in presets.keys() {
            if self.by_token.contains_key(token) {
                continue;
            }
            let Ok(id) = token.parse::<u8>() else {
                continue;
            };
            if registry.contains(id) && !self.by_position.contains_key(&id) {
                self.bind(id, token.clone());
            }
        }
    }

    fn bind(&mut self, position_id: u8, token: String) {
        self.by_token.insert(token.clone(), position_id);
        self.by_position.insert(position_id, token);
    }

    /// Preset token bound to a position, if any.
    pub fn token_for(&self, position_id: u8) -> Option<&str> {
        self.by_position.get(&position_id).map(String::as_str)
    }

    /// Position bound to a preset token, if any.
    pub fn position_for(&self, token: &str) -> Option<u8> {
        self.by_token.get(token).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_position.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_position.len()
    }

    /// Position -> token pairs in position order.
    pub fn bindings(&self) -> impl Iterator<Item = (u8, &str)> {
        self.by_position.iter().map(|(id, token)| (*id, token.as_str()))
    }

    /// Whether the home position has a binding.
    pub fn has_home(&self) -> bool {
        self.by_position.contains_key(&HOME_POSITION)
    }
}

/// Preset tokens sorted numerically where they parse as integers, with
/// non-numeric tokens after them in lexicographic order.
fn sorted_tokens(presets: &BTreeMap<String, String>) -> Vec<String> {
    let mut tokens: Vec<String> = presets.keys().cloned().collect();
    tokens.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    });
    tokens
}
