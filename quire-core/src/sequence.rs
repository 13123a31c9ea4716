//! Tombstoned, position-ordered character store.
//!
//! ```text
//!  BTreeMap<Position, Slot>
//!  ┌─────────┬─────────┬─────────┬─────────┬──────────┐
//!  │ [0]     │ [1]     │ [3]     │ [3.9]   │ [65535]  │
//!  │ ␀ dead  │ 'H'     │ 'i' dead│ '!'     │ ␀ dead   │
//!  └─────────┴─────────┴─────────┴─────────┴──────────┘
//!    start                                   end
//!  visible text: "H!"
//! ```
//!
//! Elements are never removed, only tombstoned, so a late delete or a
//! re-insert at the same position always finds its slot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::position::{generate_between, Position};

/// Placeholder value carried by the sentinels.
const SENTINEL_VALUE: char = '\u{0}';

/// One character slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub position: Position,
    pub value: char,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    value: char,
    deleted: bool,
}

/// The sequence CRDT.
///
/// Position-keyed upsert plus permanent tombstones make every pair of
/// operations from different sites commute.
#[derive(Debug, Clone)]
pub struct SequenceStore {
    slots: BTreeMap<Position, Slot>,
}

impl Default for SequenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceStore {
    /// Create an empty document bounded by the two sentinels.
    pub fn new() -> Self {
        let mut slots = BTreeMap::new();
        for position in [Position::start(), Position::end()] {
            slots.insert(
                position,
                Slot {
                    value: SENTINEL_VALUE,
                    deleted: true,
                },
            );
        }
        Self { slots }
    }

    /// Generate a position between `left` and `right` and store a live
    /// element there. An existing slot at the generated position is kept.
    pub fn insert(&mut self, left: &Position, right: &Position, value: char, bias: i64) -> Element {
        let position = generate_between(left, right, bias);
        let slot = self.slots.entry(position.clone()).or_insert(Slot {
            value,
            deleted: false,
        });
        Element {
            position,
            value: slot.value,
            deleted: slot.deleted,
        }
    }

    /// Tombstone the element at exactly `position`, if there is one.
    pub fn delete(&mut self, position: &Position) {
        if let Some(slot) = self.slots.get_mut(position) {
            slot.deleted = true;
        }
    }

    /// Merge a remote view of one slot.
    ///
    /// A known position only has its tombstone flag updated, in either
    /// direction. An unknown live position is created. An unknown deleted
    /// position is dropped: no tombstone is kept for it, so an insert for that
    /// position arriving later is not suppressed.
    pub fn apply_remote(&mut self, position: &Position, value: char, deleted: bool) {
        if !position.is_interior() {
            log::debug!("ignoring remote slot outside the sentinels: {position}");
            return;
        }
        if let Some(slot) = self.slots.get_mut(position) {
            slot.deleted = deleted;
            return;
        }
        if deleted {
            log::trace!("dropping delete for unknown position {position}");
            return;
        }
        self.slots.insert(
            position.clone(),
            Slot {
                value,
                deleted: false,
            },
        );
    }

    /// Look up the element stored at `position`, tombstoned or not.
    pub fn element(&self, position: &Position) -> Option<Element> {
        self.slots.get(position).map(|slot| Element {
            position: position.clone(),
            value: slot.value,
            deleted: slot.deleted,
        })
    }

    /// Value of the live element at `position`.
    pub fn live_value(&self, position: &Position) -> Option<char> {
        self.slots
            .get(position)
            .filter(|slot| !slot.deleted)
            .map(|slot| slot.value)
    }

    /// All elements in position order, sentinels and tombstones included.
    pub fn elements(&self) -> impl Iterator<Item = Element> + '_ {
        self.slots.iter().map(|(position, slot)| Element {
            position: position.clone(),
            value: slot.value,
            deleted: slot.deleted,
        })
    }

    fn visible(&self) -> impl Iterator<Item = (&Position, &Slot)> {
        self.slots
            .iter()
            .filter(|(position, slot)| !slot.deleted && !position.is_sentinel())
    }

    /// Visible text.
    pub fn text(&self) -> String {
        self.visible().map(|(_, slot)| slot.value).collect()
    }

    /// Positions of the visible characters, in order.
    pub fn positions(&self) -> Vec<Position> {
        self.visible().map(|(position, _)| position.clone()).collect()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible().count()
    }

    pub fn is_empty(&self) -> bool {
        self.visible().next().is_none()
    }

    /// Total slots held, tombstones and sentinels included.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Visible index a cursor anchored at `position` sits at: the number of
    /// visible characters ordered before it.
    pub fn position_to_index(&self, position: &Position) -> usize {
        self.visible().take_while(|(p, _)| *p < position).count()
    }

    /// A fresh anchor position for visible index `index`, between the
    /// visible characters at `index - 1` and `index`. Index 0 is bounded by
    /// the start sentinel and `index >= len` by the end sentinel.
    pub fn index_to_position(&self, index: usize) -> Position {
        let (left, right) = self.bounds_at(index);
        generate_between(&left, &right, 0)
    }

    /// The visible neighbours an insertion at `index` falls between.
    pub fn bounds_at(&self, index: usize) -> (Position, Position) {
        let positions = self.positions();
        let left = match index {
            0 => Position::start(),
            i => positions
                .get(i - 1)
                .or(positions.last())
                .cloned()
                .unwrap_or_else(Position::start),
        };
        let right = positions
            .get(index)
            .cloned()
            .unwrap_or_else(Position::end);
        (left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::BASE;

    fn append(store: &mut SequenceStore, text: &str) -> Vec<Position> {
        let mut out = Vec::new();
        for (i, ch) in text.chars().enumerate() {
            let (left, right) = store.bounds_at(store.len());
            out.push(store.insert(&left, &right, ch, i as i64).position);
        }
        out
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = SequenceStore::new();
        assert_eq!(store.text(), "");
        assert!(store.is_empty());
        assert_eq!(store.slot_count(), 2);
        assert!(store.positions().is_empty());
    }

    #[test]
    fn test_insert_and_text() {
        let mut store = SequenceStore::new();
        append(&mut store, "hello");
        assert_eq!(store.text(), "hello");
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_insert_in_middle() {
        let mut store = SequenceStore::new();
        let p = append(&mut store, "ac");
        store.insert(&p[0], &p[1], 'b', 0);
        assert_eq!(store.text(), "abc");
    }

    #[test]
    fn test_delete_tombstones() {
        let mut store = SequenceStore::new();
        let p = append(&mut store, "abc");
        store.delete(&p[1]);
        assert_eq!(store.text(), "ac");
        assert_eq!(store.slot_count(), 5);
        assert!(store.element(&p[1]).unwrap().deleted);
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let mut store = SequenceStore::new();
        store.delete(&Position::new(vec![42]));
        assert_eq!(store.slot_count(), 2);
    }

    #[test]
    fn test_apply_remote_toggles_known() {
        let mut store = SequenceStore::new();
        let p = append(&mut store, "x");
        store.apply_remote(&p[0], 'x', true);
        assert_eq!(store.text(), "");
        store.apply_remote(&p[0], 'x', false);
        assert_eq!(store.text(), "x");
    }

    #[test]
    fn test_apply_remote_drops_unknown_delete() {
        let mut store = SequenceStore::new();
        let p = Position::new(vec![9]);
        store.apply_remote(&p, 'q', true);
        assert!(store.element(&p).is_none());
        // A later insert for the same slot still lands.
        store.apply_remote(&p, 'q', false);
        assert_eq!(store.text(), "q");
    }

    #[test]
    fn test_apply_remote_is_idempotent() {
        let mut store = SequenceStore::new();
        let p = Position::new(vec![9]);
        store.apply_remote(&p, 'q', false);
        store.apply_remote(&p, 'q', false);
        assert_eq!(store.text(), "q");
        assert_eq!(store.slot_count(), 3);
    }

    #[test]
    fn test_apply_remote_ignores_out_of_range() {
        let mut store = SequenceStore::new();
        store.apply_remote(&Position::new(vec![70000]), 'x', false);
        store.apply_remote(&Position::new(vec![]), 'x', false);
        store.apply_remote(&Position::new(vec![BASE - 1, 2]), 'x', false);
        assert_eq!(store.slot_count(), 2);

        append(&mut store, "y");
        let (left, right) = store.bounds_at(0);
        store.insert(&left, &right, 'x', 3);
        assert_eq!(store.text(), "xy");
    }

    #[test]
    fn test_sentinels_never_revived() {
        let mut store = SequenceStore::new();
        store.apply_remote(&Position::start(), 'z', false);
        assert_eq!(store.text(), "");
    }

    #[test]
    fn test_index_position_mapping() {
        let mut store = SequenceStore::new();
        let p = append(&mut store, "abc");
        assert_eq!(store.position_to_index(&p[0]), 0);
        assert_eq!(store.position_to_index(&p[2]), 2);
        assert_eq!(store.position_to_index(&Position::end()), 3);

        let anchor = store.index_to_position(2);
        assert!(p[1] < anchor && anchor < p[2]);
        assert_eq!(store.position_to_index(&anchor), 2);

        let tail = store.index_to_position(3);
        assert_eq!(store.position_to_index(&tail), 3);
    }

    #[test]
    fn test_index_to_position_empty() {
        let store = SequenceStore::new();
        let anchor = store.index_to_position(0);
        assert!(Position::start() < anchor && anchor < Position::end());
    }

    #[test]
    fn test_clone_does_not_alias() {
        let mut store = SequenceStore::new();
        let p = append(&mut store, "ab");
        let mut copy = store.clone();
        copy.delete(&p[0]);
        assert_eq!(store.text(), "ab");
        assert_eq!(copy.text(), "b");
    }
}
