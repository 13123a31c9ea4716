//! Seeding a new document from plain text.

use crate::operation::{OpId, Operation};
use crate::position::{generate_between, Position};

/// Build the insert operations that spell `text` in a fresh document.
///
/// Each character is appended after the previous one with bias and counter
/// equal to its index, all issued by `site_id`.
pub fn seed_operations(doc_id: &str, site_id: &str, text: &str) -> Vec<Operation> {
    let end = Position::end();
    let mut left = Position::start();
    let mut ops = Vec::with_capacity(text.len());

    for (i, ch) in text.chars().enumerate() {
        let position = generate_between(&left, &end, i as i64);
        ops.push(Operation::insert(
            doc_id,
            OpId::new(site_id, i as u64),
            position.clone(),
            ch,
        ));
        left = position;
    }
    ops
}
