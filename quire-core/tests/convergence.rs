//! Property tests: position ordering, commutativity and idempotent replay.

use std::collections::HashSet;

use proptest::prelude::*;
use proptest::test_runner::Config;

use quire_core::{
    generate_between, EditorState, OpId, OpKind, Operation, Position, ReplayEngine, BASE,
};

// =============================================================================
// Helpers
// =============================================================================

/// A minimal replica: confirmed state plus the replay engine guarding it.
struct Replica {
    site: String,
    bias: i64,
    counter: u64,
    state: EditorState,
    engine: ReplayEngine,
}

impl Replica {
    fn new(site: &str, bias: i64) -> Self {
        Self {
            site: site.to_string(),
            bias,
            counter: 0,
            state: EditorState::new(),
            engine: ReplayEngine::new(),
        }
    }

    fn next_id(&mut self) -> OpId {
        let id = OpId::new(self.site.clone(), self.counter);
        self.counter += 1;
        id
    }

    fn insert(&mut self, index: usize, value: char) -> Operation {
        let visible = self.state.visible_state();
        let (left, right) = visible.bounds_at(index.min(visible.len()));
        let position = generate_between(&left, &right, self.bias + self.counter as i64);
        let op = Operation::insert("doc", self.next_id(), position, value);
        self.commit(op.clone());
        op
    }

    fn delete(&mut self, index: usize) -> Option<Operation> {
        let positions = self.state.visible_state().positions();
        let position = positions.get(index % positions.len().max(1))?.clone();
        let op = Operation::delete("doc", self.next_id(), position);
        self.commit(op.clone());
        Some(op)
    }

    fn commit(&mut self, op: Operation) {
        let state = &mut self.state;
        self.engine.apply_one(op, |op| {
            state.apply_to_confirmed(op);
        });
    }

    fn receive(&mut self, op: Operation) -> bool {
        let state = &mut self.state;
        self.engine.apply_one(op, |op| {
            state.apply_to_confirmed(op);
        })
    }

    fn text(&self) -> String {
        self.state.visible_text()
    }

    fn positions(&self) -> Vec<Position> {
        self.state.visible_state().positions()
    }
}

#[derive(Debug, Clone)]
enum Edit {
    Insert(usize, char),
    Delete(usize),
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (0usize..64, proptest::char::range('a', 'z')).prop_map(|(i, c)| Edit::Insert(i, c)),
        1 => (0usize..64).prop_map(Edit::Delete),
    ]
}

fn run_edits(replica: &mut Replica, edits: &[Edit]) -> Vec<Operation> {
    edits
        .iter()
        .filter_map(|edit| match edit {
            Edit::Insert(i, c) => Some(replica.insert(*i, *c)),
            Edit::Delete(i) => replica.delete(*i),
        })
        .collect()
}

fn insert_positions_distinct<'a>(ops: impl Iterator<Item = &'a Operation>) -> bool {
    let mut seen = HashSet::new();
    ops.filter(|op| op.kind() == OpKind::Insert)
        .all(|op| seen.insert(op.position().clone()))
}

/// Digits in range; the last one non-zero so the position can bound a gap.
fn bounding_position() -> impl Strategy<Value = Position> {
    (proptest::collection::vec(0u32..BASE, 0..4), 1u32..BASE).prop_map(|(mut digits, last)| {
        digits.push(last);
        Position::new(digits)
    })
}

fn any_position() -> impl Strategy<Value = Position> {
    proptest::collection::vec(0u32..BASE, 1..5).prop_map(Position::new)
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(Config::with_cases(512))]

    #[test]
    fn generated_position_is_strictly_between(
        left in any_position(),
        right in bounding_position(),
        bias in any::<i64>(),
    ) {
        prop_assume!(left < right);
        let p = generate_between(&left, &right, bias);
        prop_assert!(left < p, "{} !< {}", left, p);
        prop_assert!(p < right, "{} !< {}", p, right);
        prop_assert_ne!(*p.digits().last().unwrap(), 0);
    }

    #[test]
    fn repeated_insertion_keeps_order(
        steps in proptest::collection::vec((0usize..32, 0i64..1000), 1..120),
    ) {
        let mut replica = Replica::new("a", 17);
        for (i, (index, _)) in steps.iter().enumerate() {
            replica.insert(*index, char::from(b'a' + (i % 26) as u8));
            let positions = replica.positions();
            prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(positions.iter().all(|p| Position::start() < *p && *p < Position::end()));
        }
    }
}

proptest! {
    #![proptest_config(Config::with_cases(128))]

    #[test]
    fn concurrent_edits_converge(
        base in proptest::collection::vec(proptest::char::range('a', 'z'), 0..8),
        edits_a in proptest::collection::vec(edit(), 0..24),
        edits_b in proptest::collection::vec(edit(), 0..24),
        interleave in proptest::collection::vec(any::<bool>(), 48),
    ) {
        let mut seed = Replica::new("seed", 0);
        let base_ops: Vec<Operation> = base.iter().enumerate().map(|(i, c)| seed.insert(i, *c)).collect();

        let mut a = Replica::new("a", 1000);
        let mut b = Replica::new("b", 2000);
        for op in &base_ops {
            a.receive(op.clone());
            b.receive(op.clone());
        }

        let ops_a = run_edits(&mut a, &edits_a);
        let ops_b = run_edits(&mut b, &edits_b);
        // Two sites landing on the same slot is not resolved by the store.
        prop_assume!(insert_positions_distinct(base_ops.iter().chain(&ops_a).chain(&ops_b)));

        // A third replica sees an arbitrary interleaving that keeps each
        // site's own order.
        let mut c = Replica::new("c", 3000);
        for op in &base_ops {
            c.receive(op.clone());
        }
        let (mut ia, mut ib) = (0, 0);
        for take_a in interleave.iter().copied().chain(std::iter::repeat(true)) {
            if ia == ops_a.len() && ib == ops_b.len() {
                break;
            }
            if (take_a && ia < ops_a.len()) || ib == ops_b.len() {
                c.receive(ops_a[ia].clone());
                ia += 1;
            } else {
                c.receive(ops_b[ib].clone());
                ib += 1;
            }
        }

        for op in &ops_b {
            a.receive(op.clone());
        }
        for op in &ops_a {
            b.receive(op.clone());
        }

        prop_assert_eq!(a.text(), b.text());
        prop_assert_eq!(a.text(), c.text());
        prop_assert_eq!(a.positions(), b.positions());
        prop_assert_eq!(a.positions(), c.positions());
    }

    #[test]
    fn replay_is_idempotent(
        edits in proptest::collection::vec(edit(), 1..32),
        repeats in 1usize..4,
    ) {
        let mut origin = Replica::new("a", 5);
        let ops = run_edits(&mut origin, &edits);

        let mut replica = Replica::new("b", 9);
        for op in &ops {
            prop_assert!(replica.receive(op.clone()));
        }
        let once = replica.text();

        for _ in 0..repeats {
            for op in &ops {
                prop_assert!(!replica.receive(op.clone()));
            }
        }
        prop_assert_eq!(replica.text(), once.clone());
        prop_assert_eq!(origin.text(), once);
        prop_assert_eq!(replica.engine.log().len(), ops.len());
    }
}

#[test]
fn test_disjoint_inserts_commute() {
    let mut a = Replica::new("a", 100);
    let mut b = Replica::new("b", 200);
    let x = a.insert(0, 'x');
    let y = b.insert(0, 'y');

    a.receive(y.clone());
    b.receive(x.clone());
    assert_eq!(a.text(), b.text());
    assert_eq!(a.text().len(), 2);
}

#[test]
fn test_insert_then_delete_commute_across_sites() {
    let mut a = Replica::new("a", 100);
    let mut b = Replica::new("b", 200);
    let base = a.insert(0, 'q');
    b.receive(base);

    let del = a.delete(0).unwrap();
    let ins = b.insert(1, 'r');

    a.receive(ins);
    b.receive(del);
    assert_eq!(a.text(), "r");
    assert_eq!(b.text(), "r");
}
