use super::*;
use crate::core::error::Error;
use std::collections::BTreeSet;

fn columns(names: &[&str]) -> Option<BTreeSet<String>> {
    Some(names.iter().map(|name| name.to_string()).collect())
}

#[test]
fn new_coalescer_has_no_changes() {
    let keeper = OperationCoalescer::new(5);
    assert!(!keeper.has_changes());
    assert!(keeper.equivalent_operations().is_empty());
    assert_eq!(keeper.unchanged_count(), 5);
    assert!(keeper.is_canonical());
}

#[test]
fn full_change_then_partial_changes_merge_per_row() {
    let mut keeper = OperationCoalescer::new(5);
    keeper.process_operation(&ArrayOperation::change(2, 2)).unwrap();
    keeper
        .process_operation(&ArrayOperation::partial_change(2, 2, ["columnA"]))
        .unwrap();
    keeper
        .process_operation(&ArrayOperation::partial_change(4, 4, ["columnA"]))
        .unwrap();
    keeper
        .process_operation(&ArrayOperation::partial_change(4, 4, ["columnB"]))
        .unwrap();

    assert_eq!(
        keeper.equivalent_operations(),
        vec![
            ArrayOperation::change(2, 2),
            ArrayOperation::partial_change(4, 4, ["columnA", "columnB"]),
        ]
    );
}

#[test]
fn inserts_shift_later_inserts() {
    let mut keeper = OperationCoalescer::new(6);
    keeper.process_operation(&ArrayOperation::insert(0, 15)).unwrap();
    keeper.process_operation(&ArrayOperation::insert(22, 25)).unwrap();
    keeper.process_operation(&ArrayOperation::insert(20, 50)).unwrap();

    assert_eq!(
        keeper.equivalent_operations(),
        vec![
            ArrayOperation::insert(0, 15),
            ArrayOperation::insert(20, 50),
            ArrayOperation::insert(53, 56),
        ]
    );
    assert_eq!(keeper.unchanged_count(), 6);
    assert_eq!(keeper.size(), 57);
}

#[test]
fn full_change_erases_earlier_partial_tag() {
    let mut keeper = OperationCoalescer::new(4);
    keeper
        .process_operation(&ArrayOperation::partial_change(0, 2, ["a"]))
        .unwrap();
    keeper.process_operation(&ArrayOperation::change(1, 3)).unwrap();

    assert_eq!(
        keeper.equivalent_operations(),
        vec![
            ArrayOperation::partial_change(0, 0, ["a"]),
            ArrayOperation::change(1, 3),
        ]
    );
}

#[test]
fn partial_change_after_full_change_stays_full() {
    let mut keeper = OperationCoalescer::new(4);
    keeper.process_operation(&ArrayOperation::change(1, 2)).unwrap();
    keeper
        .process_operation(&ArrayOperation::partial_change(0, 3, ["a"]))
        .unwrap();

    assert_eq!(
        keeper.equivalent_operations(),
        vec![
            ArrayOperation::partial_change(0, 0, ["a"]),
            ArrayOperation::change(1, 2),
            ArrayOperation::partial_change(3, 3, ["a"]),
        ]
    );
}

#[test]
fn delete_subsumes_changes() {
    let mut keeper = OperationCoalescer::new(6);
    keeper.process_operation(&ArrayOperation::change(1, 2)).unwrap();
    keeper
        .process_operation(&ArrayOperation::partial_change(3, 3, ["x"]))
        .unwrap();
    keeper.process_operation(&ArrayOperation::delete(1, 3)).unwrap();

    assert_eq!(keeper.equivalent_operations(), vec![ArrayOperation::delete(1, 3)]);
    assert_eq!(keeper.size(), 3);
}

#[test]
fn delete_of_untouched_rows_is_reported() {
    let mut keeper = OperationCoalescer::new(3);
    keeper.process_operation(&ArrayOperation::delete(0, 0)).unwrap();

    assert_eq!(keeper.equivalent_operations(), vec![ArrayOperation::delete(0, 0)]);
    assert_eq!(keeper.unchanged_count(), 2);
}

#[test]
fn deleting_inserted_rows_cancels_them() {
    let mut keeper = OperationCoalescer::new(2);
    keeper.process_operation(&ArrayOperation::insert(1, 3)).unwrap();
    keeper.process_operation(&ArrayOperation::delete(1, 3)).unwrap();

    assert!(!keeper.has_changes());
    assert!(keeper.equivalent_operations().is_empty());
}

#[test]
fn changes_on_inserted_rows_are_absorbed() {
    let mut keeper = OperationCoalescer::new(2);
    keeper.process_operation(&ArrayOperation::insert(2, 3)).unwrap();
    keeper.process_operation(&ArrayOperation::change(1, 3)).unwrap();

    assert_eq!(
        keeper.equivalent_operations(),
        vec![ArrayOperation::change(1, 1), ArrayOperation::insert(2, 3)]
    );
}

#[test]
fn delete_marker_moves_before_adjacent_insert() {
    let mut keeper = OperationCoalescer::new(3);
    keeper.process_operation(&ArrayOperation::insert(0, 1)).unwrap();
    keeper.process_operation(&ArrayOperation::delete(2, 2)).unwrap();

    assert_eq!(
        keeper.equivalent_operations(),
        vec![ArrayOperation::delete(0, 0), ArrayOperation::insert(0, 1)]
    );
    assert!(keeper.is_canonical());
}

#[test]
fn adjacent_deletes_merge() {
    let mut keeper = OperationCoalescer::new(5);
    keeper.process_operation(&ArrayOperation::delete(3, 3)).unwrap();
    keeper.process_operation(&ArrayOperation::delete(1, 2)).unwrap();

    assert_eq!(keeper.equivalent_operations(), vec![ArrayOperation::delete(1, 3)]);
    assert_eq!(keeper.intervals().len(), 3);
}

#[test]
fn adjacent_equal_partial_changes_merge() {
    let mut keeper = OperationCoalescer::new(5);
    keeper
        .process_operation(&ArrayOperation::partial_change(1, 1, ["b", "a"]))
        .unwrap();
    keeper
        .process_operation(&ArrayOperation::partial_change(2, 3, ["a", "b"]))
        .unwrap();

    assert_eq!(
        keeper.intervals(),
        vec![
            Interval {
                start: 0,
                len: 1,
                kind: IntervalKind::Unchanged
            },
            Interval {
                start: 1,
                len: 3,
                kind: IntervalKind::Changed(columns(&["a", "b"]))
            },
            Interval {
                start: 4,
                len: 1,
                kind: IntervalKind::Unchanged
            },
        ]
    );
}

#[test]
fn out_of_range_operations_fail_without_side_effects() {
    let mut keeper = OperationCoalescer::new(3);
    keeper.process_operation(&ArrayOperation::change(0, 0)).unwrap();
    let before = keeper.intervals();

    for operation in [
        ArrayOperation::change(2, 3),
        ArrayOperation::delete(3, 3),
        ArrayOperation::insert(4, 4),
        ArrayOperation::new(2, 1, OperationKind::Change, None),
        ArrayOperation::new(0, 0, OperationKind::Delete, columns(&["a"])),
        ArrayOperation::new(0, 0, OperationKind::Change, Some(BTreeSet::new())),
    ] {
        let result = keeper.process_operation(&operation);
        assert!(
            matches!(result, Err(Error::InvalidOperation(_))),
            "{} should be rejected",
            operation
        );
    }

    assert_eq!(keeper.intervals(), before);
}

#[test]
fn insert_at_end_is_valid() {
    let mut keeper = OperationCoalescer::new(3);
    keeper.process_operation(&ArrayOperation::insert(3, 3)).unwrap();
    assert_eq!(keeper.equivalent_operations(), vec![ArrayOperation::insert(3, 3)]);
}

#[test]
fn reset_discards_everything() {
    let mut keeper = OperationCoalescer::new(3);
    keeper.process_operation(&ArrayOperation::insert(0, 1)).unwrap();
    keeper.reset(5, 7);

    assert!(!keeper.has_changes());
    assert_eq!(keeper.size(), 7);
    assert_eq!(keeper.original_size(), 7);
}

#[test]
fn empty_collection_accepts_inserts() {
    let mut keeper = OperationCoalescer::new(0);
    keeper.process_operation(&ArrayOperation::insert(0, 2)).unwrap();
    keeper.process_operation(&ArrayOperation::change(1, 1)).unwrap();

    assert_eq!(keeper.equivalent_operations(), vec![ArrayOperation::insert(0, 2)]);
    assert_eq!(keeper.rows_to_send(), 3);
}

#[test]
fn mixed_history_keeps_replay_positions() {
    // A B C D E -> delete B, insert X at 1, change D
    let mut keeper = OperationCoalescer::new(5);
    keeper.process_operation(&ArrayOperation::delete(1, 1)).unwrap();
    keeper.process_operation(&ArrayOperation::insert(1, 1)).unwrap();
    keeper.process_operation(&ArrayOperation::change(3, 3)).unwrap();

    // A X C D' E
    assert_eq!(
        keeper.equivalent_operations(),
        vec![
            ArrayOperation::delete(1, 1),
            ArrayOperation::insert(1, 1),
            ArrayOperation::change(3, 3),
        ]
    );
}
