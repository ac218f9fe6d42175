//! Operation coalescing for granular collection updates
//!
//! The coalescer keeps an ordered partition of the collection's current index
//! range. Every segment is tagged with what happened to its rows since the last
//! reset, so that the whole history collapses into the smallest ordered
//! sequence of operations the client has to replay.
//!
//! Deleted rows no longer occupy an index; they are kept as zero-width markers
//! at the position where they used to be, because the client still has to
//! remove them.

use super::operation::{ArrayOperation, OperationKind};
use crate::core::error::{Error, Result};
use std::collections::BTreeSet;
use tracing::trace;

/// What happened to the rows of one interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalKind {
    /// Rows the client already has, untouched
    Unchanged,
    /// Original rows changed in place; `None` means whole rows, otherwise only these columns
    Changed(Option<BTreeSet<String>>),
    /// Rows the client does not have yet
    Inserted,
    /// Original rows that were removed (zero width in the current index space)
    Deleted,
}

/// Public view of one interval of the partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    /// Start in the current index space
    pub start: usize,
    /// Number of rows (for deleted intervals, number of removed original rows)
    pub len: usize,
    /// Interval tag
    pub kind: IntervalKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    kind: IntervalKind,
    len: usize,
}

/// Keeps the minimal equivalent operation sequence for one ordered collection
#[derive(Debug, Clone)]
pub struct OperationCoalescer {
    segments: Vec<Segment>,
    size: usize,
    original_size: usize,
}

impl OperationCoalescer {
    /// Create a coalescer for a collection of `size` rows the client already has
    pub fn new(size: usize) -> Self {
        let mut coalescer = Self {
            segments: Vec::new(),
            size: 0,
            original_size: 0,
        };
        coalescer.establish(size);
        coalescer
    }

    /// Discard all tracked changes; the client is now assumed to hold `new_size` rows
    pub fn reset(&mut self, old_size: usize, new_size: usize) {
        trace!(old_size, new_size, "resetting operation coalescer");
        self.establish(new_size);
    }

    fn establish(&mut self, size: usize) {
        self.segments.clear();
        if size > 0 {
            self.segments.push(Segment {
                kind: IntervalKind::Unchanged,
                len: size,
            });
        }
        self.size = size;
        self.original_size = size;
    }

    /// Current number of rows
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of rows at the last reset
    pub fn original_size(&self) -> usize {
        self.original_size
    }

    /// Whether any operation has been recorded since the last reset
    pub fn has_changes(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| segment.kind != IntervalKind::Unchanged)
    }

    /// Number of original rows that are still present and untouched
    pub fn unchanged_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| segment.kind == IntervalKind::Unchanged)
            .map(|segment| segment.len)
            .sum()
    }

    /// Number of rows the client would receive values for (changed or inserted)
    pub fn rows_to_send(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| {
                matches!(segment.kind, IntervalKind::Changed(_) | IntervalKind::Inserted)
            })
            .map(|segment| segment.len)
            .sum()
    }

    /// Record one operation
    ///
    /// Fails with [`Error::InvalidOperation`] when the operation does not fit the
    /// current bounds; the recorded state is left untouched in that case.
    pub fn process_operation(&mut self, operation: &ArrayOperation) -> Result<()> {
        self.validate(operation)?;
        trace!(%operation, size = self.size, "recording array operation");

        match operation.kind {
            OperationKind::Insert => self.apply_insert(operation.start_index, operation.len()),
            OperationKind::Delete => self.apply_delete(operation.start_index, operation.end_index),
            OperationKind::Change => self.apply_change(
                operation.start_index,
                operation.end_index,
                operation.column_names.as_ref(),
            ),
        }

        self.normalize();
        debug_assert!(self.is_canonical(), "coalescer lost its canonical form");
        Ok(())
    }

    fn validate(&self, operation: &ArrayOperation) -> Result<()> {
        if operation.start_index > operation.end_index {
            return Err(Error::invalid_operation(format!(
                "{}: start index after end index",
                operation
            )));
        }

        match operation.kind {
            OperationKind::Insert => {
                if operation.column_names.is_some() {
                    return Err(Error::invalid_operation(format!(
                        "{}: inserts cannot be restricted to columns",
                        operation
                    )));
                }
                if operation.start_index > self.size {
                    return Err(Error::invalid_operation(format!(
                        "{}: insertion point beyond size {}",
                        operation, self.size
                    )));
                }
            }
            OperationKind::Delete => {
                if operation.column_names.is_some() {
                    return Err(Error::invalid_operation(format!(
                        "{}: deletes cannot be restricted to columns",
                        operation
                    )));
                }
                if operation.end_index >= self.size {
                    return Err(Error::invalid_operation(format!(
                        "{}: out of range for size {}",
                        operation, self.size
                    )));
                }
            }
            OperationKind::Change => {
                if operation.end_index >= self.size {
                    return Err(Error::invalid_operation(format!(
                        "{}: out of range for size {}",
                        operation, self.size
                    )));
                }
                if matches!(&operation.column_names, Some(columns) if columns.is_empty()) {
                    return Err(Error::invalid_operation(format!(
                        "{}: empty column set",
                        operation
                    )));
                }
            }
        }

        Ok(())
    }

    /// Make sure a segment boundary exists at `position` (current index space)
    ///
    /// Returns the index of the first live segment starting at `position`, or the
    /// segment count when `position` is the end. Delete markers sitting at
    /// `position` stay before the returned index.
    fn split_at(&mut self, position: usize) -> usize {
        let mut cursor = 0;
        for i in 0..self.segments.len() {
            if self.segments[i].kind == IntervalKind::Deleted {
                continue;
            }
            if cursor == position {
                return i;
            }

            let len = self.segments[i].len;
            if position < cursor + len {
                let head = position - cursor;
                let tail = Segment {
                    kind: self.segments[i].kind.clone(),
                    len: len - head,
                };
                self.segments[i].len = head;
                self.segments.insert(i + 1, tail);
                return i + 1;
            }
            cursor += len;
        }
        self.segments.len()
    }

    /// Split at both ends of `[start, end]` and return the covered segment range
    fn isolate(&mut self, start: usize, end: usize) -> std::ops::Range<usize> {
        let first = self.split_at(start);
        let last = self.split_at(end + 1);
        first..last
    }

    fn apply_insert(&mut self, position: usize, count: usize) {
        let index = self.split_at(position);
        self.segments.insert(
            index,
            Segment {
                kind: IntervalKind::Inserted,
                len: count,
            },
        );
        self.size += count;
    }

    fn apply_delete(&mut self, start: usize, end: usize) {
        let range = self.isolate(start, end);
        for segment in &mut self.segments[range] {
            match segment.kind {
                // rows the client never saw just disappear
                IntervalKind::Inserted => segment.len = 0,
                IntervalKind::Unchanged | IntervalKind::Changed(_) => {
                    segment.kind = IntervalKind::Deleted
                }
                IntervalKind::Deleted => {}
            }
        }
        self.size -= end - start + 1;
    }

    fn apply_change(&mut self, start: usize, end: usize, columns: Option<&BTreeSet<String>>) {
        let range = self.isolate(start, end);
        for segment in &mut self.segments[range] {
            let merged = match (&segment.kind, columns) {
                (IntervalKind::Inserted | IntervalKind::Deleted, _) => continue,
                (_, None) => IntervalKind::Changed(None),
                (IntervalKind::Changed(None), Some(_)) => continue,
                (IntervalKind::Unchanged, Some(columns)) => {
                    IntervalKind::Changed(Some(columns.clone()))
                }
                (IntervalKind::Changed(Some(existing)), Some(columns)) => {
                    IntervalKind::Changed(Some(existing.union(columns).cloned().collect()))
                }
            };
            segment.kind = merged;
        }
    }

    fn normalize(&mut self) {
        self.segments.retain(|segment| segment.len > 0);

        // delete markers go before insertions at the same position
        let mut swapped = true;
        while swapped {
            swapped = false;
            for i in 1..self.segments.len() {
                if self.segments[i - 1].kind == IntervalKind::Inserted
                    && self.segments[i].kind == IntervalKind::Deleted
                {
                    self.segments.swap(i - 1, i);
                    swapped = true;
                }
            }
        }

        let mut merged: Vec<Segment> = Vec::with_capacity(self.segments.len());
        for segment in self.segments.drain(..) {
            match merged.last_mut() {
                Some(last) if last.kind == segment.kind => last.len += segment.len,
                _ => merged.push(segment),
            }
        }
        self.segments = merged;
    }

    /// Check the partition invariants
    ///
    /// Live intervals cover `[0, size)` without gaps, the intervals that existed
    /// at the last reset add up to the original size, no interval is empty,
    /// adjacent intervals never carry the same tag, and delete markers never
    /// follow an insertion directly.
    pub fn is_canonical(&self) -> bool {
        let live: usize = self
            .segments
            .iter()
            .filter(|segment| segment.kind != IntervalKind::Deleted)
            .map(|segment| segment.len)
            .sum();
        let original: usize = self
            .segments
            .iter()
            .filter(|segment| segment.kind != IntervalKind::Inserted)
            .map(|segment| segment.len)
            .sum();

        let well_formed = self.segments.iter().all(|segment| {
            segment.len > 0
                && !matches!(&segment.kind, IntervalKind::Changed(Some(columns)) if columns.is_empty())
        });
        let merged = self.segments.windows(2).all(|pair| {
            pair[0].kind != pair[1].kind
                && !(pair[0].kind == IntervalKind::Inserted && pair[1].kind == IntervalKind::Deleted)
        });

        live == self.size && original == self.original_size && well_formed && merged
    }

    /// The partition, in ascending order
    pub fn intervals(&self) -> Vec<Interval> {
        let mut position = 0;
        self.segments
            .iter()
            .map(|segment| {
                let interval = Interval {
                    start: position,
                    len: segment.len,
                    kind: segment.kind.clone(),
                };
                if segment.kind != IntervalKind::Deleted {
                    position += segment.len;
                }
                interval
            })
            .collect()
    }

    /// The minimal ordered operation sequence equivalent to everything recorded
    ///
    /// Replaying the returned operations in order against the collection as it
    /// was at the last reset produces the current collection. Each index is
    /// relative to the replay position at that step: for inserts and changes
    /// that is the final index of the row.
    pub fn equivalent_operations(&self) -> Vec<ArrayOperation> {
        let mut operations = Vec::new();
        let mut position = 0;

        for segment in &self.segments {
            let end = position + segment.len - 1;
            match &segment.kind {
                IntervalKind::Unchanged => position += segment.len,
                IntervalKind::Changed(columns) => {
                    operations.push(ArrayOperation::new(
                        position,
                        end,
                        OperationKind::Change,
                        columns.clone(),
                    ));
                    position += segment.len;
                }
                IntervalKind::Inserted => {
                    operations.push(ArrayOperation::insert(position, end));
                    position += segment.len;
                }
                IntervalKind::Deleted => operations.push(ArrayOperation::delete(position, end)),
            }
        }

        operations
    }
}

impl Default for OperationCoalescer {
    fn default() -> Self {
        Self::new(0)
    }
}
