//! Structural operations over ordered collections

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of structural operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Rows were changed in place
    Change,
    /// Rows were inserted
    Insert,
    /// Rows were deleted
    Delete,
}

/// One structural operation over an inclusive index range
///
/// Indices are expressed against the index space the collection has at the
/// moment the operation is recorded, after all previously recorded operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayOperation {
    /// First affected index
    pub start_index: usize,
    /// Last affected index (inclusive)
    pub end_index: usize,
    /// Operation kind
    pub kind: OperationKind,
    /// `None` means whole rows; `Some` restricts a change to these sub-fields
    pub column_names: Option<BTreeSet<String>>,
}

impl ArrayOperation {
    /// Create an operation
    pub fn new(
        start_index: usize,
        end_index: usize,
        kind: OperationKind,
        column_names: Option<BTreeSet<String>>,
    ) -> Self {
        Self {
            start_index,
            end_index,
            kind,
            column_names,
        }
    }

    /// Whole-row change of `[start, end]`
    pub fn change(start_index: usize, end_index: usize) -> Self {
        Self::new(start_index, end_index, OperationKind::Change, None)
    }

    /// Change of the given columns of `[start, end]`
    pub fn partial_change<I, S>(start_index: usize, end_index: usize, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            start_index,
            end_index,
            OperationKind::Change,
            Some(columns.into_iter().map(Into::into).collect()),
        )
    }

    /// Insertion of rows that end up at `[start, end]`
    pub fn insert(start_index: usize, end_index: usize) -> Self {
        Self::new(start_index, end_index, OperationKind::Insert, None)
    }

    /// Deletion of rows `[start, end]`
    pub fn delete(start_index: usize, end_index: usize) -> Self {
        Self::new(start_index, end_index, OperationKind::Delete, None)
    }

    /// Number of rows covered
    pub fn len(&self) -> usize {
        self.end_index.saturating_sub(self.start_index) + 1
    }

    /// Operations always cover at least one row
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether this is a column-restricted change
    pub fn is_partial(&self) -> bool {
        self.column_names.is_some()
    }
}

impl fmt::Display for ArrayOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}..={}]", self.kind, self.start_index, self.end_index)?;
        if let Some(columns) = &self.column_names {
            write!(f, " columns {:?}", columns)?;
        }
        Ok(())
    }
}
