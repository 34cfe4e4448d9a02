use serde_derive::{Deserialize, Serialize};

use crate::error::Warning;

/// One captured call stack, root-first. Weight is always 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackSample {
    pub frames: Vec<String>,
}

impl StackSample {
    pub fn new(frames: Vec<String>) -> Self {
        StackSample { frames }
    }
}

/// A unique root-first frame path and the number of samples that hit it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FoldedStack {
    pub frames: Vec<String>,
    pub count: u64,
}

/// The aggregate set of folded stacks. Sorted by frame path, no duplicates.
/// Only an `Aggregator` builds one, so its total always fits in a `u64`.
///
/// ```compile_fail
/// let _: stofold::structs::FoldedStacks = serde_json::from_str(r#"{"stacks":[]}"#).unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FoldedStacks {
    stacks: Vec<FoldedStack>,
}

impl FoldedStacks {
    /// Callers must hand over unique paths; `Aggregator::finish` does.
    pub(crate) fn from_unique(mut stacks: Vec<FoldedStack>) -> Self {
        stacks.sort_unstable_by(|a, b| a.frames.cmp(&b.frames));
        FoldedStacks { stacks }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FoldedStack> {
        self.stacks.iter()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Total sample count across all paths.
    pub fn total(&self) -> u64 {
        self.stacks.iter().map(|s| s.count).sum()
    }

    pub fn get(&self, frames: &[String]) -> Option<u64> {
        self.stacks
            .binary_search_by(|s| s.frames.as_slice().cmp(frames))
            .ok()
            .map(|i| self.stacks[i].count)
    }

}

impl<'a> IntoIterator for &'a FoldedStacks {
    type Item = &'a FoldedStack;
    type IntoIter = std::slice::Iter<'a, FoldedStack>;

    fn into_iter(self) -> Self::IntoIter {
        self.stacks.iter()
    }
}

/// Per-path change between two aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub frames: Vec<String>,
    pub before: u64,
    pub after: u64,
    pub delta: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSet {
    pub entries: Vec<DeltaEntry>,
    pub before_total: u64,
    pub after_total: u64,
    pub normalized: bool,
    /// Set when zero-delta paths were dropped.
    pub lossy: bool,
    pub pruned: u64,
}

impl DeltaSet {
    pub fn get(&self, frames: &[String]) -> Option<&DeltaEntry> {
        self.entries
            .binary_search_by(|e| e.frames.as_slice().cmp(frames))
            .ok()
            .map(|i| &self.entries[i])
    }
}

/// A stage's successful output plus everything it chose to skip.
#[derive(Debug, Clone, PartialEq)]
pub struct Report<T> {
    pub value: T,
    pub warnings: Vec<Warning>,
    pub skipped: u64,
}

impl<T> Report<T> {
    pub fn new(value: T) -> Self {
        Report {
            value,
            warnings: Vec::new(),
            skipped: 0,
        }
    }
}
