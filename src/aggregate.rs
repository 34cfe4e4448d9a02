use std::collections::HashMap;

use tracing::{event, Level};

use crate::error::{Error, Result, Stage};
use crate::ingest::Record;
use crate::structs::{FoldedStack, FoldedStacks, Report, StackSample};

/// Collapses identical stacks into counts. One per run; never shared.
#[derive(Debug, Default)]
pub struct Aggregator {
    counts: HashMap<Vec<String>, u64, ahash::RandomState>,
    samples: u64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, sample: StackSample) -> Result<()> {
        self.add_path(sample.frames, 1)
    }

    pub fn add_folded(&mut self, stack: FoldedStack) -> Result<()> {
        self.add_path(stack.frames, stack.count)
    }

    pub fn add(&mut self, record: Record) -> Result<()> {
        match record {
            Record::Sample(sample) => self.add_sample(sample),
            Record::Folded(stack) => self.add_folded(stack),
        }
    }

    // the run total bounds every per-path count, so checking it is enough
    fn bump_total(&mut self, count: u64) -> Result<()> {
        self.samples = self
            .samples
            .checked_add(count)
            .ok_or(Error::Overflow { stage: Stage::Aggregate })?;
        Ok(())
    }

    fn add_path(&mut self, frames: Vec<String>, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.bump_total(count)?;
        *self.counts.entry(frames).or_insert(0) += count;
        Ok(())
    }

    /// Fold in another aggregate.
    pub fn merge(&mut self, other: &FoldedStacks) -> Result<()> {
        for stack in other {
            self.bump_total(stack.count)?;
            match self.counts.get_mut(&stack.frames) {
                Some(count) => *count += stack.count,
                None => {
                    self.counts.insert(stack.frames.clone(), stack.count);
                }
            }
        }
        Ok(())
    }

    pub fn finish(self) -> FoldedStacks {
        event!(
            Level::DEBUG,
            unique = self.counts.len(),
            samples = self.samples,
            "aggregation finished"
        );
        FoldedStacks::from_unique(
            self.counts
                .into_iter()
                .map(|(frames, count)| FoldedStack { frames, count })
                .collect(),
        )
    }
}

/// Drain an ingestor completely. Per-record failures are already warnings
/// inside the ingestor; anything it yields as an error is fatal.
pub fn aggregate_records<I>(records: I) -> Result<FoldedStacks>
where
    I: IntoIterator<Item = Result<Record>>,
{
    let mut agg = Aggregator::new();
    for record in records {
        agg.add(record?)?;
    }
    Ok(agg.finish())
}

/// Turn an empty aggregate into `EmptyInput` attributed to `stage`.
pub fn require_samples(report: Report<FoldedStacks>, stage: Stage) -> Result<Report<FoldedStacks>> {
    if report.value.is_empty() {
        return Err(Error::EmptyInput {
            stage,
            skipped: report.skipped,
        });
    }
    Ok(report)
}

/// Merge independently built aggregates.
pub fn merge_all<'a, I>(parts: I) -> Result<FoldedStacks>
where
    I: IntoIterator<Item = &'a FoldedStacks>,
{
    let mut agg = Aggregator::new();
    for part in parts {
        agg.merge(part)?;
    }
    Ok(agg.finish())
}
