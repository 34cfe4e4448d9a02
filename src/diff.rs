use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::{event, Level};

use crate::defs::{DiffOptions, ZeroDeltaPolicy};
use crate::structs::{DeltaEntry, DeltaSet, FoldedStack, FoldedStacks};

fn scale(count: u64, from: u64, to: u64) -> u64 {
    if from == 0 || from == to {
        return count;
    }
    let scaled = (count as u128 * to as u128 + from as u128 / 2) / from as u128;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

fn signed_delta(before: u64, after: u64) -> i64 {
    (after as i128 - before as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

fn entry(frames: &[String], before: u64, after: u64) -> DeltaEntry {
    DeltaEntry {
        frames: frames.to_vec(),
        before,
        after,
        delta: signed_delta(before, after),
    }
}

/// Per-path `after - before` over the union of both inputs' paths, sorted
/// by path. A path missing on one side counts as zero there.
pub fn diff_stacks(before: &FoldedStacks, after: &FoldedStacks, opts: &DiffOptions) -> DeltaSet {
    let before_total = before.total();
    let after_total = after.total();
    let scaled = |s: &FoldedStack| {
        if opts.normalize {
            scale(s.count, before_total, after_total)
        } else {
            s.count
        }
    };

    // both sides are sorted by path, so a merge join visits the union once
    let mut entries = Vec::with_capacity(before.len().max(after.len()));
    let mut b = before.iter().peekable();
    let mut a = after.iter().peekable();
    loop {
        let order = match (b.peek(), a.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(x), Some(y)) => x.frames.cmp(&y.frames),
        };
        match order {
            Ordering::Less => {
                let Some(x) = b.next() else { break };
                entries.push(entry(&x.frames, scaled(x), 0));
            }
            Ordering::Greater => {
                let Some(y) = a.next() else { break };
                entries.push(entry(&y.frames, 0, y.count));
            }
            Ordering::Equal => {
                let (Some(x), Some(y)) = (b.next(), a.next()) else {
                    break;
                };
                entries.push(entry(&x.frames, scaled(x), y.count));
            }
        }
    }

    let mut pruned = 0;
    if opts.zero_delta == ZeroDeltaPolicy::Prune {
        let parents: HashSet<&[String], ahash::RandomState> = entries
            .iter()
            .filter_map(|e| e.frames.split_last().map(|(_, parent)| parent))
            .collect();
        let keep: Vec<bool> = entries
            .iter()
            .map(|e| e.delta != 0 || parents.contains(e.frames.as_slice()))
            .collect();
        let union = entries.len();
        let mut keep = keep.into_iter();
        entries.retain(|_| keep.next().unwrap_or(true));
        pruned = (union - entries.len()) as u64;
    }

    event!(
        Level::DEBUG,
        entries = entries.len(),
        pruned,
        before_total,
        after_total,
        "diff computed"
    );
    DeltaSet {
        entries,
        before_total: if opts.normalize { after_total } else { before_total },
        after_total,
        normalized: opts.normalize,
        lossy: pruned > 0,
        pruned,
    }
}
