use crate::aggregate::{aggregate_records, require_samples};
use crate::defs::{DiffOptions, IngestOptions, RenderOptions};
use crate::diff;
use crate::error::{Error, Result, Stage};
use crate::ingest::Ingestor;
use crate::render::{DiffSummary, Renderer};
use crate::resolve::{DemanglingResolver, IdentityResolver, NameResolver};
use crate::structs::{DeltaSet, FoldedStacks, Report};
use crate::tree::CallTree;

/// Raw sampler output to folded stacks.
pub fn aggregate(raw: &[u8], opts: &IngestOptions) -> Result<Report<FoldedStacks>> {
    let mut ingestor = Ingestor::new(raw, opts.clone());
    let folded = aggregate_records(ingestor.by_ref())?;
    require_samples(ingestor.into_report(folded), Stage::Ingest)
}

fn default_resolver(opts: &RenderOptions) -> Box<dyn NameResolver> {
    if opts.demangle {
        return Box::new(DemanglingResolver::default());
    }
    Box::new(IdentityResolver)
}

pub fn render(folded: &FoldedStacks, opts: &RenderOptions) -> Result<Report<Vec<u8>>> {
    render_with(folded, opts, default_resolver(opts).as_ref())
}

/// [`render`] with a caller-supplied name resolver.
pub fn render_with(
    folded: &FoldedStacks,
    opts: &RenderOptions,
    resolver: &dyn NameResolver,
) -> Result<Report<Vec<u8>>> {
    let tree = CallTree::from_folded(folded)?;
    Renderer::new(opts, resolver)?.render(&tree)
}

/// Per-path deltas without drawing them.
pub fn diff_stacks(before: &FoldedStacks, after: &FoldedStacks, opts: &DiffOptions) -> Result<DeltaSet> {
    if before.is_empty() && after.is_empty() {
        return Err(Error::EmptyInput {
            stage: Stage::Diff,
            skipped: 0,
        });
    }
    Ok(diff::diff_stacks(before, after, opts))
}

/// Differential flame graph of `before` against `after`.
pub fn diff(
    before: &FoldedStacks,
    after: &FoldedStacks,
    opts: &DiffOptions,
    render_opts: &RenderOptions,
) -> Result<Report<Vec<u8>>> {
    let delta = diff_stacks(before, after, opts)?;
    render_delta(&delta, opts, render_opts)
}

/// Draw an already computed delta set.
pub fn render_delta(delta: &DeltaSet, opts: &DiffOptions, render_opts: &RenderOptions) -> Result<Report<Vec<u8>>> {
    let tree = CallTree::from_delta(delta, opts.shape).map_err(|e| match e {
        Error::EmptyInput { skipped, .. } => Error::EmptyInput {
            stage: Stage::Diff,
            skipped,
        },
        e => e,
    })?;
    let resolver = default_resolver(render_opts);
    Renderer::new(render_opts, resolver.as_ref())?.render_diff(&tree, DiffSummary::from(delta))
}
