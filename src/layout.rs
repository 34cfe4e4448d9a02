// widths are fixed-point units. each node's width is split by largest
// remainder between its name-ordered children and, last, its own samples.

use tracing::{event, Level};

use crate::error::{Error, Result, Stage};
use crate::tree::{CallTree, NodeId, ROOT};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayoutOptions {
    /// Units spanned by the root. `None` uses the total sample count.
    pub resolution: Option<u64>,
    /// Allowed difference between a width and the sum of its parts.
    pub tolerance: u64,
    /// Rects narrower than this are not drawn. Counts are unaffected.
    pub min_width: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutRect {
    pub node: NodeId,
    pub x: u64,
    pub width: u64,
    /// Part of `width` owned by samples that ended at this node.
    pub self_width: u64,
    pub depth: u32,
    pub visible: bool,
}

/// Positioned tree, rects in depth-first, name-ordered sequence.
#[derive(Debug, Clone)]
pub struct Layout<'t> {
    tree: &'t CallTree,
    rects: Vec<LayoutRect>,
    // rect position for each node id
    by_node: Vec<usize>,
    width: u64,
    hidden: u64,
}

impl<'t> Layout<'t> {
    pub fn tree(&self) -> &'t CallTree {
        self.tree
    }

    pub fn rects(&self) -> &[LayoutRect] {
        &self.rects
    }

    pub fn visible(&self) -> impl Iterator<Item = &LayoutRect> {
        self.rects.iter().filter(|r| r.visible)
    }

    /// Units spanned by the root.
    pub fn width(&self) -> u64 {
        self.width
    }

    pub fn hidden(&self) -> u64 {
        self.hidden
    }

    pub fn max_visible_depth(&self) -> u32 {
        self.visible().map(|r| r.depth).max().unwrap_or(0)
    }

    pub fn rect(&self, node: NodeId) -> Option<&LayoutRect> {
        self.rects.get(*self.by_node.get(node)?)
    }
}

/// Split `width` proportionally to `weights`, which must sum to `total`.
/// Returns `None` if they do not.
fn apportion(width: u64, weights: &[u64], total: u64) -> Option<Vec<u64>> {
    if total == 0 {
        return weights.iter().all(|w| *w == 0).then(|| vec![0; weights.len()]);
    }
    let mut shares = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    let mut assigned: u64 = 0;
    for (i, &w) in weights.iter().enumerate() {
        let scaled = width as u128 * w as u128;
        let share = u64::try_from(scaled / total as u128).ok()?;
        remainders.push((scaled % total as u128, i));
        shares.push(share);
        assigned = assigned.checked_add(share)?;
    }
    let mut left = width.checked_sub(assigned)?;
    if left as usize > weights.len() {
        return None;
    }
    // largest remainder first, earlier slot wins ties
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for &(rem, i) in &remainders {
        if left == 0 || rem == 0 {
            break;
        }
        shares[i] += 1;
        left -= 1;
    }
    Some(shares)
}

pub fn layout<'t>(tree: &'t CallTree, opts: &LayoutOptions) -> Result<Layout<'t>> {
    let total = tree.total();
    if total == 0 {
        return Err(Error::EmptyInput {
            stage: Stage::Layout,
            skipped: 0,
        });
    }
    let width = opts.resolution.filter(|r| *r > 0).unwrap_or(total);

    let mut rects = Vec::with_capacity(tree.node_count());
    let mut by_node = vec![usize::MAX; tree.node_count()];
    let mut hidden = 0;
    let mut weights = Vec::new();
    // (node, x, width, parent visible)
    let mut stack: Vec<(NodeId, u64, u64, bool)> = vec![(ROOT, 0, width, true)];
    while let Some((id, x, w, parent_visible)) = stack.pop() {
        let node = tree.node(id);
        weights.clear();
        weights.extend(node.children().map(|c| tree.node(c).total));
        weights.push(node.self_count);

        let shares = apportion(w, &weights, node.total).ok_or(Error::RoundingOverflow {
            node: id,
            expected: w,
            actual: 0,
        })?;
        let sum: u64 = shares.iter().sum();
        if sum.abs_diff(w) > opts.tolerance {
            return Err(Error::RoundingOverflow {
                node: id,
                expected: w,
                actual: sum,
            });
        }

        let visible = parent_visible && w > 0 && w >= opts.min_width;
        if !visible {
            hidden += 1;
        }
        by_node[id] = rects.len();
        rects.push(LayoutRect {
            node: id,
            x,
            width: w,
            self_width: shares[shares.len() - 1],
            depth: node.depth,
            visible,
        });

        let mut child_x = x;
        let mut placed = Vec::with_capacity(shares.len() - 1);
        for (child, share) in node.children().zip(&shares) {
            placed.push((child, child_x, *share, visible));
            child_x += share;
        }
        // reversed so the first name is popped first
        stack.extend(placed.into_iter().rev());
    }

    event!(
        Level::DEBUG,
        rects = rects.len(),
        hidden,
        width,
        "layout computed"
    );
    Ok(Layout {
        tree,
        rects,
        by_node,
        width,
        hidden,
    })
}
