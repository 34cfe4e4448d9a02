use pretty_assertions::assert_eq;
use proptest::prelude::*;

use stofold::aggregate::{merge_all, Aggregator};
use stofold::defs::{Framing, IngestOptions};
use stofold::layout::{layout, LayoutOptions};
use stofold::pipeline;
use stofold::structs::{FoldedStack, FoldedStacks, StackSample};
use stofold::tree::CallTree;
use stofold::unparse::{folded_to_string, StreamWriter};

// names a folded line has to escape: delimiter, backslash, brackets,
// comment marker, edge and line-breaking whitespace
fn arb_frame() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => "[a-d]{1,3}",
        1 => r"[a-b;\\()\[\]{}# \t\n\r\x{a0}é]{1,5}",
    ]
}

fn arb_path() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(arb_frame(), 0..5)
}

fn arb_stacks() -> impl Strategy<Value = Vec<(Vec<String>, u64)>> {
    prop::collection::vec((arb_path(), 1u64..1_000), 1..24)
}

fn aggregate_samples(samples: &[Vec<String>]) -> FoldedStacks {
    let mut agg = Aggregator::new();
    for frames in samples {
        agg.add_sample(StackSample::new(frames.clone())).unwrap();
    }
    agg.finish()
}

fn aggregate_folded(stacks: &[(Vec<String>, u64)]) -> FoldedStacks {
    let mut agg = Aggregator::new();
    for (frames, count) in stacks {
        agg.add_folded(FoldedStack {
            frames: frames.clone(),
            count: *count,
        })
        .unwrap();
    }
    agg.finish()
}

fn reread(text: &str) -> FoldedStacks {
    let opts = IngestOptions {
        framing: Framing::Folded,
        ..Default::default()
    };
    let report = pipeline::aggregate(text.as_bytes(), &opts).unwrap();
    assert_eq!(report.skipped, 0, "{:?}", report.warnings);
    report.value
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn aggregation_ignores_order_and_batching(
        samples in prop::collection::vec(arb_path(), 0..40),
        cut in 0usize..40,
        second_cut in 0usize..40,
    ) {
        let whole = aggregate_samples(&samples);

        let mut reversed = samples.clone();
        reversed.reverse();
        prop_assert_eq!(&aggregate_samples(&reversed), &whole);

        let cut = cut.min(samples.len());
        let second_cut = second_cut.clamp(cut, samples.len());
        let a = aggregate_samples(&samples[..cut]);
        let b = aggregate_samples(&samples[cut..second_cut]);
        let c = aggregate_samples(&samples[second_cut..]);
        let ab_c = merge_all([&merge_all([&a, &b]).unwrap(), &c]).unwrap();
        let a_bc = merge_all([&a, &merge_all([&b, &c]).unwrap()]).unwrap();
        let c_b_a = merge_all([&c, &b, &a]).unwrap();
        prop_assert_eq!(&ab_c, &whole);
        prop_assert_eq!(&a_bc, &whole);
        prop_assert_eq!(&c_b_a, &whole);
        prop_assert_eq!(whole.total(), samples.len() as u64);
    }

    #[test]
    fn folded_text_round_trips(stacks in arb_stacks()) {
        let folded = aggregate_folded(&stacks);
        let text = folded_to_string(&folded);
        prop_assert_eq!(text.lines().count(), folded.len());
        let back = reread(&text);
        prop_assert_eq!(&back, &folded);
        prop_assert_eq!(folded_to_string(&back), text);
    }

    #[test]
    fn binary_samples_round_trip_through_folded_text(
        samples in prop::collection::vec(arb_path(), 1..24),
    ) {
        let mut w = StreamWriter::new(Vec::new()).unwrap();
        for frames in &samples {
            // the stream is leaf-first
            w.write_record(frames.iter().rev()).unwrap();
        }
        let bytes = w.finish().unwrap();
        let opts = IngestOptions {
            framing: Framing::Binary,
            ..Default::default()
        };
        let ingested = pipeline::aggregate(&bytes, &opts).unwrap();
        prop_assert_eq!(ingested.skipped, 0);
        prop_assert_eq!(&ingested.value, &aggregate_samples(&samples));
        prop_assert_eq!(&reread(&folded_to_string(&ingested.value)), &ingested.value);
    }

    #[test]
    fn tree_counts_add_up(stacks in arb_stacks()) {
        let folded = aggregate_folded(&stacks);
        let tree = CallTree::from_folded(&folded).unwrap();
        prop_assert_eq!(tree.total(), folded.total());
        for (_, node) in tree.iter() {
            let children: u64 = node.children().map(|c| tree.node(c).total).sum();
            prop_assert_eq!(node.total, node.self_count + children);
        }
        for stack in &folded {
            let path: Vec<&str> = stack.frames.iter().map(String::as_str).collect();
            let id = tree.find(&path);
            prop_assert!(id.is_some());
            if let Some(id) = id {
                prop_assert_eq!(tree.node(id).self_count, stack.count);
            }
        }
    }

    #[test]
    fn layout_tiles_every_node_exactly(
        stacks in arb_stacks(),
        resolution in prop::option::of(1u64..5_000),
    ) {
        let tree = CallTree::from_folded(&aggregate_folded(&stacks)).unwrap();
        let opts = LayoutOptions {
            resolution,
            ..Default::default()
        };
        let geometry = layout(&tree, &opts).unwrap();
        prop_assert_eq!(geometry.width(), resolution.unwrap_or(tree.total()));
        prop_assert_eq!(geometry.rects().len(), tree.node_count());
        for rect in geometry.rects() {
            let mut x = rect.x;
            for child in tree.node(rect.node).children() {
                let c = geometry.rect(child).unwrap();
                prop_assert_eq!(c.x, x);
                prop_assert_eq!(c.depth, rect.depth + 1);
                x += c.width;
            }
            prop_assert_eq!(x + rect.self_width, rect.x + rect.width);
        }
    }
}
