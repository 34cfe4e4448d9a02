use std::collections::BTreeSet;

use regex::Regex;

use stofold::aggregate::Aggregator;
use stofold::defs::{DiffOptions, RenderOptions};
use stofold::layout::layout;
use stofold::pipeline;
use stofold::render::layout_options;
use stofold::tree::CallTree;
use stofold::{FoldedStack, FoldedStacks};

fn folded(stacks: &[(&str, u64)]) -> FoldedStacks {
    let mut agg = Aggregator::new();
    for (path, count) in stacks {
        agg.add_folded(FoldedStack {
            frames: path.split(';').map(String::from).collect(),
            count: *count,
        })
        .unwrap();
    }
    agg.finish()
}

type Row = (String, u32, String, u64, u64, u64);

fn frames_in(svg: &str) -> BTreeSet<Row> {
    let re = Regex::new(
        r#"<g class="frame" data-name="([^"]*)" data-label="[^"]*" data-depth="(\d+)" data-pct="([\d.]+)" data-count="(\d+)" data-x="(\d+)" data-w="(\d+)""#,
    )
    .unwrap();
    re.captures_iter(svg)
        .map(|c| {
            (
                c[1].to_string(),
                c[2].parse().unwrap(),
                c[3].to_string(),
                c[4].parse().unwrap(),
                c[5].parse().unwrap(),
                c[6].parse().unwrap(),
            )
        })
        .collect()
}

fn expected(stacks: &FoldedStacks, opts: &RenderOptions) -> BTreeSet<Row> {
    let tree = CallTree::from_folded(stacks).unwrap();
    let geometry = layout(&tree, &layout_options(&tree, opts)).unwrap();
    geometry
        .visible()
        .map(|r| {
            let node = tree.node(r.node);
            (
                node.name.clone(),
                r.depth,
                format!("{:.2}", node.total as f64 * 100.0 / tree.total() as f64),
                node.total,
                r.x,
                r.width,
            )
        })
        .collect()
}

#[test]
fn every_rect_is_encoded() {
    let stacks = folded(&[
        ("main;foo;bar", 2),
        ("main;baz", 1),
        ("main;foo;qux;quux", 5),
        ("worker;poll;read", 11),
        ("worker;poll", 3),
        ("worker;poll;poll;poll", 4),
    ]);
    let opts = RenderOptions {
        resolution: Some(997),
        ..Default::default()
    };
    let svg = String::from_utf8(pipeline::render(&stacks, &opts).unwrap().value).unwrap();
    let drawn = frames_in(&svg);
    let want = expected(&stacks, &opts);
    assert_eq!(drawn.len(), CallTree::from_folded(&stacks).unwrap().node_count());
    assert_eq!(drawn, want);
}

#[test]
fn hidden_rects_are_counted_in_metadata() {
    let stacks = folded(&[("big", 1_000_000), ("tiny;tinier", 1)]);
    let opts = RenderOptions {
        min_width: 0.5,
        ..Default::default()
    };
    let report = pipeline::render(&stacks, &opts).unwrap();
    let svg = String::from_utf8(report.value).unwrap();
    assert_eq!(frames_in(&svg), expected(&stacks, &opts));
    assert!(svg.contains("&quot;hidden&quot;:2"));
    assert!(!report.warnings.is_empty());
}

#[test]
fn diff_frames_carry_deltas() {
    let before = folded(&[("a;b", 10)]);
    let after = folded(&[("a;b", 4), ("a;c", 6)]);
    let report = pipeline::diff(&before, &after, &DiffOptions::default(), &RenderOptions::default()).unwrap();
    let svg = String::from_utf8(report.value).unwrap();
    assert!(svg.contains(r#"data-name="b" data-label="b" data-depth="2""#));
    let delta = |name: &str| -> i64 {
        let re = Regex::new(&format!(r#"data-name="{name}"[^>]*data-delta="(-?\d+)""#)).unwrap();
        re.captures(&svg).unwrap()[1].parse().unwrap()
    };
    assert_eq!(delta("b"), -6);
    assert_eq!(delta("c"), 6);
    assert_eq!(delta("a"), 0);
    assert!(svg.contains("rgb(255,0,0)"));
    assert!(svg.contains("rgb(0,0,255)"));
}

#[test]
fn output_is_deterministic_without_a_timestamp() {
    let stacks = folded(&[("x;y", 3), ("x;z", 4)]);
    let opts = RenderOptions::default();
    let a = pipeline::render(&stacks, &opts).unwrap().value;
    let b = pipeline::render(&stacks, &opts).unwrap().value;
    assert_eq!(a, b);
}
