use chrono::SecondsFormat;
use highway::{HighwayHash, HighwayHasher};
use rust_embed::RustEmbed;
use serde_derive::Serialize;
use tera::{Context, Tera};
use tracing::{event, Level};

use crate::defs::{Palette, RenderOptions, HASHER_SEED};
use crate::error::{Error, Result, Warning};
use crate::layout::{layout, Layout, LayoutOptions, LayoutRect};
use crate::resolve::NameResolver;
use crate::structs::{DeltaSet, Report};
use crate::tree::{CallTree, ROOT};

const TEMPLATE: &str = "flamegraph.svg";
const TEMPLATE_FILE: &str = "flamegraph.svg.tera";
const SCRIPT_FILE: &str = "flamegraph.js";

const XPAD: f64 = 10.0;
// approximate glyph width as a fraction of the font size
const FONT_WIDTH: f64 = 0.59;
const SEARCH_COLOR: &str = "rgb(230,0,230)";

#[derive(RustEmbed)]
#[folder = "assets/"]
struct Assets;

fn asset(name: &'static str) -> Result<String> {
    let file = Assets::get(name).ok_or(Error::MissingAsset(name))?;
    String::from_utf8(file.data.into_owned()).map_err(|_| Error::MissingAsset(name))
}

/// Differential metadata carried into the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub before_total: u64,
    pub after_total: u64,
    pub normalized: bool,
    pub lossy: bool,
    pub pruned: u64,
}

impl From<&DeltaSet> for DiffSummary {
    fn from(delta: &DeltaSet) -> Self {
        DiffSummary {
            before_total: delta.before_total,
            after_total: delta.after_total,
            normalized: delta.normalized,
            lossy: delta.lossy,
            pruned: delta.pruned,
        }
    }
}

#[derive(Serialize)]
struct FrameView {
    name: String,
    label: String,
    title: String,
    text: String,
    depth: u32,
    pct: String,
    count: u64,
    delta: Option<i64>,
    ux: u64,
    uw: u64,
    x: String,
    y: String,
    w: String,
    text_x: String,
    text_y: String,
    fill: String,
}

#[derive(Serialize)]
struct Metadata<'a> {
    generator: &'static str,
    generated_at: Option<String>,
    total: u64,
    resolution: u64,
    hidden: u64,
    count_name: &'a str,
    inverted: bool,
    diff: Option<DiffSummary>,
}

/// Hash a frame name into three stable fractions in `[0, 1]`.
fn name_hash(name: &str) -> (f64, f64, f64) {
    let mut hasher = HighwayHasher::new(HASHER_SEED);
    hasher.append(name.as_bytes());
    let h = hasher.finalize64();
    let part = |shift: u32| ((h >> shift) & 0xffff) as f64 / 65535.0;
    (part(0), part(16), part(32))
}

pub fn palette_color(palette: Palette, name: &str) -> String {
    let (v1, v2, v3) = name_hash(name);
    let (r, g, b) = match palette {
        Palette::Hot => (205.0 + 50.0 * v3, 230.0 * v1, 55.0 * v2),
        Palette::Mem => (0.0, 190.0 + 50.0 * v2, 210.0 * v1),
        Palette::Io => {
            let rg = 80.0 + 60.0 * v1;
            (rg, rg, 190.0 + 55.0 * v2)
        }
        Palette::Red => {
            let gb = 50.0 + 80.0 * v1;
            (200.0 + 55.0 * v1, gb, gb)
        }
        Palette::Green => {
            let rb = 50.0 + 60.0 * v1;
            (rb, 200.0 + 55.0 * v1, rb)
        }
        Palette::Blue => {
            let rg = 80.0 + 60.0 * v1;
            (rg, rg, 205.0 + 50.0 * v1)
        }
    };
    format!("rgb({},{},{})", r as u8, g as u8, b as u8)
}

/// Red for growth, blue for shrinkage, white for no change.
pub fn delta_color(delta: i64, max: u64) -> String {
    if delta == 0 || max == 0 {
        return "rgb(255,255,255)".to_string();
    }
    let ratio = (delta.unsigned_abs() as f64 / max as f64).min(1.0);
    let fade = (210.0 * (1.0 - ratio)).round() as u8;
    if delta > 0 {
        format!("rgb(255,{fade},{fade})")
    } else {
        format!("rgb({fade},{fade},255)")
    }
}

/// Fit `label` into `width` pixels, flamegraph.pl style.
fn fit_label(label: &str, width: f64, font_size: f64) -> String {
    let chars = (width / (font_size * FONT_WIDTH)) as usize;
    if chars < 3 {
        return String::new();
    }
    if label.chars().count() <= chars {
        return label.to_string();
    }
    let mut out: String = label.chars().take(chars - 2).collect();
    out.push_str("..");
    out
}

fn px(v: f64) -> String {
    format!("{v:.2}")
}

fn percent(count: u64, total: u64) -> String {
    format!("{:.2}", count as f64 * 100.0 / total as f64)
}

fn with_commas(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Pixels per fixed-point unit for a layout of `units` across the image.
fn scale(opts: &RenderOptions, units: u64) -> f64 {
    let drawable = (opts.width as f64 - 2.0 * XPAD).max(1.0);
    drawable / units.max(1) as f64
}

/// Layout options matching the render options for `tree`.
pub fn layout_options(tree: &CallTree, opts: &RenderOptions) -> LayoutOptions {
    let units = opts.resolution.filter(|r| *r > 0).unwrap_or(tree.total());
    let per_unit = scale(opts, units);
    let min_width = if opts.min_width > 0.0 {
        (opts.min_width / per_unit).ceil() as u64
    } else {
        0
    };
    LayoutOptions {
        resolution: opts.resolution,
        tolerance: opts.tolerance,
        min_width,
    }
}

pub struct Renderer<'a> {
    opts: &'a RenderOptions,
    resolver: &'a dyn NameResolver,
    tera: Tera,
    script: String,
}

impl<'a> Renderer<'a> {
    pub fn new(opts: &'a RenderOptions, resolver: &'a dyn NameResolver) -> Result<Self> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![".svg"]);
        tera.add_raw_template(TEMPLATE, &asset(TEMPLATE_FILE)?)?;
        Ok(Renderer {
            opts,
            resolver,
            tera,
            script: asset(SCRIPT_FILE)?,
        })
    }

    /// Lay out and draw a plain profile.
    pub fn render(&self, tree: &CallTree) -> Result<Report<Vec<u8>>> {
        let layout = layout(tree, &layout_options(tree, self.opts))?;
        self.draw(&layout, None)
    }

    /// Lay out and draw a differential profile built by
    /// [`CallTree::from_delta`].
    pub fn render_diff(&self, tree: &CallTree, summary: DiffSummary) -> Result<Report<Vec<u8>>> {
        let layout = layout(tree, &layout_options(tree, self.opts))?;
        let mut report = self.draw(&layout, Some(summary))?;
        if summary.lossy {
            report.warnings.push(Warning::LossyDiff {
                pruned: summary.pruned,
            });
        }
        Ok(report)
    }

    pub fn draw(&self, layout: &Layout<'_>, diff: Option<DiffSummary>) -> Result<Report<Vec<u8>>> {
        let opts = self.opts;
        let tree = layout.tree();
        let total = tree.total();
        let per_unit = scale(opts, layout.width());
        let fh = opts.frame_height as f64;
        let fs = opts.font_size;

        let title_y = fs * 2.0;
        let subtitle_y = title_y + fs * 1.5;
        let ypad1 = if opts.subtitle.is_some() {
            fs * 5.0
        } else {
            fs * 3.0
        };
        let ypad2 = fs * 2.0 + 10.0;
        let levels = layout.max_visible_depth() as f64 + 1.0;
        let height = ypad1 + ypad2 + levels * fh;

        let max_delta = tree
            .iter()
            .filter(|(id, _)| *id != ROOT)
            .map(|(_, n)| n.delta.unsigned_abs())
            .max()
            .unwrap_or(0);

        let frames: Vec<FrameView> = layout
            .visible()
            .map(|rect| self.frame_view(tree, rect, diff.is_some(), max_delta, per_unit, ypad1, height - ypad2))
            .collect();

        let metadata = Metadata {
            generator: concat!("stofold ", env!("CARGO_PKG_VERSION")),
            generated_at: opts
                .generated_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            total,
            resolution: layout.width(),
            hidden: layout.hidden(),
            count_name: &opts.count_name,
            inverted: opts.inverted,
            diff,
        };

        let mut context = Context::new();
        context.insert("width", &opts.width);
        context.insert("height", &px(height));
        context.insert("font_size", &opts.font_size);
        context.insert("frame_height", &opts.frame_height);
        context.insert("title", &opts.title);
        context.insert("title_x", &px(opts.width as f64 / 2.0));
        context.insert("title_y", &px(title_y));
        context.insert("subtitle", &opts.subtitle);
        context.insert("subtitle_y", &px(subtitle_y));
        context.insert("details_y", &px(height - ypad2 / 2.0));
        context.insert("xpad", &px(XPAD));
        context.insert("right_x", &px(opts.width as f64 - XPAD));
        context.insert("search_color", SEARCH_COLOR);
        context.insert("metadata", &metadata);
        context.insert("script", &self.script);
        context.insert("frames", &frames);
        context.insert("diff", &diff.is_some());

        let mut out = Vec::new();
        self.tera.render_to(TEMPLATE, &context, &mut out)?;

        event!(
            Level::DEBUG,
            frames = frames.len(),
            hidden = layout.hidden(),
            bytes = out.len(),
            "rendered svg"
        );
        let mut report = Report::new(out);
        if layout.hidden() > 0 {
            report.warnings.push(Warning::RectsHidden {
                hidden: layout.hidden(),
            });
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn frame_view(
        &self,
        tree: &CallTree,
        rect: &LayoutRect,
        diff: bool,
        max_delta: u64,
        per_unit: f64,
        top: f64,
        bottom: f64,
    ) -> FrameView {
        let opts = self.opts;
        let node = tree.node(rect.node);
        let fh = opts.frame_height as f64;
        let depth = rect.depth as f64;
        let y = if opts.inverted {
            top + depth * fh
        } else {
            bottom - (depth + 1.0) * fh
        };
        let x = XPAD + rect.x as f64 * per_unit;
        let w = rect.width as f64 * per_unit;

        let label = self.resolver.resolve(&node.name).into_owned();
        let pct = percent(node.total, tree.total());
        let mut title = format!(
            "{} ({} {}, {}%",
            label,
            with_commas(node.total),
            opts.count_name,
            pct
        );
        if diff {
            title.push_str(&format!("; {:+}", node.delta));
        }
        title.push(')');

        let fill = if diff {
            delta_color(node.delta, max_delta)
        } else {
            palette_color(opts.palette, &node.name)
        };

        FrameView {
            name: node.name.clone(),
            text: fit_label(&label, w, opts.font_size),
            label,
            title,
            depth: rect.depth,
            pct,
            count: node.total,
            delta: diff.then_some(node.delta),
            ux: rect.x,
            uw: rect.width,
            x: px(x),
            y: px(y),
            w: px(w),
            text_x: px(x + 3.0),
            text_y: px(y + fh / 2.0 + opts.font_size / 3.0),
            fill,
        }
    }
}
