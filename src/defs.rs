use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use highway::Key;
use serde_derive::{Deserialize, Serialize};

use crate::ingest::Record;

pub const ROOT_NAME: &str = "all";
pub const DEFAULT_DELIMITER: char = ';';
pub const DEFAULT_MAX_DEPTH: usize = 1 << 20;

// producer -> aggregator queue for streamed input
pub const QUEUE_CAPACITY: usize = 64;
pub const BATCH_SIZE: usize = 1024;

pub const STREAM_MAGIC: &[u8; 8] = b"STOFOLD\0";
pub const STREAM_VERSION: u32 = 1;

pub const HASHER_SEED: Key = Key([1, 2, 3, 4]);

pub enum Batch {
    Records(Vec<Record>),
    Done,
}

pub type RecordQueue = deadqueue::limited::Queue<Batch>;

#[derive(ValueEnum, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// One stack per line, frames separated by the delimiter.
    #[default]
    Lines,
    /// Already folded `frames count` lines.
    Folded,
    /// Length-prefixed binary record stream.
    Binary,
    /// `perf script` text output.
    Perf,
}

#[derive(ValueEnum, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FrameOrder {
    #[default]
    LeafFirst,
    RootFirst,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PerfOptions {
    pub include_comm: bool,
    pub include_pid: bool,
    pub include_tid: bool,
    pub annotate_kernel: bool,
    pub strip_offsets: bool,
    /// Only keep samples of this event. `None` keeps the first event seen.
    pub event_filter: Option<String>,
}

impl Default for PerfOptions {
    fn default() -> Self {
        PerfOptions {
            include_comm: true,
            include_pid: false,
            include_tid: false,
            annotate_kernel: false,
            strip_offsets: true,
            event_filter: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct IngestOptions {
    pub framing: Framing,
    pub order: FrameOrder,
    pub delimiter: char,
    pub max_depth: usize,
    pub perf: PerfOptions,
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptions {
            framing: Framing::default(),
            order: FrameOrder::default(),
            delimiter: DEFAULT_DELIMITER,
            max_depth: DEFAULT_MAX_DEPTH,
            perf: PerfOptions::default(),
        }
    }
}

#[derive(ValueEnum, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Palette {
    #[default]
    Hot,
    Mem,
    Io,
    Red,
    Green,
    Blue,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RenderOptions {
    pub title: String,
    pub subtitle: Option<String>,
    /// Image width in pixels.
    pub width: u32,
    pub frame_height: u32,
    pub font_size: f64,
    pub count_name: String,
    pub palette: Palette,
    /// Icicle graph: root at the top.
    pub inverted: bool,
    /// Rects narrower than this many pixels are left out of the image.
    pub min_width: f64,
    /// Fixed-point units spanned by the root. `None` uses the total count.
    pub resolution: Option<u64>,
    pub tolerance: u64,
    pub demangle: bool,
    pub generated_at: Option<DateTime<Utc>>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            title: "Flame Graph".into(),
            subtitle: None,
            width: 1200,
            frame_height: 16,
            font_size: 12.0,
            count_name: "samples".into(),
            palette: Palette::default(),
            inverted: false,
            min_width: 0.0,
            resolution: None,
            tolerance: 0,
            demangle: false,
            generated_at: None,
        }
    }
}

#[derive(ValueEnum, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ZeroDeltaPolicy {
    #[default]
    Keep,
    Prune,
}

/// Which side's counts size the rects of a differential graph.
#[derive(ValueEnum, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DiffShape {
    #[default]
    Max,
    After,
    Before,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DiffOptions {
    /// Scale the before counts to the after total first.
    pub normalize: bool,
    pub zero_delta: ZeroDeltaPolicy,
    pub shape: DiffShape,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Fold sampled stacks and draw flame graphs")]
pub struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Collapse raw stacks into folded stacks.
    Collapse(CollapseArgs),
    /// Draw a flame graph from folded stacks.
    Render(RenderArgs),
    /// Compare two folded files.
    Diff(DiffArgs),
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    #[arg(value_enum, short, long, env = "STOFOLD_FRAMING")]
    pub framing: Option<Framing>,
    #[arg(value_enum, long)]
    pub order: Option<FrameOrder>,
    #[arg(short, long)]
    pub delimiter: Option<char>,
    #[arg(long, env = "STOFOLD_MAX_DEPTH")]
    pub max_depth: Option<usize>,
    #[arg(long, help = "perf: keep only this event")]
    pub event: Option<String>,
    #[arg(long, help = "perf: do not use the command name as root frame")]
    pub no_comm: bool,
    #[arg(long, help = "perf: append pid to the command name")]
    pub pid: bool,
    #[arg(long, help = "perf: append tid to the command name")]
    pub tid: bool,
    #[arg(long, help = "perf: mark kernel frames with _[k]")]
    pub kernel: bool,
}

impl IngestArgs {
    pub fn apply(&self, opts: &mut IngestOptions) {
        if let Some(framing) = self.framing {
            opts.framing = framing;
        }
        if let Some(order) = self.order {
            opts.order = order;
        }
        if let Some(delimiter) = self.delimiter {
            opts.delimiter = delimiter;
        }
        if let Some(max_depth) = self.max_depth {
            opts.max_depth = max_depth;
        }
        if self.event.is_some() {
            opts.perf.event_filter = self.event.clone();
        }
        opts.perf.include_comm &= !self.no_comm;
        opts.perf.include_pid |= self.pid;
        opts.perf.include_tid |= self.tid;
        opts.perf.annotate_kernel |= self.kernel;
    }
}

#[derive(Args, Debug, Clone)]
pub struct DrawArgs {
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub subtitle: Option<String>,
    #[arg(short, long, env = "STOFOLD_WIDTH")]
    pub width: Option<u32>,
    #[arg(long)]
    pub frame_height: Option<u32>,
    #[arg(long)]
    pub font_size: Option<f64>,
    #[arg(long)]
    pub count_name: Option<String>,
    #[arg(value_enum, long, env = "STOFOLD_PALETTE")]
    pub palette: Option<Palette>,
    #[arg(long)]
    pub inverted: bool,
    #[arg(long, help = "omit rects narrower than this many pixels")]
    pub min_width: Option<f64>,
    #[arg(long)]
    pub resolution: Option<u64>,
    #[arg(long)]
    pub demangle: bool,
    #[arg(long, help = "leave the generation time out of the image")]
    pub no_timestamp: bool,
    #[arg(long, help = "JSON file with render options")]
    pub options: Option<PathBuf>,
}

impl DrawArgs {
    pub fn apply(&self, opts: &mut RenderOptions) {
        if let Some(title) = &self.title {
            opts.title = title.clone();
        }
        if self.subtitle.is_some() {
            opts.subtitle = self.subtitle.clone();
        }
        if let Some(width) = self.width {
            opts.width = width;
        }
        if let Some(frame_height) = self.frame_height {
            opts.frame_height = frame_height;
        }
        if let Some(font_size) = self.font_size {
            opts.font_size = font_size;
        }
        if let Some(count_name) = &self.count_name {
            opts.count_name = count_name.clone();
        }
        if let Some(palette) = self.palette {
            opts.palette = palette;
        }
        if let Some(min_width) = self.min_width {
            opts.min_width = min_width;
        }
        if self.resolution.is_some() {
            opts.resolution = self.resolution;
        }
        opts.inverted |= self.inverted;
        opts.demangle |= self.demangle;
        opts.generated_at = if self.no_timestamp {
            None
        } else {
            Some(Utc::now())
        };
    }
}

#[derive(Args, Debug, Clone)]
pub struct CollapseArgs {
    #[arg(required = true, help = "raw sample files; `-` reads stdin")]
    pub inputs: Vec<PathBuf>,
    #[arg(short, long, help = "defaults to stdout")]
    pub output: Option<PathBuf>,
    #[command(flatten)]
    pub ingest: IngestArgs,
    #[arg(long, help = "JSON file with ingest options")]
    pub options: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    #[arg(required = true, help = "folded stack files, merged before drawing")]
    pub inputs: Vec<PathBuf>,
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    #[command(flatten)]
    pub draw: DrawArgs,
}

#[derive(Args, Debug, Clone)]
pub struct DiffArgs {
    pub before: PathBuf,
    pub after: PathBuf,
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    #[arg(short, long)]
    pub normalize: bool,
    #[arg(value_enum, long, default_value_t = ZeroDeltaPolicy::Keep)]
    pub zero_delta: ZeroDeltaPolicy,
    #[arg(value_enum, long, default_value_t = DiffShape::Max)]
    pub shape: DiffShape,
    #[arg(long, help = "write `frames before after` text instead of an image")]
    pub folded: bool,
    #[command(flatten)]
    pub draw: DrawArgs,
}

impl DiffArgs {
    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            normalize: self.normalize,
            zero_delta: self.zero_delta,
            shape: self.shape,
        }
    }
}
