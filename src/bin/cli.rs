use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use tracing::{event, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;

use stofold::defs::{Cli, CollapseArgs, Command, DiffArgs, DrawArgs, IngestOptions, RenderArgs, RenderOptions};
use stofold::error::{Stage, Warning};
use stofold::pipeline;
use stofold::read::{ingest_paths, read_folded};
use stofold::structs::Report;
use stofold::unparse::{write_delta_folded, write_folded};
use stofold::write::write_artifact;

fn load_options<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("opening options file {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing options file {}", path.display()))
}

fn render_options(draw: &DrawArgs) -> Result<RenderOptions> {
    let mut opts = match &draw.options {
        Some(path) => load_options(path)?,
        None => RenderOptions::default(),
    };
    draw.apply(&mut opts);
    Ok(opts)
}

fn level_filter(verbose: u8) -> LevelFilter {
    match verbose {
        0 => std::env::var("STOFOLD_LOG")
            .ok()
            .and_then(|s| LevelFilter::from_str(&s).ok())
            .unwrap_or(LevelFilter::WARN),
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn report_warnings<T>(report: &Report<T>) {
    for warning in &report.warnings {
        match warning {
            // one line per bad record only when asked for
            Warning::Malformed(m) => event!(Level::DEBUG, "{m}"),
            w => event!(Level::WARN, "{w}"),
        }
    }
    if report.skipped > 0 {
        event!(Level::WARN, skipped = report.skipped, "malformed records skipped");
    }
}

async fn collapse(args: CollapseArgs) -> Result<()> {
    let mut opts = match &args.options {
        Some(path) => load_options(path)?,
        None => IngestOptions::default(),
    };
    args.ingest.apply(&mut opts);
    let report = ingest_paths(&args.inputs, &opts).await?;
    report_warnings(&report);

    let mut out = Vec::new();
    write_folded(&report.value, &mut out)?;
    write_artifact(args.output.as_deref(), &out, Stage::Aggregate).await?;
    Ok(())
}

async fn render(args: RenderArgs) -> Result<()> {
    let opts = render_options(&args.draw)?;
    let folded = read_folded(&args.inputs).await?;
    report_warnings(&folded);
    let svg = pipeline::render(&folded.value, &opts)?;
    report_warnings(&svg);
    write_artifact(args.output.as_deref(), &svg.value, Stage::Render).await?;
    Ok(())
}

async fn diff(args: DiffArgs) -> Result<()> {
    let before_path = [args.before.clone()];
    let after_path = [args.after.clone()];
    let (before, after) = tokio::try_join!(
        read_folded(&before_path),
        read_folded(&after_path)
    )?;
    report_warnings(&before);
    report_warnings(&after);

    let diff_opts = args.diff_options();
    let delta = pipeline::diff_stacks(&before.value, &after.value, &diff_opts)?;
    let out = if args.folded {
        if delta.lossy {
            event!(Level::WARN, pruned = delta.pruned, "unchanged paths pruned");
        }
        let mut out = Vec::new();
        write_delta_folded(&delta, &mut out)?;
        out
    } else {
        let opts = render_options(&args.draw)?;
        let svg = pipeline::render_delta(&delta, &diff_opts, &opts)?;
        report_warnings(&svg);
        svg.value
    };
    write_artifact(args.output.as_deref(), &out, Stage::Diff).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_level(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_filter(level_filter(cli.verbose)),
        )
        .init();

    let result = match cli.command {
        Command::Collapse(args) => collapse(args).await,
        Command::Render(args) => render(args).await,
        Command::Diff(args) => diff(args).await,
    };
    if let Err(e) = &result {
        event!(Level::ERROR, "{e:#}");
    }
    result
}
