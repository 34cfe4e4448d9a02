use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{event, info, Level};

use crate::aggregate::{merge_all, require_samples, Aggregator};
use crate::defs::{Batch, Framing, IngestOptions, RecordQueue, BATCH_SIZE, QUEUE_CAPACITY};
use crate::error::{Error, Result, Stage, Warning};
use crate::ingest::Decoder;
use crate::structs::{FoldedStacks, Report};

const READ_CHUNK: usize = 64 * 1024;

// parse `reader` into batches until EOF or a fatal error. `Done` is always
// pushed last so the consumer never waits forever.
async fn produce<R>(mut reader: R, opts: IngestOptions, queue: Arc<RecordQueue>) -> Result<(Vec<Warning>, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Decoder::new(opts);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    let result = loop {
        let n = match reader.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) => break Err(Error::io(Stage::Ingest, e)),
        };
        let fed = if n == 0 {
            decoder.finish(&mut batch)
        } else {
            decoder.feed(&chunk[..n], &mut batch)
        };
        if let Err(e) = fed {
            break Err(e);
        }
        if n == 0 || batch.len() >= BATCH_SIZE {
            if !batch.is_empty() {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(BATCH_SIZE));
                queue.push(Batch::Records(full)).await;
            }
            if n == 0 {
                break Ok(());
            }
        }
    };
    queue.push(Batch::Done).await;
    event!(
        Level::DEBUG,
        records = decoder.records_seen(),
        "producer finished"
    );
    result.map(|_| decoder.into_parts())
}

/// Aggregate a byte stream. Reading and parsing run in their own task and
/// hand batches to this one over a bounded queue.
pub async fn ingest_stream<R>(reader: R, opts: IngestOptions) -> Result<Report<FoldedStacks>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let queue = Arc::new(RecordQueue::new(QUEUE_CAPACITY));
    let producer = tokio::spawn(produce(reader, opts, queue.clone()));

    let mut agg = Aggregator::new();
    let mut failed = None;
    loop {
        match queue.pop().await {
            // after a failure keep draining so the producer can reach `Done`
            Batch::Records(_) if failed.is_some() => {}
            Batch::Records(records) => {
                if let Err(e) = records.into_iter().try_for_each(|record| agg.add(record)) {
                    failed = Some(e);
                }
            }
            Batch::Done => break,
        }
    }

    let (warnings, skipped) = producer
        .await
        .map_err(|e| Error::io(Stage::Ingest, std::io::Error::new(std::io::ErrorKind::Other, e)))??;
    if let Some(e) = failed {
        return Err(e);
    }
    Ok(Report {
        value: agg.finish(),
        warnings,
        skipped,
    })
}

/// Aggregate one file; `-` is stdin.
pub async fn ingest_path(path: &Path, opts: IngestOptions) -> Result<Report<FoldedStacks>> {
    let report = if path.as_os_str() == "-" {
        ingest_stream(tokio::io::stdin(), opts).await?
    } else {
        let file = File::open(path).await.map_err(|e| Error::io(Stage::Ingest, e))?;
        ingest_stream(file, opts).await?
    };
    info!(
        path = %path.display(),
        unique = report.value.len(),
        samples = report.value.total(),
        skipped = report.skipped,
        "ingested"
    );
    Ok(report)
}

/// Aggregate every input in parallel and merge the results. Fails with
/// `EmptyInput` only if no input produced a sample.
pub async fn ingest_paths(paths: &[PathBuf], opts: &IngestOptions) -> Result<Report<FoldedStacks>> {
    let reports: Vec<Result<Report<FoldedStacks>>> = stream::iter(paths)
        .map(|path| ingest_path(path, opts.clone()))
        .buffered(num_cpus::get().max(1))
        .collect()
        .await;

    let mut parts = Vec::with_capacity(reports.len());
    let mut warnings = Vec::new();
    let mut skipped = 0;
    for report in reports {
        let report = report?;
        warnings.extend(report.warnings);
        skipped += report.skipped;
        parts.push(report.value);
    }
    let merged = if parts.len() == 1 {
        parts.pop().unwrap_or_default()
    } else {
        merge_all(&parts)?
    };
    require_samples(
        Report {
            value: merged,
            warnings,
            skipped,
        },
        Stage::Ingest,
    )
}

/// Read folded stack files, merged.
pub async fn read_folded(paths: &[PathBuf]) -> Result<Report<FoldedStacks>> {
    let opts = IngestOptions {
        framing: Framing::Folded,
        ..Default::default()
    };
    ingest_paths(paths, &opts).await
}
