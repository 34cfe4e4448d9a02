use std::fmt;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stage a fatal error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Ingest,
    Aggregate,
    Tree,
    Layout,
    Render,
    Diff,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Ingest => "ingest",
            Stage::Aggregate => "aggregate",
            Stage::Tree => "tree",
            Stage::Layout => "layout",
            Stage::Render => "render",
            Stage::Diff => "diff",
        };
        f.write_str(s)
    }
}

/// One bad input record. Never aborts a run on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("malformed sample at record {record}: {reason}")]
pub struct MalformedSample {
    pub record: u64,
    pub reason: String,
}

impl MalformedSample {
    pub fn new(record: u64, reason: impl Into<String>) -> Self {
        MalformedSample {
            record,
            reason: reason.into(),
        }
    }
}

/// Non-fatal problems reported next to a successful result.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Warning {
    #[error(transparent)]
    Malformed(#[from] MalformedSample),
    #[error("record {record} has {depth} frames, truncated to {max}")]
    InconsistentDepth { record: u64, depth: usize, max: usize },
    #[error("{skipped} samples of other events skipped (kept `{kept}`)")]
    EventFiltered { kept: String, skipped: u64 },
    #[error("{hidden} frames narrower than the minimum width left out of the image")]
    RectsHidden { hidden: u64 },
    #[error("{pruned} unchanged paths pruned from the differential profile")]
    LossyDiff { pruned: u64 },
}

/// Fatal errors. Each one names the stage that failed.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{stage}: no valid samples ({skipped} records skipped)")]
    EmptyInput { stage: Stage, skipped: u64 },
    #[error("layout: widths under node {node} sum to {actual}, expected {expected}")]
    RoundingOverflow {
        node: usize,
        expected: u64,
        actual: u64,
    },
    #[error("{stage}: sample count overflow")]
    Overflow { stage: Stage },
    #[error("ingest: bad stream header: {0}")]
    BadHeader(String),
    #[error("{stage}: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },
    #[error("render: {0}")]
    Template(#[from] tera::Error),
    #[error("render: missing embedded asset `{0}`")]
    MissingAsset(&'static str),
}

impl Error {
    pub fn stage(&self) -> Stage {
        match self {
            Error::EmptyInput { stage, .. }
            | Error::Io { stage, .. }
            | Error::Overflow { stage } => *stage,
            Error::RoundingOverflow { .. } => Stage::Layout,
            Error::BadHeader(_) => Stage::Ingest,
            Error::Template(_) | Error::MissingAsset(_) => Stage::Render,
        }
    }

    pub fn io(stage: Stage, source: std::io::Error) -> Self {
        Error::Io { stage, source }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
