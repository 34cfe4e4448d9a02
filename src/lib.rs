pub mod aggregate;
pub mod defs;
pub mod diff;
pub mod error;
pub mod ingest;
pub mod layout;
pub mod parse;
pub mod pipeline;
pub mod read;
pub mod render;
pub mod resolve;
pub mod structs;
pub mod tree;
pub mod unparse;
pub mod write;

pub use error::{Error, MalformedSample, Result, Stage, Warning};
pub use structs::{DeltaEntry, DeltaSet, FoldedStack, FoldedStacks, Report, StackSample};
