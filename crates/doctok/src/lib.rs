//! # doctok
//!
//! Turns a project's raw textual records into tokenized binary blobs and
//! derives per-attribute token statistics from them.
//!
//! The entry point is [`Orchestrator`]. Bulk requests create a
//! [`TokenizationTask`] row, spawn a detached worker on the [`WorkerPool`] and
//! return immediately; the worker streams over the records in chunks, commits
//! each chunk, reports throttled progress through the [`ProgressBridge`], and
//! hands off to the statistics pass when it finishes. Single-record requests
//! run inline and register themselves in a [`PriorityRegistry`] so a running
//! bulk job skips the record instead of doing the work twice.
//!
//! Everything the orchestrator talks to is behind a trait:
//!
//! - [`Database`] / [`Session`] - records, attributes, blobs, statistics and
//!   task rows ([`MemoryDatabase`] is the bundled implementation)
//! - [`Tokenizer`] / [`TokenizerLoader`] - the tokenizer engine
//!   ([`RuleBasedTokenizer`] is the bundled engine)
//! - [`Broadcaster`] - live project events
//! - [`BlobSync`] - bulk export of non-text columns
//! - [`ConfigSource`] - the tokenizer allow-list

mod codec;
mod config;
mod error;
mod model;
mod notify;
mod orchestrator;
mod pipeline;
mod pool;
mod registry;
mod store;
mod task;
mod tokenizer;

pub use crate::codec::*;
pub use crate::config::*;
pub use crate::error::*;
pub use crate::model::*;
pub use crate::notify::*;
pub use crate::orchestrator::*;
pub use crate::pipeline::{PipelineOutcome, PipelineSettings, ProgressStrategy, StatisticsStart};
pub use crate::pool::*;
pub use crate::registry::*;
pub use crate::store::*;
pub use crate::tokenizer::*;
