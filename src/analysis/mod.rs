//! Analysis modules.
//!
//! `aggregator` holds the pure counting functions; `pipeline` drives the
//! store reads and folds their results into a snapshot.

pub mod aggregator;
pub mod pipeline;

pub use aggregator::*;
pub use pipeline::StatsPipeline;
