//! # scx: post-processing of single-cell clustering results
//!
//! Loads a 10x count matrix, filters cells, takes embeddings, clusters and marker
//! tables from an analysis backend, derives marker gene sets, optionally enriches
//! them and writes everything out for downstream viewers.

/// Gene symbol normalization and identifier lookups
pub mod annotation;

/// Analysis backend trait and the precomputed-results implementation
pub mod backend;

/// Run parameters
pub mod config;

/// CSV/TSV writers for run outputs
pub mod export;

/// Marker table loading and thresholding
pub mod markers;

/// Mapping summary metrics
pub mod metrics;

/// 10x matrix directory loading
pub mod mtx;

/// End-to-end analysis run
pub mod pipeline;

/// Cell and gene quality control
pub mod qc;

pub use config::AnalysisParams;
pub use pipeline::{run, AnalysisSnapshot, RunSummary};
