//! # enrich: gene-set enrichment queries against Enrichr-style web services

/// Blocking HTTP client for the Enrichr API
pub mod client;

/// Retry with exponential backoff
pub mod retry;

/// Bounded-concurrency enrichment of many gene sets
pub mod runner;

/// Service abstraction and result types
pub mod service;

pub use client::EnrichrClient;
pub use retry::RetryPolicy;
pub use runner::{run_enrichment, EnrichmentOptions, EnrichmentReport, GeneSetQuery, MIN_GENE_SET_SIZE};
pub use service::{EnrichmentService, EnrichmentTerm, TransientError};
