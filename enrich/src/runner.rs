use anyhow::{Context, Error};
use log::{info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::retry::RetryPolicy;
use crate::service::{EnrichmentService, EnrichmentTerm};

/// Gene sets smaller than this are never sent to the service.
pub const MIN_GENE_SET_SIZE: usize = 3;

/// A named gene list, already translated to the service's symbol namespace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneSetQuery {
    pub name: String,
    pub genes: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct EnrichmentOptions {
    pub databases: Vec<String>,
    /// Smallest set that is queried; never below [MIN_GENE_SET_SIZE]
    pub min_genes: usize,
    /// Upper bound on gene sets being queried at once
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for EnrichmentOptions {
    fn default() -> Self {
        EnrichmentOptions {
            databases: Vec::new(),
            min_genes: MIN_GENE_SET_SIZE,
            max_in_flight: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Terms per library for one gene set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneSetEnrichment {
    pub name: String,
    pub num_genes: usize,
    pub databases: BTreeMap<String, Vec<EnrichmentTerm>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkippedGeneSet {
    pub name: String,
    pub num_genes: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedGeneSet {
    pub name: String,
    pub error: String,
}

/// Outcome of enriching a batch of gene sets. Each input set lands in exactly one list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentReport {
    pub results: Vec<GeneSetEnrichment>,
    pub skipped: Vec<SkippedGeneSet>,
    pub failed: Vec<FailedGeneSet>,
}

enum Outcome {
    Done(GeneSetEnrichment),
    Skipped(SkippedGeneSet),
    Failed(FailedGeneSet),
}

fn enrich_one<S: EnrichmentService>(service: &S, set: &GeneSetQuery, opts: &EnrichmentOptions) -> Outcome {
    let min_genes = opts.min_genes.max(MIN_GENE_SET_SIZE);
    if set.genes.len() < min_genes {
        info!(
            "skipping enrichment of {}: {} gene(s), need at least {}",
            set.name,
            set.genes.len(),
            min_genes
        );
        return Outcome::Skipped(SkippedGeneSet {
            name: set.name.clone(),
            num_genes: set.genes.len(),
        });
    }

    let query = || -> Result<GeneSetEnrichment, Error> {
        let list_id = opts
            .retry
            .run(&format!("upload of {}", set.name), || service.add_list(&set.genes, &set.name))?;
        let mut databases = BTreeMap::new();
        for db in &opts.databases {
            let terms = opts
                .retry
                .run(&format!("enrichment of {} against {}", set.name, db), || {
                    service.enrich(list_id, db)
                })?;
            databases.insert(db.clone(), terms);
        }
        Ok(GeneSetEnrichment {
            name: set.name.clone(),
            num_genes: set.genes.len(),
            databases,
        })
    };

    match query() {
        Ok(res) => {
            info!("enriched {} ({} genes)", set.name, set.genes.len());
            Outcome::Done(res)
        }
        Err(e) => {
            warn!("giving up on {}: {:#}", set.name, e);
            Outcome::Failed(FailedGeneSet {
                name: set.name.clone(),
                error: format!("{:#}", e),
            })
        }
    }
}

/// Enrich every gene set against every configured library, at most
/// `opts.max_in_flight` sets at a time. Failures are isolated per set; only a
/// failure to set up the worker pool is returned as an error.
pub fn run_enrichment<S: EnrichmentService>(
    service: &S,
    sets: &[GeneSetQuery],
    opts: &EnrichmentOptions,
) -> Result<EnrichmentReport, Error> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(opts.max_in_flight.max(1))
        .build()
        .context("could not build enrichment worker pool")?;

    let outcomes: Vec<Outcome> = pool.install(|| sets.par_iter().map(|set| enrich_one(service, set, opts)).collect());

    let mut report = EnrichmentReport::default();
    for outcome in outcomes {
        match outcome {
            Outcome::Done(r) => report.results.push(r),
            Outcome::Skipped(s) => report.skipped.push(s),
            Outcome::Failed(f) => report.failed.push(f),
        }
    }
    info!(
        "enrichment: {} queried, {} skipped, {} failed",
        report.results.len(),
        report.skipped.len(),
        report.failed.len()
    );
    Ok(report)
}
