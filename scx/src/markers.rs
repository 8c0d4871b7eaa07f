//! Per-cluster marker filtering.

use anyhow::{Context, Error};
use enrich::GeneSetQuery;
use itertools::Itertools;
use log::info;
use scx_types::{ClusterLabel, MarkerRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::annotation::GeneAnnotationTable;
use crate::mtx::open_text;

/// Read a one-vs-rest marker table (CSV with a header).
pub fn load_markers(path: impl AsRef<Path>) -> Result<Vec<MarkerRecord>, Error> {
    let path = path.as_ref();
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(open_text(path)?);
    let records = rdr
        .deserialize()
        .enumerate()
        .map(|(i, r)| r.with_context(|| format!("{}: row {}", path.display(), i + 1)))
        .collect::<Result<Vec<MarkerRecord>, Error>>()?;
    info!("loaded {} marker rows from {}", records.len(), path.display());
    Ok(records)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerThresholds {
    /// Rows need `padj < padj`
    pub padj: f64,
    /// Rows need `|log2fc| >= log2fc` to count as up or down
    pub log2fc: f64,
}

impl MarkerThresholds {
    fn significant(&self, r: &MarkerRecord) -> bool {
        r.padj < self.padj && !r.log2fc.is_nan()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// Up/down marker counts of one cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCounts {
    pub cluster: ClusterLabel,
    pub up: usize,
    pub down: usize,
}

/// Significant markers split by direction. Built once by [filter_markers] and read-only afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilteredMarkerSet {
    thresholds: MarkerThresholds,
    /// Every known cluster label plus those seen in the input, sorted
    clusters: Vec<ClusterLabel>,
    significant: Vec<MarkerRecord>,
    up: BTreeMap<ClusterLabel, Vec<MarkerRecord>>,
    down: BTreeMap<ClusterLabel, Vec<MarkerRecord>>,
}

/// Split `records` into significance-filtered, up and down views. Clusters in `known` are
/// kept even when the marker table has no rows for them.
pub fn filter_markers(
    records: &[MarkerRecord],
    known: &[ClusterLabel],
    thresholds: MarkerThresholds,
) -> FilteredMarkerSet {
    let clusters = known
        .iter()
        .chain(records.iter().map(|r| &r.cluster))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();

    let significant = records
        .iter()
        .filter(|r| thresholds.significant(r))
        .cloned()
        .collect::<Vec<_>>();

    let mut up: BTreeMap<ClusterLabel, Vec<MarkerRecord>> = BTreeMap::new();
    let mut down: BTreeMap<ClusterLabel, Vec<MarkerRecord>> = BTreeMap::new();
    for r in &significant {
        if r.log2fc >= thresholds.log2fc {
            up.entry(r.cluster.clone()).or_default().push(r.clone());
        } else if r.log2fc <= -thresholds.log2fc {
            down.entry(r.cluster.clone()).or_default().push(r.clone());
        }
    }

    let set = FilteredMarkerSet {
        thresholds,
        clusters,
        significant,
        up,
        down,
    };
    info!(
        "{} of {} marker rows significant across {} clusters ({} up, {} down)",
        set.significant.len(),
        records.len(),
        set.clusters.len(),
        set.up.values().map(Vec::len).sum::<usize>(),
        set.down.values().map(Vec::len).sum::<usize>()
    );
    set
}

impl FilteredMarkerSet {
    pub fn thresholds(&self) -> MarkerThresholds {
        self.thresholds
    }

    pub fn clusters(&self) -> &[ClusterLabel] {
        &self.clusters
    }

    pub fn significant(&self) -> &[MarkerRecord] {
        &self.significant
    }

    /// Significant rows of one cluster, in input order
    pub fn significant_in(&self, cluster: &ClusterLabel) -> impl Iterator<Item = &MarkerRecord> + '_ {
        let cluster = cluster.clone();
        self.significant.iter().filter(move |r| r.cluster == cluster)
    }

    pub fn get(&self, cluster: &ClusterLabel, direction: Direction) -> &[MarkerRecord] {
        let map = match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        };
        map.get(cluster).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn up(&self, cluster: &ClusterLabel) -> &[MarkerRecord] {
        self.get(cluster, Direction::Up)
    }

    pub fn down(&self, cluster: &ClusterLabel) -> &[MarkerRecord] {
        self.get(cluster, Direction::Down)
    }

    /// One row per input cluster, zero counts included, in cluster order.
    pub fn direction_counts(&self) -> Vec<ClusterCounts> {
        self.clusters
            .iter()
            .map(|c| ClusterCounts {
                cluster: c.clone(),
                up: self.up(c).len(),
                down: self.down(c).len(),
            })
            .collect()
    }

    /// `cluster_<label>_<direction>` gene sets of display symbols, deduplicated, in cluster order.
    pub fn gene_sets(&self) -> Vec<GeneSet> {
        self.clusters
            .iter()
            .flat_map(|c| [Direction::Up, Direction::Down].map(|d| (c, d)))
            .map(|(c, d)| GeneSet {
                name: format!("cluster_{}_{}", c, d.as_str()),
                genes: self.get(c, d).iter().map(|r| r.gene.clone()).unique().collect(),
            })
            .collect()
    }
}

/// A named list of display symbols.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneSet {
    pub name: String,
    pub genes: Vec<String>,
}

impl GeneSet {
    /// Named sets from a configuration lookup (e.g. cell-cycle phases).
    pub fn from_lookup(lookup: &BTreeMap<String, Vec<String>>) -> Vec<GeneSet> {
        lookup
            .iter()
            .map(|(name, genes)| GeneSet {
                name: name.clone(),
                genes: genes.iter().unique().cloned().collect(),
            })
            .collect()
    }

    /// Translate to the enrichment service's namespace.
    pub fn to_query(&self, annotation: &GeneAnnotationTable) -> GeneSetQuery {
        GeneSetQuery {
            name: self.name.clone(),
            genes: self
                .genes
                .iter()
                .map(|g| annotation.query_symbol(g).to_string())
                .unique()
                .collect(),
        }
    }
}
