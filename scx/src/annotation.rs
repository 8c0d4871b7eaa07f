//! Gene symbol lookups: display symbol -> stable id and display symbol -> cross-reference symbol.
//!
//! Display symbols are the names an expression object gives its rows: underscores are rewritten to
//! dashes, then repeats are made unique with `.1`, `.2`, ... suffixes. Marker tables coming back
//! from the analysis refer to genes by these names, so lookups only succeed if we apply the same
//! rewriting here.

use anyhow::{format_err, Context, Error};
use log::{info, warn};
use scx_types::{Feature, FeatureTypes, GENE_EXPRESSION};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::mtx::open_text;

/// Rewrite characters that the expression object reserves as delimiters.
pub fn normalize_delimiters(symbol: &str) -> String {
    symbol.replace('_', "-")
}

/// Make names unique: the first occurrence keeps its name, repeats get `.1`, `.2`, ...,
/// skipping any candidate that is already taken.
pub fn make_unique(names: &[String]) -> Vec<String> {
    let mut used = names.iter().cloned().collect::<HashSet<_>>();
    let mut seen = HashSet::with_capacity(names.len());
    let mut counters: HashMap<&str, usize> = HashMap::new();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        if seen.insert(name.as_str()) {
            out.push(name.clone());
            continue;
        }
        let cnt = counters.entry(name.as_str()).or_insert(0);
        let candidate = loop {
            *cnt += 1;
            let candidate = format!("{}.{}", name, cnt);
            if !used.contains(&candidate) {
                break candidate;
            }
        };
        used.insert(candidate.clone());
        out.push(candidate);
    }
    out
}

/// One expression feature after symbol rewriting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneAnnotation {
    pub raw_symbol: String,
    pub display_symbol: String,
    pub gene_id: String,
    /// None when the annotation table has no entry for `gene_id`
    pub xref_symbol: Option<String>,
}

/// Read an annotation table keyed by stable gene id. Tab-delimited unless the
/// file name ends in `.csv` (optionally `.csv.gz`). Empty and `NA` cells are missing.
pub fn load_xrefs(path: impl AsRef<Path>, id_column: &str, xref_column: &str) -> Result<HashMap<String, String>, Error> {
    let path = path.as_ref();
    let name = path.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default();
    let delimiter = if name.ends_with(".csv") || name.ends_with(".csv.gz") {
        b','
    } else {
        b'\t'
    };
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(open_text(path)?);
    let headers = rdr.headers().with_context(|| path.display().to_string())?.clone();
    let column = |col: &str| {
        headers
            .iter()
            .position(|h| h.trim() == col)
            .ok_or_else(|| format_err!("{}: no column named {}", path.display(), col))
    };
    let id_idx = column(id_column)?;
    let xref_idx = column(xref_column)?;

    let mut xrefs = HashMap::new();
    for record in rdr.records() {
        let record = record.with_context(|| path.display().to_string())?;
        let (Some(id), Some(xref)) = (record.get(id_idx), record.get(xref_idx)) else {
            continue;
        };
        let (id, xref) = (id.trim(), xref.trim());
        if id.is_empty() || xref.is_empty() || xref == "NA" {
            continue;
        }
        xrefs.entry(id.to_string()).or_insert_with(|| xref.to_string());
    }
    info!("loaded {} cross-references from {}", xrefs.len(), path.display());
    Ok(xrefs)
}

/// Immutable symbol lookups for the expression features of a dataset.
#[derive(Clone, Debug, Default)]
pub struct GeneAnnotationTable {
    genes: Vec<GeneAnnotation>,
    ids: HashMap<String, String>,
    xrefs: HashMap<String, Option<String>>,
}

impl GeneAnnotationTable {
    /// Build from a feature list, keeping `Gene Expression` rows only.
    pub fn build(features: &[Feature], feature_types: &FeatureTypes, xrefs: &HashMap<String, String>) -> Self {
        let rows = feature_types.get_indices(GENE_EXPRESSION).unwrap_or(&[]);
        let raw = rows.iter().map(|&r| &features[r]).collect::<Vec<_>>();
        let normalized = raw.iter().map(|f| normalize_delimiters(&f.name)).collect::<Vec<_>>();
        let display = make_unique(&normalized);

        let genes = raw
            .iter()
            .zip(display)
            .map(|(f, display_symbol)| GeneAnnotation {
                raw_symbol: f.name.clone(),
                display_symbol,
                gene_id: f.id.clone(),
                xref_symbol: xrefs.get(&f.id).cloned(),
            })
            .collect::<Vec<_>>();

        let missing = genes.iter().filter(|g| g.xref_symbol.is_none()).count();
        if !xrefs.is_empty() && missing > 0 {
            warn!("{} of {} genes have no cross-reference symbol", missing, genes.len());
        }

        let ids = genes
            .iter()
            .map(|g| (g.display_symbol.clone(), g.gene_id.clone()))
            .collect();
        let xrefs = genes
            .iter()
            .map(|g| (g.display_symbol.clone(), g.xref_symbol.clone()))
            .collect();
        GeneAnnotationTable { genes, ids, xrefs }
    }

    pub fn genes(&self) -> &[GeneAnnotation] {
        &self.genes
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    pub fn contains(&self, display_symbol: &str) -> bool {
        self.ids.contains_key(display_symbol)
    }

    /// Stable id of a display symbol; None for unknown symbols.
    pub fn gene_id(&self, display_symbol: &str) -> Option<&str> {
        self.ids.get(display_symbol).map(String::as_str)
    }

    /// Cross-reference symbol; None for unknown symbols or unannotated genes.
    pub fn xref(&self, display_symbol: &str) -> Option<&str> {
        self.xrefs.get(display_symbol).and_then(|x| x.as_deref())
    }

    /// Symbol to send to services keyed on the cross-reference namespace.
    pub fn query_symbol<'a>(&'a self, display_symbol: &'a str) -> &'a str {
        self.xref(display_symbol).unwrap_or(display_symbol)
    }

    /// Resolve a literature marker panel against the dataset's genes.
    pub fn resolve_panel(&self, panel: &BTreeMap<String, Vec<String>>) -> Vec<PanelEntry> {
        panel
            .iter()
            .flat_map(|(category, symbols)| {
                symbols.iter().map(move |symbol| {
                    let display = normalize_delimiters(symbol);
                    PanelEntry {
                        category: category.clone(),
                        symbol: symbol.clone(),
                        gene_id: self.gene_id(&display).map(str::to_string),
                        present: self.contains(&display),
                    }
                })
            })
            .collect()
    }
}

/// A literature marker and whether the dataset measures it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelEntry {
    pub category: String,
    pub symbol: String,
    pub gene_id: Option<String>,
    pub present: bool,
}
