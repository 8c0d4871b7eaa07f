//! Capability boundary for the analysis steps we do not implement: normalization,
//! PCA/UMAP, graph clustering, cell-cycle scoring and the differential expression test.

use anyhow::{bail, format_err, Context, Error};
use log::{debug, info};
use ndarray::Array2;
use scx_types::{ClusterLabel, FeatureBarcodeMatrix, MarkerRecord};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::export::ensure_barcode_suffix;
use crate::markers::load_markers;
use crate::mtx::open_text;

/// Knobs forwarded to whatever produces the embedding and clustering.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendSettings {
    pub num_pcs: usize,
    pub resolution: f64,
}

/// Per-cell results, one entry per matrix barcode in matrix order.
#[derive(Clone, Debug, PartialEq)]
pub struct CellAnalysis {
    pub barcodes: Vec<String>,
    /// cells x 2
    pub embedding: Array2<f64>,
    pub clusters: Vec<ClusterLabel>,
    pub phases: Option<Vec<String>>,
}

impl CellAnalysis {
    pub fn num_cells(&self) -> usize {
        self.barcodes.len()
    }

    /// Cells per cluster label, sorted by label
    pub fn cluster_sizes(&self) -> Vec<(ClusterLabel, usize)> {
        let mut sizes = std::collections::BTreeMap::new();
        for c in &self.clusters {
            *sizes.entry(c.clone()).or_insert(0) += 1;
        }
        sizes.into_iter().collect()
    }
}

pub trait AnalysisBackend {
    /// Embed and cluster the cells of `matrix`.
    fn analyze(&self, matrix: &FeatureBarcodeMatrix, settings: &BackendSettings) -> Result<CellAnalysis, Error>;

    /// One-vs-rest differential expression of every cluster.
    fn markers(&self, matrix: &FeatureBarcodeMatrix, analysis: &CellAnalysis) -> Result<Vec<MarkerRecord>, Error>;
}

/// Results computed by an external tool and written to a directory:
/// `projection.csv` (barcode, x, y), `clusters.csv` (barcode, cluster),
/// optional `phases.csv` (barcode, phase) and `markers.csv`.
pub struct PrecomputedAnalysis {
    dir: PathBuf,
}

/// Barcode-keyed rows of a headed CSV; keys carry the `-<digit>` suffix. Repeated barcodes are an error.
fn read_barcode_table(path: &Path, min_columns: usize) -> Result<HashMap<String, Vec<String>>, Error> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(open_text(path)?);
    let mut rows = HashMap::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record.with_context(|| path.display().to_string())?;
        if record.len() < min_columns {
            bail!("{}: row {} has {} columns, expected {}", path.display(), i + 1, record.len(), min_columns);
        }
        let barcode = ensure_barcode_suffix(record[0].trim());
        let values = record.iter().skip(1).map(|v| v.trim().to_string()).collect();
        if rows.insert(barcode.clone(), values).is_some() {
            bail!("{}: barcode {} appears more than once", path.display(), barcode);
        }
    }
    Ok(rows)
}

/// Look up every barcode, failing with the number of misses.
fn align<'a>(
    barcodes: &[String],
    table: &'a HashMap<String, Vec<String>>,
    path: &Path,
) -> Result<Vec<&'a [String]>, Error> {
    let mut missing = Vec::new();
    let rows = barcodes
        .iter()
        .filter_map(|bc| {
            let row = table.get(&ensure_barcode_suffix(bc));
            if row.is_none() {
                missing.push(bc.as_str());
            }
            row.map(Vec::as_slice)
        })
        .collect::<Vec<_>>();
    if let Some(first) = missing.first() {
        bail!("{}: {} cell(s) missing, e.g. {}", path.display(), missing.len(), first);
    }
    Ok(rows)
}

impl PrecomputedAnalysis {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        PrecomputedAnalysis {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, name: &str) -> Result<PathBuf, Error> {
        let path = self.dir.join(name);
        if !path.exists() {
            bail!("missing input file: {}", path.display());
        }
        Ok(path)
    }
}

impl AnalysisBackend for PrecomputedAnalysis {
    fn analyze(&self, matrix: &FeatureBarcodeMatrix, settings: &BackendSettings) -> Result<CellAnalysis, Error> {
        debug!(
            "using precomputed analysis in {} (num_pcs={}, resolution={} were fixed upstream)",
            self.dir.display(),
            settings.num_pcs,
            settings.resolution
        );
        let barcodes = matrix.barcodes.clone();

        let projection_path = self.path("projection.csv")?;
        let projection = read_barcode_table(&projection_path, 3)?;
        let mut embedding = Array2::<f64>::zeros((barcodes.len(), 2));
        for (i, row) in align(&barcodes, &projection, &projection_path)?.into_iter().enumerate() {
            for j in 0..2 {
                embedding[[i, j]] = row[j]
                    .parse::<f64>()
                    .map_err(|e| format_err!("{}: bad coordinate {:?}: {}", projection_path.display(), row[j], e))?;
            }
        }

        let clusters_path = self.path("clusters.csv")?;
        let cluster_table = read_barcode_table(&clusters_path, 2)?;
        let clusters = align(&barcodes, &cluster_table, &clusters_path)?
            .into_iter()
            .map(|row| ClusterLabel::new(row[0].as_str()))
            .collect::<Vec<_>>();

        let phases_path = self.dir.join("phases.csv");
        let phases = if phases_path.exists() {
            let phase_table = read_barcode_table(&phases_path, 2)?;
            Some(
                align(&barcodes, &phase_table, &phases_path)?
                    .into_iter()
                    .map(|row| row[0].clone())
                    .collect(),
            )
        } else {
            None
        };

        let analysis = CellAnalysis {
            barcodes,
            embedding,
            clusters,
            phases,
        };
        info!(
            "{} cells in {} clusters{}",
            analysis.num_cells(),
            analysis.cluster_sizes().len(),
            if analysis.phases.is_some() { ", with cell-cycle phases" } else { "" }
        );
        Ok(analysis)
    }

    fn markers(&self, _matrix: &FeatureBarcodeMatrix, _analysis: &CellAnalysis) -> Result<Vec<MarkerRecord>, Error> {
        load_markers(self.path("markers.csv")?)
    }
}
