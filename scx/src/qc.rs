//! Per-cell and per-gene quality control

use anyhow::{bail, Error};
use log::info;
use rayon::prelude::*;
use scx_types::FeatureBarcodeMatrix;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QcThresholds {
    pub min_genes_per_cell: usize,
    pub max_genes_per_cell: usize,
    /// Percent of a cell's UMIs on mitochondrial genes
    pub max_pct_mito: f64,
    pub min_cells_per_gene: usize,
}

impl Default for QcThresholds {
    fn default() -> Self {
        QcThresholds {
            min_genes_per_cell: 200,
            max_genes_per_cell: 2500,
            max_pct_mito: 5.0,
            min_cells_per_gene: 3,
        }
    }
}

impl QcThresholds {
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_genes_per_cell > self.max_genes_per_cell {
            bail!(
                "qc.min_genes_per_cell ({}) exceeds qc.max_genes_per_cell ({})",
                self.min_genes_per_cell,
                self.max_genes_per_cell
            );
        }
        if !(0.0..=100.0).contains(&self.max_pct_mito) {
            bail!("qc.max_pct_mito must be a percentage, got {}", self.max_pct_mito);
        }
        Ok(())
    }

    fn passes(&self, cell: &CellQc) -> bool {
        cell.n_genes >= self.min_genes_per_cell
            && cell.n_genes <= self.max_genes_per_cell
            && cell.pct_mito <= self.max_pct_mito
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellQc {
    pub barcode: String,
    pub total_counts: u64,
    pub n_genes: usize,
    pub pct_mito: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QcSummary {
    pub cells_before: usize,
    pub cells_after: usize,
    pub genes_before: usize,
    pub genes_after: usize,
    pub median_genes_per_cell: f64,
}

/// Filtered matrix plus the metrics it was filtered on.
#[derive(Clone, Debug)]
pub struct QcResult {
    pub matrix: FeatureBarcodeMatrix,
    /// Metrics of every input cell, in input order
    pub cells: Vec<CellQc>,
    pub summary: QcSummary,
}

fn is_mito(symbol: &str) -> bool {
    symbol.get(..3).is_some_and(|prefix| prefix.eq_ignore_ascii_case("MT-"))
}

/// Total UMIs, detected genes and mitochondrial fraction of every cell.
pub fn cell_metrics(fbm: &FeatureBarcodeMatrix) -> Vec<CellQc> {
    let mito = fbm.features.iter().map(|f| is_mito(&f.name)).collect::<Vec<_>>();
    let csc = fbm.matrix.to_csc();
    (0..fbm.num_barcodes())
        .into_par_iter()
        .map(|c| {
            let (mut total, mut mito_total, mut n_genes) = (0u64, 0u64, 0usize);
            if let Some(col) = csc.outer_view(c) {
                for (gene, &v) in col.iter() {
                    if v == 0 {
                        continue;
                    }
                    total += u64::from(v);
                    n_genes += 1;
                    if mito[gene] {
                        mito_total += u64::from(v);
                    }
                }
            }
            let pct_mito = if total == 0 {
                0.0
            } else {
                100.0 * mito_total as f64 / total as f64
            };
            CellQc {
                barcode: fbm.barcodes[c].clone(),
                total_counts: total,
                n_genes,
                pct_mito,
            }
        })
        .collect()
}

/// Number of the given cells in which each gene is detected.
fn cells_per_gene(fbm: &FeatureBarcodeMatrix, keep_cell: &[bool]) -> Vec<usize> {
    (0..fbm.num_features())
        .into_par_iter()
        .map(|r| match fbm.matrix.outer_view(r) {
            Some(row) => row.iter().filter(|&(c, &v)| v > 0 && keep_cell[c]).count(),
            None => 0,
        })
        .collect()
}

fn median(mut xs: Vec<usize>) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.sort_unstable();
    let n = xs.len();
    if n % 2 == 0 {
        (xs[n / 2 - 1] + xs[n / 2]) as f64 / 2.0
    } else {
        xs[n / 2] as f64
    }
}

/// Drop cells outside the thresholds, then genes seen in too few of the remaining cells.
pub fn filter_cells_and_genes(fbm: &FeatureBarcodeMatrix, thresholds: &QcThresholds) -> QcResult {
    let cells = cell_metrics(fbm);
    let keep_cell = cells.iter().map(|c| thresholds.passes(c)).collect::<Vec<_>>();
    let kept_cols = (0..cells.len()).filter(|&c| keep_cell[c]).collect::<Vec<_>>();

    let gene_counts = cells_per_gene(fbm, &keep_cell);
    let kept_rows = (0..fbm.num_features())
        .filter(|&r| gene_counts[r] >= thresholds.min_cells_per_gene)
        .collect::<Vec<_>>();

    let matrix = fbm.select(&kept_rows, &kept_cols);
    let summary = QcSummary {
        cells_before: fbm.num_barcodes(),
        cells_after: kept_cols.len(),
        genes_before: fbm.num_features(),
        genes_after: kept_rows.len(),
        median_genes_per_cell: median(kept_cols.iter().map(|&c| cells[c].n_genes).collect()),
    };
    info!(
        "QC kept {}/{} cells and {}/{} genes (median {} genes per cell)",
        summary.cells_after, summary.cells_before, summary.genes_after, summary.genes_before, summary.median_genes_per_cell
    );
    QcResult {
        matrix,
        cells,
        summary,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use scx_types::Feature;
    use sprs::TriMat;

    fn fbm() -> FeatureBarcodeMatrix {
        // genes: CD3D, MT-CO1, LYZ, RARE; cells: A, B, C
        let mut tri = TriMat::new((4, 3));
        tri.add_triplet(0, 0, 10u32);
        tri.add_triplet(0, 1, 2);
        tri.add_triplet(0, 2, 5);
        tri.add_triplet(1, 0, 1);
        tri.add_triplet(1, 1, 8);
        tri.add_triplet(2, 0, 4);
        tri.add_triplet(2, 2, 3);
        tri.add_triplet(3, 2, 1);
        let features = ["CD3D", "MT-CO1", "LYZ", "RARE"]
            .iter()
            .map(|n| Feature {
                id: format!("ENSG_{}", n),
                name: n.to_string(),
                feature_type: scx_types::GENE_EXPRESSION.to_string(),
            })
            .collect();
        FeatureBarcodeMatrix::new(vec!["A-1".into(), "B-1".into(), "C-1".into()], features, tri.to_csr()).unwrap()
    }

    #[test]
    fn test_cell_metrics() {
        let cells = cell_metrics(&fbm());
        assert_eq!(cells[0].total_counts, 15);
        assert_eq!(cells[0].n_genes, 3);
        approx::assert_abs_diff_eq!(cells[0].pct_mito, 100.0 / 15.0, epsilon = 1e-9);
        assert_eq!(cells[1].n_genes, 2);
        approx::assert_abs_diff_eq!(cells[1].pct_mito, 80.0, epsilon = 1e-9);
        assert_eq!(cells[2].pct_mito, 0.0);
    }

    #[test]
    fn test_filter() {
        let thresholds = QcThresholds {
            min_genes_per_cell: 2,
            max_genes_per_cell: 10,
            max_pct_mito: 10.0,
            min_cells_per_gene: 2,
        };
        let res = filter_cells_and_genes(&fbm(), &thresholds);
        // B fails on mito; then only CD3D and LYZ are seen in both A and C
        assert_eq!(res.matrix.barcodes, vec!["A-1", "C-1"]);
        let names = res.matrix.features.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["CD3D", "LYZ"]);
        assert_eq!(
            res.summary,
            QcSummary {
                cells_before: 3,
                cells_after: 2,
                genes_before: 4,
                genes_after: 2,
                median_genes_per_cell: 3.0,
            }
        );
        assert_eq!(res.cells.len(), 3);
    }

    #[test]
    fn test_thresholds_validate() {
        let mut t = QcThresholds::default();
        t.validate().unwrap();
        t.min_genes_per_cell = 3000;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_is_mito() {
        assert!(is_mito("MT-ND1"));
        assert!(is_mito("mt-Nd1"));
        assert!(!is_mito("MTOR"));
        assert!(!is_mito("MT"));
    }
}
