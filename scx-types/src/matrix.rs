use anyhow::{bail, Error};
use sprs::{CsMatI, TriMat};

use crate::feature_types::FeatureTypes;

/// One row of a 10x feature list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Feature {
    pub id: String,
    pub name: String,
    pub feature_type: String,
}

/// Genes-by-cells UMI counts, CSR with one row per feature.
pub type CountMatrix = CsMatI<u32, usize>;

#[derive(Clone, Debug)]
pub struct FeatureBarcodeMatrix {
    pub barcodes: Vec<String>,
    pub features: Vec<Feature>,
    pub feature_types: FeatureTypes,
    pub matrix: CountMatrix,
}

impl FeatureBarcodeMatrix {
    pub fn new(barcodes: Vec<String>, features: Vec<Feature>, matrix: CountMatrix) -> Result<Self, Error> {
        let (rows, cols) = matrix.shape();
        if rows != features.len() {
            bail!("matrix has {} rows but {} features were listed", rows, features.len());
        }
        if cols != barcodes.len() {
            bail!("matrix has {} columns but {} barcodes were listed", cols, barcodes.len());
        }
        let tags = features.iter().map(|f| f.feature_type.clone()).collect::<Vec<_>>();
        let feature_types = if tags.is_empty() {
            FeatureTypes::default()
        } else {
            FeatureTypes::from_feature_types(&tags)?
        };
        Ok(FeatureBarcodeMatrix {
            barcodes,
            features,
            feature_types,
            matrix,
        })
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn num_barcodes(&self) -> usize {
        self.barcodes.len()
    }

    /// New matrix restricted to the given feature rows and barcode columns, in the given order.
    pub fn select(&self, rows: &[usize], cols: &[usize]) -> FeatureBarcodeMatrix {
        let mut col_map = vec![None; self.num_barcodes()];
        for (new, &old) in cols.iter().enumerate() {
            col_map[old] = Some(new);
        }
        let mut tri = TriMat::new((rows.len(), cols.len()));
        for (new_row, &old_row) in rows.iter().enumerate() {
            if let Some(row) = self.matrix.outer_view(old_row) {
                for (c, &v) in row.iter() {
                    if let Some(new_col) = col_map[c] {
                        tri.add_triplet(new_row, new_col, v);
                    }
                }
            }
        }
        FeatureBarcodeMatrix {
            barcodes: cols.iter().map(|&c| self.barcodes[c].clone()).collect(),
            features: rows.iter().map(|&r| self.features[r].clone()).collect(),
            feature_types: self.feature_types.select(rows),
            matrix: tri.to_csr(),
        }
    }
}
