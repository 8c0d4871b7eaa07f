//! Shared data types for the scx single-cell marker pipeline.

/// Grouping of features by their feature type tag
pub mod feature_types;

/// Differential-expression marker rows and cluster labels
pub mod marker;

/// Feature-barcode count matrix
pub mod matrix;

pub use feature_types::{FeatureTypes, GENE_EXPRESSION};
pub use marker::{ClusterLabel, MarkerRecord};
pub use matrix::{Feature, FeatureBarcodeMatrix};
