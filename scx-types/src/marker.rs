use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A cluster label. Integer labels order numerically and sort before any
/// non-integer label; the rest order lexicographically.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterLabel(String);

impl ClusterLabel {
    pub fn new(label: impl Into<String>) -> Self {
        ClusterLabel(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<i64> {
        self.0.trim().parse::<i64>().ok()
    }
}

impl fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterLabel {
    fn from(s: &str) -> Self {
        ClusterLabel::new(s)
    }
}

impl Ord for ClusterLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for ClusterLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One (gene, cluster) row of a one-vs-rest differential expression table.
///
/// Column names follow the `FindAllMarkers` table; the unnamed row-name column is ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub gene: String,
    pub cluster: ClusterLabel,
    #[serde(alias = "avg_log2FC", alias = "avg_logFC", alias = "log2_fold_change")]
    pub log2fc: f64,
    #[serde(alias = "p_val_adj", alias = "adjusted_p_value")]
    pub padj: f64,
    #[serde(default, alias = "p_val", alias = "p_value")]
    pub p_value: Option<f64>,
    #[serde(default, alias = "pct.1")]
    pub pct_in: Option<f64>,
    #[serde(default, alias = "pct.2")]
    pub pct_out: Option<f64>,
}

impl MarkerRecord {
    pub fn new(gene: &str, cluster: &str, log2fc: f64, padj: f64) -> Self {
        MarkerRecord {
            gene: gene.to_string(),
            cluster: ClusterLabel::new(cluster),
            log2fc,
            padj,
            p_value: None,
            pct_in: None,
            pct_out: None,
        }
    }
}
