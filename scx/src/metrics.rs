use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::mtx::open_text;

/// The single-row mapping metrics summary written next to a 10x count matrix.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingMetrics {
    pub metrics: Vec<(String, String)>,
}

impl MappingMetrics {
    pub fn load(path: impl AsRef<Path>) -> Result<MappingMetrics, Error> {
        let path = path.as_ref();
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(open_text(path)?);
        let headers = rdr.headers().with_context(|| path.display().to_string())?.clone();
        let Some(values) = rdr.records().next() else {
            bail!("no metric values in {}", path.display());
        };
        let values = values.with_context(|| path.display().to_string())?;
        if values.len() != headers.len() {
            bail!(
                "{}: {} metric names but {} values",
                path.display(),
                headers.len(),
                values.len()
            );
        }
        let metrics = headers
            .iter()
            .zip(values.iter())
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        Ok(MappingMetrics { metrics })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.metrics.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Numeric value of a metric, ignoring thousands separators and a trailing `%`.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        let raw = self.get(name)?;
        raw.trim_end_matches('%').replace(',', "").trim().parse().ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_load_metrics_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metrics_summary.csv");
        std::fs::write(
            &path,
            "Estimated Number of Cells,Mean Reads per Cell,Median Genes per Cell,Reads Mapped to Genome\n\
             \"1,222\",\"54,470\",\"1,056\",93.5%\n",
        )
        .unwrap();
        let m = MappingMetrics::load(&path).unwrap();
        assert_eq!(m.metrics.len(), 4);
        assert_eq!(m.get("Estimated Number of Cells"), Some("1,222"));
        assert_eq!(m.get_f64("Mean Reads per Cell"), Some(54470.0));
        assert_eq!(m.get_f64("Reads Mapped to Genome"), Some(93.5));
        assert_eq!(m.get_f64("Q30 Bases in Barcode"), None);
    }

    #[test]
    fn test_header_only() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metrics_summary.csv");
        std::fs::write(&path, "Estimated Number of Cells\n").unwrap();
        assert!(MappingMetrics::load(&path).is_err());
        assert!(MappingMetrics::load(tmp.path().join("absent.csv")).is_err());
    }
}
