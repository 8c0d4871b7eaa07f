use anyhow::{bail, Context, Error};
use enrich::{EnrichmentOptions, RetryPolicy, MIN_GENE_SET_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::qc::QcThresholds;

fn panel(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(name, genes)| (name.to_string(), genes.iter().map(|g| g.to_string()).collect()))
        .collect()
}

/// Canonical PBMC cell-type markers
fn default_marker_genes() -> BTreeMap<String, Vec<String>> {
    panel(&[
        ("B", &["MS4A1", "CD79A"]),
        ("CD14+ Mono", &["CD14", "LYZ"]),
        ("CD8+ T", &["CD8A"]),
        ("DC", &["FCER1A", "CST3"]),
        ("FCGR3A+ Mono", &["FCGR3A", "MS4A7"]),
        ("Memory CD4+ T", &["IL7R", "S100A4"]),
        ("NK", &["GNLY", "NKG7"]),
        ("Naive CD4+ T", &["IL7R", "CCR7"]),
        ("Platelet", &["PPBP"]),
    ])
}

/// S and G2/M phase genes (Tirosh et al. 2016, 2019 symbol update)
fn default_cell_cycle_genes() -> BTreeMap<String, Vec<String>> {
    panel(&[
        (
            "S_phase",
            &[
                "MCM5", "PCNA", "TYMS", "FEN1", "MCM7", "MCM4", "RRM1", "UNG", "GINS2", "MCM6", "CDCA7", "DTL",
                "PRIM1", "UHRF1", "CENPU", "HELLS", "RFC2", "POLR1B", "NASP", "RAD51AP1", "GMNN", "WDR76", "SLBP",
                "CCNE2", "UBR7", "POLD3", "MSH2", "ATAD2", "RAD51", "RRM2", "CDC45", "CDC6", "EXO1", "TIPIN",
                "DSCC1", "BLM", "CASP8AP2", "USP1", "CLSPN", "POLA1", "CHAF1B", "MRPL36", "E2F8",
            ],
        ),
        (
            "G2M_phase",
            &[
                "HMGB2", "CDK1", "NUSAP1", "UBE2C", "BIRC5", "TPX2", "TOP2A", "NDC80", "CKS2", "NUF2", "CKS1B",
                "MKI67", "TMPO", "CENPF", "TACC3", "PIMREG", "SMC4", "CCNB2", "CKAP2L", "CKAP2", "AURKB", "BUB1",
                "KIF11", "ANP32E", "TUBB4B", "GTSE1", "KIF20B", "HJURP", "CDCA3", "JPT1", "CDC20", "TTK", "CDC25C",
                "KIF2C", "RANGAP1", "NCAPD2", "DLGAP5", "CDCA2", "CDCA8", "ECT2", "KIF23", "HMMR", "AURKA", "PSRC1",
                "ANLN", "LBR", "CKAP5", "CENPE", "CTCF", "NEK2", "G2E3", "GAS2L3", "CBX5", "CENPA",
            ],
        ),
    ])
}

/// Settings for the enrichment web service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnrichmentParams {
    pub enabled: bool,
    pub url: String,
    pub databases: Vec<String>,
    pub min_genes: usize,
    pub max_in_flight: usize,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for EnrichmentParams {
    fn default() -> Self {
        EnrichmentParams {
            enabled: true,
            url: enrich::client::DEFAULT_ENRICHR_URL.to_string(),
            databases: vec![
                "GO_Biological_Process_2023".to_string(),
                "KEGG_2021_Human".to_string(),
                "Reactome_2022".to_string(),
            ],
            min_genes: MIN_GENE_SET_SIZE,
            max_in_flight: 4,
            timeout_secs: 60,
            max_attempts: 4,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
        }
    }
}

impl EnrichmentParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn options(&self) -> EnrichmentOptions {
        EnrichmentOptions {
            databases: self.databases.clone(),
            min_genes: self.min_genes,
            max_in_flight: self.max_in_flight,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                initial_backoff: Duration::from_millis(self.initial_backoff_ms),
                multiplier: self.backoff_multiplier,
            },
        }
    }
}

/// Parameters of one analysis run, read from a JSON file. Every field has a default
/// except the two input directories.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisParams {
    /// 10x matrix directory (matrix, features, barcodes)
    pub matrix_dir: PathBuf,
    /// Output directory of the external analysis (projection, clusters, markers)
    pub analysis_dir: PathBuf,
    pub gene_annotation: Option<PathBuf>,
    pub annotation_id_column: String,
    pub annotation_xref_column: String,
    pub mapping_metrics: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub num_pcs: usize,
    pub resolution: f64,
    pub qc: QcThresholds,
    pub padj_threshold: f64,
    pub log2fc_threshold: f64,
    /// Literature marker lookup: cell type -> gene symbols
    pub marker_genes: BTreeMap<String, Vec<String>>,
    pub cell_cycle_genes: BTreeMap<String, Vec<String>>,
    pub enrichment: EnrichmentParams,
    pub plot_color: String,
    /// Accepted for compatibility; cell-cycle effects are never regressed out.
    pub regress_cell_cycle: bool,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        AnalysisParams {
            matrix_dir: PathBuf::new(),
            analysis_dir: PathBuf::new(),
            gene_annotation: None,
            annotation_id_column: "gene_id".to_string(),
            annotation_xref_column: "gene_name".to_string(),
            mapping_metrics: None,
            out_dir: PathBuf::from("."),
            num_pcs: 30,
            resolution: 0.8,
            qc: QcThresholds::default(),
            padj_threshold: 0.05,
            log2fc_threshold: 1.5f64.log2(),
            marker_genes: default_marker_genes(),
            cell_cycle_genes: default_cell_cycle_genes(),
            enrichment: EnrichmentParams::default(),
            plot_color: "#1f77b4".to_string(),
            regress_cell_cycle: false,
        }
    }
}

impl AnalysisParams {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<AnalysisParams, Error> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
        let params: AnalysisParams =
            serde_json::from_reader(reader).with_context(|| format!("invalid parameters in {}", path.display()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.matrix_dir.as_os_str().is_empty() {
            bail!("matrix_dir is required");
        }
        if self.analysis_dir.as_os_str().is_empty() {
            bail!("analysis_dir is required");
        }
        if self.num_pcs == 0 {
            bail!("num_pcs must be positive");
        }
        if !(self.resolution > 0.0) {
            bail!("resolution must be positive, got {}", self.resolution);
        }
        if !(self.padj_threshold > 0.0 && self.padj_threshold <= 1.0) {
            bail!("padj_threshold must be in (0, 1], got {}", self.padj_threshold);
        }
        if !(self.log2fc_threshold >= 0.0) {
            bail!("log2fc_threshold must be non-negative, got {}", self.log2fc_threshold);
        }
        self.qc.validate()?;
        let e = &self.enrichment;
        if e.min_genes < MIN_GENE_SET_SIZE {
            bail!(
                "enrichment.min_genes must be at least {}, got {}",
                MIN_GENE_SET_SIZE,
                e.min_genes
            );
        }
        if e.enabled {
            if e.databases.is_empty() {
                bail!("enrichment is enabled but no databases are configured");
            }
            if e.max_in_flight == 0 || e.max_attempts == 0 {
                bail!("enrichment max_in_flight and max_attempts must be positive");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_fill_in() {
        let params: AnalysisParams = serde_json::from_str(
            r#"{
                "matrix_dir": "filtered_feature_bc_matrix",
                "analysis_dir": "analysis",
                "padj_threshold": 0.01,
                "enrichment": { "databases": ["KEGG_2021_Human"], "max_in_flight": 2 }
            }"#,
        )
        .unwrap();
        params.validate().unwrap();
        assert_eq!(params.padj_threshold, 0.01);
        approx::assert_abs_diff_eq!(params.log2fc_threshold, 0.584_962_5, epsilon = 1e-6);
        assert_eq!(params.enrichment.databases, vec!["KEGG_2021_Human"]);
        assert_eq!(params.enrichment.min_genes, 3);
        assert_eq!(params.cell_cycle_genes["S_phase"].len(), 43);
        assert_eq!(params.cell_cycle_genes["G2M_phase"].len(), 54);
        assert!(params.marker_genes.contains_key("NK"));
        assert!(!params.regress_cell_cycle);

        let opts = params.enrichment.options();
        assert_eq!(opts.max_in_flight, 2);
        assert_eq!(opts.retry.initial_backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_validation() {
        let mut params = AnalysisParams {
            matrix_dir: "m".into(),
            analysis_dir: "a".into(),
            ..AnalysisParams::default()
        };
        params.validate().unwrap();

        params.padj_threshold = 0.0;
        assert!(params.validate().is_err());
        params.padj_threshold = 0.05;

        params.enrichment.min_genes = 1;
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("min_genes"));
        params.enrichment.min_genes = MIN_GENE_SET_SIZE + 2;
        params.validate().unwrap();

        params.enrichment.databases.clear();
        assert!(params.validate().is_err());
        params.enrichment.enabled = false;
        params.validate().unwrap();

        params.matrix_dir = PathBuf::new();
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("params.json");
        std::fs::write(&path, r#"{"matrix_dir": "m", "analysis_dir": "a", "n_pcs": 10}"#).unwrap();
        assert!(AnalysisParams::from_json_file(&path).is_err());
        assert!(AnalysisParams::from_json_file(tmp.path().join("missing.json")).is_err());
    }
}
