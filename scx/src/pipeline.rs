//! The analysis run as a chain of stages, each taking the previous stage's output by
//! reference and returning a new value.

use anyhow::{bail, Context, Error};
use enrich::{run_enrichment, EnrichmentReport, EnrichmentService};
use log::{info, warn};
use scx_types::{ClusterLabel, FeatureBarcodeMatrix, MarkerRecord, GENE_EXPRESSION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{create_dir_all, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::annotation::{load_xrefs, GeneAnnotationTable, PanelEntry};
use crate::backend::{AnalysisBackend, BackendSettings, CellAnalysis};
use crate::config::AnalysisParams;
use crate::export;
use crate::markers::{filter_markers, ClusterCounts, FilteredMarkerSet, GeneSet, MarkerThresholds};
use crate::metrics::MappingMetrics;
use crate::mtx::load_10x_dir;
use crate::qc::{filter_cells_and_genes, QcResult, QcSummary};

/// Expression matrix with display symbols as feature names, plus the lookups built from it.
#[derive(Clone, Debug)]
pub struct Inputs {
    pub matrix: FeatureBarcodeMatrix,
    pub annotation: GeneAnnotationTable,
    pub mapping_metrics: Option<MappingMetrics>,
}

/// Load the count matrix, annotation and metrics named in `params`.
pub fn load_inputs(params: &AnalysisParams) -> Result<Inputs, Error> {
    let raw = load_10x_dir(&params.matrix_dir)?;

    let xrefs = match &params.gene_annotation {
        Some(path) => load_xrefs(path, &params.annotation_id_column, &params.annotation_xref_column)?,
        None => HashMap::new(),
    };
    let annotation = GeneAnnotationTable::build(&raw.features, &raw.feature_types, &xrefs);

    let Some(rows) = raw.feature_types.get_indices(GENE_EXPRESSION) else {
        bail!("no {} features in {}", GENE_EXPRESSION, params.matrix_dir.display());
    };
    let cols = (0..raw.num_barcodes()).collect::<Vec<_>>();
    let mut matrix = raw.select(rows, &cols);
    for (feature, gene) in matrix.features.iter_mut().zip(annotation.genes()) {
        feature.name = gene.display_symbol.clone();
    }
    if matrix.num_features() < raw.num_features() {
        info!(
            "kept {} of {} features tagged {}",
            matrix.num_features(),
            raw.num_features(),
            GENE_EXPRESSION
        );
    }

    let mapping_metrics = params
        .mapping_metrics
        .as_ref()
        .map(|p| MappingMetrics::load(p))
        .transpose()?;

    Ok(Inputs {
        matrix,
        annotation,
        mapping_metrics,
    })
}

/// Cells, clusters and the raw marker table from the analysis backend.
#[derive(Clone, Debug)]
pub struct Analysis {
    pub cells: CellAnalysis,
    pub markers: Vec<MarkerRecord>,
}

pub fn analyze<B: AnalysisBackend + ?Sized>(
    backend: &B,
    qc: &QcResult,
    params: &AnalysisParams,
) -> Result<Analysis, Error> {
    if params.regress_cell_cycle {
        warn!("regress_cell_cycle is set but cell-cycle effects are not removed; continuing without it");
    }
    let settings = BackendSettings {
        num_pcs: params.num_pcs,
        resolution: params.resolution,
    };
    let cells = backend.analyze(&qc.matrix, &settings)?;
    let markers = backend.markers(&qc.matrix, &cells)?;
    Ok(Analysis { cells, markers })
}

/// Marker gene sets followed by the configured cell-cycle sets.
pub fn gene_sets(markers: &FilteredMarkerSet, params: &AnalysisParams) -> Vec<GeneSet> {
    let mut sets = markers.gene_sets();
    sets.extend(GeneSet::from_lookup(&params.cell_cycle_genes));
    sets
}

/// Enrich the per-cluster marker sets.
pub fn enrich_markers<S: EnrichmentService>(
    service: &S,
    markers: &FilteredMarkerSet,
    annotation: &GeneAnnotationTable,
    params: &AnalysisParams,
) -> Result<EnrichmentReport, Error> {
    let queries = markers
        .gene_sets()
        .iter()
        .map(|s| s.to_query(annotation))
        .collect::<Vec<_>>();
    run_enrichment(service, &queries, &params.enrichment.options())
}

/// Everything worth keeping about a run, written as `snapshot.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    pub params: AnalysisParams,
    pub mapping_metrics: Option<MappingMetrics>,
    pub qc: QcSummary,
    pub cluster_sizes: Vec<(ClusterLabel, usize)>,
    pub thresholds: MarkerThresholds,
    pub num_significant: usize,
    pub marker_counts: Vec<ClusterCounts>,
    pub gene_sets: Vec<GeneSet>,
    pub marker_panel: Vec<PanelEntry>,
    pub enrichment: Option<EnrichmentReport>,
}

impl AnalysisSnapshot {
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let writer = BufWriter::new(File::create(path).with_context(|| path.display().to_string())?);
        serde_json::to_writer_pretty(writer, self).with_context(|| path.display().to_string())?;
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<AnalysisSnapshot, Error> {
        let path = path.as_ref();
        let reader = std::io::BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
        serde_json::from_reader(reader).with_context(|| path.display().to_string())
    }
}

/// Outcome of [run]
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub files: Vec<PathBuf>,
    pub snapshot: AnalysisSnapshot,
}

/// Run every stage and write all outputs to `params.out_dir`. Enrichment runs only when
/// a service is given and enrichment is enabled.
pub fn run<B, S>(params: &AnalysisParams, backend: &B, service: Option<&S>) -> Result<RunSummary, Error>
where
    B: AnalysisBackend + ?Sized,
    S: EnrichmentService,
{
    params.validate()?;
    let out_dir = &params.out_dir;
    create_dir_all(out_dir).with_context(|| out_dir.display().to_string())?;

    let inputs = load_inputs(params)?;
    let qc = filter_cells_and_genes(&inputs.matrix, &params.qc);
    if qc.matrix.num_barcodes() == 0 {
        bail!("no cells passed QC");
    }
    let analysis = analyze(backend, &qc, params)?;
    let thresholds = MarkerThresholds {
        padj: params.padj_threshold,
        log2fc: params.log2fc_threshold,
    };
    let known = analysis
        .cells
        .cluster_sizes()
        .into_iter()
        .map(|(label, _)| label)
        .collect::<Vec<_>>();
    let markers = filter_markers(&analysis.markers, &known, thresholds);
    let sets = gene_sets(&markers, params);
    let panel = inputs.annotation.resolve_panel(&params.marker_genes);

    let enrichment = match service {
        Some(service) if params.enrichment.enabled => Some(enrich_markers(
            service,
            &markers,
            &inputs.annotation,
            params,
        )?),
        _ => {
            info!("enrichment disabled");
            None
        }
    };

    let mut files = Vec::new();
    let mut out = |name: &str| {
        let p = out_dir.join(name);
        files.push(p.clone());
        p
    };
    export::write_gene_ids(out("gene_ids.tsv"), &inputs.annotation)?;
    export::write_embedding(out("embedding.csv"), &analysis.cells)?;
    export::write_metadata(out("metadata.csv"), &analysis.cells)?;
    export::write_gene_set_table(out("gene_sets.csv"), &sets, &inputs.annotation)?;
    export::write_counts(out("marker_counts.csv"), &markers.direction_counts())?;
    export::write_marker_panel(out("marker_panel.csv"), &panel)?;
    export::write_marker_sheets(out("markers"), out("markers.xlsx"), &markers, &inputs.annotation)?;
    if let Some(report) = &enrichment {
        export::write_enrichment_sheets(out("enrichment"), out("enrichment.xlsx"), report)?;
    }

    let snapshot = AnalysisSnapshot {
        params: params.clone(),
        mapping_metrics: inputs.mapping_metrics,
        qc: qc.summary,
        cluster_sizes: analysis.cells.cluster_sizes(),
        thresholds,
        num_significant: markers.significant().len(),
        marker_counts: markers.direction_counts(),
        gene_sets: sets,
        marker_panel: panel,
        enrichment,
    };
    snapshot.write(out("snapshot.json"))?;
    info!("wrote {} outputs to {}", files.len(), out_dir.display());

    Ok(RunSummary { files, snapshot })
}
