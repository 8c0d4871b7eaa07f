//! Writers for the files handed to downstream viewers and spreadsheets.
//!
//! Missing gene identifiers are written as empty fields; they never abort an export.

use anyhow::{Context, Error};
use enrich::EnrichmentReport;
use rust_xlsxwriter::Workbook;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use crate::annotation::{GeneAnnotationTable, PanelEntry};
use crate::backend::CellAnalysis;
use crate::markers::{ClusterCounts, Direction, FilteredMarkerSet, GeneSet};

/// Barcodes end in `-<digits>` (a GEM group); append `-1` to those that don't.
pub fn ensure_barcode_suffix(barcode: &str) -> String {
    match barcode.rsplit_once('-') {
        Some((stem, gem)) if !stem.is_empty() && !gem.is_empty() && gem.bytes().all(|b| b.is_ascii_digit()) => {
            barcode.to_string()
        }
        _ => format!("{}-1", barcode),
    }
}

fn writer(path: &Path) -> Result<csv::Writer<std::fs::File>, Error> {
    csv::Writer::from_path(path).with_context(|| path.display().to_string())
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<std::fs::File>, Error> {
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| path.display().to_string())
}

/// File-name-safe form of a sheet name
fn sheet_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRow {
    pub barcode: String,
    pub x: f64,
    pub y: f64,
}

/// Write per-cell 2D coordinates.
pub fn write_embedding(path: impl AsRef<Path>, analysis: &CellAnalysis) -> Result<(), Error> {
    let path = path.as_ref();
    let mut w = writer(path)?;
    for (bc, xy) in analysis.barcodes.iter().zip(analysis.embedding.rows()) {
        w.serialize(EmbeddingRow {
            barcode: ensure_barcode_suffix(bc),
            x: xy[0],
            y: xy[1],
        })?;
    }
    w.flush().with_context(|| path.display().to_string())?;
    Ok(())
}

/// Read back a file written by [write_embedding].
pub fn read_embedding(path: impl AsRef<Path>) -> Result<Vec<EmbeddingRow>, Error> {
    let path = path.as_ref();
    let mut rdr = csv::Reader::from_path(path).with_context(|| path.display().to_string())?;
    let rows = rdr.deserialize().collect::<Result<Vec<EmbeddingRow>, _>>();
    rows.with_context(|| path.display().to_string())
}

#[derive(Serialize)]
struct MetadataRow<'a> {
    barcode: String,
    cluster: &'a str,
    phase: Option<&'a str>,
}

/// Write per-cell categorical metadata.
pub fn write_metadata(path: impl AsRef<Path>, analysis: &CellAnalysis) -> Result<(), Error> {
    let path = path.as_ref();
    let mut w = writer(path)?;
    for (i, bc) in analysis.barcodes.iter().enumerate() {
        w.serialize(MetadataRow {
            barcode: ensure_barcode_suffix(bc),
            cluster: analysis.clusters[i].as_str(),
            phase: analysis.phases.as_ref().map(|p| p[i].as_str()),
        })?;
    }
    w.flush().with_context(|| path.display().to_string())?;
    Ok(())
}

#[derive(Serialize)]
struct GeneSetRow<'a> {
    set_name: &'a str,
    gene_symbol: &'a str,
    gene_id: Option<&'a str>,
}

/// Write the union of the given gene sets, one row per (set, gene).
pub fn write_gene_set_table(
    path: impl AsRef<Path>,
    sets: &[GeneSet],
    annotation: &GeneAnnotationTable,
) -> Result<(), Error> {
    let path = path.as_ref();
    let mut w = writer(path)?;
    for set in sets {
        for gene in &set.genes {
            w.serialize(GeneSetRow {
                set_name: &set.name,
                gene_symbol: gene,
                gene_id: annotation.gene_id(gene),
            })?;
        }
    }
    w.flush().with_context(|| path.display().to_string())?;
    Ok(())
}

/// Write the gene identifier table.
pub fn write_gene_ids(path: impl AsRef<Path>, annotation: &GeneAnnotationTable) -> Result<(), Error> {
    let path = path.as_ref();
    let mut w = tsv_writer(path)?;
    for gene in annotation.genes() {
        w.serialize(gene)?;
    }
    w.flush().with_context(|| path.display().to_string())?;
    Ok(())
}

/// Write the cluster x direction count table.
pub fn write_counts(path: impl AsRef<Path>, counts: &[ClusterCounts]) -> Result<(), Error> {
    let path = path.as_ref();
    let mut w = writer(path)?;
    for c in counts {
        w.serialize(c)?;
    }
    w.flush().with_context(|| path.display().to_string())?;
    Ok(())
}

pub fn write_marker_panel(path: impl AsRef<Path>, entries: &[PanelEntry]) -> Result<(), Error> {
    let path = path.as_ref();
    let mut w = writer(path)?;
    for e in entries {
        w.serialize(e)?;
    }
    w.flush().with_context(|| path.display().to_string())?;
    Ok(())
}

/// One field of a sheet row.
#[derive(Clone, Debug, PartialEq)]
enum Cell {
    Text(String),
    Number(f64),
    Count(u64),
    Blank,
}

impl From<Option<f64>> for Cell {
    fn from(v: Option<f64>) -> Self {
        v.map_or(Cell::Blank, Cell::Number)
    }
}

impl From<Option<&str>> for Cell {
    fn from(v: Option<&str>) -> Self {
        v.map_or(Cell::Blank, |s| Cell::Text(s.to_string()))
    }
}

impl Serialize for Cell {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Cell::Text(s) => serializer.serialize_str(s),
            Cell::Number(x) => serializer.serialize_f64(*x),
            Cell::Count(n) => serializer.serialize_u64(*n),
            Cell::Blank => serializer.serialize_none(),
        }
    }
}

/// A named table written both as `<name>.csv` and as a worksheet.
struct Sheet {
    name: String,
    header: &'static [&'static str],
    rows: Vec<Vec<Cell>>,
}

/// Excel's worksheet name limit
const MAX_SHEET_NAME: usize = 31;

/// Hands out distinct sheet names. Collisions after sanitizing (compared case-insensitively)
/// get a `.1`, `.2`, ... suffix.
#[derive(Default)]
struct SheetNames {
    taken: HashSet<String>,
}

impl SheetNames {
    fn reserving(names: &[&str]) -> Self {
        // "History" is reserved by Excel
        SheetNames {
            taken: names
                .iter()
                .chain(&["history"])
                .map(|n| n.to_ascii_lowercase())
                .collect(),
        }
    }

    fn assign(&mut self, name: &str) -> String {
        let mut base = sheet_name(name);
        if base.is_empty() {
            base = "sheet".to_string();
        }
        let mut n = 0usize;
        loop {
            let suffix = if n == 0 { String::new() } else { format!(".{}", n) };
            let stem = base.chars().take(MAX_SHEET_NAME - suffix.len()).collect::<String>();
            let candidate = format!("{}{}", stem, suffix);
            if self.taken.insert(candidate.to_ascii_lowercase()) {
                return candidate;
            }
            n += 1;
        }
    }
}

fn write_sheet_csv(dir: &Path, sheet: &Sheet) -> Result<PathBuf, Error> {
    let path = dir.join(format!("{}.csv", sheet.name));
    let mut w = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(&path)
        .with_context(|| path.display().to_string())?;
    w.write_record(sheet.header)?;
    for row in &sheet.rows {
        w.serialize(row)?;
    }
    w.flush().with_context(|| path.display().to_string())?;
    Ok(path)
}

fn write_workbook(path: &Path, sheets: &[Sheet]) -> Result<(), Error> {
    let mut workbook = Workbook::new();
    for sheet in sheets {
        let ws = workbook.add_worksheet();
        ws.set_name(&sheet.name)?;
        for (c, h) in sheet.header.iter().enumerate() {
            ws.write_string(0, c as u16, *h)?;
        }
        for (r, row) in sheet.rows.iter().enumerate() {
            let r = r as u32 + 1;
            for (c, cell) in row.iter().enumerate() {
                let c = c as u16;
                match cell {
                    Cell::Text(t) => {
                        ws.write_string(r, c, t)?;
                    }
                    Cell::Number(x) if x.is_finite() => {
                        ws.write_number(r, c, *x)?;
                    }
                    Cell::Number(x) => {
                        ws.write_string(r, c, x.to_string())?;
                    }
                    Cell::Count(n) => {
                        ws.write_number(r, c, *n as f64)?;
                    }
                    Cell::Blank => {}
                }
            }
        }
    }
    workbook.save(path).with_context(|| path.display().to_string())?;
    Ok(())
}

fn counts_sheet(name: String, counts: &[ClusterCounts]) -> Sheet {
    Sheet {
        name,
        header: &["cluster", "up", "down"],
        rows: counts
            .iter()
            .map(|c| {
                vec![
                    Cell::Text(c.cluster.to_string()),
                    Cell::Count(c.up as u64),
                    Cell::Count(c.down as u64),
                ]
            })
            .collect(),
    }
}

const MARKER_HEADER: &[&str] = &["gene", "gene_id", "direction", "log2fc", "padj", "p_value", "pct_in", "pct_out"];

/// One sheet per cluster with its significant markers, plus a `summary` sheet with the counts.
/// Sheets go to `dir` as CSV files and together into the `workbook` file.
/// Returns the per-cluster CSV paths in cluster order.
pub fn write_marker_sheets(
    dir: impl AsRef<Path>,
    workbook: impl AsRef<Path>,
    markers: &FilteredMarkerSet,
    annotation: &GeneAnnotationTable,
) -> Result<Vec<PathBuf>, Error> {
    let dir = dir.as_ref();
    create_dir_all(dir).with_context(|| dir.display().to_string())?;
    let t = markers.thresholds();
    let mut names = SheetNames::reserving(&["summary"]);

    let mut sheets = Vec::new();
    for cluster in markers.clusters() {
        let rows = markers
            .significant_in(cluster)
            .map(|r| {
                let direction = if r.log2fc >= t.log2fc {
                    Some(Direction::Up.as_str())
                } else if r.log2fc <= -t.log2fc {
                    Some(Direction::Down.as_str())
                } else {
                    None
                };
                vec![
                    Cell::Text(r.gene.clone()),
                    annotation.gene_id(&r.gene).into(),
                    direction.into(),
                    Cell::Number(r.log2fc),
                    Cell::Number(r.padj),
                    r.p_value.into(),
                    r.pct_in.into(),
                    r.pct_out.into(),
                ]
            })
            .collect();
        sheets.push(Sheet {
            name: names.assign(&format!("cluster_{}", cluster)),
            header: MARKER_HEADER,
            rows,
        });
    }

    let mut paths = Vec::new();
    for sheet in &sheets {
        paths.push(write_sheet_csv(dir, sheet)?);
    }
    sheets.push(counts_sheet("summary".to_string(), &markers.direction_counts()));
    write_sheet_csv(dir, &sheets[sheets.len() - 1])?;
    write_workbook(workbook.as_ref(), &sheets)?;
    Ok(paths)
}

const ENRICHMENT_HEADER: &[&str] = &[
    "database",
    "rank",
    "term",
    "p_value",
    "adjusted_p_value",
    "z_score",
    "combined_score",
    "genes",
];

/// One sheet per enriched gene set, plus a `skipped` sheet listing sets that were skipped or
/// failed. Sheets go to `dir` as CSV files and together into the `workbook` file.
pub fn write_enrichment_sheets(
    dir: impl AsRef<Path>,
    workbook: impl AsRef<Path>,
    report: &EnrichmentReport,
) -> Result<(), Error> {
    let dir = dir.as_ref();
    create_dir_all(dir).with_context(|| dir.display().to_string())?;
    let mut names = SheetNames::reserving(&["skipped"]);

    let mut sheets = Vec::new();
    for set in &report.results {
        let mut rows = Vec::new();
        for (db, terms) in &set.databases {
            for t in terms {
                rows.push(vec![
                    Cell::Text(db.clone()),
                    Cell::Count(u64::from(t.rank)),
                    Cell::Text(t.term.clone()),
                    Cell::Number(t.p_value),
                    Cell::Number(t.adjusted_p_value),
                    Cell::Number(t.z_score),
                    Cell::Number(t.combined_score),
                    Cell::Text(t.genes.join(";")),
                ]);
            }
        }
        sheets.push(Sheet {
            name: names.assign(&set.name),
            header: ENRICHMENT_HEADER,
            rows,
        });
    }

    let skipped = report
        .skipped
        .iter()
        .map(|s| (s.name.as_str(), "skipped", format!("{} gene(s)", s.num_genes)));
    let failed = report
        .failed
        .iter()
        .map(|f| (f.name.as_str(), "failed", f.error.clone()));
    sheets.push(Sheet {
        name: "skipped".to_string(),
        header: &["set_name", "status", "detail"],
        rows: skipped
            .chain(failed)
            .map(|(name, status, detail)| {
                vec![
                    Cell::Text(name.to_string()),
                    Cell::Text(status.to_string()),
                    Cell::Text(detail),
                ]
            })
            .collect(),
    });

    for sheet in &sheets {
        write_sheet_csv(dir, sheet)?;
    }
    write_workbook(workbook.as_ref(), &sheets)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::markers::{filter_markers, MarkerThresholds};
    use calamine::{open_workbook, Reader, Xlsx};
    use enrich::runner::{FailedGeneSet, GeneSetEnrichment, SkippedGeneSet};
    use enrich::EnrichmentTerm;
    use ndarray::array;
    use scx_types::{ClusterLabel, Feature, FeatureTypes, MarkerRecord, GENE_EXPRESSION};
    use std::collections::{BTreeMap, HashMap};

    fn analysis() -> CellAnalysis {
        CellAnalysis {
            barcodes: vec!["AAAC-1".into(), "AAAG".into(), "AAAT-2".into(), "CELL-A".into()],
            embedding: array![[1.5, -2.0], [0.1, 3.0], [-4.0, 0.5], [1e-7, 12345.678]],
            clusters: ["1", "0", "1", "2"].into_iter().map(ClusterLabel::from).collect(),
            phases: Some(vec!["G1".into(), "S".into(), "G2M".into(), "G1".into()]),
        }
    }

    fn annotation() -> GeneAnnotationTable {
        let features = ["CD3D", "LYZ"]
            .iter()
            .enumerate()
            .map(|(i, n)| Feature {
                id: format!("ENSG0{}", i),
                name: n.to_string(),
                feature_type: GENE_EXPRESSION.to_string(),
            })
            .collect::<Vec<_>>();
        GeneAnnotationTable::build(&features, &FeatureTypes::uniform(GENE_EXPRESSION, 2), &HashMap::new())
    }

    #[test]
    fn test_barcode_suffix() {
        assert_eq!(ensure_barcode_suffix("AAACCTGAGAAACCAT-1"), "AAACCTGAGAAACCAT-1");
        assert_eq!(ensure_barcode_suffix("AAACCTGAGAAACCAT-12"), "AAACCTGAGAAACCAT-12");
        assert_eq!(ensure_barcode_suffix("AAACCTGAGAAACCAT"), "AAACCTGAGAAACCAT-1");
        assert_eq!(ensure_barcode_suffix("sample-A"), "sample-A-1");
        assert_eq!(ensure_barcode_suffix("AAAC-"), "AAAC--1");
        assert_eq!(ensure_barcode_suffix("-1"), "-1-1");
    }

    #[test]
    fn test_embedding_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("embedding.csv");
        let a = analysis();
        write_embedding(&path, &a).unwrap();
        let rows = read_embedding(&path).unwrap();
        assert_eq!(rows.len(), a.num_cells());
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.barcode, ensure_barcode_suffix(&a.barcodes[i]));
            assert_eq!(row.x, a.embedding[[i, 0]]);
            assert_eq!(row.y, a.embedding[[i, 1]]);
            let (_, gem) = row.barcode.rsplit_once('-').unwrap();
            assert!(gem.parse::<u32>().is_ok());
        }
        assert_eq!(rows[1].barcode, "AAAG-1");
        assert_eq!(rows[2].barcode, "AAAT-2");
    }

    #[test]
    fn test_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metadata.csv");
        let mut a = analysis();
        write_metadata(&path, &a).unwrap();
        insta::assert_snapshot!(std::fs::read_to_string(&path).unwrap(), @r"
        barcode,cluster,phase
        AAAC-1,1,G1
        AAAG-1,0,S
        AAAT-2,1,G2M
        CELL-A-1,2,G1
        ");

        a.phases = None;
        write_metadata(&path, &a).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.lines().nth(1).unwrap().ends_with(",1,"));
    }

    #[test]
    fn test_gene_set_table_blank_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gene_sets.csv");
        let mut lookup = BTreeMap::new();
        lookup.insert("S_phase".to_string(), vec!["PCNA".to_string()]);
        let mut sets = vec![GeneSet {
            name: "cluster_0_up".to_string(),
            genes: vec!["CD3D".to_string(), "LYZ".to_string()],
        }];
        sets.extend(GeneSet::from_lookup(&lookup));
        write_gene_set_table(&path, &sets, &annotation()).unwrap();
        insta::assert_snapshot!(std::fs::read_to_string(&path).unwrap(), @r"
        set_name,gene_symbol,gene_id
        cluster_0_up,CD3D,ENSG00
        cluster_0_up,LYZ,ENSG01
        S_phase,PCNA,
        ");
    }

    #[test]
    fn test_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("marker_counts.csv");
        let records = vec![
            MarkerRecord::new("CD3D", "0", 2.0, 0.001),
            MarkerRecord::new("LYZ", "0", -2.0, 0.001),
            MarkerRecord::new("MS4A1", "1", 0.1, 0.9),
        ];
        let set = filter_markers(
            &records,
            &[],
            MarkerThresholds {
                padj: 0.05,
                log2fc: 1.0,
            },
        );
        write_counts(&path, &set.direction_counts()).unwrap();
        insta::assert_snapshot!(std::fs::read_to_string(&path).unwrap(), @r"
        cluster,up,down
        0,1,1
        1,0,0
        ");

        let workbook = tmp.path().join("markers.xlsx");
        let sheets = write_marker_sheets(tmp.path().join("markers"), &workbook, &set, &annotation()).unwrap();
        assert_eq!(sheets.len(), 2);
        let sheet0 = std::fs::read_to_string(&sheets[0]).unwrap();
        assert!(sheet0.contains("CD3D,ENSG00,up,"));
        assert!(sheet0.contains("LYZ,ENSG01,down"));
        let sheet1 = std::fs::read_to_string(&sheets[1]).unwrap();
        assert_eq!(sheet1.lines().count(), 1);
        assert!(tmp.path().join("markers/summary.csv").exists());

        let wb: Xlsx<_> = open_workbook(&workbook).unwrap();
        assert_eq!(wb.sheet_names(), vec!["cluster_0", "cluster_1", "summary"]);
    }

    #[test]
    fn test_colliding_sheet_names() {
        let tmp = tempfile::tempdir().unwrap();
        let records = vec![
            MarkerRecord::new("CD3D", "a b", 2.0, 0.001),
            MarkerRecord::new("LYZ", "a_b", 2.0, 0.001),
            MarkerRecord::new("MS4A1", "summary", 2.0, 0.001),
        ];
        let set = filter_markers(
            &records,
            &[],
            MarkerThresholds {
                padj: 0.05,
                log2fc: 1.0,
            },
        );
        let workbook = tmp.path().join("markers.xlsx");
        let sheets = write_marker_sheets(tmp.path().join("markers"), &workbook, &set, &annotation()).unwrap();
        let files = sheets
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(files, vec!["cluster_a_b.csv", "cluster_a_b.1.csv", "cluster_summary.csv"]);
        assert!(std::fs::read_to_string(&sheets[0]).unwrap().contains("CD3D"));
        assert!(std::fs::read_to_string(&sheets[1]).unwrap().contains("LYZ"));

        let wb: Xlsx<_> = open_workbook(&workbook).unwrap();
        assert_eq!(wb.sheet_names().len(), 4);
    }

    #[test]
    fn test_sheet_name_limits() {
        let mut names = SheetNames::reserving(&["skipped"]);
        assert_eq!(names.assign("Skipped"), "Skipped.1");
        assert_eq!(names.assign("history"), "history.1");
        assert_eq!(names.assign(""), "sheet");
        let long = "x".repeat(40);
        assert_eq!(names.assign(&long), "x".repeat(31));
        let second = names.assign(&long);
        assert_eq!(second, format!("{}.1", "x".repeat(29)));
        assert_eq!(second.len(), 31);
    }

    #[test]
    fn test_enrichment_sheets() {
        let tmp = tempfile::tempdir().unwrap();
        let mut databases = BTreeMap::new();
        databases.insert(
            "KEGG_2021_Human".to_string(),
            vec![EnrichmentTerm {
                rank: 1,
                term: "T cell receptor signaling pathway".to_string(),
                p_value: 1e-6,
                adjusted_p_value: 1e-4,
                z_score: -3.0,
                combined_score: 40.0,
                genes: vec!["CD3D".to_string(), "CD3E".to_string()],
            }],
        );
        let report = EnrichmentReport {
            results: vec![GeneSetEnrichment {
                name: "cluster_0_up".to_string(),
                num_genes: 12,
                databases,
            }],
            skipped: vec![SkippedGeneSet {
                name: "cluster_0_down".to_string(),
                num_genes: 2,
            }],
            failed: vec![FailedGeneSet {
                name: "cluster 1/up".to_string(),
                error: "timeout".to_string(),
            }],
        };
        let dir = tmp.path().join("enrichment");
        let workbook = tmp.path().join("enrichment.xlsx");
        write_enrichment_sheets(&dir, &workbook, &report).unwrap();
        let sheet = std::fs::read_to_string(dir.join("cluster_0_up.csv")).unwrap();
        assert!(sheet.contains("KEGG_2021_Human,1,T cell receptor signaling pathway"));
        assert!(sheet.contains("CD3D;CD3E"));
        insta::assert_snapshot!(std::fs::read_to_string(dir.join("skipped.csv")).unwrap(), @r"
        set_name,status,detail
        cluster_0_down,skipped,2 gene(s)
        cluster 1/up,failed,timeout
        ");
        assert_eq!(sheet_name("cluster 1/up"), "cluster_1_up");

        let wb: Xlsx<_> = open_workbook(&workbook).unwrap();
        assert_eq!(wb.sheet_names(), vec!["cluster_0_up", "skipped"]);
    }
}
