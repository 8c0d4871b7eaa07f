use anyhow::{bail, format_err, Context, Error};
use flate2::bufread::MultiGzDecoder;
use log::info;
use scx_types::{Feature, FeatureBarcodeMatrix, GENE_EXPRESSION};
use sprs::TriMat;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Open a possibly gzipped text file for buffered reading
pub fn open_text(path: impl AsRef<Path>) -> Result<Box<dyn BufRead>, Error> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// First of `names` present in `dir`, or an error naming the first candidate.
fn find_file(dir: &Path, names: &[&str]) -> Result<PathBuf, Error> {
    names
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
        .ok_or_else(|| format_err!("missing input file: {}", dir.join(names[0]).display()))
}

/// Load a sparse `u32` triplet matrix from (optionally gzipped) MTX format
pub fn load_mtx(path: impl AsRef<Path>) -> Result<TriMat<u32>, Error> {
    let path = path.as_ref();
    let mut reader = open_text(path)?;
    let mut line = String::new();
    let mut mat: Option<TriMat<u32>> = None;
    let mut lineno = 0;

    loop {
        line.clear();
        let sz = reader
            .read_line(&mut line)
            .with_context(|| path.display().to_string())?;
        if sz == 0 {
            break;
        }
        lineno += 1;
        if line.starts_with('%') || line.trim().is_empty() {
            continue;
        }
        let ctx = || format!("{}:{}", path.display(), lineno);
        let mut data = line.split_whitespace();
        let mut next_usize = |what: &str| -> Result<usize, Error> {
            data.next()
                .ok_or_else(|| format_err!("missing {}", what))?
                .parse::<usize>()
                .map_err(Error::from)
        };
        match mat.as_mut() {
            None => {
                let nrow = next_usize("NROW").with_context(ctx)?;
                let ncol = next_usize("NCOL").with_context(ctx)?;
                let nnz = next_usize("NNZ").with_context(ctx)?;
                mat = Some(TriMat::with_capacity((nrow, ncol), nnz));
            }
            Some(m) => {
                let row = next_usize("ROW").with_context(ctx)?;
                let col = next_usize("COL").with_context(ctx)?;
                let val = data
                    .next()
                    .ok_or_else(|| format_err!("missing VAL"))
                    .and_then(|v| v.parse::<u32>().map_err(Error::from))
                    .with_context(ctx)?;
                if row == 0 || col == 0 || row > m.rows() || col > m.cols() {
                    bail!("{}: entry ({}, {}) outside a {}x{} matrix", ctx(), row, col, m.rows(), m.cols());
                }
                m.add_triplet(row - 1, col - 1, val);
            }
        }
    }

    let Some(matrix) = mat else { bail!("no matrix found in {}", path.display()) };
    Ok(matrix)
}

/// Parse a 10x feature list: `id <TAB> name [<TAB> type]`. Legacy two-column
/// lists carry gene expression only.
pub fn load_features(path: impl AsRef<Path>) -> Result<Vec<Feature>, Error> {
    let path = path.as_ref();
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_reader(open_text(path)?);
    let mut features = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record.with_context(|| path.display().to_string())?;
        let id = record
            .get(0)
            .ok_or_else(|| format_err!("{}: line {} has no feature id", path.display(), i + 1))?;
        let name = record.get(1).unwrap_or(id);
        let feature_type = record.get(2).unwrap_or(GENE_EXPRESSION);
        features.push(Feature {
            id: id.to_string(),
            name: name.to_string(),
            feature_type: feature_type.to_string(),
        });
    }
    Ok(features)
}

/// One barcode per line
pub fn load_barcodes(path: impl AsRef<Path>) -> Result<Vec<String>, Error> {
    let path = path.as_ref();
    let mut barcodes = Vec::new();
    for line in open_text(path)?.lines() {
        let line = line.with_context(|| path.display().to_string())?;
        let bc = line.trim();
        if !bc.is_empty() {
            barcodes.push(bc.to_string());
        }
    }
    Ok(barcodes)
}

/// Load a 10x feature-barcode matrix directory (`matrix.mtx`, `features.tsv`
/// or legacy `genes.tsv`, `barcodes.tsv`, each optionally gzipped).
pub fn load_10x_dir(dir: impl AsRef<Path>) -> Result<FeatureBarcodeMatrix, Error> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        bail!("missing matrix directory: {}", dir.display());
    }
    let matrix_path = find_file(dir, &["matrix.mtx.gz", "matrix.mtx"])?;
    let features_path = find_file(dir, &["features.tsv.gz", "features.tsv", "genes.tsv.gz", "genes.tsv"])?;
    let barcodes_path = find_file(dir, &["barcodes.tsv.gz", "barcodes.tsv"])?;

    let features = load_features(&features_path)?;
    let barcodes = load_barcodes(&barcodes_path)?;
    let matrix = load_mtx(&matrix_path)?;
    let fbm = FeatureBarcodeMatrix::new(barcodes, features, matrix.to_csr())
        .with_context(|| dir.display().to_string())?;
    info!(
        "loaded {} features x {} barcodes ({} nonzero) from {}",
        fbm.num_features(),
        fbm.num_barcodes(),
        fbm.matrix.nnz(),
        dir.display()
    );
    Ok(fbm)
}
