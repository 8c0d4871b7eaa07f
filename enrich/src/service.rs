use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;

/// A failure worth retrying: dropped connections, timeouts, rate limiting, 5xx responses.
#[derive(Debug)]
pub struct TransientError(pub String);

impl std::error::Error for TransientError {}

impl Display for TransientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transient service error: {}", self.0)
    }
}

/// Returns true if `err` was raised as a [TransientError].
pub fn is_transient(err: &Error) -> bool {
    err.chain().any(|e| e.is::<TransientError>())
}

/// One enriched term of one library.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentTerm {
    pub rank: u32,
    pub term: String,
    pub p_value: f64,
    pub adjusted_p_value: f64,
    pub z_score: f64,
    pub combined_score: f64,
    pub genes: Vec<String>,
}

impl EnrichmentTerm {
    /// Parse one row of an Enrichr `enrich` response:
    /// `[rank, term, p, z, combined, [genes], adj_p, old_p, old_adj_p]`.
    pub fn from_row(row: &Value) -> Result<EnrichmentTerm, Error> {
        let row = row.as_array().ok_or_else(|| format_err!("enrichment row is not an array"))?;
        let num = |idx: usize, what: &str| {
            row.get(idx)
                .and_then(Value::as_f64)
                .ok_or_else(|| format_err!("enrichment row missing {}", what))
        };
        let genes = row
            .get(5)
            .and_then(Value::as_array)
            .ok_or_else(|| format_err!("enrichment row missing overlapping genes"))?
            .iter()
            .filter_map(|g| g.as_str().map(str::to_string))
            .collect();
        Ok(EnrichmentTerm {
            rank: num(0, "rank")? as u32,
            term: row
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| format_err!("enrichment row missing term"))?
                .to_string(),
            p_value: num(2, "p-value")?,
            z_score: num(3, "z-score")?,
            combined_score: num(4, "combined score")?,
            genes,
            adjusted_p_value: num(6, "adjusted p-value")?,
        })
    }
}

/// Parse the body of an Enrichr `enrich` response for `database`.
pub fn parse_enrich_response(body: &Value, database: &str) -> Result<Vec<EnrichmentTerm>, Error> {
    let rows = body
        .get(database)
        .and_then(Value::as_array)
        .ok_or_else(|| format_err!("no results for library {} in enrichment response", database))?;
    rows.iter().map(EnrichmentTerm::from_row).collect()
}

/// An over-representation service that accepts a gene list once and can then
/// be queried against named libraries.
pub trait EnrichmentService: Send + Sync {
    /// Upload a gene list, returning the service's handle for it.
    fn add_list(&self, genes: &[String], description: &str) -> Result<u64, Error>;

    /// Enrich a previously uploaded list against one library.
    fn enrich(&self, list_id: u64, database: &str) -> Result<Vec<EnrichmentTerm>, Error>;
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_enrich_response() {
        let body = json!({
            "KEGG_2021_Human": [
                [1, "T cell receptor signaling pathway", 1.5e-6, -3.2, 42.7, ["CD3D", "CD3E", "LCK"], 2.0e-4, 0, 0],
                [2, "Antigen processing", 0.01, -1.1, 5.0, ["HLA-DRA"], 0.2, 0, 0]
            ]
        });
        let terms = parse_enrich_response(&body, "KEGG_2021_Human").unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].rank, 1);
        assert_eq!(terms[0].term, "T cell receptor signaling pathway");
        assert_eq!(terms[0].genes, vec!["CD3D", "CD3E", "LCK"]);
        assert_eq!(terms[1].adjusted_p_value, 0.2);
        assert!(parse_enrich_response(&body, "GO_Biological_Process_2023").is_err());
    }

    #[test]
    fn test_malformed_row() {
        let body = json!({"lib": [[1, "term"]]});
        assert!(parse_enrich_response(&body, "lib").is_err());
    }

    #[test]
    fn test_is_transient() {
        let err = Error::new(TransientError("503".to_string())).context("enriching cluster_0_up");
        assert!(is_transient(&err));
        assert!(!is_transient(&format_err!("400 bad request")));
    }
}
