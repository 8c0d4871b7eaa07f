use anyhow::{bail, Context, Error};
use log::debug;
use reqwest::blocking::{multipart, Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::service::{parse_enrich_response, EnrichmentService, EnrichmentTerm, TransientError};

/// Public Enrichr endpoint
pub const DEFAULT_ENRICHR_URL: &str = "https://maayanlab.cloud/Enrichr";

#[derive(Deserialize)]
struct AddListResponse {
    #[serde(rename = "userListId")]
    user_list_id: u64,
}

/// Blocking client for the Enrichr REST API.
pub struct EnrichrClient {
    client: Client,
    base_url: String,
}

impl EnrichrClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<EnrichrClient, Error> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("could not build enrichment HTTP client")?;
        Ok(EnrichrClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder, endpoint: &str) -> Result<Response, Error> {
        let response = request
            .send()
            .map_err(|e| TransientError(format!("request to {} failed: {}", endpoint, e)))?;
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TransientError(format!("{} returned {}", endpoint, status)).into());
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("{} returned {}: {}", endpoint, status, body.trim());
        }
        Ok(response)
    }
}

impl EnrichmentService for EnrichrClient {
    fn add_list(&self, genes: &[String], description: &str) -> Result<u64, Error> {
        let endpoint = format!("{}/addList", self.base_url);
        let form = multipart::Form::new()
            .text("list", genes.join("\n"))
            .text("description", description.to_string());
        let response = self.send(self.client.post(&endpoint).multipart(form), &endpoint)?;
        let parsed: AddListResponse = response
            .json()
            .with_context(|| format!("invalid addList response from {}", endpoint))?;
        debug!("uploaded {} genes as list {} ({})", genes.len(), parsed.user_list_id, description);
        Ok(parsed.user_list_id)
    }

    fn enrich(&self, list_id: u64, database: &str) -> Result<Vec<EnrichmentTerm>, Error> {
        let endpoint = format!("{}/enrich", self.base_url);
        let request = self
            .client
            .get(&endpoint)
            .query(&[("userListId", list_id.to_string()), ("backgroundType", database.to_string())]);
        let body: Value = self
            .send(request, &endpoint)?
            .json()
            .with_context(|| format!("invalid enrich response from {}", endpoint))?;
        parse_enrich_response(&body, database)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let client = EnrichrClient::new("http://localhost:9/Enrichr/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:9/Enrichr");
    }

    #[test]
    fn test_unreachable_is_transient() {
        // nothing listens on the discard port
        let client = EnrichrClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = client.add_list(&["CD3D".to_string()], "probe").unwrap_err();
        assert!(crate::service::is_transient(&err));
    }
}
