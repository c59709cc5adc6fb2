use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;

use crate::config::EndpointSection;
use crate::model::{BadgeIds, TagAssignment, strip_entity_uri};

const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

/// SPARQL query listing every badged sitelink of one client wiki.
pub fn badge_query(site_url: &str, badges: &BadgeIds) -> String {
    format!(
        "SELECT ?item ?sitelink ?name ?badge WHERE {{\n  VALUES ?badge {{ wd:{} wd:{} }}\n  ?sitelink schema:about ?item; schema:isPartOf <{}/>; schema:name ?name; wikibase:badge ?badge .\n}}",
        badges.sitelink_to_redirect,
        badges.intentional_sitelink_to_redirect,
        site_url.trim_end_matches('/'),
    )
}

pub struct QueryServiceClient {
    client: Client,
    endpoint: String,
    user_agent: String,
    max_retries: usize,
    retry_delay_ms: u64,
}

impl QueryServiceClient {
    pub fn new(endpoints: &EndpointSection) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(endpoints.timeout_ms))
            .build()
            .context("failed to build query service HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoints.query_service_url.clone(),
            user_agent: endpoints.user_agent(),
            max_retries: endpoints.max_retries,
            retry_delay_ms: endpoints.retry_delay_ms,
        })
    }

    pub fn tag_assignments(&self, site_url: &str, badges: &BadgeIds) -> Result<Vec<TagAssignment>> {
        let query = badge_query(site_url, badges);
        let body = self.run_query(&query)?;
        let parsed: SparqlResponse =
            serde_json::from_str(&body).context("failed to decode query service response")?;
        Ok(assignments_from_response(parsed))
    }

    fn run_query(&self, query: &str) -> Result<String> {
        for attempt in 0..=self.max_retries {
            let response = self
                .client
                .post(&self.endpoint)
                .header("User-Agent", self.user_agent.clone())
                .header("Accept", SPARQL_RESULTS_JSON)
                .form(&[("query", query)])
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .text()
                            .context("failed to read query service response body");
                    }
                    if attempt < self.max_retries && is_retryable_status(status) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    bail!("query service request failed with HTTP {status}");
                }
                Err(error) => {
                    if attempt < self.max_retries && (error.is_timeout() || error.is_connect()) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call query service");
                }
            }
        }
        bail!("query service request exhausted retry budget")
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        sleep(Duration::from_millis(
            self.retry_delay_ms
                .saturating_mul(2u64.saturating_pow(exponent)),
        ));
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    #[serde(default)]
    bindings: Vec<BadgeBinding>,
}

#[derive(Debug, Deserialize)]
struct BadgeBinding {
    item: Option<BindingValue>,
    sitelink: Option<BindingValue>,
    name: Option<BindingValue>,
    badge: Option<BindingValue>,
}

#[derive(Debug, Deserialize)]
struct BindingValue {
    value: String,
}

/// Rows missing the item or the badge cannot be joined and are dropped.
fn assignments_from_response(response: SparqlResponse) -> Vec<TagAssignment> {
    response
        .results
        .bindings
        .into_iter()
        .filter_map(|binding| {
            let item = binding.item?.value;
            let badge = binding.badge?.value;
            Some(TagAssignment {
                identifier: strip_entity_uri(&item).to_string(),
                site_link: binding.sitelink.map(|value| value.value).unwrap_or_default(),
                display_name: binding.name.map(|value| value.value).unwrap_or_default(),
                badge: strip_entity_uri(&badge).to_string(),
            })
        })
        .collect()
}
