//! Issues concurrent range queries to an external metrics scraper.
//!
//! Grounded on `original_source/report_handler.py::prom_raw`: five
//! PromQL-shaped range queries keyed by the session's container name,
//! fetched concurrently, `end` rounded down to the nearest 30s with a
//! 1-hour look-back. `aiohttp.ClientSession` + `asyncio.gather` becomes
//! `reqwest` + `futures::future::join_all`.

use std::collections::HashMap;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::clock::now_s;
use crate::error::{Result, SandboxError};
use crate::util::{http_client, round_down_to};

const DEFAULT_STEP_S: u64 = 2;
const LOOKBACK_S: u64 = 3600;
const ROUND_TO_S: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricFamily {
    CpuPercent,
    WorkingSetMemory,
    FilesystemUsage,
    FilesystemThroughput,
    NetworkThroughput,
}

impl MetricFamily {
    pub fn identifier(self) -> &'static str {
        match self {
            MetricFamily::CpuPercent => "cpu_percent",
            MetricFamily::WorkingSetMemory => "memory_working_set",
            MetricFamily::FilesystemUsage => "filesystem_usage",
            MetricFamily::FilesystemThroughput => "filesystem_throughput",
            MetricFamily::NetworkThroughput => "network_throughput",
        }
    }

    fn promql(self, container_name_pattern: &str) -> String {
        match self {
            MetricFamily::CpuPercent => format!(
                r#"sum by (name) (rate(container_cpu_usage_seconds_total{{name=~"{container_name_pattern}"}}[1m])) * 100"#
            ),
            MetricFamily::WorkingSetMemory => format!(
                r#"container_memory_working_set_bytes{{name=~"{container_name_pattern}"}}"#
            ),
            MetricFamily::FilesystemUsage => {
                format!(r#"(container_fs_usage_bytes{{name="{container_name_pattern}"}})"#)
            }
            MetricFamily::FilesystemThroughput => format!(
                r#"sum by (name) (rate(container_fs_reads_bytes_total{{name="{container_name_pattern}"}}[1m]) + rate(container_fs_writes_bytes_total{{name="{container_name_pattern}"}}[1m]))"#
            ),
            MetricFamily::NetworkThroughput => format!(
                r#"sum by (name) (rate(container_network_receive_bytes_total{{name=~"{container_name_pattern}"}}[1m]) + rate(container_network_transmit_bytes_total{{name=~"{container_name_pattern}"}}[1m]))"#
            ),
        }
    }
}

const ALL_FAMILIES: [MetricFamily; 5] = [
    MetricFamily::CpuPercent,
    MetricFamily::WorkingSetMemory,
    MetricFamily::FilesystemUsage,
    MetricFamily::FilesystemThroughput,
    MetricFamily::NetworkThroughput,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMetricSeries {
    pub metric: String,
    pub query: String,
    pub response: serde_json::Value,
}

pub struct ScraperAdapter {
    base_url: String,
}

impl ScraperAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }

    async fn fetch_one(&self, family: MetricFamily, container_name_pattern: &str, start: u64, end: u64, step_s: u64) -> Result<RawMetricSeries> {
        let client = http_client()?;
        let url = format!("{}/api/v1/query_range", self.base_url.trim_end_matches('/'));
        let query = family.promql(container_name_pattern);

        let mut params: HashMap<&str, String> = HashMap::new();
        params.insert("query", query.clone());
        params.insert("start", start.to_string());
        params.insert("end", end.to_string());
        params.insert("step", format!("{step_s}s"));

        let response = client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|err| SandboxError::Scraper(format!("querying {}: {err}", family.identifier())))?;

        if !response.status().is_success() {
            return Err(SandboxError::Scraper(format!(
                "scraper returned {} for {}",
                response.status(),
                family.identifier()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| SandboxError::Scraper(format!("decoding response for {}: {err}", family.identifier())))?;

        Ok(RawMetricSeries {
            metric: family.identifier().to_string(),
            query,
            response: body,
        })
    }

    /// Fetch all five metric families for `session_id`'s container,
    /// concurrently, over the default look-back window (spec.md §4.7).
    pub async fn fetch_session_window(&self, session_id: &str, step_s: u64) -> Result<Vec<RawMetricSeries>> {
        let step_s = if step_s == 0 { DEFAULT_STEP_S } else { step_s };
        let end = round_down_to(now_s(), ROUND_TO_S);
        let start = end.saturating_sub(LOOKBACK_S);
        let container_name_pattern = format!("sandbox_{session_id}");

        let futures = ALL_FAMILIES
            .iter()
            .map(|family| self.fetch_one(*family, &container_name_pattern, start, end, step_s));
        let results = join_all(futures).await;

        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_all_five_families_concurrently() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .and(query_param("step", "2s"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "success"})))
            .expect(5)
            .mount(&server)
            .await;

        let adapter = ScraperAdapter::new(server.uri());
        let results = adapter.fetch_session_window("abc123", 2).await.unwrap();
        assert_eq!(results.len(), 5);
    }

    #[tokio::test]
    async fn http_error_surfaces_as_scraper_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let adapter = ScraperAdapter::new(server.uri());
        let err = adapter.fetch_session_window("abc123", 2).await.unwrap_err();
        assert!(matches!(err, SandboxError::Scraper(_)));
    }
}
