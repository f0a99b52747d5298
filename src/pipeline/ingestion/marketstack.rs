use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{FetchRequest, QuoteFetcher};
use crate::config::ProviderConfig;
use crate::error::{IngestError, Result};
use crate::types::RawRecord;

const PROVIDER: &str = "marketstack";

/// Client for the Marketstack `eod` endpoint. Follows offset pagination until
/// every page for the requested window has been read.
pub struct MarketstackClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    page_limit: u32,
}

#[derive(Debug, Deserialize)]
struct EodPage {
    pagination: Option<Pagination>,
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    count: u64,
    #[serde(default)]
    total: u64,
}

impl MarketstackClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            page_limit: config.page_limit,
        })
    }

    async fn fetch_page(&self, request: &FetchRequest, offset: u64) -> Result<EodPage> {
        let symbols = request.symbols.iter().cloned().collect::<Vec<_>>().join(",");
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("access_key", self.api_key.as_str()),
                ("symbols", symbols.as_str()),
                ("sort", "DESC"),
            ])
            .query(&[
                ("date_from", request.date_from.format("%Y-%m-%d").to_string()),
                ("date_to", request.date_to.format("%Y-%m-%d").to_string()),
                ("limit", self.page_limit.to_string()),
                ("offset", offset.to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(300).collect();
            return Err(IngestError::Fetch(format!(
                "{PROVIDER} responded with status {}: {}",
                status.as_u16(),
                excerpt
            )));
        }

        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl QuoteFetcher for MarketstackClient {
    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    #[instrument(skip(self, request), fields(symbols = request.symbols.len(), from = %request.date_from, to = %request.date_to))]
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawRecord>> {
        let started = Instant::now();
        let mut records = Vec::new();
        let mut offset: u64 = 0;
        let mut pages = 0usize;

        loop {
            let page = self.fetch_page(request, offset).await?;
            pages += 1;
            let page_len = page.data.len() as u64;

            for item in page.data {
                match item {
                    Value::Object(map) => records.push(map),
                    other => {
                        return Err(IngestError::Fetch(format!(
                            "{PROVIDER} returned a non-object record: {other}"
                        )))
                    }
                }
            }

            let Some(pagination) = page.pagination else {
                warn!("Response carried no pagination block; assuming single page");
                break;
            };
            let count = if pagination.count > 0 { pagination.count } else { page_len };
            debug!(offset, count, total = pagination.total, "Fetched page");
            if count == 0 {
                break;
            }
            offset += count;
            if offset >= pagination.total {
                break;
            }
        }

        info!(
            "Fetched {} raw records in {} page(s) from {} ({:.2}s)",
            records.len(),
            pages,
            PROVIDER,
            started.elapsed().as_secs_f64()
        );
        Ok(records)
    }
}
