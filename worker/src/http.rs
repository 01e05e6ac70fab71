//! reqwest による HttpClient 実装

use std::time::Duration;

use async_trait::async_trait;
use nostrpress_core::lnurl::HttpClient;
use nostrpress_core::{CoreError, Result};
use serde_json::Value;

pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nostrpress/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::HttpError(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::HttpError(format!("GET {} returned {}", url, status)));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| CoreError::HttpError(format!("GET {}: invalid JSON: {}", url, e)))
    }
}
