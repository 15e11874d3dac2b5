//! HTTP liveness over reqwest

use super::HttpLiveness;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

pub struct ReqwestLiveness {
    client: reqwest::Client,
}

impl ReqwestLiveness {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpLiveness for ReqwestLiveness {
    async fn get_status(&self, url: &str) -> Result<u16> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        Ok(response.status().as_u16())
    }
}
