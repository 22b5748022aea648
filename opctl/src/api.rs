//! HTTP client against the Hub's thin management API (spec §6), in the
//! shape of the teacher CLI's `ApiClient`: a thin `reqwest` wrapper with
//! typed `get`/`post` helpers and uniform error formatting.

use anyhow::Result;
use serde::de::DeserializeOwned;

pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self { base_url: base_url.trim_end_matches('/').to_string(), client: reqwest::Client::new() }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.client.get(format!("{}{}", self.base_url, path)).send().await?;
        Self::parse(response).await
    }

    pub async fn post<T: DeserializeOwned, B: serde::Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.client.post(format!("{}{}", self.base_url, path)).json(body).send().await?;
        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("hub request failed: {status} - {body}");
        }
        Ok(response.json().await?)
    }
}
