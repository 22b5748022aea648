//! HTTP client the Hub uses to reach a Node's control API through the
//! reverse tunnel's remote forward (spec §6). The tunnel terminates on the
//! Hub at a local port per enrolled node; this client just speaks plain
//! JSON over that loopback port, exactly like any other `reqwest` caller in
//! this codebase.

use common::wire::{
    CbtStatusResponse, CleanupRequest, DiscoverRequest, DiscoverResponse, HealthResponse, JobStatusResponse,
    PowerOpRequest, PowerOpResponse, PowerStateResponse, ProgressResponse, ReplicateRequest, ReplicateResponse,
};
use common::Error;
use std::time::Duration;

pub struct NodeClient {
    base_url: String,
    client: reqwest::Client,
}

impl NodeClient {
    /// `base_url` is the Hub-local loopback address the tunnel's remote
    /// forward exposes for this node, e.g. `http://127.0.0.1:9201`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), client: reqwest::Client::new() }
    }

    async fn post<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
        deadline: Duration,
    ) -> Result<Resp, Error> {
        let response = tokio::time::timeout(
            deadline,
            self.client.post(format!("{}{}", self.base_url, path)).json(body).send(),
        )
        .await
        .map_err(|_| Error::unavailable(format!("node call to {path} timed out")))?
        .map_err(|e| Error::unavailable(format!("node unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::unavailable(format!("node returned status {} for {path}", response.status())));
        }
        response.json().await.map_err(|e| Error::unavailable(format!("invalid node response: {e}")))
    }

    async fn get<Resp: serde::de::DeserializeOwned>(&self, path: &str, deadline: Duration) -> Result<Resp, Error> {
        let response = tokio::time::timeout(deadline, self.client.get(format!("{}{}", self.base_url, path)).send())
            .await
            .map_err(|_| Error::unavailable(format!("node call to {path} timed out")))?
            .map_err(|e| Error::unavailable(format!("node unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::unavailable(format!("node returned status {} for {path}", response.status())));
        }
        response.json().await.map_err(|e| Error::unavailable(format!("invalid node response: {e}")))
    }

    pub async fn discover(&self, req: &DiscoverRequest, deadline: Duration) -> Result<DiscoverResponse, Error> {
        self.post("/api/v1/discover", req, deadline).await
    }

    pub async fn replicate(&self, req: &ReplicateRequest, deadline: Duration) -> Result<ReplicateResponse, Error> {
        self.post("/api/v1/replicate", req, deadline).await
    }

    pub async fn cleanup(&self, req: &CleanupRequest, deadline: Duration) -> Result<(), Error> {
        let _: serde_json::Value = self.post("/api/v1/cleanup", req, deadline).await?;
        Ok(())
    }

    pub async fn progress(&self, job_id: &str, deadline: Duration) -> Result<ProgressResponse, Error> {
        self.get(&format!("/api/v1/progress/{job_id}"), deadline).await
    }

    pub async fn job_status(&self, job_id: &str, deadline: Duration) -> Result<JobStatusResponse, Error> {
        self.get(&format!("/api/v1/status/{job_id}"), deadline).await
    }

    pub async fn cbt_status(
        &self,
        vm_path: &str,
        vcenter: &str,
        username: &str,
        password: &str,
        deadline: Duration,
    ) -> Result<CbtStatusResponse, Error> {
        self.get(
            &format!(
                "/api/v1/vms/{vm_path}/cbt-status?vcenter={vcenter}&username={username}&password={password}"
            ),
            deadline,
        )
        .await
    }

    pub async fn power_off(&self, vm_id: &str, req: &PowerOpRequest, deadline: Duration) -> Result<PowerOpResponse, Error> {
        self.post(&format!("/api/v1/vm/{vm_id}/power-off"), req, deadline).await
    }

    pub async fn power_on(&self, vm_id: &str, req: &PowerOpRequest, deadline: Duration) -> Result<PowerOpResponse, Error> {
        self.post(&format!("/api/v1/vm/{vm_id}/power-on"), req, deadline).await
    }

    pub async fn power_state(&self, vm_id: &str, deadline: Duration) -> Result<PowerStateResponse, Error> {
        self.get(&format!("/api/v1/vm/{vm_id}/power-state"), deadline).await
    }

    pub async fn health(&self, deadline: Duration) -> Result<HealthResponse, Error> {
        self.get("/api/v1/health", deadline).await
    }
}
