//! Config-backed implementations of the orchestrator/failover resolver
//! seams (`NodeClientResolver`, `CredentialResolver`, `NetworkMappingResolver`).
//!
//! None of these own how nodes are discovered, credentials are vaulted, or
//! network mappings are authored — they just read the static registry an
//! operator maintains in `HubConfig`, matching the teacher's pattern of
//! keeping such seams as thin adapters over config rather than baking
//! policy into the core managers.

use crate::config::{CredentialsConfig, NetworksConfig, NodeRegistryConfig};
use crate::cloud::NetworkMapping;
use crate::failover::NetworkMappingResolver;
use crate::node_client::NodeClient;
use crate::orchestrator::{CredentialResolver, NodeClientResolver};
use async_trait::async_trait;
use common::wire::VCenterCredential;
use common::{Error, VmContext};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Resolves a context's vCenter host to the `NodeClient` for the node that
/// fronts it, caching constructed clients so repeated lookups don't rebuild
/// the underlying `reqwest::Client`.
pub struct ConfigNodeResolver {
    base_urls: HashMap<String, String>,
    clients: RwLock<HashMap<String, Arc<NodeClient>>>,
}

impl ConfigNodeResolver {
    pub fn new(registry: NodeRegistryConfig) -> Self {
        Self { base_urls: registry.nodes, clients: RwLock::new(HashMap::new()) }
    }
}

#[async_trait]
impl NodeClientResolver for ConfigNodeResolver {
    async fn client_for(&self, context: &VmContext) -> Result<Arc<NodeClient>, Error> {
        if let Some(client) = self.clients.read().await.get(&context.vcenter_host) {
            return Ok(client.clone());
        }
        let base_url = self.base_urls.get(&context.vcenter_host).ok_or_else(|| {
            Error::unavailable(format!("no node enrolled for vCenter host '{}'", context.vcenter_host))
        })?;
        let client = Arc::new(NodeClient::new(base_url.clone()));
        self.clients.write().await.insert(context.vcenter_host.clone(), client.clone());
        Ok(client)
    }
}

pub struct ConfigCredentialResolver {
    entries: HashMap<String, VCenterCredential>,
}

impl ConfigCredentialResolver {
    pub fn new(config: CredentialsConfig) -> Self {
        let entries = config
            .entries
            .into_iter()
            .map(|(id, e)| (id, VCenterCredential { vcenter: e.vcenter, username: e.username, password: e.password }))
            .collect();
        Self { entries }
    }
}

#[async_trait]
impl CredentialResolver for ConfigCredentialResolver {
    async fn resolve(&self, credential_id: &str) -> Result<VCenterCredential, Error> {
        self.entries
            .get(credential_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("credential '{credential_id}'")))
    }
}

pub struct ConfigNetworkResolver {
    mappings: HashMap<String, Vec<NetworkMapping>>,
}

impl ConfigNetworkResolver {
    pub fn new(config: NetworksConfig) -> Self {
        let mappings = config
            .mappings
            .into_iter()
            .map(|(context_id, entries)| {
                let mapped = entries
                    .into_iter()
                    .map(|e| NetworkMapping { source_network: e.source_network, target_network_id: e.target_network_id })
                    .collect();
                (context_id, mapped)
            })
            .collect();
        Self { mappings }
    }
}

#[async_trait]
impl NetworkMappingResolver for ConfigNetworkResolver {
    async fn mappings_for(&self, context_id: &str) -> Result<Vec<NetworkMapping>, Error> {
        Ok(self.mappings.get(context_id).cloned().unwrap_or_default())
    }
}
