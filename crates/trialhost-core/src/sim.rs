//! In-memory simulated backends.
//!
//! [`SimulatedCloud`] implements every backend contract against one shared
//! state, so a probe only succeeds when the whole chain exists: DNS record →
//! tunnel → route → published metadata → running instance. Faults can be
//! injected per [`Operation`], and every call is journaled.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use trialhost_common::types::metadata_file_name;
use trialhost_common::{
    InstanceId, InstanceRecord, InstanceState, MetadataDocument, PoolConfig, ProvisionError,
    Route, TunnelCredentials, TunnelToken,
};

use crate::allocator::PoolAllocator;
use crate::edge::EdgeNetwork;
use crate::lifecycle::Hypervisor;
use crate::metadata::MetadataStore;
use crate::orchestrator::Backends;
use crate::readiness::Probe;

/// Backend operations that can fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListInstances,
    CreateTunnel,
    ConfigureRouting,
    RegisterDns,
    DnsExists,
    DeleteDns,
    DestroyTunnel,
    Publish,
    Fetch,
    Unpublish,
    Clone,
    Start,
    Stop,
    Destroy,
    Probe,
}

#[derive(Debug, Clone)]
struct Tunnel {
    name: String,
    token: TunnelToken,
    route: Option<Route>,
}

#[derive(Debug, Default)]
struct State {
    tunnels: BTreeMap<String, Tunnel>,
    /// hostname → tunnel id
    dns: BTreeMap<String, String>,
    /// instance hostname → serialized document
    documents: BTreeMap<String, String>,
    instances: BTreeMap<InstanceId, InstanceRecord>,
    templates: BTreeSet<u32>,
    /// Remaining injected failures; `None` fails forever.
    faults: HashMap<Operation, Option<u32>>,
    journal: Vec<Operation>,
    next_tunnel: u64,
}

impl State {
    /// Record the call and consume an injected fault, if any.
    fn enter(&mut self, op: Operation) -> Result<(), String> {
        self.journal.push(op);
        match self.faults.get_mut(&op) {
            None => Ok(()),
            Some(None) => Err(format!("injected {op:?} failure")),
            Some(Some(remaining)) => {
                *remaining -= 1;
                if *remaining == 0 {
                    self.faults.remove(&op);
                }
                Err(format!("injected {op:?} failure"))
            }
        }
    }

    fn chain_ready(&self, host: &str) -> bool {
        let Some(tunnel_id) = self.dns.get(host) else {
            return false;
        };
        let Some(tunnel) = self.tunnels.get(tunnel_id) else {
            return false;
        };
        if tunnel.route.as_ref().is_none_or(|r| r.hostname != host) {
            return false;
        }

        let label = host.split('.').next().unwrap_or(host);
        let document = self
            .documents
            .get(label)
            .and_then(|json| serde_json::from_str::<MetadataDocument>(json).ok());
        let Some(document) = document else {
            return false;
        };
        if &document.tunnel_id != tunnel_id || document.tunnel_token != tunnel.token {
            return false;
        }

        self.instances.get(&document.vmid).is_some_and(|instance| {
            instance.hostname == label && instance.state == InstanceState::Running
        })
    }
}

/// An edge network, metadata store, hypervisor and public internet in memory.
#[derive(Debug, Default)]
pub struct SimulatedCloud {
    state: Mutex<State>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template that instances can be cloned from.
    #[must_use]
    pub fn with_template(self, template_id: u32) -> Self {
        self.state.lock().templates.insert(template_id);
        self
    }

    /// Backends wired to this cloud, with a [`PoolAllocator`] over `pool`.
    pub fn backends(self: &Arc<Self>, pool: PoolConfig) -> Backends {
        Backends {
            pool: Arc::new(PoolAllocator::new(pool, self.clone())),
            edge: self.clone(),
            metadata: self.clone(),
            hypervisor: self.clone(),
            probe: self.clone(),
        }
    }

    /// Fail every future call of `op`.
    pub fn fail_on(&self, op: Operation) {
        self.state.lock().faults.insert(op, None);
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_times(&self, op: Operation, times: u32) {
        if times > 0 {
            self.state.lock().faults.insert(op, Some(times));
        }
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Add an instance that was created outside the workflow.
    pub fn insert_instance(&self, id: InstanceId, hostname: &str) {
        self.state.lock().instances.insert(
            id,
            InstanceRecord {
                id,
                template_id: 0,
                hostname: hostname.to_string(),
                state: InstanceState::Running,
            },
        );
    }

    /// Number of calls made to `op`.
    pub fn calls(&self, op: Operation) -> usize {
        self.state.lock().journal.iter().filter(|o| **o == op).count()
    }

    /// Every call made so far, in order.
    pub fn journal(&self) -> Vec<Operation> {
        self.state.lock().journal.clone()
    }

    pub fn tunnel_count(&self) -> usize {
        self.state.lock().tunnels.len()
    }

    /// Tunnel id the DNS record for `hostname` points at.
    pub fn dns_record(&self, hostname: &str) -> Option<String> {
        self.state.lock().dns.get(hostname).cloned()
    }

    pub fn route(&self, tunnel_id: &str) -> Option<Route> {
        self.state
            .lock()
            .tunnels
            .get(tunnel_id)
            .and_then(|t| t.route.clone())
    }

    pub fn has_document(&self, hostname: &str) -> bool {
        self.state.lock().documents.contains_key(hostname)
    }

    pub fn instance(&self, id: InstanceId) -> Option<InstanceRecord> {
        self.state.lock().instances.get(&id).cloned()
    }

    /// Returns `true` if no tunnel, DNS record, document or instance is left.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.tunnels.is_empty()
            && state.dns.is_empty()
            && state.documents.is_empty()
            && state.instances.is_empty()
    }
}

#[async_trait]
impl EdgeNetwork for SimulatedCloud {
    async fn create_tunnel(&self, name: &str) -> Result<TunnelCredentials, ProvisionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state
            .enter(Operation::CreateTunnel)
            .map_err(ProvisionError::tunnel_create_failed)?;

        if let Some((id, tunnel)) = state.tunnels.iter().find(|(_, t)| t.name == name) {
            return Ok(TunnelCredentials {
                tunnel_id: id.clone(),
                token: tunnel.token.clone(),
                reused: true,
            });
        }

        state.next_tunnel += 1;
        let id = format!("sim-tunnel-{}", state.next_tunnel);
        let token = TunnelToken::new(format!("sim-token-{}", state.next_tunnel));
        state.tunnels.insert(
            id.clone(),
            Tunnel {
                name: name.to_string(),
                token: token.clone(),
                route: None,
            },
        );
        debug!(tunnel_id = %id, name, "Simulated tunnel created");

        Ok(TunnelCredentials {
            tunnel_id: id,
            token,
            reused: false,
        })
    }

    async fn configure_routing(
        &self,
        tunnel_id: &str,
        route: &Route,
    ) -> Result<(), ProvisionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state
            .enter(Operation::ConfigureRouting)
            .map_err(ProvisionError::routing_config_failed)?;

        let tunnel = state.tunnels.get_mut(tunnel_id).ok_or_else(|| {
            ProvisionError::routing_config_failed(format!("tunnel {tunnel_id} not found"))
        })?;
        tunnel.route = Some(route.clone());
        Ok(())
    }

    async fn register_dns(&self, hostname: &str, tunnel_id: &str) -> Result<(), ProvisionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state
            .enter(Operation::RegisterDns)
            .map_err(ProvisionError::dns_register_failed)?;

        if !state.tunnels.contains_key(tunnel_id) {
            return Err(ProvisionError::dns_register_failed(format!(
                "tunnel {tunnel_id} not found"
            )));
        }
        state.dns.insert(hostname.to_string(), tunnel_id.to_string());
        Ok(())
    }

    async fn dns_exists(&self, hostname: &str) -> Result<bool, ProvisionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state
            .enter(Operation::DnsExists)
            .map_err(ProvisionError::dns_lookup_failed)?;
        Ok(state.dns.contains_key(hostname))
    }

    async fn delete_dns(&self, hostname: &str) -> Result<(), ProvisionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state
            .enter(Operation::DeleteDns)
            .map_err(|r| ProvisionError::teardown_failed(format!("dns {hostname}"), r))?;
        state.dns.remove(hostname);
        Ok(())
    }

    async fn destroy_tunnel(&self, tunnel_id: &str) -> Result<(), ProvisionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state
            .enter(Operation::DestroyTunnel)
            .map_err(|r| ProvisionError::teardown_failed(format!("tunnel {tunnel_id}"), r))?;
        state.tunnels.remove(tunnel_id);
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SimulatedCloud {
    async fn publish(
        &self,
        hostname: &str,
        document: &MetadataDocument,
    ) -> Result<(), ProvisionError> {
        tokio::task::yield_now().await;
        let json = serde_json::to_string(document)
            .map_err(|e| ProvisionError::metadata_publish_failed(e.to_string()))?;

        let mut state = self.state.lock();
        state
            .enter(Operation::Publish)
            .map_err(ProvisionError::metadata_publish_failed)?;
        state.documents.insert(hostname.to_string(), json);
        Ok(())
    }

    async fn fetch(&self, hostname: &str) -> Result<Option<MetadataDocument>, ProvisionError> {
        tokio::task::yield_now().await;
        let json = {
            let mut state = self.state.lock();
            state
                .enter(Operation::Fetch)
                .map_err(ProvisionError::metadata_publish_failed)?;
            state.documents.get(hostname).cloned()
        };

        json.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| ProvisionError::metadata_publish_failed(e.to_string()))
    }

    async fn unpublish(&self, hostname: &str) -> Result<(), ProvisionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state
            .enter(Operation::Unpublish)
            .map_err(|r| ProvisionError::teardown_failed(format!("metadata {hostname}"), r))?;
        state.documents.remove(hostname);
        Ok(())
    }

    fn document_url(&self, hostname: &str) -> String {
        format!("sim://metadata/{}", metadata_file_name(hostname))
    }
}

#[async_trait]
impl Hypervisor for SimulatedCloud {
    async fn list_instance_ids(&self) -> Result<BTreeSet<InstanceId>, ProvisionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state
            .enter(Operation::ListInstances)
            .map_err(ProvisionError::hypervisor_unavailable)?;

        let mut ids: BTreeSet<InstanceId> = state.instances.keys().copied().collect();
        ids.extend(state.templates.iter().copied().map(InstanceId::new));
        Ok(ids)
    }

    async fn clone_instance(
        &self,
        template_id: u32,
        new_id: InstanceId,
        hostname: &str,
    ) -> Result<InstanceRecord, ProvisionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state
            .enter(Operation::Clone)
            .map_err(|reason| ProvisionError::CloneFailed { id: new_id, reason })?;

        if state.instances.contains_key(&new_id) || state.templates.contains(&new_id.get()) {
            return Err(ProvisionError::CloneConflict { id: new_id });
        }
        if !state.templates.contains(&template_id) {
            return Err(ProvisionError::TemplateMissing { template_id });
        }

        let record = InstanceRecord {
            id: new_id,
            template_id,
            hostname: hostname.to_string(),
            state: InstanceState::Stopped,
        };
        state.instances.insert(new_id, record.clone());
        Ok(record)
    }

    async fn start(&self, id: InstanceId) -> Result<(), ProvisionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state
            .enter(Operation::Start)
            .map_err(|r| ProvisionError::start_failed(id, r))?;

        let instance = state
            .instances
            .get_mut(&id)
            .ok_or_else(|| ProvisionError::start_failed(id, "instance does not exist"))?;
        instance.state = InstanceState::Running;
        Ok(())
    }

    async fn stop(&self, id: InstanceId) -> Result<(), ProvisionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state
            .enter(Operation::Stop)
            .map_err(|r| ProvisionError::teardown_failed(format!("instance {id}"), r))?;

        if let Some(instance) = state.instances.get_mut(&id) {
            instance.state = InstanceState::Stopped;
        }
        Ok(())
    }

    async fn destroy(&self, id: InstanceId) -> Result<(), ProvisionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state
            .enter(Operation::Destroy)
            .map_err(|r| ProvisionError::teardown_failed(format!("instance {id}"), r))?;
        state.instances.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl Probe for SimulatedCloud {
    async fn check(&self, url: &str) -> bool {
        tokio::task::yield_now().await;
        let Some(host) = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
        else {
            return false;
        };

        let mut state = self.state.lock();
        if state.enter(Operation::Probe).is_err() {
            return false;
        }
        state.chain_ready(&host)
    }
}
