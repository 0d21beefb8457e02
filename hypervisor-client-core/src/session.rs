//! Session Monitor (spec §4.G): connect/disconnect lifecycle plus the two
//! background loops that keep the session alive and the derived state
//! current, modeled directly on the teacher's `state_watcher.rs::run`
//! interval-driven loop shape (no immediate-trigger channel is needed here;
//! spec §4.G's loops are plain `tokio::time::interval` loops).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::config::EndpointConfig;
use crate::datastore::DatastoreBrowser;
use crate::error::{HypervisorError, Result};
use crate::inventory::{reload_vm_cache, set_task, InventoryStore};
use crate::network::distributed::DistributedNetworkManager;
use crate::network::host::HostNetworkManager;
use crate::network::overlay::OverlayNetworkManager;
use crate::network::NetworkManager;
use crate::resolver::{resolve, ResolvedInventory};
use crate::rpc::HypervisorTransport;
use crate::tasks::TaskTracker;

const SESSION_TICK: Duration = Duration::from_secs(30);
const TASK_TICK: Duration = Duration::from_secs(3);
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Invariant 6 (spec §3): the session is either `Null`, `Open`, or `Faulted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Null,
    Open,
    Faulted,
}

/// Owns the live session against one hypervisor endpoint: the transport, the
/// resolved topology, the selected network manager, the task tracker, the
/// datastore browser, and the inventory cache. Callers reach these through
/// [`crate::client::HypervisorClient`] rather than directly.
pub struct HypervisorSession {
    pub(crate) config: EndpointConfig,
    pub(crate) transport: Arc<dyn HypervisorTransport>,
    pub(crate) inventory: Arc<dyn InventoryStore>,
    pub(crate) tasks: Arc<TaskTracker>,

    state: RwLock<SessionState>,
    resolved: RwLock<Option<ResolvedInventory>>,
    network: RwLock<Option<Arc<dyn NetworkManager>>>,
    datastore: RwLock<Option<Arc<DatastoreBrowser>>>,
    is_vcenter: RwLock<bool>,
    last_action: RwLock<DateTime<Utc>>,

    /// Serializes `Connect` (spec §3 lifecycle: "gated by a mutex on the
    /// config object", replaced per Design Notes §9 with an explicit
    /// connect-mutex owned by the client).
    connect_mutex: Mutex<()>,
}

impl HypervisorSession {
    pub fn new(config: EndpointConfig, transport: Arc<dyn HypervisorTransport>, inventory: Arc<dyn InventoryStore>) -> Arc<Self> {
        let tasks = Arc::new(TaskTracker::new(transport.clone()));
        Arc::new(Self {
            config,
            transport,
            inventory,
            tasks,
            state: RwLock::new(SessionState::Null),
            resolved: RwLock::new(None),
            network: RwLock::new(None),
            datastore: RwLock::new(None),
            is_vcenter: RwLock::new(false),
            last_action: RwLock::new(Utc::now()),
            connect_mutex: Mutex::new(()),
        })
    }

    /// Launch the two background loops (spec §4.G). Call once per session.
    pub fn spawn_background_loops(self: &Arc<Self>) {
        tokio::spawn(session_loop(self.clone()));
        tokio::spawn(task_loop(self.clone()));
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn resolved(&self) -> Option<ResolvedInventory> {
        self.resolved.read().await.clone()
    }

    pub async fn network(&self) -> Option<Arc<dyn NetworkManager>> {
        self.network.read().await.clone()
    }

    pub async fn datastore(&self) -> Option<Arc<DatastoreBrowser>> {
        self.datastore.read().await.clone()
    }

    pub async fn is_vcenter(&self) -> bool {
        *self.is_vcenter.read().await
    }

    /// A transport-level failure observed outside `Connect` marks the
    /// session faulted; `Connect`'s next call tears it down before doing any
    /// new work (invariant 6).
    pub async fn mark_faulted(&self) {
        *self.state.write().await = SessionState::Faulted;
    }

    /// Idempotent (spec §3); bumps `lastAction` on every call regardless of
    /// whether a handshake actually runs, since every public operation opens
    /// with `Connect()`.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_mutex.lock().await;
        *self.last_action.write().await = Utc::now();

        if matches!(*self.state.read().await, SessionState::Open) {
            return Ok(());
        }

        let content = self.transport.retrieve_service_content().await?;
        self.transport.login(&self.config.user, &self.config.password).await?;

        let resolved = resolve(self.transport.as_ref(), &self.config, &content.root_folder).await?;

        let exclude_mask = parse_exclude_mask(&self.config)?;
        let network = select_network_manager(self.transport.clone(), &self.config, &resolved, exclude_mask)?;
        network.initialize().await?;

        let datastore = Arc::new(DatastoreBrowser::new(
            self.transport.clone(),
            resolved.datacenter.clone(),
            content.datastore_namespace_manager.clone(),
        ));

        *self.resolved.write().await = Some(resolved.clone());
        *self.network.write().await = Some(network);
        *self.datastore.write().await = Some(datastore);
        *self.is_vcenter.write().await = content.about.is_vcenter();
        *self.state.write().await = SessionState::Open;

        // Reload inline; network clean() is deferred to the first
        // session-monitor tick (Design Notes §9 "bootstrap fan-out").
        reload_vm_cache(self.transport.as_ref(), &resolved, &self.config.host, &self.config.tenant, self.inventory.as_ref()).await?;

        info!(host = %self.config.host, "session established");
        Ok(())
    }

    /// Lazy teardown with a 500 ms grace period (spec §3 lifecycle).
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        tokio::time::sleep(DISCONNECT_GRACE).await;
        if let Err(err) = self.transport.logout().await {
            warn!(%err, "logout failed during disconnect");
        }
        *self.state.write().await = SessionState::Null;
        *self.resolved.write().await = None;
        *self.network.write().await = None;
        *self.datastore.write().await = None;
        info!(host = %self.config.host, "session torn down");
    }

    pub async fn touch(&self) {
        *self.last_action.write().await = Utc::now();
    }
}

fn parse_exclude_mask(config: &EndpointConfig) -> Result<Option<Regex>> {
    config
        .exclude_network_mask
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|err| HypervisorError::InvalidArgument(format!("invalid exclude_network_mask: {err}")))
}

/// Selects the network manager variant per spec §4.D: Overlay when the
/// cluster's uplink is NSX-flavored, Host for a standalone endpoint,
/// Distributed when a cluster names a standard distributed switch uplink,
/// falling back to Host if the cluster happens to expose a network system
/// directly.
fn select_network_manager(
    transport: Arc<dyn HypervisorTransport>,
    config: &EndpointConfig,
    resolved: &ResolvedInventory,
    exclude_mask: Option<Regex>,
) -> Result<Arc<dyn NetworkManager>> {
    if config.wants_overlay() && resolved.is_cluster {
        // EndpointConfig carries no separate NSX control-plane URL; the
        // endpoint's own SOAP URL doubles as the control-plane base, the
        // same way `vm_store` reuses `host` for its `{host}` substitution.
        let sddc = config.sddc.clone().unwrap_or_default();
        let manager = OverlayNetworkManager::new(config.url.clone(), sddc, exclude_mask)?;
        return Ok(Arc::new(manager));
    }

    if !resolved.is_cluster {
        let network_system = resolved
            .network_system
            .clone()
            .ok_or_else(|| HypervisorError::Internal("standalone host endpoint exposes no network system".to_string()))?;
        return Ok(Arc::new(HostNetworkManager::new(transport, network_system, exclude_mask)));
    }

    if let (Some(switch), Some(uuid)) = (resolved.distributed_switch.clone(), resolved.distributed_switch_uuid.clone()) {
        return Ok(Arc::new(DistributedNetworkManager::new(transport, switch, uuid, exclude_mask)));
    }

    if let Some(network_system) = resolved.network_system.clone() {
        return Ok(Arc::new(HostNetworkManager::new(transport, network_system, exclude_mask)));
    }

    Err(HypervisorError::Internal("no network manager variant could be selected for this endpoint".to_string()))
}

async fn session_loop(session: Arc<HypervisorSession>) {
    let mut ticker = tokio::time::interval(SESSION_TICK);
    let mut tick_count: u64 = 0;
    loop {
        ticker.tick().await;
        tick_count = tick_count.wrapping_add(1);
        session_tick(&session, tick_count).await;
    }
}

async fn session_tick(session: &HypervisorSession, tick_count: u64) {
    let idle = Utc::now().signed_duration_since(*session.last_action.read().await);
    if idle.num_minutes() > session.config.keep_alive_minutes {
        info!(host = %session.config.host, "idle timeout exceeded, disconnecting");
        session.disconnect().await;
        return;
    }

    if matches!(*session.state.read().await, SessionState::Open) {
        let resolved = session.resolved.read().await.clone();
        if let Some(resolved) = resolved {
            let result = reload_vm_cache(
                session.transport.as_ref(),
                &resolved,
                &session.config.host,
                &session.config.tenant,
                session.inventory.as_ref(),
            )
            .await;

            match result {
                Ok(()) => {}
                Err(err) if err.is_server_too_busy() => {
                    warn!(host = %session.config.host, "endpoint reports too busy, disconnecting");
                    session.disconnect().await;
                    return;
                }
                Err(err) => warn!(host = %session.config.host, %err, "vm cache reload failed"),
            }
        }

        if tick_count % 2 == 0 {
            if let Some(network) = session.network.read().await.clone() {
                if let Err(err) = network.clean().await {
                    warn!(host = %session.config.host, %err, "network clean failed");
                }
            }
        }
    }

    if matches!(*session.state.read().await, SessionState::Null | SessionState::Faulted) {
        if let Err(err) = session.connect().await {
            warn!(host = %session.config.host, %err, "reconnect attempt failed");
        }
    }
}

async fn task_loop(session: Arc<HypervisorSession>) {
    let mut ticker = tokio::time::interval(TASK_TICK);
    loop {
        ticker.tick().await;
        let updates = session.tasks.tick().await;
        for update in updates {
            let terminal = update.progress == 100 || update.progress < 0;
            if terminal {
                session.inventory.mutate(&update.vm_id, set_task(None)).await;
            } else {
                let progress = update.progress;
                session
                    .inventory
                    .mutate(
                        &update.vm_id,
                        Box::new(move |vm| {
                            if let Some(task) = vm.task.as_mut() {
                                task.progress = progress;
                            }
                        }),
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::InMemoryInventoryStore;
    use crate::mock::{refs, MockTransport};

    fn config() -> EndpointConfig {
        EndpointConfig {
            host: "esx1.lab.example.com".into(),
            url: "https://esx1.lab.example.com/sdk".into(),
            user: "admin".into(),
            password: "secret".into(),
            pool_path: "dc1/cluster1/pool1".into(),
            uplink: Some("dvs1".into()),
            is_nsx_network: false,
            sddc: None,
            is_vcenter: true,
            vm_store: "[vsan] {host}".into(),
            tenant: "ws1".into(),
            exclude_network_mask: None,
            keep_alive_minutes: 10,
            ignore_certificate_errors: false,
            debug_verbose: false,
        }
    }

    fn session() -> Arc<HypervisorSession> {
        let transport: Arc<dyn HypervisorTransport> = Arc::new(MockTransport::new());
        let inventory: Arc<dyn InventoryStore> = Arc::new(InMemoryInventoryStore::new());
        HypervisorSession::new(config(), transport, inventory)
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_resolves_topology() {
        let session = session();
        session.connect().await.unwrap();
        assert_eq!(session.state().await, SessionState::Open);
        let resolved_first = session.resolved().await.unwrap();

        session.connect().await.unwrap();
        let resolved_second = session.resolved().await.unwrap();
        assert_eq!(resolved_first.cluster, resolved_second.cluster);
    }

    #[tokio::test]
    async fn disconnect_nulls_out_session_state() {
        let session = session();
        session.connect().await.unwrap();
        session.disconnect().await;
        assert_eq!(session.state().await, SessionState::Null);
        assert!(session.resolved().await.is_none());
        assert!(session.network().await.is_none());
    }

    #[tokio::test]
    async fn faulted_session_reconnects_like_null() {
        let session = session();
        session.connect().await.unwrap();
        session.mark_faulted().await;
        assert_eq!(session.state().await, SessionState::Faulted);

        session.connect().await.unwrap();
        assert_eq!(session.state().await, SessionState::Open);
    }

    #[tokio::test]
    async fn connect_selects_distributed_network_manager_on_cluster_with_uplink() {
        let session = session();
        session.connect().await.unwrap();
        let resolved = session.resolved().await.unwrap();
        assert!(resolved.is_cluster);
        assert!(resolved.distributed_switch.is_some());
        assert!(session.network().await.is_some());
    }

    #[tokio::test]
    async fn connect_falls_back_to_host_manager_without_uplink() {
        let mut cfg = config();
        cfg.uplink = None;
        let transport: Arc<dyn HypervisorTransport> = Arc::new(MockTransport::new());
        let inventory: Arc<dyn InventoryStore> = Arc::new(InMemoryInventoryStore::new());
        let session = HypervisorSession::new(cfg, transport, inventory);
        session.connect().await.unwrap();
        assert!(session.network().await.is_some());
    }

    #[tokio::test]
    async fn connect_reloads_inventory_inline() {
        let mock = MockTransport::new();
        mock.seed_vm(
            &ManagedRef::new("VirtualMachine", "vm-100"),
            "alpha#ws1",
            "uuid-100",
            "[vsan] ws1/alpha/alpha.vmdk",
            crate::types::VmPowerState::Running,
        );
        let transport: Arc<dyn HypervisorTransport> = Arc::new(mock);
        let inventory: Arc<dyn InventoryStore> = Arc::new(InMemoryInventoryStore::new());
        let session = HypervisorSession::new(config(), transport, inventory);

        session.connect().await.unwrap();

        let all = session.inventory.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "alpha#ws1");
    }

    #[test]
    fn refs_smoke() {
        // Exercises the mock topology refs used across session tests.
        assert_eq!(refs::cluster().kind, "ClusterComputeResource");
    }
}
