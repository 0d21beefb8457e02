//! VM Inventory Cache (spec §4.F): a process-wide `id -> Vm` mapping,
//! modeled as an explicit collaborator interface rather than ambient global
//! state (Design Notes §9) so tests can substitute an in-memory stub.
//!
//! `reload_vm_cache` mirrors the teacher's `state_watcher.rs::detect_vm_changes`
//! shape: snapshot the ids currently owned, rebuild from a fresh properties
//! pass, upsert, then evict anything no longer observed.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::resolver::ResolvedInventory;
use crate::rpc::{HypervisorTransport, ObjectSpec, PropertyFilterSpec, PropertySpec};
use crate::types::{ManagedRef, Vm, VmLifecycleStatus, VmTask};

/// Explicit collaborator interface over the VM cache (Design Notes §9: "model
/// as an explicit collaborator interface" in place of ambient global state).
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn upsert(&self, vm: Vm);
    async fn evict(&self, id: &str);
    async fn get(&self, id: &str) -> Option<Vm>;
    async fn find(&self, term: &str) -> Vec<Vm>;
    async fn all(&self) -> Vec<Vm>;

    /// Apply an in-place mutation to a cached Vm, if present. Used by the VM
    /// Operations Surface to update `state`/`status`/`question`/`task`
    /// without requiring a full reload. Returns whether the id was found.
    async fn mutate(&self, id: &str, f: Box<dyn FnOnce(&mut Vm) + Send>) -> bool;
}

/// In-memory implementation backing a single endpoint's inventory.
#[derive(Default)]
pub struct InMemoryInventoryStore {
    vms: RwLock<HashMap<String, Vm>>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn upsert(&self, vm: Vm) {
        self.vms.write().await.insert(vm.id.clone(), vm);
    }

    async fn evict(&self, id: &str) {
        self.vms.write().await.remove(id);
    }

    async fn get(&self, id: &str) -> Option<Vm> {
        self.vms.read().await.get(id).cloned()
    }

    async fn find(&self, term: &str) -> Vec<Vm> {
        let vms = self.vms.read().await;
        if term.is_empty() {
            return vms.values().cloned().collect();
        }
        vms.values()
            .filter(|vm| vm.id.contains(term) || vm.name.contains(term))
            .cloned()
            .collect()
    }

    async fn all(&self) -> Vec<Vm> {
        self.vms.read().await.values().cloned().collect()
    }

    async fn mutate(&self, id: &str, f: Box<dyn FnOnce(&mut Vm) + Send>) -> bool {
        let mut vms = self.vms.write().await;
        match vms.get_mut(id) {
            Some(vm) => {
                f(vm);
                true
            }
            None => false,
        }
    }
}

const VM_PROPS: &[&str] = &[
    "name",
    "config.instanceUuid",
    "runtime",
    "summary",
    "snapshot",
    "layoutEx",
    "config.files.vmPathName",
];

/// `LoadVm` (spec §4.F): build a single [`Vm`] view from a fresh properties
/// fetch against one managed reference. Used both by `reload_vm_cache` and by
/// operations that need a refreshed view of a single VM after a mutation
/// (Start, Stop, Reconfigure, Deploy).
#[instrument(skip(transport))]
pub async fn load_vm(transport: &dyn HypervisorTransport, vm_ref: &ManagedRef, host: &str) -> Result<Vm> {
    let filter = PropertyFilterSpec {
        object_set: vec![ObjectSpec { obj: vm_ref.clone(), recurse: false }],
        prop_set: vec![PropertySpec {
            obj_type: "VirtualMachine".to_string(),
            path_set: VM_PROPS.iter().map(|s| s.to_string()).collect(),
        }],
    };
    let content = transport
        .retrieve_properties(&filter)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| HypervisorError::NotFound(format!("vm {vm_ref} not found")))?;

    let name = content.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let id = content
        .get("config.instanceUuid")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| HypervisorError::Internal(format!("vm {vm_ref} has no instanceUuid")))?;
    let runtime = content
        .get("runtime")
        .and_then(|v| v.as_runtime())
        .ok_or_else(|| HypervisorError::Internal(format!("vm {vm_ref} has no runtime")))?;
    let stats = content.get("summary").and_then(|v| v.as_summary()).map(|s| s.format_stats()).unwrap_or_default();
    let path = content.get("config.files.vmPathName").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let disk_path = content
        .get("layoutEx")
        .and_then(|v| v.as_layout())
        .and_then(|l| l.primary_disk_path())
        .unwrap_or_default();

    Ok(Vm {
        id,
        name,
        host: host.to_string(),
        path,
        disk_path,
        state: runtime.power_state,
        reference: vm_ref.to_string(),
        stats,
        status: VmLifecycleStatus::Deployed,
        question: runtime.question.clone(),
        task: None,
    })
}

/// `reloadVmCache` (spec §4.F): snapshot ids currently owned by this
/// endpoint, rebuild every VM under the resolved pool, upsert, then evict
/// any id no longer observed.
#[instrument(skip(transport, store))]
pub async fn reload_vm_cache(
    transport: &dyn HypervisorTransport,
    resolved: &ResolvedInventory,
    host: &str,
    tenant: &str,
    store: &dyn InventoryStore,
) -> Result<()> {
    let owned_before: HashSet<String> = store.all().await.into_iter().filter(|vm| vm.host == host).map(|vm| vm.id).collect();

    let pool_filter = PropertyFilterSpec {
        object_set: vec![ObjectSpec { obj: resolved.pool.clone(), recurse: false }],
        prop_set: vec![PropertySpec {
            obj_type: "ResourcePool".to_string(),
            path_set: vec!["vm".to_string()],
        }],
    };
    let pool_content = transport.retrieve_properties(&pool_filter).await?.into_iter().next();
    let vm_refs: Vec<ManagedRef> = pool_content
        .as_ref()
        .and_then(|c| c.get("vm"))
        .and_then(|v| v.as_ref_list())
        .map(<[ManagedRef]>::to_vec)
        .unwrap_or_default();

    let mut observed = HashSet::new();
    for vm_ref in &vm_refs {
        let mut vm = match load_vm(transport, vm_ref, host).await {
            Ok(vm) => vm,
            Err(err) => {
                warn!(%vm_ref, %err, "skipping vm during inventory reload");
                continue;
            }
        };

        if !vm.belongs_to_tenant(tenant) {
            continue;
        }

        // Preserve an in-flight task across the rebuild: the task tracker
        // owns task progress independently of this properties snapshot.
        if let Some(existing) = store.get(&vm.id).await {
            vm.task = existing.task;
        }

        observed.insert(vm.id.clone());
        store.upsert(vm).await;
    }

    for stale_id in owned_before.difference(&observed) {
        debug!(vm_id = stale_id, "evicting stale cache entry");
        store.evict(stale_id).await;
    }

    Ok(())
}

/// Applied by `AnswerVmQuestion` to clear a VM's pending prompt in place.
pub fn clear_question() -> Box<dyn FnOnce(&mut Vm) + Send> {
    Box::new(|vm: &mut Vm| vm.question = None)
}

/// Applied by the session monitor's task loop to keep a cached Vm's active
/// task view current without a full reload.
pub fn set_task(task: Option<VmTask>) -> Box<dyn FnOnce(&mut Vm) + Send> {
    Box::new(move |vm: &mut Vm| vm.task = task)
}

/// Applied by operations that transition lifecycle status without otherwise
/// touching the properties-derived fields (e.g. `Delete`).
pub fn set_status(status: VmLifecycleStatus) -> Box<dyn FnOnce(&mut Vm) + Send> {
    Box::new(move |vm: &mut Vm| vm.status = status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{refs, MockTransport};
    use crate::resolver::resolve;
    use crate::types::VmPowerState;

    fn config() -> crate::config::EndpointConfig {
        crate::config::EndpointConfig {
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

    #[tokio::test]
    async fn reload_upserts_matching_tenant_and_skips_others() {
        let transport = MockTransport::new();
        let cfg = config();
        let resolved = resolve(&transport, &cfg, &refs::root_folder()).await.unwrap();

        transport.seed_vm(&ManagedRef::new("VirtualMachine", "vm-1"), "alpha#ws1", "uuid-1", "[ds1] ws1/alpha.vmx", VmPowerState::Off);
        transport.seed_vm(&ManagedRef::new("VirtualMachine", "vm-2"), "beta#other", "uuid-2", "[ds1] other/beta.vmx", VmPowerState::Off);

        let store = InMemoryInventoryStore::new();
        reload_vm_cache(&transport, &resolved, &cfg.host, &cfg.tenant, &store).await.unwrap();

        assert!(store.get("uuid-1").await.is_some());
        assert!(store.get("uuid-2").await.is_none());
    }

    #[tokio::test]
    async fn reload_evicts_entries_no_longer_observed() {
        let transport = MockTransport::new();
        let cfg = config();
        let resolved = resolve(&transport, &cfg, &refs::root_folder()).await.unwrap();

        let vm_ref = ManagedRef::new("VirtualMachine", "vm-1");
        transport.seed_vm(&vm_ref, "alpha#ws1", "uuid-1", "[ds1] ws1/alpha.vmx", VmPowerState::Off);

        let store = InMemoryInventoryStore::new();
        reload_vm_cache(&transport, &resolved, &cfg.host, &cfg.tenant, &store).await.unwrap();
        assert!(store.get("uuid-1").await.is_some());

        transport.remove_vm(&vm_ref);
        reload_vm_cache(&transport, &resolved, &cfg.host, &cfg.tenant, &store).await.unwrap();
        assert!(store.get("uuid-1").await.is_none());
    }

    #[tokio::test]
    async fn reload_preserves_in_flight_task_across_rebuild() {
        let transport = MockTransport::new();
        let cfg = config();
        let resolved = resolve(&transport, &cfg, &refs::root_folder()).await.unwrap();

        transport.seed_vm(&ManagedRef::new("VirtualMachine", "vm-1"), "alpha#ws1", "uuid-1", "[ds1] ws1/alpha.vmx", VmPowerState::Off);

        let store = InMemoryInventoryStore::new();
        reload_vm_cache(&transport, &resolved, &cfg.host, &cfg.tenant, &store).await.unwrap();
        store.mutate("uuid-1", set_task(Some(VmTask::new("PowerOnVM")))).await;

        reload_vm_cache(&transport, &resolved, &cfg.host, &cfg.tenant, &store).await.unwrap();
        let vm = store.get("uuid-1").await.unwrap();
        assert!(vm.task.is_some());
    }

    #[tokio::test]
    async fn find_matches_id_or_name_substring() {
        let store = InMemoryInventoryStore::new();
        store
            .upsert(Vm {
                id: "uuid-1".into(), name: "alpha#ws1".into(), host: "esx1".into(), path: String::new(),
                disk_path: String::new(), state: VmPowerState::Off, reference: String::new(),
                stats: String::new(), status: VmLifecycleStatus::Deployed, question: None, task: None,
            })
            .await;

        assert_eq!(store.find("alpha").await.len(), 1);
        assert_eq!(store.find("uuid-1").await.len(), 1);
        assert!(store.find("nomatch").await.is_empty());
        assert_eq!(store.find("").await.len(), 1);
    }
}
