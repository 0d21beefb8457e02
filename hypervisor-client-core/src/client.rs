//! VM Operations Surface (spec §4.H): the public entry points a caller
//! drives: Find, Start, Stop, Save, Revert, Delete, Deploy, Change,
//! Reconfigure, AnswerVmQuestion, GetTicket, Clone/Create/Delete disk,
//! Get/Folder/File-exists, SetAffinity. Every operation opens with `Connect`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{instrument, warn};

use crate::config::EndpointConfig;
use crate::datastore::DatastoreBrowser;
use crate::error::{HypervisorError, Result};
use crate::inventory::{clear_question, load_vm, set_status, set_task, InMemoryInventoryStore, InventoryStore};
use crate::network::NetworkManager;
use crate::resolver::ResolvedInventory;
use crate::rpc::{
    ClusterAffinityRuleSpec, DeviceBacking, DeviceOperation, HypervisorTransport, NewDiskDeviceSpec, NewNicDeviceSpec,
    ObjectSpec, PropertyFilterSpec, PropertySpec, VirtualDeviceConfigSpec, VirtualDeviceInfo, VirtualDeviceKind, VmConfigSpec,
};
use crate::session::HypervisorSession;
use crate::tasks::is_already_in_desired_power_state;
use crate::types::{
    ChangeFeature, DiskAdapter, ManagedRef, TaskState, Vm, VmLifecycleStatus, VmKeyValue, VmPowerState, VmTask, VmTemplate,
};

/// `blank-<size>-<adapter>.vmdk` (spec §4.H CloneDisk), e.g. `blank-20-lsilogic.vmdk`.
static BLANK_DISK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^blank-(\d+)-([A-Za-z]+)(?:\.\w+)?$").unwrap());

/// Entry point a caller holds for the lifetime of its relationship with one
/// hypervisor endpoint. Cheap to clone; wraps an `Arc<HypervisorSession>`.
pub struct HypervisorClient {
    session: Arc<HypervisorSession>,
}

impl HypervisorClient {
    /// Construct against a real transport, with a private in-memory
    /// inventory. Background loops start immediately.
    pub fn new(config: EndpointConfig, transport: Arc<dyn HypervisorTransport>) -> Arc<Self> {
        let inventory: Arc<dyn InventoryStore> = Arc::new(InMemoryInventoryStore::new());
        Self::with_inventory(config, transport, inventory)
    }

    /// Construct with a caller-supplied inventory store, e.g. one shared
    /// across endpoints or substituted in tests.
    pub fn with_inventory(config: EndpointConfig, transport: Arc<dyn HypervisorTransport>, inventory: Arc<dyn InventoryStore>) -> Arc<Self> {
        let session = HypervisorSession::new(config, transport, inventory);
        session.spawn_background_loops();
        Arc::new(Self { session })
    }

    async fn require_resolved(&self) -> Result<ResolvedInventory> {
        self.session
            .resolved()
            .await
            .ok_or_else(|| HypervisorError::Internal("session not connected".to_string()))
    }

    async fn require_network(&self) -> Result<Arc<dyn NetworkManager>> {
        self.session
            .network()
            .await
            .ok_or_else(|| HypervisorError::Internal("network manager not initialized".to_string()))
    }

    async fn require_datastore(&self) -> Result<Arc<DatastoreBrowser>> {
        self.session
            .datastore()
            .await
            .ok_or_else(|| HypervisorError::Internal("datastore browser not initialized".to_string()))
    }

    async fn get_vm(&self, id: &str) -> Result<Vm> {
        self.session
            .inventory
            .get(id)
            .await
            .ok_or_else(|| HypervisorError::NotFound(format!("vm {id} not found")))
    }

    fn vm_ref(vm: &Vm) -> Result<ManagedRef> {
        vm.reference.parse()
    }

    /// **Find(term)**: reload the cache, then return entries whose `id` or
    /// `name` contain `term`; an empty term returns every owned entry.
    #[instrument(skip(self))]
    pub async fn find(&self, term: &str) -> Result<Vec<Vm>> {
        self.session.connect().await?;
        let resolved = self.require_resolved().await?;
        crate::inventory::reload_vm_cache(
            self.session.transport.as_ref(),
            &resolved,
            &self.session.config.host,
            &self.session.config.tenant,
            self.session.inventory.as_ref(),
        )
        .await?;
        Ok(self.session.inventory.find(term).await)
    }

    /// **Start(id)**: power on if not already running, then push the VM's
    /// annotation out as guestinfo via a `guest` Reconfigure.
    #[instrument(skip(self))]
    pub async fn start(&self, id: &str) -> Result<Vm> {
        self.session.connect().await?;
        let vm = self.get_vm(id).await?;

        if vm.state != VmPowerState::Running {
            let vm_ref = Self::vm_ref(&vm)?;
            let task = self.session.transport.power_on(&vm_ref).await?;
            let info = self.session.tasks.wait_for_task(&task).await?;
            if info.state == TaskState::Error && !is_already_in_desired_power_state(&info, VmPowerState::Running) {
                return Err(HypervisorError::TaskError(info.error_message()));
            }
            self.session
                .inventory
                .mutate(id, Box::new(|vm: &mut Vm| vm.state = VmPowerState::Running))
                .await;
            self.reconfigure(id, ChangeFeature::Guest, None, "").await?;
        }

        self.get_vm(id).await
    }

    /// **Stop(id)**: power off if not already off.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<Vm> {
        self.session.connect().await?;
        let vm = self.get_vm(id).await?;

        if vm.state != VmPowerState::Off {
            let vm_ref = Self::vm_ref(&vm)?;
            let task = self.session.transport.power_off(&vm_ref).await?;
            let info = self.session.tasks.wait_for_task(&task).await?;
            if info.state == TaskState::Error && !is_already_in_desired_power_state(&info, VmPowerState::Off) {
                return Err(HypervisorError::TaskError(info.error_message()));
            }
            self.session
                .inventory
                .mutate(id, Box::new(|vm: &mut Vm| vm.state = VmPowerState::Off))
                .await;
        }

        self.get_vm(id).await
    }

    async fn current_snapshot(&self, vm_ref: &ManagedRef) -> Result<Option<ManagedRef>> {
        let filter = PropertyFilterSpec {
            object_set: vec![ObjectSpec { obj: vm_ref.clone(), recurse: false }],
            prop_set: vec![PropertySpec { obj_type: "VirtualMachine".to_string(), path_set: vec!["snapshot".to_string()] }],
        };
        let content = self.session.transport.retrieve_properties(&filter).await?.into_iter().next();
        Ok(content
            .and_then(|c| c.get("snapshot").and_then(|v| v.as_snapshot()).cloned())
            .and_then(|s| s.current_snapshot))
    }

    /// **Save(id)**: refuses to save over a foreign workspace's disk (spec
    /// invariant 3), otherwise creates a fresh "Root Snap" and consolidates
    /// away the previous one. A removal still running after the 500 ms grace
    /// window is handed off to the task loop rather than blocking the caller.
    #[instrument(skip(self))]
    pub async fn save(&self, id: &str) -> Result<Vm> {
        self.session.connect().await?;
        let vm = self.get_vm(id).await?;

        let tag = vm.workspace_tag();
        if !tag.is_empty() && !vm.disk_path.contains(tag) {
            return Err(HypervisorError::InvalidArgument(format!(
                "save refused: vm {id} disk path {} does not belong to workspace {tag}",
                vm.disk_path
            )));
        }

        let vm_ref = Self::vm_ref(&vm)?;
        let previous_snapshot = self.current_snapshot(&vm_ref).await?;

        let description = Utc::now().to_rfc3339();
        let snapshot_task = self.session.transport.create_snapshot(&vm_ref, "Root Snap", &description, false, false).await?;
        let snapshot_info = self.session.tasks.wait_for_task(&snapshot_task).await?;
        if snapshot_info.state == TaskState::Error {
            return Err(HypervisorError::TaskError(snapshot_info.error_message()));
        }

        if let Some(previous) = previous_snapshot {
            let removal_task = self.session.transport.remove_snapshot(&previous, false, true).await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            let info = self.session.tasks.poll_once(&removal_task).await?;
            if !info.state.is_terminal() {
                self.session.tasks.register_vm_task(id, removal_task);
                self.session.inventory.mutate(id, set_task(Some(VmTask::new("RemoveSnapshot")))).await;
                return self.get_vm(id).await;
            }
            if info.state == TaskState::Error {
                return Err(HypervisorError::TaskError(info.error_message()));
            }
        }

        self.get_vm(id).await
    }

    /// **Revert(id)**: revert to the current snapshot, restarting the VM
    /// afterward if it was running beforehand.
    #[instrument(skip(self))]
    pub async fn revert(&self, id: &str) -> Result<Vm> {
        self.session.connect().await?;
        let vm = self.get_vm(id).await?;
        let vm_ref = Self::vm_ref(&vm)?;
        let was_running = vm.state == VmPowerState::Running;

        let task = self.session.transport.revert_to_current_snapshot(&vm_ref).await?;
        let info = self.session.tasks.wait_for_task(&task).await?;
        if info.state == TaskState::Error {
            return Err(HypervisorError::TaskError(info.error_message()));
        }

        let refreshed = load_vm(self.session.transport.as_ref(), &vm_ref, &self.session.config.host).await?;
        self.session.inventory.upsert(refreshed).await;

        if was_running {
            self.start(id).await
        } else {
            self.get_vm(id).await
        }
    }

    async fn evict_with_retry(&self, id: &str) -> Result<()> {
        self.session.inventory.evict(id).await;
        if self.session.inventory.get(id).await.is_none() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.session.inventory.evict(id).await;
        if self.session.inventory.get(id).await.is_none() {
            Ok(())
        } else {
            Err(HypervisorError::RaceRetry(format!("vm {id} still present in cache after delete")))
        }
    }

    /// **Delete(id)**: stop, release network ownership, unregister, remove
    /// the VM's datastore folder, then evict the cache entry.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.session.connect().await?;
        let vm = self.stop(id).await?;
        let vm_ref = Self::vm_ref(&vm)?;

        if let Some(network) = self.session.network().await {
            network.unprovision(&vm_ref).await?;
        }

        self.session.transport.unregister_vm(&vm_ref).await?;

        let folder = vm.path.rsplit_once('/').map(|(folder, _)| folder).unwrap_or(vm.path.as_str());
        let datacenter = self.require_resolved().await?.datacenter;
        let delete_task = self.session.transport.delete_datastore_file(&datacenter, folder).await?;
        let info = self.session.tasks.wait_for_task(&delete_task).await?;
        if info.state == TaskState::Error {
            return Err(HypervisorError::TaskError(info.error_message()));
        }

        self.session.inventory.mutate(id, set_status(VmLifecycleStatus::Initialized)).await;
        self.evict_with_retry(id).await
    }

    fn nic_spec(network: &dyn NetworkManager, net: &str) -> NewNicDeviceSpec {
        let mut device = VirtualDeviceInfo {
            key: 0,
            label: String::new(),
            kind: VirtualDeviceKind::EthernetCard,
            backing: None,
            connected: false,
        };
        network.update_ethernet_card_backing(&mut device, net);
        let switch_uuid = match device.backing {
            Some(DeviceBacking::PortGroup { switch_uuid, .. }) => switch_uuid,
            _ => None,
        };
        NewNicDeviceSpec { port_group: net.to_string(), switch_uuid }
    }

    fn build_create_spec(&self, template: &VmTemplate, network: &dyn NetworkManager) -> VmConfigSpec {
        let new_nics = template.nics.iter().map(|nic| Self::nic_spec(network, &nic.net)).collect();
        let new_disks = template
            .disks
            .iter()
            .map(|d| NewDiskDeviceSpec { datastore_path: d.path.clone(), size_gib: d.size_gib, controller: d.controller })
            .collect();
        let store = self.session.config.resolved_vm_store();
        let vm_path_name = format!("{store}/{name}/{name}.vmx", store = store, name = template.name);
        let extra_config = template.guestinfo.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        VmConfigSpec {
            name: Some(template.name.clone()),
            guest_id: Some(template.guest_id.clone()),
            num_cpus: Some(template.cpu),
            memory_mb: Some(template.memory_mb),
            annotation: None,
            vm_path_name: Some(vm_path_name),
            extra_config,
            new_disks,
            new_nics,
            new_iso: template.iso.clone(),
            boot_delay_ms: None,
            device_change: Vec::new(),
        }
    }

    /// **Deploy(template)**: provision networking, create the VM, load its
    /// inventory view, snapshot it as "Root Snap", then `Start` if the
    /// template asked for autostart.
    #[instrument(skip(self, template))]
    pub async fn deploy(&self, template: &VmTemplate) -> Result<Vm> {
        self.session.connect().await?;
        let network = self.require_network().await?;
        network.provision(template).await?;

        let resolved = self.require_resolved().await?;
        let spec = self.build_create_spec(template, network.as_ref());

        let create_task = self.session.transport.create_vm(&resolved.vm_folder, &resolved.pool, None, &spec).await?;
        let create_info = self.session.tasks.wait_for_task(&create_task).await?;
        if create_info.state == TaskState::Error {
            return Err(HypervisorError::TaskError(create_info.error_message()));
        }
        let created = self.session.transport.search_result(&create_task).await?;
        let vm_ref = created
            .first()
            .map(|f| ManagedRef::new("VirtualMachine", f.path.clone()))
            .ok_or_else(|| HypervisorError::Internal("createVM task carried no result".to_string()))?;

        let nets: Vec<String> = template.nics.iter().map(|n| n.net.clone()).collect();
        network.bind_ownership(&vm_ref, &nets).await?;

        let mut vm = load_vm(self.session.transport.as_ref(), &vm_ref, &self.session.config.host).await?;
        vm.status = VmLifecycleStatus::Deployed;
        self.session.inventory.upsert(vm.clone()).await;

        let description = Utc::now().to_rfc3339();
        let snapshot_task = self.session.transport.create_snapshot(&vm_ref, "Root Snap", &description, false, false).await?;
        let snapshot_info = self.session.tasks.wait_for_task(&snapshot_task).await?;
        if snapshot_info.state == TaskState::Error {
            return Err(HypervisorError::TaskError(snapshot_info.error_message()));
        }

        if template.auto_start {
            self.start(&vm.id).await
        } else {
            Ok(vm)
        }
    }

    /// **Change(id, kv)**: split the value on `:`, the tail (if present)
    /// selecting a target device by label or index, and dispatch to
    /// `Reconfigure`.
    #[instrument(skip(self, kv))]
    pub async fn change(&self, id: &str, kv: &VmKeyValue) -> Result<Vm> {
        let feature = ChangeFeature::parse(&kv.key)?;
        let (value, label) = kv.split_label();
        self.reconfigure(id, feature, label, value).await
    }

    async fn select_device(&self, vm_ref: &ManagedRef, kind: VirtualDeviceKind, selector: Option<&str>) -> Result<VirtualDeviceInfo> {
        let filter = PropertyFilterSpec {
            object_set: vec![ObjectSpec { obj: vm_ref.clone(), recurse: false }],
            prop_set: vec![PropertySpec { obj_type: "VirtualMachine".to_string(), path_set: vec!["config.hardware.device".to_string()] }],
        };
        let content = self
            .session
            .transport
            .retrieve_properties(&filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| HypervisorError::NotFound(format!("vm {vm_ref} not found")))?;
        let devices: Vec<VirtualDeviceInfo> = content.get("config.hardware.device").and_then(|v| v.as_device_list()).map(<[_]>::to_vec).unwrap_or_default();
        let matching: Vec<&VirtualDeviceInfo> = devices.iter().filter(|d| d.kind == kind).collect();

        let found = match selector {
            Some(token) => match token.parse::<usize>() {
                Ok(index) => matching.get(index).map(|d| (*d).clone()),
                Err(_) => matching.into_iter().find(|d| d.label == token).cloned(),
            },
            None => matching.first().map(|d| (*d).clone()),
        };

        found.ok_or_else(|| HypervisorError::NotFound(format!("no matching {kind:?} device for selector {selector:?} on {vm_ref}")))
    }

    /// **Reconfigure(id, feature, label, value)**: select the target device
    /// (by label if given, else by index) for `iso`/`net`/`eth`, or mutate
    /// boot/annotation state directly for `boot`/`guest`, then submit one
    /// `reconfigVM` and return the refreshed Vm.
    #[instrument(skip(self, value))]
    pub async fn reconfigure(&self, id: &str, feature: ChangeFeature, label: Option<&str>, value: &str) -> Result<Vm> {
        self.session.connect().await?;
        let vm = self.get_vm(id).await?;
        let vm_ref = Self::vm_ref(&vm)?;
        let mut spec = VmConfigSpec::default();

        match feature {
            ChangeFeature::Iso => {
                let device = self.select_device(&vm_ref, VirtualDeviceKind::Cdrom, label).await?;
                spec.device_change.push(VirtualDeviceConfigSpec {
                    operation: DeviceOperation::Edit,
                    key: device.key,
                    backing: Some(DeviceBacking::IsoFile { file_name: value.to_string() }),
                    connected: Some(true),
                    start_connected: Some(true),
                });
            }
            ChangeFeature::Net | ChangeFeature::Eth => {
                let device = self.select_device(&vm_ref, VirtualDeviceKind::EthernetCard, label).await?;
                if value.starts_with("_none_") {
                    spec.device_change.push(VirtualDeviceConfigSpec {
                        operation: DeviceOperation::Edit,
                        key: device.key,
                        backing: Some(DeviceBacking::Disconnected),
                        connected: Some(false),
                        start_connected: Some(false),
                    });
                } else {
                    let network = self.require_network().await?;
                    let mut target = device;
                    network.update_ethernet_card_backing(&mut target, value);
                    spec.device_change.push(VirtualDeviceConfigSpec {
                        operation: DeviceOperation::Edit,
                        key: target.key,
                        backing: target.backing,
                        connected: Some(true),
                        start_connected: Some(true),
                    });
                }
            }
            ChangeFeature::Boot => {
                let delay = value
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| HypervisorError::InvalidArgument(format!("invalid boot delay: {value}")))?;
                spec.boot_delay_ms = Some(delay);
            }
            ChangeFeature::Guest => {
                let mut annotation = value.to_string();
                if !annotation.ends_with('\n') {
                    annotation.push('\n');
                }
                spec.annotation = Some(annotation);
                if vm.state == VmPowerState::Running {
                    for line in value.split(['\r', '\n']).filter(|l| !l.is_empty()) {
                        if let Some((k, v)) = line.split_once('=') {
                            spec.extra_config.push((k.to_string(), v.to_string()));
                        }
                    }
                }
            }
        }

        let task = self.session.transport.reconfig_vm(&vm_ref, &spec).await?;
        let info = self.session.tasks.wait_for_task(&task).await?;
        if info.state == TaskState::Error {
            return Err(HypervisorError::TaskError(info.error_message()));
        }

        let refreshed = load_vm(self.session.transport.as_ref(), &vm_ref, &self.session.config.host).await?;
        self.session.inventory.upsert(refreshed.clone()).await;
        Ok(refreshed)
    }

    /// **GetTicket(id)**: acquire an MKS/WebMKS console ticket and format it
    /// as a `wss://` URL, omitting port 443.
    #[instrument(skip(self))]
    pub async fn get_ticket(&self, id: &str) -> Result<String> {
        self.session.connect().await?;
        let vm = self.get_vm(id).await?;
        let vm_ref = Self::vm_ref(&vm)?;
        let ticket = self.session.transport.acquire_ticket(&vm_ref, "webmks").await?;
        let authority = match ticket.port {
            Some(port) if port != 443 => format!("{}:{}", ticket.host, port),
            _ => ticket.host.clone(),
        };
        Ok(format!("wss://{authority}/ticket/{}", ticket.ticket))
    }

    /// **AnswerVmQuestion(id, qid, answer)**: submit the answer and clear
    /// the cached pending question.
    #[instrument(skip(self))]
    pub async fn answer_vm_question(&self, id: &str, question_id: &str, answer_id: &str) -> Result<()> {
        self.session.connect().await?;
        let vm = self.get_vm(id).await?;
        let vm_ref = Self::vm_ref(&vm)?;
        self.session.transport.answer_vm(&vm_ref, question_id, answer_id).await?;
        self.session.inventory.mutate(id, clear_question()).await;
        Ok(())
    }

    /// **CloneDisk(src, dest)**: creates `dest`'s parent directory, then
    /// either allocates a thin blank disk (`blank-<size>-<adapter>.vmdk`
    /// source names) or copies `src` onto `dest`. The resulting task is
    /// registered under `dest` in the keyed task map after a 1 s settle
    /// delay, dodging the empty-`TaskInfo` race some endpoints exhibit right
    /// after task creation.
    #[instrument(skip(self))]
    pub async fn clone_disk(&self, src: &str, dest: &str) -> Result<()> {
        self.session.connect().await?;
        let datacenter = self.require_resolved().await?.datacenter;

        let dest_folder = dest.rsplit_once('/').map(|(folder, _)| folder).unwrap_or(dest);
        self.session.transport.make_directory(&datacenter, dest_folder, true).await?;

        let task = if let Some(captures) = BLANK_DISK.captures(src) {
            let size_gib: u64 = captures[1].parse().map_err(|_| HypervisorError::InvalidArgument(format!("malformed blank disk size in {src}")))?;
            let controller = DiskAdapter::from_token(&captures[2])
                .ok_or_else(|| HypervisorError::InvalidArgument(format!("unknown disk adapter in {src}")))?;
            self.session.transport.create_virtual_disk(&datacenter, dest, size_gib, controller).await?
        } else {
            self.session.transport.copy_virtual_disk(&datacenter, src, &datacenter, dest).await?
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        self.session.tasks.register_keyed_task(dest, task);
        Ok(())
    }

    /// **TaskProgress(id)**: `-1` unknown, `0` registered but not yet
    /// polled, `[0,99]` while running, `100` on either terminal outcome.
    /// Callers poll this after `CloneDisk` or any operation that registers a
    /// task under `_tasks`/`_taskMap` instead of awaiting it inline.
    pub fn task_progress(&self, id: &str) -> i32 {
        self.session.tasks.task_progress(id)
    }

    /// **CreateDisk**: fires the create and returns without waiting (spec
    /// §9 Open Question 1; kept as intentional fire-and-forget async, not
    /// exposed through the keyed task map since no destination key is
    /// threaded through this overload).
    #[instrument(skip(self))]
    pub async fn create_disk(&self, name: &str, size_gib: u64, controller: DiskAdapter) -> Result<()> {
        self.session.connect().await?;
        let datacenter = self.require_resolved().await?.datacenter;
        self.session.transport.create_virtual_disk(&datacenter, name, size_gib, controller).await?;
        Ok(())
    }

    /// **DeleteDisk**: straightforward RPC proxy, awaited to completion.
    #[instrument(skip(self))]
    pub async fn delete_disk(&self, name: &str) -> Result<()> {
        self.session.connect().await?;
        let datacenter = self.require_resolved().await?.datacenter;
        let task = self.session.transport.delete_virtual_disk(&datacenter, name).await?;
        let info = self.session.tasks.wait_for_task(&task).await?;
        if info.state == TaskState::Error {
            return Err(HypervisorError::TaskError(info.error_message()));
        }
        Ok(())
    }

    /// **GetFiles/FolderExists/FileExists**: proxy to the datastore browser
    /// against the resolved cluster (spec §4.C).
    #[instrument(skip(self))]
    pub async fn get_files(&self, path: &str, recursive: bool) -> Result<Vec<String>> {
        self.session.connect().await?;
        let datastore = self.require_datastore().await?;
        let resolved = self.require_resolved().await?;
        datastore.get_files(&resolved.cluster, path, recursive).await
    }

    #[instrument(skip(self))]
    pub async fn folder_exists(&self, path: &str) -> Result<bool> {
        self.session.connect().await?;
        let datastore = self.require_datastore().await?;
        let resolved = self.require_resolved().await?;
        datastore.folder_exists(&resolved.cluster, path).await
    }

    #[instrument(skip(self))]
    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        self.session.connect().await?;
        let datastore = self.require_datastore().await?;
        let resolved = self.require_resolved().await?;
        datastore.file_exists(&resolved.cluster, path).await
    }

    /// **SetAffinity(tag, vms, start)**: adds a mandatory, enabled
    /// `ClusterAffinityRule` named `Affinity#<tag>` on cluster endpoints,
    /// then starts the named VMs concurrently if `start` is set.
    #[instrument(skip(self, vm_ids))]
    pub async fn set_affinity(&self, tag: &str, vm_ids: &[String], start: bool) -> Result<()> {
        self.session.connect().await?;
        let resolved = self.require_resolved().await?;
        if !resolved.is_cluster {
            return Err(HypervisorError::InvalidArgument("affinity rules require a cluster endpoint".to_string()));
        }

        let mut vm_refs = Vec::with_capacity(vm_ids.len());
        for id in vm_ids {
            let vm = self.get_vm(id).await?;
            vm_refs.push(Self::vm_ref(&vm)?);
        }

        let rule = ClusterAffinityRuleSpec { name: format!("Affinity#{tag}"), enabled: true, mandatory: true, vms: vm_refs };
        let task = self.session.transport.reconfigure_cluster(&resolved.cluster, &rule, true).await?;
        let info = self.session.tasks.wait_for_task(&task).await?;
        if info.state == TaskState::Error {
            return Err(HypervisorError::TaskError(info.error_message()));
        }

        if start {
            let results = futures::future::join_all(vm_ids.iter().map(|id| self.start(id))).await;
            for (id, result) in vm_ids.iter().zip(results) {
                if let Err(err) = result {
                    warn!(vm_id = id, %err, "affinity start failed for one vm");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{refs, MockTransport};
    use crate::types::{DiskAdapter, VmDisk, VmNic, VmPowerState};

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

    fn client() -> Arc<HypervisorClient> {
        let transport: Arc<dyn HypervisorTransport> = Arc::new(MockTransport::new());
        HypervisorClient::new(config(), transport)
    }

    fn template(name: &str) -> VmTemplate {
        VmTemplate {
            name: name.to_string(),
            guest_id: "otherGuest".into(),
            cpu: 2,
            memory_mb: 2048,
            disks: vec![VmDisk { path: "[vsan] ws1/alpha/disk.vmdk".into(), size_gib: 10, controller: DiskAdapter::LsiLogic }],
            nics: vec![VmNic { net: "lan".into() }],
            iso: None,
            guestinfo: Default::default(),
            auto_start: true,
            host_affinity_tag: None,
        }
    }

    #[tokio::test]
    async fn deploy_start_stop_delete_round_trip() {
        let client = client();
        let vm = client.deploy(&template("alpha#ws1")).await.unwrap();
        assert_eq!(vm.state, VmPowerState::Running);
        assert_eq!(vm.status, VmLifecycleStatus::Deployed);

        let stopped = client.stop(&vm.id).await.unwrap();
        assert_eq!(stopped.state, VmPowerState::Off);

        client.delete(&vm.id).await.unwrap();
        assert!(client.get_vm(&vm.id).await.is_err());
    }

    #[tokio::test]
    async fn idempotent_start_accepts_already_running_backend() {
        let mock = Arc::new(MockTransport::new());
        let vm_ref = ManagedRef::new("VirtualMachine", "vm-1");
        mock.seed_vm(&vm_ref, "alpha#ws1", "uuid-1", "[ds1] ws1/alpha.vmx", VmPowerState::Running);
        let transport: Arc<dyn HypervisorTransport> = mock;
        let client = HypervisorClient::new(config(), transport);

        client.session.connect().await.unwrap();

        // Force the local cache stale (Off) so Start issues the power-on RPC
        // and exercises the idempotent-already-on detection path.
        client.session.inventory.mutate("uuid-1", Box::new(|vm: &mut Vm| vm.state = VmPowerState::Off)).await;

        let started = client.start("uuid-1").await.unwrap();
        assert_eq!(started.state, VmPowerState::Running);
    }

    #[tokio::test]
    async fn save_refuses_foreign_workspace_disk() {
        let mock = Arc::new(MockTransport::new());
        let vm_ref = ManagedRef::new("VirtualMachine", "vm-1");
        mock.seed_vm(&vm_ref, "alpha#ws1", "uuid-1", "[ds1] other-workspace/alpha.vmx", VmPowerState::Off);
        let transport: Arc<dyn HypervisorTransport> = mock;
        let client = HypervisorClient::new(config(), transport);

        client.session.connect().await.unwrap();

        let err = client.save("uuid-1").await.unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn reconfigure_iso_by_index_targets_second_cdrom() {
        let mock = Arc::new(MockTransport::new());
        let transport: Arc<dyn HypervisorTransport> = mock.clone();
        let client = HypervisorClient::new(config(), transport);

        let vm = client.deploy(&template("alpha#ws1")).await.unwrap();
        let vm_ref: ManagedRef = vm.reference.parse().unwrap();

        let devices = vec![
            VirtualDeviceInfo { key: 200, label: "CD/DVD drive 1".into(), kind: VirtualDeviceKind::Cdrom, backing: None, connected: false },
            VirtualDeviceInfo { key: 201, label: "CD/DVD drive 2".into(), kind: VirtualDeviceKind::Cdrom, backing: None, connected: false },
        ];
        mock.set_device_list(&vm_ref, devices);

        let refreshed = client
            .reconfigure(&vm.id, ChangeFeature::Iso, Some("1"), "[ds1] isos/linux.iso")
            .await
            .unwrap();
        assert_eq!(refreshed.id, vm.id);
    }

    #[tokio::test]
    async fn get_ticket_omits_default_port() {
        let client = client();
        let vm = client.deploy(&template("alpha#ws1")).await.unwrap();
        let url = client.get_ticket(&vm.id).await.unwrap();
        assert!(url.starts_with("wss://esx1.lab.example.com/ticket/"));
        assert!(!url.contains(":443"));
    }

    #[tokio::test]
    async fn clone_disk_from_blank_template_registers_keyed_task() {
        let client = client();
        client.session.connect().await.unwrap();
        client.clone_disk("blank-40-lsilogic.vmdk", "[ds1] ws1/a.vmdk").await.unwrap();
        let progress = client.session.tasks.task_progress("[ds1] ws1/a.vmdk");
        assert!(progress >= 0);
    }

    #[tokio::test]
    async fn set_affinity_rejects_non_cluster_endpoint() {
        let mut cfg = config();
        cfg.uplink = None;
        let transport: Arc<dyn HypervisorTransport> = Arc::new(MockTransport::new());
        let client = HypervisorClient::new(cfg, transport);
        client.session.connect().await.unwrap();
        let err = client.set_affinity("ws1", &[], false).await.unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn set_affinity_issues_rule_and_starts_vms() {
        let client = client();
        let a = client.deploy(&template("alpha#ws1")).await.unwrap();
        let mut tpl_b = template("beta#ws1");
        tpl_b.auto_start = false;
        let b = client.deploy(&tpl_b).await.unwrap();
        client.stop(&b.id).await.unwrap();

        client.set_affinity("ws1", &[a.id.clone(), b.id.clone()], true).await.unwrap();
        let refreshed_b = client.get_vm(&b.id).await.unwrap();
        assert_eq!(refreshed_b.state, VmPowerState::Running);
    }

    #[test]
    fn refs_smoke() {
        assert_eq!(refs::cluster().kind, "ClusterComputeResource");
    }
}
