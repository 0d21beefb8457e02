//! Mock hypervisor endpoint for testing and development.
//!
//! Simulates a SOAP endpoint's object graph and property bag in memory so
//! the rest of this crate can be exercised without a real vCenter/ESXi host.
//! Seeded with a small, fixed topology ([`MockTransport::new`]): one
//! datacenter, one cluster, one resource pool, one standalone host, one
//! distributed switch, and two datastores (one classic, one object-store).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{HypervisorError, Result};
use crate::rpc::{
    AboutInfo, ClusterAffinityRuleSpec, ConfigManagerInfo, DatastoreCapabilityInfo, DatastoreFileInfo,
    FileLayoutEx, HypervisorTransport, LayoutFileInfo, ObjectContent, PropertyFilterSpec, PropertyValue,
    RuntimeInfo, SearchSpec, ServiceContent, TicketInfo, VmConfigSpec, VmSnapshotInfo, VmSummaryInfo,
};
use crate::types::{DiskAdapter, ManagedRef, TaskInfo, TaskState, VmPowerState};

/// Fixed refs for the seeded topology, exposed so tests can address objects
/// without re-deriving string ids.
pub mod refs {
    use crate::types::ManagedRef;

    pub fn root_folder() -> ManagedRef {
        ManagedRef::new("Folder", "group-d1")
    }
    pub fn datacenter() -> ManagedRef {
        ManagedRef::new("Datacenter", "datacenter-1")
    }
    pub fn vm_folder() -> ManagedRef {
        ManagedRef::new("Folder", "group-v1")
    }
    pub fn host_folder() -> ManagedRef {
        ManagedRef::new("Folder", "group-h1")
    }
    pub fn network_folder() -> ManagedRef {
        ManagedRef::new("Folder", "group-n1")
    }
    pub fn cluster() -> ManagedRef {
        ManagedRef::new("ClusterComputeResource", "domain-c1")
    }
    pub fn root_pool() -> ManagedRef {
        ManagedRef::new("ResourcePool", "resgroup-1")
    }
    pub fn pool() -> ManagedRef {
        ManagedRef::new("ResourcePool", "resgroup-2")
    }
    pub fn host() -> ManagedRef {
        ManagedRef::new("HostSystem", "host-1")
    }
    pub fn network_system() -> ManagedRef {
        ManagedRef::new("HostNetworkSystem", "hostnetwork-1")
    }
    pub fn dvs() -> ManagedRef {
        ManagedRef::new("DistributedVirtualSwitch", "dvs-1")
    }
    pub fn classic_datastore() -> ManagedRef {
        ManagedRef::new("Datastore", "datastore-ds1")
    }
    pub fn object_store_datastore() -> ManagedRef {
        ManagedRef::new("Datastore", "datastore-vsan")
    }
    pub fn classic_browser() -> ManagedRef {
        ManagedRef::new("HostDatastoreBrowser", "browser-ds1")
    }
    pub fn object_store_browser() -> ManagedRef {
        ManagedRef::new("HostDatastoreBrowser", "browser-vsan")
    }
}

#[derive(Clone)]
struct MockTask {
    /// Number of polls still required before the task flips terminal.
    remaining_polls: u32,
    terminal: TaskState,
    description: Option<String>,
    error: Option<String>,
    progress: i32,
    search_results: Vec<DatastoreFileInfo>,
}

impl MockTask {
    fn immediate_success() -> Self {
        Self {
            remaining_polls: 0,
            terminal: TaskState::Success,
            description: None,
            error: None,
            progress: 100,
            search_results: Vec::new(),
        }
    }

    fn immediate_error(description: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            remaining_polls: 0,
            terminal: TaskState::Error,
            description: Some(description.into()),
            error: Some(error.into()),
            progress: -1,
            search_results: Vec::new(),
        }
    }
}

#[derive(Default)]
struct MockState {
    objects: HashMap<ManagedRef, HashMap<String, PropertyValue>>,
    tasks: HashMap<String, MockTask>,
    port_groups: HashMap<String, Vec<String>>,
    dv_portgroups: HashMap<String, Vec<ManagedRef>>,
    task_counter: u64,
}

/// In-memory stand-in for a real vSphere endpoint.
pub struct MockTransport {
    state: RwLock<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        info!("creating mock hypervisor transport");
        let mut objects = HashMap::new();

        objects.insert(
            refs::root_folder(),
            HashMap::from([(
                "childEntity".to_string(),
                PropertyValue::RefList(vec![refs::datacenter()]),
            )]),
        );

        objects.insert(
            refs::datacenter(),
            HashMap::from([
                ("name".to_string(), PropertyValue::Str("dc1".to_string())),
                ("vmFolder".to_string(), PropertyValue::Ref(refs::vm_folder())),
                ("hostFolder".to_string(), PropertyValue::Ref(refs::host_folder())),
                ("networkFolder".to_string(), PropertyValue::Ref(refs::network_folder())),
            ]),
        );

        objects.insert(
            refs::host_folder(),
            HashMap::from([(
                "childEntity".to_string(),
                PropertyValue::RefList(vec![refs::cluster()]),
            )]),
        );

        objects.insert(
            refs::network_folder(),
            HashMap::from([(
                "childEntity".to_string(),
                PropertyValue::RefList(vec![refs::dvs()]),
            )]),
        );

        objects.insert(
            refs::cluster(),
            HashMap::from([
                ("name".to_string(), PropertyValue::Str("cluster1".to_string())),
                ("resourcePool".to_string(), PropertyValue::Ref(refs::root_pool())),
                ("host".to_string(), PropertyValue::RefList(vec![refs::host()])),
                (
                    "datastore".to_string(),
                    PropertyValue::RefList(vec![refs::classic_datastore(), refs::object_store_datastore()]),
                ),
            ]),
        );

        objects.insert(
            refs::root_pool(),
            HashMap::from([(
                "resourcePool".to_string(),
                PropertyValue::RefList(vec![refs::pool()]),
            )]),
        );

        objects.insert(
            refs::pool(),
            HashMap::from([
                ("name".to_string(), PropertyValue::Str("pool1".to_string())),
                ("vm".to_string(), PropertyValue::RefList(vec![])),
            ]),
        );

        objects.insert(
            refs::host(),
            HashMap::from([(
                "configManager".to_string(),
                PropertyValue::ConfigManager(ConfigManagerInfo {
                    network_system: Some(refs::network_system()),
                }),
            )]),
        );

        objects.insert(
            refs::dvs(),
            HashMap::from([
                ("name".to_string(), PropertyValue::Str("dvs1".to_string())),
                ("uuid".to_string(), PropertyValue::Str(Uuid::new_v4().to_string())),
            ]),
        );

        objects.insert(
            refs::classic_datastore(),
            HashMap::from([
                ("summary.name".to_string(), PropertyValue::Str("ds1".to_string())),
                ("summary.url".to_string(), PropertyValue::Str("ds:///vmfs/volumes/ds1/".to_string())),
                (
                    "capability".to_string(),
                    PropertyValue::Capability(DatastoreCapabilityInfo {
                        top_level_directory_create_supported: true,
                    }),
                ),
                ("browser".to_string(), PropertyValue::Ref(refs::classic_browser())),
            ]),
        );

        objects.insert(
            refs::object_store_datastore(),
            HashMap::from([
                ("summary.name".to_string(), PropertyValue::Str("vsan".to_string())),
                ("summary.url".to_string(), PropertyValue::Str("ds:///vmfs/volumes/vsan/".to_string())),
                (
                    "capability".to_string(),
                    PropertyValue::Capability(DatastoreCapabilityInfo {
                        top_level_directory_create_supported: false,
                    }),
                ),
                ("browser".to_string(), PropertyValue::Ref(refs::object_store_browser())),
            ]),
        );

        Self {
            state: RwLock::new(MockState {
                objects,
                tasks: HashMap::new(),
                port_groups: HashMap::new(),
                dv_portgroups: HashMap::new(),
                task_counter: 0,
            }),
        }
    }

    fn next_task_ref(&self, state: &mut MockState) -> ManagedRef {
        state.task_counter += 1;
        ManagedRef::new("Task", format!("task-{}", state.task_counter))
    }

    fn register_task(&self, task: MockTask) -> ManagedRef {
        let mut state = self.state.write().unwrap();
        let task_ref = self.next_task_ref(&mut state);
        state.tasks.insert(task_ref.value.clone(), task);
        task_ref
    }

    /// Register an already-existing task ref with a number of polls to take
    /// before it flips terminal, for tests exercising in-flight progress
    /// (e.g. `CloneDisk`'s monotonic progress scenario).
    pub fn set_task_delay(&self, task: &ManagedRef, polls: u32) {
        let mut state = self.state.write().unwrap();
        if let Some(t) = state.tasks.get_mut(&task.value) {
            t.remaining_polls = polls;
        }
    }

    fn object(&self, r: &ManagedRef) -> Option<HashMap<String, PropertyValue>> {
        self.state.read().unwrap().objects.get(r).cloned()
    }

    fn set_prop(&self, r: &ManagedRef, key: &str, value: PropertyValue) {
        self.state
            .write()
            .unwrap()
            .objects
            .entry(r.clone())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Seed a VM into the inventory. Exposed for test setup.
    #[allow(clippy::too_many_arguments)]
    pub fn seed_vm(
        &self,
        vm_ref: &ManagedRef,
        name: &str,
        instance_uuid: &str,
        disk_path: &str,
        power_state: VmPowerState,
    ) {
        let mut props = HashMap::new();
        props.insert("name".to_string(), PropertyValue::Str(name.to_string()));
        props.insert(
            "config.instanceUuid".to_string(),
            PropertyValue::Str(instance_uuid.to_string()),
        );
        props.insert(
            "runtime".to_string(),
            PropertyValue::Runtime(RuntimeInfo { power_state, question: None }),
        );
        props.insert(
            "summary".to_string(),
            PropertyValue::Summary(VmSummaryInfo {
                overall_status: "green".to_string(),
                guest_memory_usage: 512,
                max_memory_usage: 1024,
                overall_cpu_usage: 250,
                max_cpu_usage: 1000,
            }),
        );
        props.insert(
            "snapshot".to_string(),
            PropertyValue::Snapshot(VmSnapshotInfo::default()),
        );
        props.insert(
            "layoutEx".to_string(),
            PropertyValue::Layout(FileLayoutEx {
                file: vec![LayoutFileInfo {
                    name: disk_path.to_string(),
                    file_type: "diskDescriptor".to_string(),
                }],
            }),
        );
        props.insert(
            "config.hardware.device".to_string(),
            PropertyValue::DeviceList(Vec::new()),
        );
        let folder = disk_path.rsplit_once('/').map(|(f, _)| f).unwrap_or(disk_path);
        props.insert(
            "config.files.vmPathName".to_string(),
            PropertyValue::Str(format!("{folder}/{name}.vmx")),
        );
        self.state.write().unwrap().objects.insert(vm_ref.clone(), props);

        let mut state = self.state.write().unwrap();
        if let Some(pool_props) = state.objects.get_mut(&refs::pool()) {
            if let Some(PropertyValue::RefList(vms)) = pool_props.get_mut("vm") {
                if !vms.contains(vm_ref) {
                    vms.push(vm_ref.clone());
                }
            }
        }
    }

    /// Replace a VM's `config.hardware.device` list, for tests exercising
    /// `Reconfigure`'s by-label/by-index device selection.
    pub fn set_device_list(&self, vm_ref: &ManagedRef, devices: Vec<crate::rpc::VirtualDeviceInfo>) {
        self.set_prop(vm_ref, "config.hardware.device", PropertyValue::DeviceList(devices));
    }

    pub fn remove_vm(&self, vm_ref: &ManagedRef) {
        let mut state = self.state.write().unwrap();
        state.objects.remove(vm_ref);
        if let Some(pool_props) = state.objects.get_mut(&refs::pool()) {
            if let Some(PropertyValue::RefList(vms)) = pool_props.get_mut("vm") {
                vms.retain(|v| v != vm_ref);
            }
        }
    }
}

#[async_trait]
impl HypervisorTransport for MockTransport {
    #[instrument(skip(self))]
    async fn retrieve_service_content(&self) -> Result<ServiceContent> {
        Ok(ServiceContent {
            root_folder: refs::root_folder(),
            property_collector: ManagedRef::new("PropertyCollector", "propertyCollector"),
            file_manager: ManagedRef::new("FileManager", "FileManager"),
            virtual_disk_manager: ManagedRef::new("VirtualDiskManager", "VirtualDiskManager"),
            datastore_namespace_manager: ManagedRef::new("DatastoreNamespaceManager", "DatastoreNamespaceManager"),
            about: AboutInfo { api_type: "VirtualCenter".to_string() },
        })
    }

    #[instrument(skip(self, password))]
    async fn login(&self, user: &str, password: &str) -> Result<()> {
        debug!(user, "mock login");
        if password.is_empty() {
            return Err(HypervisorError::TaskError("invalid login credentials".to_string()));
        }
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }

    #[instrument(skip(self, filter))]
    async fn retrieve_properties(&self, filter: &PropertyFilterSpec) -> Result<Vec<ObjectContent>> {
        let Some(spec) = filter.object_set.first() else {
            return Ok(Vec::new());
        };

        if spec.obj.kind == "Task" {
            let mut state = self.state.write().unwrap();
            let task = state
                .tasks
                .get_mut(&spec.obj.value)
                .ok_or_else(|| HypervisorError::NotFound(format!("unknown task {}", spec.obj.value)))?;

            let info = if task.remaining_polls > 0 {
                task.remaining_polls -= 1;
                task.progress = (task.progress + 25).min(99).max(0);
                TaskInfo::running(task.progress)
            } else {
                match task.terminal {
                    TaskState::Success => TaskInfo::success(),
                    TaskState::Error => TaskInfo::error(
                        task.description.clone().unwrap_or_default(),
                        task.error.clone().unwrap_or_default(),
                    ),
                    _ => TaskInfo::running(task.progress),
                }
            };

            let mut props = HashMap::new();
            props.insert("info".to_string(), PropertyValue::Task(info));
            return Ok(vec![ObjectContent { obj: spec.obj.clone(), props }]);
        }

        let props = self.object(&spec.obj).unwrap_or_default();

        let wanted: Vec<&str> = filter
            .prop_set
            .iter()
            .flat_map(|p| p.path_set.iter().map(String::as_str))
            .collect();

        let filtered = if wanted.is_empty() {
            props
        } else {
            props
                .into_iter()
                .filter(|(k, _)| wanted.contains(&k.as_str()))
                .collect()
        };

        Ok(vec![ObjectContent { obj: spec.obj.clone(), props: filtered }])
    }

    #[instrument(skip(self))]
    async fn power_on(&self, vm: &ManagedRef) -> Result<ManagedRef> {
        let mut props = self.object(vm).ok_or_else(|| HypervisorError::NotFound(vm.to_string()))?;
        let already_running = matches!(
            props.get("runtime").and_then(|v| v.as_runtime()),
            Some(r) if r.power_state == VmPowerState::Running
        );
        if already_running {
            return Ok(self.register_task(MockTask::immediate_error(
                "PowerOnVM",
                "The attempted operation cannot be performed in the current state (Powered on)",
            )));
        }
        props.insert(
            "runtime".to_string(),
            PropertyValue::Runtime(RuntimeInfo { power_state: VmPowerState::Running, question: None }),
        );
        self.state.write().unwrap().objects.insert(vm.clone(), props);
        Ok(self.register_task(MockTask::immediate_success()))
    }

    #[instrument(skip(self))]
    async fn power_off(&self, vm: &ManagedRef) -> Result<ManagedRef> {
        let mut props = self.object(vm).ok_or_else(|| HypervisorError::NotFound(vm.to_string()))?;
        let already_off = matches!(
            props.get("runtime").and_then(|v| v.as_runtime()),
            Some(r) if r.power_state == VmPowerState::Off
        );
        if already_off {
            return Ok(self.register_task(MockTask::immediate_error(
                "PowerOffVM",
                "The attempted operation cannot be performed in the current state (Powered off)",
            )));
        }
        props.insert(
            "runtime".to_string(),
            PropertyValue::Runtime(RuntimeInfo { power_state: VmPowerState::Off, question: None }),
        );
        self.state.write().unwrap().objects.insert(vm.clone(), props);
        Ok(self.register_task(MockTask::immediate_success()))
    }

    #[instrument(skip(self))]
    async fn create_snapshot(
        &self,
        vm: &ManagedRef,
        name: &str,
        _description: &str,
        _memory: bool,
        _quiesce: bool,
    ) -> Result<ManagedRef> {
        let mut props = self.object(vm).ok_or_else(|| HypervisorError::NotFound(vm.to_string()))?;
        let snap_ref = ManagedRef::new("VirtualMachineSnapshot", format!("snapshot-{}", Uuid::new_v4()));
        let mut snapshot_info = props
            .get("snapshot")
            .and_then(|v| v.as_snapshot())
            .cloned()
            .unwrap_or_default();
        snapshot_info.root_snapshot_list.push(crate::rpc::SnapshotTreeInfo {
            name: name.to_string(),
            snapshot: snap_ref.clone(),
            create_time: Utc::now(),
            child_snapshot: Vec::new(),
        });
        snapshot_info.current_snapshot = Some(snap_ref);
        props.insert("snapshot".to_string(), PropertyValue::Snapshot(snapshot_info));
        self.state.write().unwrap().objects.insert(vm.clone(), props);
        Ok(self.register_task(MockTask::immediate_success()))
    }

    #[instrument(skip(self))]
    async fn remove_snapshot(&self, _snapshot: &ManagedRef, _remove_children: bool, _consolidate: bool) -> Result<ManagedRef> {
        Ok(self.register_task(MockTask::immediate_success()))
    }

    #[instrument(skip(self))]
    async fn revert_to_current_snapshot(&self, _vm: &ManagedRef) -> Result<ManagedRef> {
        Ok(self.register_task(MockTask::immediate_success()))
    }

    #[instrument(skip(self, spec))]
    async fn reconfig_vm(&self, vm: &ManagedRef, spec: &VmConfigSpec) -> Result<ManagedRef> {
        let mut props = self.object(vm).ok_or_else(|| HypervisorError::NotFound(vm.to_string()))?;
        if let Some(annotation) = &spec.annotation {
            props.insert("config.annotation".to_string(), PropertyValue::Str(annotation.clone()));
        }
        self.state.write().unwrap().objects.insert(vm.clone(), props);
        Ok(self.register_task(MockTask::immediate_success()))
    }

    #[instrument(skip(self, spec))]
    async fn create_vm(
        &self,
        _folder: &ManagedRef,
        _pool: &ManagedRef,
        _host: Option<&ManagedRef>,
        spec: &VmConfigSpec,
    ) -> Result<ManagedRef> {
        let vm_ref = ManagedRef::new("VirtualMachine", format!("vm-{}", Uuid::new_v4()));
        let instance_uuid = Uuid::new_v4().to_string();
        let disk_path = spec
            .vm_path_name
            .clone()
            .unwrap_or_else(|| format!("[ds1] {}/disk.vmdk", spec.name.clone().unwrap_or_default()));
        self.seed_vm(
            &vm_ref,
            spec.name.as_deref().unwrap_or("unnamed"),
            &instance_uuid,
            &disk_path,
            VmPowerState::Off,
        );
        Ok(self.register_task(MockTask {
            remaining_polls: 0,
            terminal: TaskState::Success,
            description: None,
            error: None,
            progress: 100,
            search_results: vec![DatastoreFileInfo { path: vm_ref.value.clone() }],
        }))
    }

    #[instrument(skip(self))]
    async fn unregister_vm(&self, vm: &ManagedRef) -> Result<()> {
        self.remove_vm(vm);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_datastore_file(&self, _datacenter: &ManagedRef, name: &str) -> Result<ManagedRef> {
        debug!(name, "mock delete datastore file");
        Ok(self.register_task(MockTask::immediate_success()))
    }

    #[instrument(skip(self))]
    async fn create_virtual_disk(
        &self,
        _datacenter: &ManagedRef,
        name: &str,
        size_gib: u64,
        controller: DiskAdapter,
    ) -> Result<ManagedRef> {
        debug!(name, size_gib, ?controller, "mock create virtual disk");
        Ok(self.register_task(MockTask::immediate_success()))
    }

    #[instrument(skip(self))]
    async fn copy_virtual_disk(
        &self,
        _source_datacenter: &ManagedRef,
        source_name: &str,
        _dest_datacenter: &ManagedRef,
        dest_name: &str,
    ) -> Result<ManagedRef> {
        debug!(source_name, dest_name, "mock copy virtual disk");
        Ok(self.register_task(MockTask::immediate_success()))
    }

    #[instrument(skip(self))]
    async fn delete_virtual_disk(&self, _datacenter: &ManagedRef, name: &str) -> Result<ManagedRef> {
        debug!(name, "mock delete virtual disk");
        Ok(self.register_task(MockTask::immediate_success()))
    }

    #[instrument(skip(self))]
    async fn make_directory(&self, _datacenter: &ManagedRef, datastore_path: &str, _create_parent_directories: bool) -> Result<()> {
        debug!(datastore_path, "mock make directory");
        Ok(())
    }

    #[instrument(skip(self, spec))]
    async fn search_datastore(&self, browser: &ManagedRef, datastore_path: &str, spec: &SearchSpec) -> Result<ManagedRef> {
        self.run_search(browser, datastore_path, spec, false)
    }

    #[instrument(skip(self, spec))]
    async fn search_datastore_subfolders(&self, browser: &ManagedRef, datastore_path: &str, spec: &SearchSpec) -> Result<ManagedRef> {
        self.run_search(browser, datastore_path, spec, true)
    }

    #[instrument(skip(self))]
    async fn convert_namespace_path_to_uuid_path(
        &self,
        _datacenter: &ManagedRef,
        _namespace_manager: &ManagedRef,
        url: &str,
    ) -> Result<String> {
        let top_level = url.rsplit('/').find(|s| !s.is_empty()).unwrap_or(url);
        Ok(format!("{:x}-{}", simple_hash(top_level), "uuid"))
    }

    #[instrument(skip(self))]
    async fn acquire_ticket(&self, vm: &ManagedRef, kind: &str) -> Result<TicketInfo> {
        debug!(%vm, kind, "mock acquire ticket");
        Ok(TicketInfo {
            ticket: format!("ticket-{}", Uuid::new_v4()),
            host: "esx1.lab.example.com".to_string(),
            port: None,
        })
    }

    #[instrument(skip(self))]
    async fn answer_vm(&self, vm: &ManagedRef, _question_id: &str, _answer_id: &str) -> Result<()> {
        let mut props = self.object(vm).ok_or_else(|| HypervisorError::NotFound(vm.to_string()))?;
        if let Some(PropertyValue::Runtime(r)) = props.get_mut("runtime") {
            r.question = None;
        }
        self.state.write().unwrap().objects.insert(vm.clone(), props);
        Ok(())
    }

    #[instrument(skip(self, rule))]
    async fn reconfigure_cluster(&self, _cluster: &ManagedRef, rule: &ClusterAffinityRuleSpec, _modify: bool) -> Result<ManagedRef> {
        debug!(name = %rule.name, count = rule.vms.len(), "mock reconfigure cluster affinity");
        Ok(self.register_task(MockTask::immediate_success()))
    }

    #[instrument(skip(self))]
    async fn add_host_port_group(&self, network_system: &ManagedRef, port_group_name: &str, _vswitch_name: &str) -> Result<()> {
        self.state
            .write()
            .unwrap()
            .port_groups
            .entry(network_system.value.clone())
            .or_default()
            .push(port_group_name.to_string());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_host_port_group(&self, network_system: &ManagedRef, port_group_name: &str) -> Result<()> {
        if let Some(groups) = self.state.write().unwrap().port_groups.get_mut(&network_system.value) {
            groups.retain(|g| g != port_group_name);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_host_port_groups(&self, network_system: &ManagedRef) -> Result<Vec<String>> {
        Ok(self
            .state
            .read()
            .unwrap()
            .port_groups
            .get(&network_system.value)
            .cloned()
            .unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn create_dv_portgroup(&self, switch: &ManagedRef, name: &str) -> Result<ManagedRef> {
        let pg_ref = ManagedRef::new("DistributedVirtualPortgroup", format!("dvportgroup-{}", Uuid::new_v4()));
        self.set_prop(&pg_ref, "name", PropertyValue::Str(name.to_string()));
        self.state
            .write()
            .unwrap()
            .dv_portgroups
            .entry(switch.value.clone())
            .or_default()
            .push(pg_ref.clone());
        Ok(self.register_task(MockTask {
            remaining_polls: 0,
            terminal: TaskState::Success,
            description: None,
            error: None,
            progress: 100,
            search_results: vec![DatastoreFileInfo { path: pg_ref.value.clone() }],
        }))
    }

    #[instrument(skip(self))]
    async fn remove_dv_portgroup(&self, portgroup: &ManagedRef) -> Result<ManagedRef> {
        let mut state = self.state.write().unwrap();
        for groups in state.dv_portgroups.values_mut() {
            groups.retain(|g| g != portgroup);
        }
        drop(state);
        Ok(self.register_task(MockTask::immediate_success()))
    }

    #[instrument(skip(self))]
    async fn list_dv_portgroups(&self, switch: &ManagedRef) -> Result<Vec<ManagedRef>> {
        Ok(self
            .state
            .read()
            .unwrap()
            .dv_portgroups
            .get(&switch.value)
            .cloned()
            .unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn search_result(&self, task: &ManagedRef) -> Result<Vec<DatastoreFileInfo>> {
        Ok(self
            .state
            .read()
            .unwrap()
            .tasks
            .get(&task.value)
            .map(|t| t.search_results.clone())
            .unwrap_or_default())
    }
}

impl MockTransport {
    fn run_search(&self, browser: &ManagedRef, datastore_path: &str, spec: &SearchSpec, _recursive: bool) -> Result<ManagedRef> {
        debug!(%browser, datastore_path, ?spec.match_pattern, "mock datastore search");
        let files = vec![DatastoreFileInfo { path: format!("{datastore_path}/seeded-file.vmdk") }];
        Ok(self.register_task(MockTask {
            remaining_polls: 0,
            terminal: TaskState::Success,
            description: None,
            error: None,
            progress: 100,
            search_results: files,
        }))
    }
}

fn simple_hash(input: &str) -> u64 {
    input.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn power_on_is_idempotent() {
        let transport = MockTransport::new();
        let vm_ref = ManagedRef::new("VirtualMachine", "vm-1");
        transport.seed_vm(&vm_ref, "alpha#ws1", "uuid-1", "[ds1] ws1/alpha.vmx", VmPowerState::Off);

        transport.power_on(&vm_ref).await.unwrap();
        let props = transport.object(&vm_ref).unwrap();
        assert!(matches!(
            props.get("runtime").and_then(|v| v.as_runtime()),
            Some(r) if r.power_state == VmPowerState::Running
        ));

        let task_ref = transport.power_on(&vm_ref).await.unwrap();
        let filter = PropertyFilterSpec {
            object_set: vec![crate::rpc::ObjectSpec { obj: task_ref, recurse: false }],
            prop_set: vec![],
        };
        let content = transport.retrieve_properties(&filter).await.unwrap();
        let info = content[0].get("info").unwrap();
        if let PropertyValue::Task(t) = info {
            assert_eq!(t.state, TaskState::Error);
            assert!(t.error_message().to_lowercase().contains("powered on"));
        } else {
            panic!("expected task property");
        }
    }

    #[tokio::test]
    async fn resolver_topology_is_reachable_from_root() {
        let transport = MockTransport::new();
        let filter = PropertyFilterSpec {
            object_set: vec![crate::rpc::ObjectSpec { obj: refs::root_folder(), recurse: false }],
            prop_set: vec![],
        };
        let content = transport.retrieve_properties(&filter).await.unwrap();
        let children = content[0].get("childEntity").unwrap().as_ref_list().unwrap();
        assert_eq!(children, &[refs::datacenter()]);
    }

    #[tokio::test]
    async fn task_with_delay_reports_progress_before_terminal() {
        let transport = MockTransport::new();
        let task_ref = transport.register_task(MockTask {
            remaining_polls: 1,
            terminal: TaskState::Success,
            description: None,
            error: None,
            progress: 0,
            search_results: Vec::new(),
        });

        let filter = PropertyFilterSpec {
            object_set: vec![crate::rpc::ObjectSpec { obj: task_ref.clone(), recurse: false }],
            prop_set: vec![],
        };
        let first = transport.retrieve_properties(&filter).await.unwrap();
        let PropertyValue::Task(info) = first[0].get("info").unwrap() else { panic!() };
        assert_eq!(info.state, TaskState::Running);

        let second = transport.retrieve_properties(&filter).await.unwrap();
        let PropertyValue::Task(info) = second[0].get("info").unwrap() else { panic!() };
        assert_eq!(info.state, TaskState::Success);
        assert_eq!(info.progress, 100);
    }
}
