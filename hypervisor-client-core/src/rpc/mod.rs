//! Transport-level client against the hypervisor SDK (spec §4.A).
//!
//! [`HypervisorTransport`] is the single seam between this crate's logic and
//! the wire. A real endpoint talks SOAP over HTTP ([`soap::SoapTransport`]);
//! tests talk to an in-memory [`crate::mock::MockTransport`] instead.

pub mod soap;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{ManagedRef, TaskInfo};

/// Root catalog object returned at session bootstrap (glossary: "service
/// content"). Carries references to the collaborators the rest of the
/// client needs.
#[derive(Debug, Clone)]
pub struct ServiceContent {
    pub root_folder: ManagedRef,
    pub property_collector: ManagedRef,
    pub file_manager: ManagedRef,
    pub virtual_disk_manager: ManagedRef,
    pub datastore_namespace_manager: ManagedRef,
    pub about: AboutInfo,
}

#[derive(Debug, Clone)]
pub struct AboutInfo {
    pub api_type: String,
}

impl AboutInfo {
    pub fn is_vcenter(&self) -> bool {
        self.api_type == "VirtualCenter"
    }
}

/// A single property bag requested from the property collector for one
/// type, restricted to the named paths (e.g. `Datacenter` / `["name",
/// "parent", "vmFolder"]`).
#[derive(Debug, Clone)]
pub struct PropertySpec {
    pub obj_type: String,
    pub path_set: Vec<String>,
}

/// One root object plus whether the traversal should recurse into its
/// children (`Folder.childEntity`, `Datacenter.hostFolder`, etc.; spec
/// §4.B names the exact expansions; this traversal flag is a simplification
/// of the SDK's full `SelectionSpec` graph, sufficient for the single-root
/// traversal this client performs).
#[derive(Debug, Clone)]
pub struct ObjectSpec {
    pub obj: ManagedRef,
    pub recurse: bool,
}

/// A `retrieveProperties` request: which objects, which properties.
#[derive(Debug, Clone, Default)]
pub struct PropertyFilterSpec {
    pub object_set: Vec<ObjectSpec>,
    pub prop_set: Vec<PropertySpec>,
}

/// Power state as reported on `VirtualMachine.runtime`.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub power_state: crate::types::VmPowerState,
    pub question: Option<crate::types::VmQuestion>,
}

/// `VirtualMachine.summary` subset this client consumes (spec §4.F
/// `LoadVm` stats line).
#[derive(Debug, Clone)]
pub struct VmSummaryInfo {
    pub overall_status: String,
    pub guest_memory_usage: i64,
    pub max_memory_usage: i64,
    pub overall_cpu_usage: i64,
    pub max_cpu_usage: i64,
}

impl VmSummaryInfo {
    /// `"<overallStatus> | mem-<mem%>% cpu-<cpu%>%"` (spec §4.F).
    pub fn format_stats(&self) -> String {
        let mem_pct = percent(self.guest_memory_usage, self.max_memory_usage);
        let cpu_pct = percent(self.overall_cpu_usage, self.max_cpu_usage);
        format!("{} | mem-{}% cpu-{}%", self.overall_status, mem_pct, cpu_pct)
    }
}

fn percent(numerator: i64, denominator: i64) -> i64 {
    if denominator == 0 {
        0
    } else {
        ((numerator as f64 / denominator as f64) * 100.0).round() as i64
    }
}

/// A single node of `VirtualMachine.snapshot.rootSnapshotList`.
#[derive(Debug, Clone)]
pub struct SnapshotTreeInfo {
    pub name: String,
    pub snapshot: ManagedRef,
    pub create_time: DateTime<Utc>,
    pub child_snapshot: Vec<SnapshotTreeInfo>,
}

/// `VirtualMachine.snapshot` as a whole.
#[derive(Debug, Clone, Default)]
pub struct VmSnapshotInfo {
    pub root_snapshot_list: Vec<SnapshotTreeInfo>,
    pub current_snapshot: Option<ManagedRef>,
}

impl VmSnapshotInfo {
    pub fn find(&self, name: &str) -> Option<&SnapshotTreeInfo> {
        fn search<'a>(nodes: &'a [SnapshotTreeInfo], name: &str) -> Option<&'a SnapshotTreeInfo> {
            for node in nodes {
                if node.name == name {
                    return Some(node);
                }
                if let Some(found) = search(&node.child_snapshot, name) {
                    return Some(found);
                }
            }
            None
        }
        search(&self.root_snapshot_list, name)
    }
}

/// A single entry of `VirtualMachine.layoutEx.file` (spec §4.F `diskPath`).
#[derive(Debug, Clone)]
pub struct LayoutFileInfo {
    pub name: String,
    pub file_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct FileLayoutEx {
    pub file: Vec<LayoutFileInfo>,
}

impl FileLayoutEx {
    /// The datastore path of the first disk descriptor, used as `Vm.diskPath`.
    pub fn primary_disk_path(&self) -> Option<String> {
        self.file
            .iter()
            .find(|f| f.file_type == "diskDescriptor")
            .map(|f| f.name.clone())
    }
}

/// `HostSystem.configManager` subset (network system reference).
#[derive(Debug, Clone, Default)]
pub struct ConfigManagerInfo {
    pub network_system: Option<ManagedRef>,
}

/// `Datastore.capability` subset (object-store detection, spec §4.C).
#[derive(Debug, Clone)]
pub struct DatastoreCapabilityInfo {
    pub top_level_directory_create_supported: bool,
}

/// The tagged-union property value a `retrieveProperties` call can return
/// for any one `(object, path)` pair. Replaces the SDK's reflective
/// `DynamicProperty` with an explicit sum type dispatched by match
/// (Design Notes §9).
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Ref(ManagedRef),
    RefList(Vec<ManagedRef>),
    Runtime(RuntimeInfo),
    Summary(VmSummaryInfo),
    Snapshot(VmSnapshotInfo),
    Layout(FileLayoutEx),
    ConfigManager(ConfigManagerInfo),
    Capability(DatastoreCapabilityInfo),
    Task(TaskInfo),
    DeviceList(Vec<VirtualDeviceInfo>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Option<&ManagedRef> {
        match self {
            PropertyValue::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_ref_list(&self) -> Option<&[ManagedRef]> {
        match self {
            PropertyValue::RefList(r) => Some(r.as_slice()),
            _ => None,
        }
    }

    pub fn as_runtime(&self) -> Option<&RuntimeInfo> {
        match self {
            PropertyValue::Runtime(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_summary(&self) -> Option<&VmSummaryInfo> {
        match self {
            PropertyValue::Summary(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_snapshot(&self) -> Option<&VmSnapshotInfo> {
        match self {
            PropertyValue::Snapshot(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_layout(&self) -> Option<&FileLayoutEx> {
        match self {
            PropertyValue::Layout(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_config_manager(&self) -> Option<&ConfigManagerInfo> {
        match self {
            PropertyValue::ConfigManager(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_capability(&self) -> Option<&DatastoreCapabilityInfo> {
        match self {
            PropertyValue::Capability(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_device_list(&self) -> Option<&[VirtualDeviceInfo]> {
        match self {
            PropertyValue::DeviceList(d) => Some(d.as_slice()),
            _ => None,
        }
    }
}

/// One object's flattened property bag, keyed by path (e.g. `"name"`,
/// `"runtime"`, `"layoutEx"`).
#[derive(Debug, Clone, Default)]
pub struct ObjectContent {
    pub obj: ManagedRef,
    pub props: HashMap<String, PropertyValue>,
}

impl ObjectContent {
    pub fn get(&self, path: &str) -> Option<&PropertyValue> {
        self.props.get(path)
    }
}

/// Add/edit/remove a virtual device as part of a config spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOperation {
    Add,
    Edit,
    Remove,
}

/// Backing info for a device, generalized across CD-ROM and NIC devices.
#[derive(Debug, Clone)]
pub enum DeviceBacking {
    IsoFile { file_name: String },
    PortGroup { port_group: String, switch_uuid: Option<String> },
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualDeviceKind {
    Cdrom,
    EthernetCard,
    Disk,
    Other,
}

/// A device already present in a VM's current hardware list, as returned by
/// `retrieveProperties` on `config.hardware.device` and consumed by
/// `Reconfigure`'s by-label/by-index device selection (spec §4.H).
#[derive(Debug, Clone)]
pub struct VirtualDeviceInfo {
    pub key: i32,
    pub label: String,
    pub kind: VirtualDeviceKind,
    pub backing: Option<DeviceBacking>,
    pub connected: bool,
}

/// A device mutation to submit as part of a `reconfigVM` call.
#[derive(Debug, Clone)]
pub struct VirtualDeviceConfigSpec {
    pub operation: DeviceOperation,
    pub key: i32,
    pub backing: Option<DeviceBacking>,
    pub connected: Option<bool>,
    pub start_connected: Option<bool>,
}

/// Declarative disk device to add at `createVM`/`reconfigVM` time.
#[derive(Debug, Clone)]
pub struct NewDiskDeviceSpec {
    pub datastore_path: String,
    pub size_gib: u64,
    pub controller: crate::types::DiskAdapter,
}

/// Declarative NIC device to add at `createVM`/`reconfigVM` time.
#[derive(Debug, Clone)]
pub struct NewNicDeviceSpec {
    pub port_group: String,
    pub switch_uuid: Option<String>,
}

/// A `VirtualMachineConfigSpec` (createVM/reconfigVM payload).
#[derive(Debug, Clone, Default)]
pub struct VmConfigSpec {
    pub name: Option<String>,
    pub guest_id: Option<String>,
    pub num_cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub annotation: Option<String>,
    pub vm_path_name: Option<String>,
    pub extra_config: Vec<(String, String)>,
    pub new_disks: Vec<NewDiskDeviceSpec>,
    pub new_nics: Vec<NewNicDeviceSpec>,
    pub new_iso: Option<String>,
    pub boot_delay_ms: Option<u32>,
    pub device_change: Vec<VirtualDeviceConfigSpec>,
}

/// Options controlling `searchDatastore`/`searchDatastoreSubFolders`.
#[derive(Debug, Clone)]
pub struct SearchSpec {
    pub match_pattern: Vec<String>,
}

/// A single matched file from a datastore search task's result.
#[derive(Debug, Clone)]
pub struct DatastoreFileInfo {
    pub path: String,
}

/// `acquireTicket` result (MKS/WebMKS console ticket).
#[derive(Debug, Clone)]
pub struct TicketInfo {
    pub ticket: String,
    pub host: String,
    pub port: Option<u16>,
}

/// Affinity rule submitted to `reconfigureCluster`.
#[derive(Debug, Clone)]
pub struct ClusterAffinityRuleSpec {
    pub name: String,
    pub enabled: bool,
    pub mandatory: bool,
    pub vms: Vec<ManagedRef>,
}

/// Transport-level client against the hypervisor SDK (spec §4.A). One
/// instance guards a single authenticated session; callers obtain it from
/// [`crate::session`] rather than constructing it directly.
#[async_trait]
pub trait HypervisorTransport: Send + Sync {
    async fn retrieve_service_content(&self) -> Result<ServiceContent>;

    async fn login(&self, user: &str, password: &str) -> Result<()>;

    async fn logout(&self) -> Result<()>;

    async fn retrieve_properties(&self, filter: &PropertyFilterSpec) -> Result<Vec<ObjectContent>>;

    async fn power_on(&self, vm: &ManagedRef) -> Result<ManagedRef>;

    async fn power_off(&self, vm: &ManagedRef) -> Result<ManagedRef>;

    async fn create_snapshot(
        &self,
        vm: &ManagedRef,
        name: &str,
        description: &str,
        memory: bool,
        quiesce: bool,
    ) -> Result<ManagedRef>;

    async fn remove_snapshot(
        &self,
        snapshot: &ManagedRef,
        remove_children: bool,
        consolidate: bool,
    ) -> Result<ManagedRef>;

    async fn revert_to_current_snapshot(&self, vm: &ManagedRef) -> Result<ManagedRef>;

    async fn reconfig_vm(&self, vm: &ManagedRef, spec: &VmConfigSpec) -> Result<ManagedRef>;

    async fn create_vm(
        &self,
        folder: &ManagedRef,
        pool: &ManagedRef,
        host: Option<&ManagedRef>,
        spec: &VmConfigSpec,
    ) -> Result<ManagedRef>;

    async fn unregister_vm(&self, vm: &ManagedRef) -> Result<()>;

    async fn delete_datastore_file(&self, datacenter: &ManagedRef, name: &str) -> Result<ManagedRef>;

    async fn create_virtual_disk(
        &self,
        datacenter: &ManagedRef,
        name: &str,
        size_gib: u64,
        controller: crate::types::DiskAdapter,
    ) -> Result<ManagedRef>;

    async fn copy_virtual_disk(
        &self,
        source_datacenter: &ManagedRef,
        source_name: &str,
        dest_datacenter: &ManagedRef,
        dest_name: &str,
    ) -> Result<ManagedRef>;

    async fn delete_virtual_disk(&self, datacenter: &ManagedRef, name: &str) -> Result<ManagedRef>;

    async fn make_directory(
        &self,
        datacenter: &ManagedRef,
        datastore_path: &str,
        create_parent_directories: bool,
    ) -> Result<()>;

    async fn search_datastore(
        &self,
        browser: &ManagedRef,
        datastore_path: &str,
        spec: &SearchSpec,
    ) -> Result<ManagedRef>;

    async fn search_datastore_subfolders(
        &self,
        browser: &ManagedRef,
        datastore_path: &str,
        spec: &SearchSpec,
    ) -> Result<ManagedRef>;

    async fn convert_namespace_path_to_uuid_path(
        &self,
        datacenter: &ManagedRef,
        namespace_manager: &ManagedRef,
        url: &str,
    ) -> Result<String>;

    async fn acquire_ticket(&self, vm: &ManagedRef, kind: &str) -> Result<TicketInfo>;

    async fn answer_vm(&self, vm: &ManagedRef, question_id: &str, answer_id: &str) -> Result<()>;

    async fn reconfigure_cluster(
        &self,
        cluster: &ManagedRef,
        rule: &ClusterAffinityRuleSpec,
        modify: bool,
    ) -> Result<ManagedRef>;

    // -- Network manager support (spec §4.D). Not part of the core's
    // normative operation list (§4.A), since the network manager is a
    // distinct collaborator with its own wire contract against the same
    // endpoint (host-local and distributed-switch variants only; the
    // overlay variant talks a separate control-plane API entirely and does
    // not use this trait).

    async fn add_host_port_group(
        &self,
        network_system: &ManagedRef,
        port_group_name: &str,
        vswitch_name: &str,
    ) -> Result<()>;

    async fn remove_host_port_group(&self, network_system: &ManagedRef, port_group_name: &str) -> Result<()>;

    async fn list_host_port_groups(&self, network_system: &ManagedRef) -> Result<Vec<String>>;

    async fn create_dv_portgroup(&self, switch: &ManagedRef, name: &str) -> Result<ManagedRef>;

    async fn remove_dv_portgroup(&self, portgroup: &ManagedRef) -> Result<ManagedRef>;

    async fn list_dv_portgroups(&self, switch: &ManagedRef) -> Result<Vec<ManagedRef>>;

    /// Fetch the file list carried by a completed `searchDatastore[SubFolders]`
    /// task's result. Only meaningful after [`Self::retrieve_properties`] on
    /// the task ref reports a terminal state.
    async fn search_result(&self, task: &ManagedRef) -> Result<Vec<DatastoreFileInfo>>;
}
