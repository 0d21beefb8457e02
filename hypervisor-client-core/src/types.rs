//! Data model for the hypervisor client core (spec §3).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HypervisorError, Result};

// =============================================================================
// MANAGED REFERENCE
// =============================================================================

/// Opaque `{type, value}` handle the hypervisor endpoint uses to identify a
/// remote object. Stringified as `type|value` wherever it needs to travel
/// through a plain-`String` field (e.g. `Vm.reference`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedRef {
    pub kind: String,
    pub value: String,
}

impl ManagedRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self { kind: kind.into(), value: value.into() }
    }
}

impl fmt::Display for ManagedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.kind, self.value)
    }
}

impl FromStr for ManagedRef {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self> {
        s.split_once('|')
            .map(|(kind, value)| ManagedRef::new(kind, value))
            .ok_or_else(|| HypervisorError::InvalidArgument(format!("malformed managed reference: {s}")))
    }
}

// =============================================================================
// VM
// =============================================================================

/// Power state of a VM (spec §3 invariant: only these two states exist in
/// this client's model; a remote endpoint reporting anything else is
/// normalized to `Off` by the inventory reload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmPowerState {
    Off,
    Running,
}

/// Lifecycle status of a VM as tracked by this client (not the endpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmLifecycleStatus {
    Initialized,
    Deployed,
}

/// A single pending interactive prompt raised by the hypervisor (e.g. a
/// "disk space low, retry/abort" dialog during boot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmQuestion {
    pub id: String,
    pub prompt: String,
    pub default_choice: Option<String>,
    pub choices: Vec<String>,
}

/// The active long-running task on a VM, as surfaced to callers.
///
/// `progress` encodes `-1` for error and `100` for terminal success; any
/// value in `[0, 99]` is still running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmTask {
    pub name: String,
    pub when_created: DateTime<Utc>,
    pub progress: i32,
}

impl VmTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), when_created: Utc::now(), progress: 0 }
    }

    pub fn is_error(&self) -> bool {
        self.progress < 0
    }

    pub fn is_terminal(&self) -> bool {
        self.progress == 100 || self.progress < 0
    }
}

/// The client's in-memory view of a single VM on this endpoint (spec §3).
///
/// Identity is `id`. Built by the inventory cache from a properties
/// snapshot; updated in place on state transitions; removed on `Delete` or
/// when a reconcile pass no longer observes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    pub name: String,
    pub host: String,
    pub path: String,
    pub disk_path: String,
    pub state: VmPowerState,
    pub reference: String,
    pub stats: String,
    pub status: VmLifecycleStatus,
    pub question: Option<VmQuestion>,
    pub task: Option<VmTask>,
}

impl Vm {
    /// The substring after the final `#` in the VM's name (spec glossary:
    /// "tenant tag"), or an empty string if the name carries none.
    pub fn tenant_tag(&self) -> &str {
        self.name.rsplit_once('#').map(|(_, tag)| tag).unwrap_or("")
    }

    /// The substring identifying the template's owning workspace (spec
    /// glossary: "workspace tag"), used by `Save` to protect stock disks.
    /// Drawn from the same `#`-delimited suffix the tenant tag uses; a VM
    /// carries exactly one tag in its name, scoping both tenant ownership
    /// and workspace disk protection.
    pub fn workspace_tag(&self) -> &str {
        self.tenant_tag()
    }

    /// Invariant 2 (spec §3): a Vm belongs to the endpoint's tenant iff its
    /// name contains `#` and the suffix after `#` equals `tenant`.
    pub fn belongs_to_tenant(&self, tenant: &str) -> bool {
        self.name.contains('#') && self.tenant_tag() == tenant
    }
}

// =============================================================================
// TEMPLATE (Deploy input)
// =============================================================================

/// Disk controller/adapter family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiskAdapter {
    LsiLogic,
    BusLogic,
}

impl DiskAdapter {
    /// Parse the dialectal spelling found in `blank-<n>-<adapter>.vmdk`
    /// template names (`lsilogic` / `buslogic`, case-insensitive) into the
    /// normalized adapter name the endpoint expects.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "lsilogic" => Some(Self::LsiLogic),
            "buslogic" => Some(Self::BusLogic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LsiLogic => "lsiLogic",
            Self::BusLogic => "busLogic",
        }
    }
}

/// A disk to be created as part of a `Deploy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDisk {
    pub path: String,
    pub size_gib: u64,
    pub controller: DiskAdapter,
}

/// A network interface to be created as part of a `Deploy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmNic {
    /// Port group / logical network name the network manager should
    /// provision and back this NIC onto.
    pub net: String,
}

/// Declarative description of a VM to be deployed (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmTemplate {
    pub name: String,
    pub guest_id: String,
    pub cpu: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub disks: Vec<VmDisk>,
    #[serde(default)]
    pub nics: Vec<VmNic>,
    pub iso: Option<String>,
    #[serde(default)]
    pub guestinfo: HashMap<String, String>,
    #[serde(default)]
    pub auto_start: bool,
    pub host_affinity_tag: Option<String>,
}

// =============================================================================
// CHANGE / RECONFIGURE
// =============================================================================

/// The feature key accepted by `Reconfigure` (spec §4.H). A sum type in
/// place of the original's untyped string switch (Design Notes §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFeature {
    Iso,
    Net,
    Eth,
    Boot,
    Guest,
}

impl ChangeFeature {
    pub fn parse(key: &str) -> Result<Self> {
        match key {
            "iso" => Ok(Self::Iso),
            "net" => Ok(Self::Net),
            "eth" => Ok(Self::Eth),
            "boot" => Ok(Self::Boot),
            "guest" => Ok(Self::Guest),
            other => Err(HypervisorError::InvalidArgument(format!("unknown change feature: {other}"))),
        }
    }
}

/// A single `Change` request: `key:label` where `key` is dispatched via
/// [`ChangeFeature`] and an optional trailing `label` selects the target
/// device by label instead of by index.
#[derive(Debug, Clone)]
pub struct VmKeyValue {
    pub key: String,
    pub value: String,
}

impl VmKeyValue {
    /// Split `value` on `:`; the tail (if present) is a device label, the
    /// head is the new setting (spec §4.H Change).
    pub fn split_label(&self) -> (&str, Option<&str>) {
        match self.value.split_once(':') {
            Some((head, label)) => (head, Some(label)),
            None => (self.value.as_str(), None),
        }
    }
}

// =============================================================================
// TASK TRACKER
// =============================================================================

/// Terminal/non-terminal state of a polled hypervisor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Error)
    }
}

/// A snapshot of a polled task's `TaskInfo` (spec §4.A/§4.E).
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub state: TaskState,
    pub progress: i32,
    pub description: Option<String>,
    pub error: Option<String>,
}

impl TaskInfo {
    pub fn running(progress: i32) -> Self {
        Self { state: TaskState::Running, progress, description: None, error: None }
    }

    pub fn success() -> Self {
        Self { state: TaskState::Success, progress: 100, description: None, error: None }
    }

    pub fn error(description: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            state: TaskState::Error,
            progress: -1,
            description: Some(description.into()),
            error: Some(error.into()),
        }
    }

    /// The assembled human-readable message for a failed task (spec §4.E:
    /// `description.message + ' - ' + error.localizedMessage`).
    pub fn error_message(&self) -> String {
        format!(
            "{} - {}",
            self.description.as_deref().unwrap_or(""),
            self.error.as_deref().unwrap_or("")
        )
    }
}

// =============================================================================
// DATASTORE PATH
// =============================================================================

/// A parsed `[datastore] top/sub/dir/file` path (spec §3/§4.C).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastorePath {
    pub datastore: String,
    pub top_level_folder: String,
    pub folder_path: String,
    pub file: String,
}

impl DatastorePath {
    /// Parse `[ds1] ws1/sub/dir/file.vmdk` (or `[ds1] ws1/*` for a search
    /// pattern, or `[ds1] ws1` with no file component).
    pub fn parse(path: &str) -> Result<Self> {
        let path = path.trim();
        let rest = path
            .strip_prefix('[')
            .ok_or_else(|| HypervisorError::InvalidArgument(format!("not a datastore path: {path}")))?;
        let (datastore, rest) = rest
            .split_once(']')
            .ok_or_else(|| HypervisorError::InvalidArgument(format!("not a datastore path: {path}")))?;
        let rest = rest.trim_start();

        let (folder_path, file) = match rest.rsplit_once('/') {
            Some((folder, file)) => (folder.to_string(), file.to_string()),
            None => (String::new(), rest.to_string()),
        };

        let top_level_folder = folder_path
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| file.clone());

        Ok(Self {
            datastore: datastore.to_string(),
            top_level_folder,
            folder_path,
            file,
        })
    }

    /// The extension (including the leading `.`) of `file`, or empty if
    /// `file` names no extension (e.g. a bare wildcard `*`).
    pub fn file_extension(&self) -> String {
        match self.file.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => format!(".{ext}"),
            _ => String::new(),
        }
    }

    /// Rebuild a datastore-relative folder/file string, substituting a new
    /// top-level folder name (used to rewrite UUID top-levels back to their
    /// caller-visible name after an object-store search).
    pub fn with_top_level(&self, new_top_level: &str) -> String {
        let mut parts: Vec<&str> = self.folder_path.split('/').collect();
        if let Some(first) = parts.first_mut() {
            *first = new_top_level;
        }
        let folder = parts.join("/");
        if folder.is_empty() {
            format!("[{}] {}", self.datastore, self.file)
        } else {
            format!("[{}] {}/{}", self.datastore, folder, self.file)
        }
    }
}

impl fmt::Display for DatastorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.folder_path.is_empty() {
            write!(f, "[{}] {}", self.datastore, self.file)
        } else {
            write!(f, "[{}] {}/{}", self.datastore, self.folder_path, self.file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_tag_requires_hash() {
        let vm = Vm {
            id: "1".into(), name: "alpha".into(), host: "h".into(), path: String::new(),
            disk_path: String::new(), state: VmPowerState::Off, reference: String::new(),
            stats: String::new(), status: VmLifecycleStatus::Initialized, question: None, task: None,
        };
        assert_eq!(vm.tenant_tag(), "");
        assert!(!vm.belongs_to_tenant("ws1"));
    }

    #[test]
    fn tenant_tag_matches_suffix() {
        let vm = Vm {
            id: "1".into(), name: "alpha#ws1".into(), host: "h".into(), path: String::new(),
            disk_path: String::new(), state: VmPowerState::Off, reference: String::new(),
            stats: String::new(), status: VmLifecycleStatus::Initialized, question: None, task: None,
        };
        assert_eq!(vm.tenant_tag(), "ws1");
        assert!(vm.belongs_to_tenant("ws1"));
        assert!(!vm.belongs_to_tenant("ws2"));
    }

    #[test]
    fn workspace_tag_matches_tenant_tag() {
        let vm = Vm {
            id: "1".into(), name: "alpha#ws1".into(), host: "h".into(), path: String::new(),
            disk_path: String::new(), state: VmPowerState::Off, reference: String::new(),
            stats: String::new(), status: VmLifecycleStatus::Initialized, question: None, task: None,
        };
        assert_eq!(vm.workspace_tag(), "ws1");
    }

    #[test]
    fn datastore_path_parses_classic_form() {
        let p = DatastorePath::parse("[ds1] ws1/sub/a.vmdk").unwrap();
        assert_eq!(p.datastore, "ds1");
        assert_eq!(p.top_level_folder, "ws1");
        assert_eq!(p.folder_path, "ws1/sub");
        assert_eq!(p.file, "a.vmdk");
        assert_eq!(p.file_extension(), ".vmdk");
    }

    #[test]
    fn datastore_path_parses_no_subfolder() {
        let p = DatastorePath::parse("[vsan] ws1/*").unwrap();
        assert_eq!(p.top_level_folder, "ws1");
        assert_eq!(p.folder_path, "ws1");
        assert_eq!(p.file, "*");
    }

    #[test]
    fn datastore_path_rewrites_top_level() {
        let p = DatastorePath::parse("[vsan] ws1/sub/a.vmdk").unwrap();
        assert_eq!(p.with_top_level("12345-uuid"), "[vsan] 12345-uuid/sub/a.vmdk");
    }

    #[test]
    fn disk_adapter_normalizes_dialectal_tokens() {
        assert_eq!(DiskAdapter::from_token("lsilogic"), Some(DiskAdapter::LsiLogic));
        assert_eq!(DiskAdapter::from_token("BusLogic"), Some(DiskAdapter::BusLogic));
        assert_eq!(DiskAdapter::from_token("nvme"), None);
    }

    #[test]
    fn change_feature_rejects_unknown_key() {
        assert!(ChangeFeature::parse("iso").is_ok());
        assert!(ChangeFeature::parse("bogus").is_err());
    }

    #[test]
    fn key_value_splits_label() {
        let kv = VmKeyValue { key: "iso".into(), value: "[ds1] isos/linux.iso:1".into() };
        let (head, label) = kv.split_label();
        assert_eq!(head, "[ds1] isos/linux.iso");
        assert_eq!(label, Some("1"));
    }

    #[test]
    fn managed_ref_round_trips_through_string() {
        let r = ManagedRef::new("VirtualMachine", "vm-42");
        let s = r.to_string();
        assert_eq!(s, "VirtualMachine|vm-42");
        let parsed: ManagedRef = s.parse().unwrap();
        assert_eq!(parsed, r);
    }
}
