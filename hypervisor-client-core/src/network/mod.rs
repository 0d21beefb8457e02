//! Network Manager variant (spec §4.D): one of {Host, Distributed, Overlay},
//! selected once at `Connect` time and stored as `Arc<dyn NetworkManager>`;
//! the same construct-time strategy-selection shape the teacher crate uses
//! for its storage backend registry.

pub mod distributed;
pub mod host;
pub mod overlay;

use async_trait::async_trait;

use crate::error::Result;
use crate::rpc::{DeviceBacking, VirtualDeviceInfo};
use crate::types::{ManagedRef, VmTemplate};

/// Common contract implemented by all three variants (spec §4.D).
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Prime internal state after the reference resolver has run.
    async fn initialize(&self) -> Result<()>;

    /// Ensure all NIC port groups declared by the template exist.
    async fn provision(&self, template: &VmTemplate) -> Result<()>;

    /// Idempotent bulk form used for pre-deploy provisioning.
    async fn provision_all(&self, nets: &[String], use_uplink_switch: bool) -> Result<()>;

    /// Release port groups owned only by the given VM.
    async fn unprovision(&self, vm: &ManagedRef) -> Result<()>;

    /// Record which port groups a freshly created VM owns. `provision` runs
    /// before `createVM` (the template has no managed reference yet), so
    /// ownership is bound separately once the real ref exists; this keeps
    /// `unprovision`'s "owned only by that VM" rule auditable without
    /// inventing state in the SDK's own object model.
    async fn bind_ownership(&self, vm: &ManagedRef, nets: &[String]) -> Result<()>;

    /// Mutate a NIC device spec in place to target a named port group.
    fn update_ethernet_card_backing(&self, device: &mut VirtualDeviceInfo, port_group_name: &str);

    /// Sweep orphaned port groups. Invoked every other session-monitor tick.
    async fn clean(&self) -> Result<()>;
}

pub(crate) fn backing_for(port_group_name: &str, switch_uuid: Option<String>) -> DeviceBacking {
    DeviceBacking::PortGroup {
        port_group: port_group_name.to_string(),
        switch_uuid,
    }
}

pub(crate) fn excluded(mask: &Option<regex::Regex>, name: &str) -> bool {
    mask.as_ref().map(|re| re.is_match(name)).unwrap_or(false)
}
