//! Host-local port-group manager, bound to a standalone host's
//! `HostSystem.configManager.networkSystem` (spec §4.D, Host variant).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::rpc::HypervisorTransport;
use crate::types::{ManagedRef, VmTemplate};

use super::{excluded, NetworkManager};

pub struct HostNetworkManager {
    transport: Arc<dyn HypervisorTransport>,
    network_system: ManagedRef,
    vswitch_name: String,
    exclude_mask: Option<Regex>,
    ownership: RwLock<HashMap<String, HashSet<String>>>,
}

impl HostNetworkManager {
    pub fn new(transport: Arc<dyn HypervisorTransport>, network_system: ManagedRef, exclude_mask: Option<Regex>) -> Self {
        Self {
            transport,
            network_system,
            vswitch_name: "vSwitch0".to_string(),
            exclude_mask,
            ownership: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl NetworkManager for HostNetworkManager {
    #[instrument(skip(self))]
    async fn initialize(&self) -> Result<()> {
        let existing = self.transport.list_host_port_groups(&self.network_system).await?;
        debug!(count = existing.len(), "host network manager primed");
        Ok(())
    }

    #[instrument(skip(self, template))]
    async fn provision(&self, template: &VmTemplate) -> Result<()> {
        let nets: Vec<String> = template.nics.iter().map(|n| n.net.clone()).collect();
        self.provision_all(&nets, false).await
    }

    #[instrument(skip(self, nets))]
    async fn provision_all(&self, nets: &[String], _use_uplink_switch: bool) -> Result<()> {
        let existing = self.transport.list_host_port_groups(&self.network_system).await?;
        for net in nets {
            if excluded(&self.exclude_mask, net) {
                warn!(net, "port group excluded by mask, skipping provision");
                continue;
            }
            if !existing.contains(net) {
                self.transport.add_host_port_group(&self.network_system, net, &self.vswitch_name).await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unprovision(&self, vm: &ManagedRef) -> Result<()> {
        let mut ownership = self.ownership.write().await;
        if let Some(nets) = ownership.remove(&vm.value) {
            let still_owned: HashSet<&String> = ownership.values().flatten().collect();
            for net in nets {
                if !still_owned.contains(&net) {
                    self.transport.remove_host_port_group(&self.network_system, &net).await?;
                }
            }
        }
        Ok(())
    }

    async fn bind_ownership(&self, vm: &ManagedRef, nets: &[String]) -> Result<()> {
        self.ownership
            .write()
            .await
            .insert(vm.value.clone(), nets.iter().cloned().collect());
        Ok(())
    }

    fn update_ethernet_card_backing(&self, device: &mut crate::rpc::VirtualDeviceInfo, port_group_name: &str) {
        device.backing = Some(super::backing_for(port_group_name, None));
        device.connected = true;
    }

    #[instrument(skip(self))]
    async fn clean(&self) -> Result<()> {
        let existing = self.transport.list_host_port_groups(&self.network_system).await?;
        let owned: HashSet<String> = self.ownership.read().await.values().flatten().cloned().collect();
        for net in existing {
            if excluded(&self.exclude_mask, &net) {
                continue;
            }
            if !owned.contains(&net) {
                debug!(net, "sweeping orphaned host port group");
                self.transport.remove_host_port_group(&self.network_system, &net).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{refs, MockTransport};
    use crate::types::VmNic;

    fn template() -> VmTemplate {
        VmTemplate {
            name: "alpha#ws1".into(),
            guest_id: "otherGuest".into(),
            cpu: 2,
            memory_mb: 2048,
            disks: vec![],
            nics: vec![VmNic { net: "lan".into() }],
            iso: None,
            guestinfo: Default::default(),
            auto_start: false,
            host_affinity_tag: None,
        }
    }

    #[tokio::test]
    async fn provision_creates_missing_port_group() {
        let transport = Arc::new(MockTransport::new());
        let manager = HostNetworkManager::new(transport.clone(), refs::network_system(), None);
        manager.provision(&template()).await.unwrap();
        let groups = transport.list_host_port_groups(&refs::network_system()).await.unwrap();
        assert!(groups.contains(&"lan".to_string()));
    }

    #[tokio::test]
    async fn unprovision_removes_groups_owned_only_by_that_vm() {
        let transport = Arc::new(MockTransport::new());
        let manager = HostNetworkManager::new(transport.clone(), refs::network_system(), None);
        manager.provision(&template()).await.unwrap();
        let vm_ref = ManagedRef::new("VirtualMachine", "vm-1");
        manager.bind_ownership(&vm_ref, &["lan".to_string()]).await.unwrap();

        manager.unprovision(&vm_ref).await.unwrap();
        let groups = transport.list_host_port_groups(&refs::network_system()).await.unwrap();
        assert!(!groups.contains(&"lan".to_string()));
    }

    #[tokio::test]
    async fn excluded_mask_blocks_provisioning() {
        let transport = Arc::new(MockTransport::new());
        let manager = HostNetworkManager::new(transport.clone(), refs::network_system(), Some(Regex::new("^lan$").unwrap()));
        manager.provision(&template()).await.unwrap();
        let groups = transport.list_host_port_groups(&refs::network_system()).await.unwrap();
        assert!(!groups.contains(&"lan".to_string()));
    }
}
