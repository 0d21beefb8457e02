//! Distributed-switch port-group manager (spec §4.D, Distributed variant).

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

pub struct DistributedNetworkManager {
    transport: Arc<dyn HypervisorTransport>,
    switch: ManagedRef,
    switch_uuid: String,
    exclude_mask: Option<Regex>,
    portgroups_by_name: RwLock<HashMap<String, ManagedRef>>,
    ownership: RwLock<HashMap<String, HashSet<String>>>,
}

impl DistributedNetworkManager {
    pub fn new(transport: Arc<dyn HypervisorTransport>, switch: ManagedRef, switch_uuid: String, exclude_mask: Option<Regex>) -> Self {
        Self {
            transport,
            switch,
            switch_uuid,
            exclude_mask,
            portgroups_by_name: RwLock::new(HashMap::new()),
            ownership: RwLock::new(HashMap::new()),
        }
    }

    async fn ensure(&self, name: &str) -> Result<()> {
        if self.portgroups_by_name.read().await.contains_key(name) {
            return Ok(());
        }
        let task = self.transport.create_dv_portgroup(&self.switch, name).await?;
        let created = self.transport.search_result(&task).await?;
        let pg_ref = created
            .first()
            .map(|f| ManagedRef::new("DistributedVirtualPortgroup", f.path.clone()))
            .unwrap_or_else(|| ManagedRef::new("DistributedVirtualPortgroup", name.to_string()));
        self.portgroups_by_name.write().await.insert(name.to_string(), pg_ref);
        Ok(())
    }
}

#[async_trait]
impl NetworkManager for DistributedNetworkManager {
    #[instrument(skip(self))]
    async fn initialize(&self) -> Result<()> {
        let existing = self.transport.list_dv_portgroups(&self.switch).await?;
        debug!(count = existing.len(), "distributed network manager primed");
        Ok(())
    }

    #[instrument(skip(self, template))]
    async fn provision(&self, template: &VmTemplate) -> Result<()> {
        let nets: Vec<String> = template.nics.iter().map(|n| n.net.clone()).collect();
        self.provision_all(&nets, true).await
    }

    #[instrument(skip(self, nets))]
    async fn provision_all(&self, nets: &[String], _use_uplink_switch: bool) -> Result<()> {
        for net in nets {
            if excluded(&self.exclude_mask, net) {
                warn!(net, "port group excluded by mask, skipping provision");
                continue;
            }
            self.ensure(net).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unprovision(&self, vm: &ManagedRef) -> Result<()> {
        let mut ownership = self.ownership.write().await;
        if let Some(nets) = ownership.remove(&vm.value) {
            let still_owned: HashSet<&String> = ownership.values().flatten().collect();
            for net in nets {
                if still_owned.contains(&net) {
                    continue;
                }
                if let Some(pg_ref) = self.portgroups_by_name.write().await.remove(&net) {
                    self.transport.remove_dv_portgroup(&pg_ref).await?;
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
        device.backing = Some(super::backing_for(port_group_name, Some(self.switch_uuid.clone())));
        device.connected = true;
    }

    #[instrument(skip(self))]
    async fn clean(&self) -> Result<()> {
        let existing = self.transport.list_dv_portgroups(&self.switch).await?;
        let owned: HashSet<String> = self.ownership.read().await.values().flatten().cloned().collect();
        let tracked = self.portgroups_by_name.read().await.clone();
        for pg_ref in existing {
            let name = tracked
                .iter()
                .find(|(_, r)| *r == &pg_ref)
                .map(|(n, _)| n.clone());
            let Some(name) = name else { continue };
            if excluded(&self.exclude_mask, &name) || owned.contains(&name) {
                continue;
            }
            debug!(name, "sweeping orphaned distributed port group");
            self.transport.remove_dv_portgroup(&pg_ref).await?;
            self.portgroups_by_name.write().await.remove(&name);
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
            nics: vec![VmNic { net: "dv-lan".into() }],
            iso: None,
            guestinfo: Default::default(),
            auto_start: false,
            host_affinity_tag: None,
        }
    }

    #[tokio::test]
    async fn provision_creates_dv_portgroup() {
        let transport = Arc::new(MockTransport::new());
        let manager = DistributedNetworkManager::new(transport.clone(), refs::dvs(), "uuid-1".into(), None);
        manager.provision(&template()).await.unwrap();
        let groups = transport.list_dv_portgroups(&refs::dvs()).await.unwrap();
        assert_eq!(groups.len(), 1);
    }

    #[tokio::test]
    async fn backing_carries_switch_uuid() {
        let transport = Arc::new(MockTransport::new());
        let manager = DistributedNetworkManager::new(transport.clone(), refs::dvs(), "uuid-1".into(), None);
        let mut device = crate::rpc::VirtualDeviceInfo {
            key: 1,
            label: "Network adapter 1".into(),
            kind: crate::rpc::VirtualDeviceKind::EthernetCard,
            backing: None,
            connected: false,
        };
        manager.update_ethernet_card_backing(&mut device, "dv-lan");
        match device.backing {
            Some(crate::rpc::DeviceBacking::PortGroup { switch_uuid: Some(uuid), .. }) => assert_eq!(uuid, "uuid-1"),
            _ => panic!("expected port group backing with switch uuid"),
        }
        assert!(device.connected);
    }
}
