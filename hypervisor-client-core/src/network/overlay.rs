//! Overlay (NSX-style) network manager (spec §4.D, Overlay variant).
//!
//! Talks a separate control-plane API rather than the hypervisor SDK itself
//! (spec §4.D), so this variant does not use [`crate::rpc::HypervisorTransport`]
//! at all; it holds its own `reqwest::Client` against the configured SDDC.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::types::{ManagedRef, VmTemplate};

use super::{excluded, NetworkManager};

pub struct OverlayNetworkManager {
    client: Client,
    control_plane_url: String,
    sddc: String,
    exclude_mask: Option<Regex>,
    segments: RwLock<HashSet<String>>,
    ownership: RwLock<HashMap<String, HashSet<String>>>,
}

impl OverlayNetworkManager {
    pub fn new(control_plane_url: impl Into<String>, sddc: impl Into<String>, exclude_mask: Option<Regex>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| HypervisorError::transport("overlay-control-plane", e))?;
        Ok(Self {
            client,
            control_plane_url: control_plane_url.into(),
            sddc: sddc.into(),
            exclude_mask,
            segments: RwLock::new(HashSet::new()),
            ownership: RwLock::new(HashMap::new()),
        })
    }

    async fn ensure_segment(&self, name: &str) -> Result<()> {
        if self.segments.read().await.contains(name) {
            return Ok(());
        }
        let url = format!("{}/sddc/{}/segments/{}", self.control_plane_url, self.sddc, name);
        debug!(url, "provisioning overlay segment");
        self.client
            .put(&url)
            .send()
            .await
            .map_err(|e| HypervisorError::transport(self.control_plane_url.clone(), e))?;
        self.segments.write().await.insert(name.to_string());
        Ok(())
    }

    async fn remove_segment(&self, name: &str) -> Result<()> {
        let url = format!("{}/sddc/{}/segments/{}", self.control_plane_url, self.sddc, name);
        self.client
            .delete(&url)
            .send()
            .await
            .map_err(|e| HypervisorError::transport(self.control_plane_url.clone(), e))?;
        self.segments.write().await.remove(name);
        Ok(())
    }
}

#[async_trait]
impl NetworkManager for OverlayNetworkManager {
    #[instrument(skip(self))]
    async fn initialize(&self) -> Result<()> {
        debug!(sddc = %self.sddc, "overlay network manager primed");
        Ok(())
    }

    #[instrument(skip(self, template))]
    async fn provision(&self, template: &VmTemplate) -> Result<()> {
        let nets: Vec<String> = template.nics.iter().map(|n| n.net.clone()).collect();
        self.provision_all(&nets, false).await
    }

    #[instrument(skip(self, nets))]
    async fn provision_all(&self, nets: &[String], _use_uplink_switch: bool) -> Result<()> {
        for net in nets {
            if excluded(&self.exclude_mask, net) {
                warn!(net, "overlay segment excluded by mask, skipping provision");
                continue;
            }
            self.ensure_segment(net).await?;
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
                    self.remove_segment(&net).await?;
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
        let owned: HashSet<String> = self.ownership.read().await.values().flatten().cloned().collect();
        let tracked: Vec<String> = self.segments.read().await.iter().cloned().collect();
        for segment in tracked {
            if excluded(&self.exclude_mask, &segment) || owned.contains(&segment) {
                continue;
            }
            debug!(segment, "sweeping orphaned overlay segment");
            self.remove_segment(&segment).await?;
        }
        Ok(())
    }
}
