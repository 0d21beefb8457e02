//! Caller-supplied configuration for a single endpoint connection (spec §6).

use serde::Deserialize;

/// Everything `HypervisorClient::new` needs to dial, authenticate against,
/// and scope itself to one hypervisor endpoint. The host application owns
/// loading this (file, env, whatever) and hands it in already populated;
/// this crate does no CLI/env parsing of its own.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Short endpoint name, used as `Vm.host` and as the `vmStore` `{host}`
    /// substitution source (its first DNS label).
    pub host: String,
    /// Full SOAP endpoint URL (e.g. `https://vc1.example.com/sdk`).
    pub url: String,
    pub user: String,
    pub password: String,

    /// `<datacenter>/<cluster>/<pool>`, case-insensitive, resolved by the
    /// reference resolver at connect time.
    pub pool_path: String,

    /// Name of a distributed switch, or an overlay uplink. A `nsx.` prefix
    /// selects the overlay network manager regardless of `is_nsx_network`.
    #[serde(default)]
    pub uplink: Option<String>,
    #[serde(default)]
    pub is_nsx_network: bool,
    #[serde(default)]
    pub sddc: Option<String>,

    /// Whether the endpoint is a vCenter (vs. a standalone ESXi host).
    /// Influences pool descent and whether affinity rules are available.
    #[serde(default)]
    pub is_vcenter: bool,

    /// Datastore path pattern; `{host}` is substituted with the first DNS
    /// label of `host` when resolving a VM's on-disk location.
    pub vm_store: String,

    /// Matched against the suffix of a VM name after `#` to scope ownership.
    pub tenant: String,

    /// Regex/substring used by the network manager to ignore port groups
    /// it should never manage.
    #[serde(default)]
    pub exclude_network_mask: Option<String>,

    /// Idle minutes before the session monitor auto-disconnects.
    #[serde(default = "default_keep_alive_minutes")]
    pub keep_alive_minutes: i64,

    #[serde(default)]
    pub ignore_certificate_errors: bool,

    #[serde(default)]
    pub debug_verbose: bool,
}

fn default_keep_alive_minutes() -> i64 {
    10
}

impl EndpointConfig {
    /// The first DNS label of `host`, used to fill `{host}` in `vm_store`.
    pub fn host_label(&self) -> &str {
        self.host.split('.').next().unwrap_or(&self.host)
    }

    /// `vm_store` with `{host}` substituted.
    pub fn resolved_vm_store(&self) -> String {
        self.vm_store.replace("{host}", self.host_label())
    }

    /// True when the configured uplink selects the overlay network manager
    /// (spec §4.D: `nsx.` prefix, or overlay explicitly configured).
    pub fn wants_overlay(&self) -> bool {
        self.is_nsx_network
            || self
                .uplink
                .as_deref()
                .map(|u| u.starts_with("nsx."))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> EndpointConfig {
        EndpointConfig {
            host: "esx1.lab.example.com".into(),
            url: "https://esx1.lab.example.com/sdk".into(),
            user: "admin".into(),
            password: "secret".into(),
            pool_path: "dc1/cluster1/pool1".into(),
            uplink: None,
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

    #[test]
    fn host_label_is_first_dns_token() {
        let cfg = base_config();
        assert_eq!(cfg.host_label(), "esx1");
    }

    #[test]
    fn vm_store_substitutes_host_label() {
        let cfg = base_config();
        assert_eq!(cfg.resolved_vm_store(), "[vsan] esx1");
    }

    #[test]
    fn overlay_selected_by_nsx_prefix() {
        let mut cfg = base_config();
        cfg.uplink = Some("nsx.t1".into());
        assert!(cfg.wants_overlay());
    }

    #[test]
    fn overlay_selected_by_explicit_flag() {
        let mut cfg = base_config();
        cfg.uplink = Some("dvs-uplink".into());
        cfg.is_nsx_network = true;
        assert!(cfg.wants_overlay());
    }

    #[test]
    fn standard_dvs_uplink_is_not_overlay() {
        let mut cfg = base_config();
        cfg.uplink = Some("dvs-uplink".into());
        assert!(!cfg.wants_overlay());
    }
}
