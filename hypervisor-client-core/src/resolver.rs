//! One-shot traversal that resolves the managed references this client
//! needs for everything downstream (spec §4.B).

use tracing::{info, instrument, warn};

use crate::config::EndpointConfig;
use crate::error::{HypervisorError, Result};
use crate::rpc::{HypervisorTransport, ObjectSpec, PropertyFilterSpec, PropertySpec};
use crate::types::ManagedRef;

/// Everything the rest of the client needs after a successful `Connect`.
#[derive(Debug, Clone)]
pub struct ResolvedInventory {
    pub datacenter: ManagedRef,
    pub vm_folder: ManagedRef,
    pub cluster: ManagedRef,
    pub pool: ManagedRef,
    pub is_cluster: bool,
    pub distributed_switch: Option<ManagedRef>,
    pub distributed_switch_uuid: Option<String>,
    pub network_system: Option<ManagedRef>,
}

/// Walk the folder tree rooted at `root_folder`, descend into the
/// configured `<datacenter>/<cluster>/<pool>` path, and record the refs the
/// rest of the client needs. Failure (an empty traversal) aborts connect
/// entirely, matching spec §4.B.
#[instrument(skip(transport, config))]
pub async fn resolve(
    transport: &dyn HypervisorTransport,
    config: &EndpointConfig,
    root_folder: &ManagedRef,
) -> Result<ResolvedInventory> {
    let mut parts = config.pool_path.splitn(3, '/');
    let datacenter_name = parts.next().unwrap_or_default();
    let cluster_name = parts.next().unwrap_or_default();
    let pool_name = parts.next().unwrap_or_default();

    let datacenter = find_datacenter(transport, root_folder, datacenter_name).await?;
    let dc_props = fetch(
        transport,
        &datacenter,
        "Datacenter",
        &["name", "vmFolder", "hostFolder", "networkFolder"],
    )
    .await?;

    let vm_folder = dc_props
        .get("vmFolder")
        .and_then(|v| v.as_ref())
        .cloned()
        .ok_or_else(|| HypervisorError::Internal("datacenter has no vmFolder".to_string()))?;
    let host_folder = dc_props
        .get("hostFolder")
        .and_then(|v| v.as_ref())
        .cloned()
        .ok_or_else(|| HypervisorError::Internal("datacenter has no hostFolder".to_string()))?;
    let network_folder = dc_props.get("networkFolder").and_then(|v| v.as_ref()).cloned();

    let cluster = find_compute_resource(transport, &host_folder, cluster_name).await?;
    let cluster_props = fetch(
        transport,
        &cluster,
        "ComputeResource",
        &["name", "resourcePool", "host"],
    )
    .await?;

    let root_pool = cluster_props
        .get("resourcePool")
        .and_then(|v| v.as_ref())
        .cloned()
        .ok_or_else(|| HypervisorError::Internal("compute resource has no resourcePool".to_string()))?;

    let is_cluster = cluster.kind == "ClusterComputeResource";
    let pool = find_resource_pool(transport, &root_pool, pool_name, is_cluster).await?;

    let (distributed_switch, distributed_switch_uuid, network_system) =
        resolve_network_anchors(transport, config, &network_folder, &cluster_props).await?;

    info!(
        datacenter = %datacenter,
        cluster = %cluster,
        pool = %pool,
        is_cluster,
        "resolved endpoint topology"
    );

    Ok(ResolvedInventory {
        datacenter,
        vm_folder,
        cluster,
        pool,
        is_cluster,
        distributed_switch,
        distributed_switch_uuid,
        network_system,
    })
}

async fn fetch(
    transport: &dyn HypervisorTransport,
    obj: &ManagedRef,
    obj_type: &str,
    paths: &[&str],
) -> Result<crate::rpc::ObjectContent> {
    let filter = PropertyFilterSpec {
        object_set: vec![ObjectSpec { obj: obj.clone(), recurse: false }],
        prop_set: vec![PropertySpec {
            obj_type: obj_type.to_string(),
            path_set: paths.iter().map(|s| s.to_string()).collect(),
        }],
    };
    transport
        .retrieve_properties(&filter)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| HypervisorError::Internal(format!("empty traversal result for {obj}")))
}

async fn find_datacenter(
    transport: &dyn HypervisorTransport,
    root_folder: &ManagedRef,
    name: &str,
) -> Result<ManagedRef> {
    let content = fetch(transport, root_folder, "Folder", &["childEntity"]).await?;
    let children = content
        .get("childEntity")
        .and_then(|v| v.as_ref_list())
        .ok_or_else(|| HypervisorError::Internal("root folder traversal returned nothing".to_string()))?;

    if children.is_empty() {
        return Err(HypervisorError::Internal("no datacenters found under root folder".to_string()));
    }

    for child in children {
        let props = fetch(transport, child, "Datacenter", &["name"]).await?;
        if let Some(child_name) = props.get("name").and_then(|v| v.as_str()) {
            if child_name.eq_ignore_ascii_case(name) {
                return Ok(child.clone());
            }
        }
    }

    warn!(requested = name, "no datacenter matched by name, falling back to first observed");
    Ok(children[0].clone())
}

async fn find_compute_resource(
    transport: &dyn HypervisorTransport,
    host_folder: &ManagedRef,
    name: &str,
) -> Result<ManagedRef> {
    let content = fetch(transport, host_folder, "Folder", &["childEntity"]).await?;
    let children = content
        .get("childEntity")
        .and_then(|v| v.as_ref_list())
        .ok_or_else(|| HypervisorError::Internal("host folder has no compute resources".to_string()))?;

    if children.is_empty() {
        return Err(HypervisorError::Internal("no compute resources under datacenter".to_string()));
    }

    for child in children {
        let props = fetch(transport, child, "ComputeResource", &["name"]).await?;
        if let Some(child_name) = props.get("name").and_then(|v| v.as_str()) {
            if child_name.eq_ignore_ascii_case(name) {
                return Ok(child.clone());
            }
        }
    }

    warn!(requested = name, "no compute resource matched by name, falling back to first observed");
    Ok(children[0].clone())
}

async fn find_resource_pool(
    transport: &dyn HypervisorTransport,
    root_pool: &ManagedRef,
    name: &str,
    is_cluster: bool,
) -> Result<ManagedRef> {
    if name.is_empty() {
        return Ok(root_pool.clone());
    }

    let content = fetch(transport, root_pool, "ResourcePool", &["name", "resourcePool"]).await?;
    let children = content.get("resourcePool").and_then(|v| v.as_ref_list()).unwrap_or(&[]);

    for child in children {
        let props = fetch(transport, child, "ResourcePool", &["name"]).await?;
        if let Some(child_name) = props.get("name").and_then(|v| v.as_str()) {
            if child_name.eq_ignore_ascii_case(name) {
                return Ok(child.clone());
            }
        }
    }

    if is_cluster {
        if let Some(first_child) = children.first() {
            warn!(requested = name, "no named pool found, preferring cluster's first child pool");
            return Ok(first_child.clone());
        }
    }

    Ok(root_pool.clone())
}

async fn resolve_network_anchors(
    transport: &dyn HypervisorTransport,
    config: &EndpointConfig,
    network_folder: &Option<ManagedRef>,
    cluster_props: &crate::rpc::ObjectContent,
) -> Result<(Option<ManagedRef>, Option<String>, Option<ManagedRef>)> {
    if let Some(uplink) = &config.uplink {
        if !config.wants_overlay() {
            if let Some(folder) = network_folder {
                let content = fetch(transport, folder, "Folder", &["childEntity"]).await?;
                let children = content.get("childEntity").and_then(|v| v.as_ref_list()).unwrap_or(&[]);
                for child in children {
                    if child.kind != "DistributedVirtualSwitch" {
                        continue;
                    }
                    let props = fetch(transport, child, "DistributedVirtualSwitch", &["name", "uuid"]).await?;
                    if props
                        .get("name")
                        .and_then(|v| v.as_str())
                        .map(|n| n.eq_ignore_ascii_case(uplink))
                        .unwrap_or(false)
                    {
                        let uuid = props.get("uuid").and_then(|v| v.as_str()).map(str::to_string);
                        return Ok((Some(child.clone()), uuid, None));
                    }
                }
                if let Some(first) = children.iter().find(|c| c.kind == "DistributedVirtualSwitch") {
                    let props = fetch(transport, first, "DistributedVirtualSwitch", &["uuid"]).await?;
                    let uuid = props.get("uuid").and_then(|v| v.as_str()).map(str::to_string);
                    return Ok((Some(first.clone()), uuid, None));
                }
            }
        }
    }

    if config.wants_overlay() {
        return Ok((None, None, None));
    }

    let hosts = cluster_props.get("host").and_then(|v| v.as_ref_list()).unwrap_or(&[]);
    if let Some(host) = hosts.first() {
        let props = fetch(transport, host, "HostSystem", &["configManager"]).await?;
        let network_system = props.get("configManager").and_then(|v| v.as_config_manager()).and_then(|c| c.network_system.clone());
        return Ok((None, None, network_system));
    }

    Ok((None, None, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{refs, MockTransport};

    fn config(uplink: Option<&str>) -> EndpointConfig {
        EndpointConfig {
            host: "esx1.lab.example.com".into(),
            url: "https://esx1.lab.example.com/sdk".into(),
            user: "admin".into(),
            password: "secret".into(),
            pool_path: "dc1/cluster1/pool1".into(),
            uplink: uplink.map(str::to_string),
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
    async fn resolves_named_datacenter_cluster_and_pool() {
        let transport = MockTransport::new();
        let cfg = config(Some("dvs1"));
        let resolved = resolve(&transport, &cfg, &refs::root_folder()).await.unwrap();
        assert_eq!(resolved.datacenter, refs::datacenter());
        assert_eq!(resolved.cluster, refs::cluster());
        assert_eq!(resolved.pool, refs::pool());
        assert!(resolved.is_cluster);
        assert_eq!(resolved.distributed_switch, Some(refs::dvs()));
        assert!(resolved.distributed_switch_uuid.is_some());
    }

    #[tokio::test]
    async fn falls_back_to_host_network_system_without_uplink() {
        let transport = MockTransport::new();
        let cfg = config(None);
        let resolved = resolve(&transport, &cfg, &refs::root_folder()).await.unwrap();
        assert_eq!(resolved.network_system, Some(refs::network_system()));
        assert!(resolved.distributed_switch.is_none());
    }
}
