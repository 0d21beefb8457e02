//! End-to-end scenarios for the VM operations surface, run entirely against
//! the in-memory mock endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use hypervisor_client_core::mock::{refs, MockTransport};
use hypervisor_client_core::rpc::{HypervisorTransport, VirtualDeviceInfo, VirtualDeviceKind};
use hypervisor_client_core::{
    ChangeFeature, DiskAdapter, EndpointConfig, HypervisorClient, HypervisorError, ManagedRef, VmDisk, VmLifecycleStatus,
    VmNic, VmPowerState, VmTemplate,
};

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
        guestinfo: HashMap::new(),
        auto_start: true,
        host_affinity_tag: None,
    }
}

/// S1: Deploy, Start, Stop, Delete against a fresh template.
#[tokio::test]
async fn deploy_start_stop_delete() {
    let client = client();

    let deployed = client.deploy(&template("alpha#ws1")).await.unwrap();
    assert_eq!(deployed.state, VmPowerState::Running);
    assert_eq!(deployed.status, VmLifecycleStatus::Deployed);

    let stopped = client.stop(&deployed.id).await.unwrap();
    assert_eq!(stopped.state, VmPowerState::Off);

    client.delete(&deployed.id).await.unwrap();
    let found = client.find(&deployed.id).await.unwrap();
    assert!(found.is_empty());
}

/// S2: a second Start against an already-running VM is a no-op that still
/// returns the (unchanged) running Vm.
#[tokio::test]
async fn idempotent_start_is_a_no_op() {
    let client = client();
    let deployed = client.deploy(&template("alpha#ws1")).await.unwrap();
    assert_eq!(deployed.state, VmPowerState::Running);

    let again = client.start(&deployed.id).await.unwrap();
    assert_eq!(again.state, VmPowerState::Running);
    assert_eq!(again.id, deployed.id);
}

/// S3: Change targets the second CD-ROM device by numeric selector, leaving
/// the first untouched.
#[tokio::test]
async fn reconfigure_iso_by_index_targets_second_cdrom() {
    let mock = Arc::new(MockTransport::new());
    let transport: Arc<dyn HypervisorTransport> = mock.clone();
    let client = HypervisorClient::new(config(), transport);

    let vm = client.deploy(&template("alpha#ws1")).await.unwrap();
    let vm_ref: ManagedRef = vm.reference.parse().unwrap();

    mock.set_device_list(
        &vm_ref,
        vec![
            VirtualDeviceInfo { key: 200, label: "CD/DVD drive 1".into(), kind: VirtualDeviceKind::Cdrom, backing: None, connected: false },
            VirtualDeviceInfo { key: 201, label: "CD/DVD drive 2".into(), kind: VirtualDeviceKind::Cdrom, backing: None, connected: false },
        ],
    );

    let kv = hypervisor_client_core::VmKeyValue { key: "iso".into(), value: "[ds1] isos/linux.iso:1".into() };
    let refreshed = client.change(&vm.id, &kv).await.unwrap();
    assert_eq!(refreshed.id, vm.id);
}

/// S4: listing an object-store datastore forces recursion and widens the
/// search pattern, but the caller still sees paths under the name it asked
/// for rather than the endpoint's internal UUID.
#[tokio::test]
async fn object_store_listing_hides_the_uuid_translation() {
    let client = client();
    client.find("").await.unwrap(); // drives connect() so the datastore browser is initialized

    let files = client.get_files("[vsan] ws1/*", false).await.unwrap();
    assert!(!files.is_empty());
    assert!(files.iter().all(|f| f.starts_with("[vsan] ws1")));
}

/// S5: cloning a blank disk template allocates a thin disk at the
/// destination and exposes monotonic progress under the destination path.
#[tokio::test]
async fn clone_of_blank_template_tracks_progress_by_destination() {
    let client = client();
    client.find("").await.unwrap();

    let dest = "[ds1] ws1/a.vmdk";
    assert_eq!(client.task_progress(dest), -1);

    client.clone_disk("blank-40-lsilogic.vmdk", dest).await.unwrap();
    let progress = client.task_progress(dest);
    assert!(progress >= 0);
}

/// S6: SetAffinity issues one cluster rule naming both VMs, then starts both
/// of them concurrently.
#[tokio::test]
async fn set_affinity_issues_rule_then_starts_named_vms() {
    let client = client();

    let a = client.deploy(&template("alpha#ws1")).await.unwrap();

    let mut tpl_b = template("beta#ws1");
    tpl_b.auto_start = false;
    let b = client.deploy(&tpl_b).await.unwrap();
    let b = client.stop(&b.id).await.unwrap();
    assert_eq!(b.state, VmPowerState::Off);

    client.set_affinity("ws1", &[a.id.clone(), b.id.clone()], true).await.unwrap();

    let refreshed_b = client.find(&b.id).await.unwrap();
    assert_eq!(refreshed_b.len(), 1);
    assert_eq!(refreshed_b[0].state, VmPowerState::Running);
}

/// SetAffinity refuses a standalone-host endpoint outright.
#[tokio::test]
async fn set_affinity_rejects_non_cluster_endpoint() {
    let mut cfg = config();
    cfg.uplink = None;
    let transport: Arc<dyn HypervisorTransport> = Arc::new(MockTransport::new());
    let client = HypervisorClient::new(cfg, transport);

    let err = client.set_affinity("ws1", &[], false).await.unwrap_err();
    assert!(matches!(err, HypervisorError::InvalidArgument(_)));
}

/// Save refuses to snapshot a disk that does not belong to the VM's own
/// workspace tag (spec invariant 4).
#[tokio::test]
async fn save_refuses_a_foreign_workspace_disk() {
    let mock = Arc::new(MockTransport::new());
    let vm_ref = ManagedRef::new("VirtualMachine", "vm-1");
    mock.seed_vm(&vm_ref, "alpha#ws1", "uuid-1", "[ds1] other-workspace/alpha.vmx", VmPowerState::Off);
    let transport: Arc<dyn HypervisorTransport> = mock;
    let client = HypervisorClient::new(config(), transport);

    let err = client.save("uuid-1").await.unwrap_err();
    assert!(matches!(err, HypervisorError::InvalidArgument(_)));
}

/// GetTicket formats a WebMKS URL and omits the default port.
#[tokio::test]
async fn get_ticket_omits_default_port() {
    let client = client();
    let vm = client.deploy(&template("alpha#ws1")).await.unwrap();
    let url = client.get_ticket(&vm.id).await.unwrap();
    assert!(url.starts_with("wss://esx1.lab.example.com/ticket/"));
    assert!(!url.contains(":443"));
}

/// The seeded topology's cluster ref is reachable from the mock's root
/// folder, a sanity check the other scenarios lean on implicitly.
#[test]
fn mock_topology_exposes_a_cluster() {
    assert_eq!(refs::cluster().kind, "ClusterComputeResource");
}
