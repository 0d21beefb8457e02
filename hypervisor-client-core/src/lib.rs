//! # hypervisor-client-core
//!
//! Control-plane client mediating between an orchestrator and a single
//! vSphere-style hypervisor endpoint.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              HypervisorClient                 │
//! │  (Find, Start, Stop, Save, Deploy, Change...) │
//! └───────────────────────┬────────────────────────┘
//!                         │
//!                         ▼
//! ┌──────────────────────────────────────────────┐
//! │              HypervisorSession                │
//! │   connect/disconnect, resolved topology,      │
//! │   selected network manager, task tracker      │
//! └───────┬──────────────────┬──────────────┬─────┘
//!         ▼                  ▼              ▼
//! ┌───────────────┐  ┌───────────────┐  ┌──────────────┐
//! │ NetworkManager │  │DatastoreBrowser│  │ InventoryStore│
//! │ Host/Distrib/  │  │ object-store   │  │ cached Vm     │
//! │ Overlay        │  │ namespace UUID │  │ view          │
//! └───────────────┘  └───────────────┘  └──────────────┘
//!         │
//!         ▼
//! ┌──────────────────────────────────────────────┐
//! │            HypervisorTransport                │
//! │   SoapTransport (real endpoint) / MockTransport│
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hypervisor_client_core::{EndpointConfig, HypervisorClient};
//! use hypervisor_client_core::rpc::soap::SoapTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EndpointConfig { /* ... */ };
//!     let transport = Arc::new(SoapTransport::new(config.url.clone(), config.ignore_certificate_errors).unwrap());
//!     let client = HypervisorClient::new(config, transport);
//!
//!     let vms = client.find("").await.unwrap();
//!     println!("{} vms under management", vms.len());
//! }
//! ```

pub mod client;
pub mod config;
pub mod datastore;
pub mod error;
pub mod inventory;
pub mod mock;
pub mod network;
pub mod resolver;
pub mod rpc;
pub mod session;
pub mod tasks;
pub mod types;

pub use client::HypervisorClient;
pub use config::EndpointConfig;
pub use error::{HypervisorError, Result};
pub use inventory::{InMemoryInventoryStore, InventoryStore};
pub use rpc::HypervisorTransport;
pub use session::{HypervisorSession, SessionState};
pub use types::{
    ChangeFeature, DatastorePath, DiskAdapter, ManagedRef, TaskInfo, TaskState, Vm, VmDisk, VmKeyValue,
    VmLifecycleStatus, VmNic, VmPowerState, VmQuestion, VmTask, VmTemplate,
};
