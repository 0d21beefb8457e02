//! Lists files/folders on a datastore, transparently handling object-store
//! namespace UUID translation (spec §4.C).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::error::{HypervisorError, Result};
use crate::rpc::{HypervisorTransport, ObjectSpec, PropertyFilterSpec, PropertySpec, SearchSpec};
use crate::types::{DatastorePath, ManagedRef};

/// Browses datastores reachable from a resolved cluster/host, translating
/// object-store (vSAN-style) namespace UUIDs transparently.
pub struct DatastoreBrowser {
    transport: Arc<dyn HypervisorTransport>,
    datacenter: ManagedRef,
    namespace_manager: ManagedRef,
    /// Write-once memoization of `topLevelFolder -> uuidPath` translations,
    /// keyed by `(datastore, topLevelFolder)` (spec §4.C: "memoized in a
    /// process-wide mapping").
    dsns_map: RwLock<HashMap<(String, String), String>>,
}

struct ResolvedDatastore {
    name: String,
    browser: ManagedRef,
    url: String,
    object_store: bool,
}

impl DatastoreBrowser {
    pub fn new(transport: Arc<dyn HypervisorTransport>, datacenter: ManagedRef, namespace_manager: ManagedRef) -> Self {
        Self {
            transport,
            datacenter,
            namespace_manager,
            dsns_map: RwLock::new(HashMap::new()),
        }
    }

    #[instrument(skip(self, cluster))]
    pub async fn get_files(&self, cluster: &ManagedRef, path: &str, recursive: bool) -> Result<Vec<String>> {
        let parsed = DatastorePath::parse(path)?;
        let datastore = self.find_datastore(cluster, &parsed.datastore).await?;

        if datastore.object_store {
            let uuid_top_level = self.translate_top_level(&parsed, &datastore).await?;
            let widened = parsed.with_top_level(&uuid_top_level);
            let widened_parsed = DatastorePath::parse(&widened)?;
            let pattern = format!("*{}", parsed.file_extension());

            debug!(datastore = %parsed.datastore, top_level = %parsed.top_level_folder, "widening object-store search to recursive");

            let raw = self
                .run_search(&datastore.name, &datastore.browser, &widened_parsed.folder_path, &[pattern], true)
                .await?;

            Ok(raw
                .into_iter()
                .map(|entry| rewrite_top_level(&entry, &uuid_top_level, &parsed.top_level_folder, &parsed.datastore))
                .collect())
        } else {
            let pattern = if parsed.file.is_empty() { "*".to_string() } else { parsed.file.clone() };
            self.run_search(&datastore.name, &datastore.browser, &parsed.folder_path, &[pattern], recursive).await
        }
    }

    pub async fn folder_exists(&self, cluster: &ManagedRef, path: &str) -> Result<bool> {
        match self.get_files(cluster, path, false).await {
            Ok(_) => Ok(true),
            Err(HypervisorError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn file_exists(&self, cluster: &ManagedRef, path: &str) -> Result<bool> {
        let files = self.get_files(cluster, path, false).await?;
        let parsed = DatastorePath::parse(path)?;
        Ok(files.iter().any(|f| f.ends_with(&parsed.file)))
    }

    async fn find_datastore(&self, cluster: &ManagedRef, name: &str) -> Result<ResolvedDatastore> {
        let filter = PropertyFilterSpec {
            object_set: vec![ObjectSpec { obj: cluster.clone(), recurse: false }],
            prop_set: vec![PropertySpec {
                obj_type: "ComputeResource".to_string(),
                path_set: vec!["datastore".to_string()],
            }],
        };
        let content = self
            .transport
            .retrieve_properties(&filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| HypervisorError::NotFound(format!("datastore {name} not found")))?;

        let datastores = content.get("datastore").and_then(|v| v.as_ref_list()).unwrap_or(&[]);

        for ds_ref in datastores {
            let ds_filter = PropertyFilterSpec {
                object_set: vec![ObjectSpec { obj: ds_ref.clone(), recurse: false }],
                prop_set: vec![PropertySpec {
                    obj_type: "Datastore".to_string(),
                    path_set: vec!["summary.name".to_string(), "summary.url".to_string(), "capability".to_string(), "browser".to_string()],
                }],
            };
            let ds_content = self.transport.retrieve_properties(&ds_filter).await?.into_iter().next();
            let Some(ds_content) = ds_content else { continue };

            let ds_name = ds_content.get("summary.name").and_then(|v| v.as_str()).unwrap_or_default();
            if ds_name != name {
                continue;
            }

            let url = ds_content.get("summary.url").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let object_store = ds_content
                .get("capability")
                .and_then(|v| v.as_capability())
                .map(|c| !c.top_level_directory_create_supported)
                .unwrap_or(false);
            let browser = ds_content
                .get("browser")
                .and_then(|v| v.as_ref())
                .cloned()
                .ok_or_else(|| HypervisorError::Internal(format!("datastore {name} has no browser")))?;

            return Ok(ResolvedDatastore { name: ds_name.to_string(), browser, url, object_store });
        }

        Err(HypervisorError::NotFound(format!("datastore {name} not found on cluster")))
    }

    async fn translate_top_level(&self, parsed: &DatastorePath, datastore: &ResolvedDatastore) -> Result<String> {
        let key = (parsed.datastore.clone(), parsed.top_level_folder.clone());
        if let Some(cached) = self.dsns_map.read().await.get(&key) {
            return Ok(cached.clone());
        }

        let ns_url = format!("{}{}", datastore.url, parsed.top_level_folder);
        let uuid_path = self
            .transport
            .convert_namespace_path_to_uuid_path(&self.datacenter, &self.namespace_manager, &ns_url)
            .await?;

        self.dsns_map.write().await.insert(key, uuid_path.clone());
        Ok(uuid_path)
    }

    async fn run_search(&self, datastore: &str, browser: &ManagedRef, folder_path: &str, patterns: &[String], recursive: bool) -> Result<Vec<String>> {
        let spec = SearchSpec { match_pattern: patterns.to_vec() };
        let datastore_path = format!("[{datastore}] {folder_path}");

        let task = if recursive {
            self.transport.search_datastore_subfolders(browser, &datastore_path, &spec).await?
        } else {
            self.transport.search_datastore(browser, &datastore_path, &spec).await?
        };

        wait_search_task(self.transport.as_ref(), &task).await?;
        let files = self.transport.search_result(&task).await?;

        Ok(files
            .into_iter()
            .map(|f| format!("{folder_path}/{path}", path = f.path.rsplit('/').next().unwrap_or(&f.path)))
            .collect())
    }
}

async fn wait_search_task(transport: &dyn HypervisorTransport, task: &ManagedRef) -> Result<()> {
    loop {
        let filter = PropertyFilterSpec {
            object_set: vec![ObjectSpec { obj: task.clone(), recurse: false }],
            prop_set: vec![],
        };
        let content = transport.retrieve_properties(&filter).await?.into_iter().next();
        let Some(info) = content.and_then(|c| c.get("info").cloned()) else { break };
        if let crate::rpc::PropertyValue::Task(task_info) = info {
            if task_info.state.is_terminal() {
                if task_info.state == crate::types::TaskState::Error {
                    return Err(HypervisorError::TaskError(task_info.error_message()));
                }
                break;
            }
        } else {
            break;
        }
    }
    Ok(())
}

fn rewrite_top_level(entry: &str, uuid_top_level: &str, caller_top_level: &str, datastore: &str) -> String {
    let rewritten = if let Some(rest) = entry.strip_prefix(uuid_top_level) {
        format!("{caller_top_level}{rest}")
    } else {
        entry.to_string()
    };
    format!("[{datastore}] {rewritten}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{refs, MockTransport};

    #[tokio::test]
    async fn classic_datastore_honors_recursive_flag_and_exact_pattern() {
        let transport: Arc<dyn HypervisorTransport> = Arc::new(MockTransport::new());
        let browser = DatastoreBrowser::new(transport, refs::datacenter(), ManagedRef::new("DatastoreNamespaceManager", "nsm"));
        let files = browser.get_files(&refs::cluster(), "[ds1] ws1/a.vmdk", false).await.unwrap();
        assert!(!files.is_empty());
        assert!(files[0].starts_with("[ds1]"));
    }

    #[tokio::test]
    async fn object_store_datastore_forces_recursive_and_widens_pattern() {
        let transport: Arc<dyn HypervisorTransport> = Arc::new(MockTransport::new());
        let browser = DatastoreBrowser::new(transport, refs::datacenter(), ManagedRef::new("DatastoreNamespaceManager", "nsm"));
        let files = browser.get_files(&refs::cluster(), "[vsan] ws1/*", false).await.unwrap();
        assert!(!files.is_empty());
        assert!(files[0].starts_with("[vsan] ws1"));
    }

    #[tokio::test]
    async fn namespace_translation_is_memoized() {
        let transport: Arc<dyn HypervisorTransport> = Arc::new(MockTransport::new());
        let browser = DatastoreBrowser::new(transport, refs::datacenter(), ManagedRef::new("DatastoreNamespaceManager", "nsm"));
        browser.get_files(&refs::cluster(), "[vsan] ws1/a.vmdk", false).await.unwrap();
        assert_eq!(browser.dsns_map.read().await.len(), 1);
        browser.get_files(&refs::cluster(), "[vsan] ws1/b.vmdk", false).await.unwrap();
        assert_eq!(browser.dsns_map.read().await.len(), 1);
    }

    #[test]
    fn datastore_path_rejects_malformed_input() {
        assert!(DatastorePath::parse("not-a-datastore-path").is_err());
    }
}
