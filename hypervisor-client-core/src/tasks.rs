//! Task Tracker (spec §4.E): synchronous await plus an asynchronous monitor
//! of fire-and-forget tasks, grounded on the same polling shape the teacher's
//! state watcher uses for its own reconcile ticks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::error::{HypervisorError, Result};
use crate::rpc::{HypervisorTransport, ObjectSpec, PropertyFilterSpec, PropertyValue};
use crate::types::{ManagedRef, TaskInfo, TaskState, VmPowerState};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A tracked `_taskMap` entry: the underlying task ref plus the last
/// `TaskInfo` observed for it (`None` until the first background refresh).
struct KeyedTask {
    task_ref: ManagedRef,
    info: Option<TaskInfo>,
}

/// Owns the two tracking maps from spec §4.E: `_tasks` (VM id → task,
/// refreshed onto the cached Vm's progress) and `_taskMap` (arbitrary id →
/// `TaskInfo`, queried by `task_progress`).
pub struct TaskTracker {
    transport: Arc<dyn HypervisorTransport>,
    tasks: Mutex<HashMap<String, ManagedRef>>,
    task_map: Mutex<HashMap<String, KeyedTask>>,
}

/// Applied by the session monitor onto the VM inventory cache after each
/// task-loop tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub vm_id: String,
    pub progress: i32,
}

impl TaskTracker {
    pub fn new(transport: Arc<dyn HypervisorTransport>) -> Self {
        Self {
            transport,
            tasks: Mutex::new(HashMap::new()),
            task_map: Mutex::new(HashMap::new()),
        }
    }

    /// `waitForVimTask`: poll every second until the task leaves
    /// `{queued, running}`.
    pub async fn wait_for_task(&self, task: &ManagedRef) -> Result<TaskInfo> {
        loop {
            let info = self.poll(task).await?;
            if info.state.is_terminal() {
                return Ok(info);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Register a task against a VM id so the 3 s background tick keeps the
    /// cached Vm's `task.progress` current without the caller blocking on it
    /// (e.g. Save's background snapshot removal).
    pub fn register_vm_task(&self, vm_id: impl Into<String>, task: ManagedRef) {
        self.tasks.lock().unwrap().insert(vm_id.into(), task);
    }

    /// Register a task under an arbitrary key (typically a destination
    /// datastore path, for `CloneDisk`) so `task_progress` can be polled by
    /// that key instead of by VM id.
    pub fn register_keyed_task(&self, id: impl Into<String>, task: ManagedRef) {
        self.task_map.lock().unwrap().insert(id.into(), KeyedTask { task_ref: task, info: None });
    }

    /// `-1` when unknown, `0` when registered but not yet populated, the
    /// live progress while running, `100` on either terminal outcome (error
    /// detail is logged at refresh time, not surfaced through this call).
    pub fn task_progress(&self, id: &str) -> i32 {
        match self.task_map.lock().unwrap().get(id) {
            None => -1,
            Some(KeyedTask { info: None, .. }) => 0,
            Some(KeyedTask { info: Some(info), .. }) => match info.state {
                TaskState::Error | TaskState::Success => 100,
                _ => info.progress,
            },
        }
    }

    /// Background monitor tick (spec §4.E/§4.G, every 3 s). Refreshes both
    /// maps, drops terminal `_tasks` entries, and returns the progress
    /// updates the caller should apply to its inventory cache.
    pub async fn tick(&self) -> Vec<TaskUpdate> {
        let tracked: Vec<(String, ManagedRef)> =
            self.tasks.lock().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let mut updates = Vec::with_capacity(tracked.len());
        for (vm_id, task_ref) in tracked {
            match self.poll(&task_ref).await {
                Ok(info) => {
                    let progress = match info.state {
                        TaskState::Success => 100,
                        TaskState::Error => {
                            warn!(vm_id, message = %info.error_message(), "tracked task ended in error");
                            -1
                        }
                        _ => info.progress,
                    };
                    updates.push(TaskUpdate { vm_id: vm_id.clone(), progress });
                    if info.state.is_terminal() {
                        self.tasks.lock().unwrap().remove(&vm_id);
                    }
                }
                Err(err) => {
                    warn!(vm_id, %err, "failed to refresh tracked task");
                }
            }
        }

        let keyed: Vec<(String, ManagedRef)> = self
            .task_map
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| !t.info.as_ref().map(|i| i.state.is_terminal()).unwrap_or(false))
            .map(|(k, t)| (k.clone(), t.task_ref.clone()))
            .collect();

        for (id, task_ref) in keyed {
            match self.poll(&task_ref).await {
                Ok(info) => {
                    if info.state == TaskState::Error {
                        warn!(id, message = %info.error_message(), "keyed task ended in error");
                    }
                    if let Some(entry) = self.task_map.lock().unwrap().get_mut(&id) {
                        entry.info = Some(info);
                    }
                }
                Err(err) => {
                    warn!(id, %err, "failed to refresh keyed task");
                }
            }
        }

        updates
    }

    /// Single non-blocking poll, exposed for operations that need to peek a
    /// task's state without joining the 1 s wait loop (Save's 500 ms grace
    /// check before deciding whether to hand the removal off to `_tasks`).
    pub async fn poll_once(&self, task: &ManagedRef) -> Result<TaskInfo> {
        self.poll(task).await
    }

    async fn poll(&self, task: &ManagedRef) -> Result<TaskInfo> {
        let filter = PropertyFilterSpec {
            object_set: vec![ObjectSpec { obj: task.clone(), recurse: false }],
            prop_set: vec![],
        };
        let content = self
            .transport
            .retrieve_properties(&filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| HypervisorError::NotFound(format!("task {task} not found")))?;

        match content.get("info") {
            Some(PropertyValue::Task(info)) => Ok(info.clone()),
            _ => Err(HypervisorError::Internal(format!("task {task} carries no info property"))),
        }
    }
}

/// Idempotent power-op detection (spec §4.E): a power-on that fails because
/// the VM was already running, or a power-off that fails because it was
/// already off, is recognized by substring match on the localized error and
/// treated as success rather than a real failure.
pub fn is_already_in_desired_power_state(info: &TaskInfo, target: VmPowerState) -> bool {
    if info.state != TaskState::Error {
        return false;
    }
    let marker = match target {
        VmPowerState::Running => "powered on",
        VmPowerState::Off => "powered off",
    };
    info.error_message().to_lowercase().contains(marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::types::VmPowerState;

    #[tokio::test]
    async fn wait_for_task_blocks_until_terminal() {
        let transport = Arc::new(MockTransport::new());
        let vm_ref = ManagedRef::new("VirtualMachine", "vm-1");
        transport.seed_vm(&vm_ref, "alpha#ws1", "uuid-1", "[ds1] ws1/alpha.vmx", VmPowerState::Off);
        let task_ref = transport.power_on(&vm_ref).await.unwrap();

        let tracker = TaskTracker::new(transport.clone());
        let info = tracker.wait_for_task(&task_ref).await.unwrap();
        assert_eq!(info.state, TaskState::Success);
    }

    #[tokio::test]
    async fn idempotent_power_on_is_recognized() {
        let transport = Arc::new(MockTransport::new());
        let vm_ref = ManagedRef::new("VirtualMachine", "vm-1");
        transport.seed_vm(&vm_ref, "alpha#ws1", "uuid-1", "[ds1] ws1/alpha.vmx", VmPowerState::Running);
        let task_ref = transport.power_on(&vm_ref).await.unwrap();

        let tracker = TaskTracker::new(transport.clone());
        let info = tracker.wait_for_task(&task_ref).await.unwrap();
        assert_eq!(info.state, TaskState::Error);
        assert!(is_already_in_desired_power_state(&info, VmPowerState::Running));
        assert!(!is_already_in_desired_power_state(&info, VmPowerState::Off));
    }

    #[tokio::test]
    async fn task_progress_tracks_registered_keyed_task() {
        let transport = Arc::new(MockTransport::new());
        let tracker = TaskTracker::new(transport.clone());

        assert_eq!(tracker.task_progress("[ds1] ws1/a.vmdk"), -1);

        let task_ref = transport.create_virtual_disk(
            &ManagedRef::new("Datacenter", "datacenter-1"),
            "[ds1] ws1/a.vmdk",
            40,
            crate::types::DiskAdapter::LsiLogic,
        ).await.unwrap();
        tracker.register_keyed_task("[ds1] ws1/a.vmdk", task_ref);
        assert_eq!(tracker.task_progress("[ds1] ws1/a.vmdk"), 0);

        tracker.tick().await;
        assert_eq!(tracker.task_progress("[ds1] ws1/a.vmdk"), 100);
    }

    #[tokio::test]
    async fn tick_updates_and_drops_terminal_vm_tasks() {
        let transport = Arc::new(MockTransport::new());
        let vm_ref = ManagedRef::new("VirtualMachine", "vm-1");
        transport.seed_vm(&vm_ref, "alpha#ws1", "uuid-1", "[ds1] ws1/alpha.vmx", VmPowerState::Off);
        let task_ref = transport.power_on(&vm_ref).await.unwrap();

        let tracker = TaskTracker::new(transport.clone());
        tracker.register_vm_task("vm-1", task_ref);

        let updates = tracker.tick().await;
        assert_eq!(updates, vec![TaskUpdate { vm_id: "vm-1".to_string(), progress: 100 }]);

        let again = tracker.tick().await;
        assert!(again.is_empty());
    }
}
