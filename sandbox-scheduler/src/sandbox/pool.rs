use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{MachineError, MachineResult, Machinery};
use crate::models::{Machine, Task};
use crate::storage::TaskStore;

/// Hypervisor specific machine operations
#[async_trait]
pub trait VmDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Revert the machine to its clean snapshot
    async fn restore(&self, _machine: &Machine) -> MachineResult<()> {
        Err(MachineError::NotImplemented("restore"))
    }

    async fn start(&self, machine: &Machine) -> MachineResult<()>;

    async fn stop(&self, machine: &Machine) -> MachineResult<()>;

    async fn stop_safe(&self, machine: &Machine) -> MachineResult<()> {
        self.stop(machine).await
    }

    async fn dump_memory(&self, _machine: &Machine, _path: &Path) -> MachineResult<()> {
        Err(MachineError::NotImplemented("dump_memory"))
    }

    async fn enable_remote_control(&self, _machine: &Machine) -> MachineResult<()> {
        Err(MachineError::NotImplemented("remote control"))
    }

    async fn disable_remote_control(&self, _machine: &Machine) -> MachineResult<()> {
        Err(MachineError::NotImplemented("remote control"))
    }
}

/// Machinery keeping lock state in the store and delegating machine
/// operations to a [`VmDriver`]
pub struct MachinePool<D> {
    store: Arc<dyn TaskStore>,
    driver: D,
    running: RwLock<HashSet<String>>,
}

impl<D: VmDriver> MachinePool<D> {
    pub fn new(store: Arc<dyn TaskStore>, driver: D) -> Self {
        Self {
            store,
            driver,
            running: RwLock::new(HashSet::new()),
        }
    }

    async fn machine(&self, label: &str) -> MachineResult<Machine> {
        self.store
            .list_machines()
            .await?
            .into_iter()
            .find(|m| m.label == label)
            .ok_or_else(|| MachineError::Operation(format!("unknown machine {}", label)))
    }

    async fn stop_with(&self, label: &str, safe: bool) -> MachineResult<()> {
        let machine = self.machine(label).await?;
        info!(vmname = %machine.name, action = "vm.stop", safe, "Stopping machine");
        if safe {
            self.driver.stop_safe(&machine).await?;
        } else {
            self.driver.stop(&machine).await?;
        }
        self.running.write().await.remove(label);
        Ok(())
    }
}

#[async_trait]
impl<D: VmDriver> Machinery for MachinePool<D> {
    async fn initialize(&self) -> MachineResult<()> {
        let machines = self.store.list_machines().await?;
        for machine in &machines {
            if machine.interface.is_none() {
                warn!(
                    vmname = %machine.name,
                    "No network interface defined, routing other than 'none' will not work"
                );
            }
            debug!(vmname = %machine.name, label = %machine.label, platform = %machine.platform, "Machine registered");
        }
        info!(driver = self.driver.name(), count = machines.len(), "Machinery initialized");
        Ok(())
    }

    async fn machines(&self) -> MachineResult<Vec<Machine>> {
        Ok(self.store.list_machines().await?)
    }

    async fn availables(&self) -> MachineResult<usize> {
        Ok(self.store.get_available_machines().await?.len())
    }

    async fn running(&self) -> Vec<String> {
        self.running.read().await.iter().cloned().collect()
    }

    async fn acquire(
        &self,
        machine_id: Option<&str>,
        platform: Option<&str>,
        tags: &[String],
        task_id: Option<i64>,
    ) -> MachineResult<Option<Machine>> {
        Ok(self.store.lock_machine(machine_id, platform, tags, task_id).await?)
    }

    async fn release(&self, label: &str) -> MachineResult<Machine> {
        Ok(self.store.unlock_machine(label).await?)
    }

    async fn start(&self, label: &str, task: &Task, revert: bool) -> MachineResult<()> {
        let machine = self.machine(label).await?;
        info!(task_id = task.id, vmname = %machine.name, action = "vm.start", revert, "Starting machine");

        if revert {
            self.driver.restore(&machine).await.map_err(|e| match e {
                MachineError::Snapshot { .. } => e,
                other => MachineError::Snapshot {
                    label: label.to_string(),
                    reason: other.to_string(),
                },
            })?;
        }
        self.driver.start(&machine).await?;
        self.running.write().await.insert(label.to_string());
        Ok(())
    }

    async fn stop(&self, label: &str) -> MachineResult<()> {
        self.stop_with(label, false).await
    }

    async fn stop_safe(&self, label: &str) -> MachineResult<()> {
        self.stop_with(label, true).await
    }

    async fn dump_memory(&self, label: &str, path: &Path) -> MachineResult<()> {
        let machine = self.machine(label).await?;
        self.driver.dump_memory(&machine, path).await
    }

    async fn enable_remote_control(&self, label: &str) -> MachineResult<()> {
        let machine = self.machine(label).await?;
        self.driver.enable_remote_control(&machine).await
    }

    async fn disable_remote_control(&self, label: &str) -> MachineResult<()> {
        let machine = self.machine(label).await?;
        self.driver.disable_remote_control(&machine).await
    }

    async fn shutdown(&self) {
        let labels = self.running().await;
        if labels.is_empty() {
            return;
        }
        info!(count = labels.len(), "Stopping machines still running");

        let results = join_all(labels.iter().map(|label| self.stop(label))).await;
        for (label, result) in labels.iter().zip(results) {
            if let Err(e) = result {
                error!(vmname = %label, error = %e, "Failed to stop machine during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskType;
    use crate::storage::MemoryStore;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct RecordingDriver {
        calls: Mutex<Vec<String>>,
        fail_restore: bool,
    }

    #[async_trait]
    impl VmDriver for RecordingDriver {
        fn name(&self) -> &str {
            "recording"
        }

        async fn restore(&self, machine: &Machine) -> MachineResult<()> {
            if self.fail_restore {
                return Err(MachineError::Operation("no snapshot".to_string()));
            }
            self.calls.lock().unwrap().push(format!("restore {}", machine.label));
            Ok(())
        }

        async fn start(&self, machine: &Machine) -> MachineResult<()> {
            self.calls.lock().unwrap().push(format!("start {}", machine.label));
            Ok(())
        }

        async fn stop(&self, machine: &Machine) -> MachineResult<()> {
            self.calls.lock().unwrap().push(format!("stop {}", machine.label));
            Ok(())
        }
    }

    async fn pool(driver: RecordingDriver) -> MachinePool<RecordingDriver> {
        let store = MemoryStore::new();
        store.add_machine(Machine::new("win7", "windows")).await;
        store.add_machine(Machine::new("win10", "windows")).await;
        MachinePool::new(Arc::new(store), driver)
    }

    #[tokio::test]
    async fn test_start_reverts_and_tracks_running() {
        let pool = pool(RecordingDriver::default()).await;
        let task = Task::new(1, TaskType::Regular);

        assert_ok!(pool.start("win7", &task, true).await);
        assert_ok!(pool.start("win10", &task, false).await);
        assert_eq!(pool.running().await.len(), 2);

        pool.shutdown().await;
        assert!(pool.running().await.is_empty());

        let calls = pool.driver.calls.lock().unwrap().clone();
        assert_eq!(&calls[..3], &["restore win7", "start win7", "start win10"]);
        assert_eq!(calls.len(), 5);
    }

    #[tokio::test]
    async fn test_restore_failure_is_a_snapshot_error() {
        let pool = pool(RecordingDriver {
            fail_restore: true,
            ..Default::default()
        })
        .await;
        let task = Task::new(1, TaskType::Regular);

        let err = assert_err!(pool.start("win7", &task, true).await);
        assert!(matches!(err, MachineError::Snapshot { .. }));
        assert!(pool.running().await.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_maps_no_match() {
        let pool = pool(RecordingDriver::default()).await;

        let err = assert_err!(pool.acquire(None, Some("linux"), &[], None).await);
        assert!(matches!(err, MachineError::NoMatch));

        let machine = assert_ok!(pool.acquire(Some("win7"), None, &[], None).await).unwrap();
        assert_eq!(pool.availables().await.unwrap(), 1);
        assert_ok!(pool.release(&machine.label).await);
        assert_eq!(pool.availables().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_driver_operations() {
        let pool = pool(RecordingDriver::default()).await;
        let err = assert_err!(pool.dump_memory("win7", Path::new("/tmp/x.dmp")).await);
        assert!(matches!(err, MachineError::NotImplemented(_)));
    }
}
