//! Device registry: every discovered NVMe-oF target and the volume bound to
//! it.
//!
//! Targets move between two states, unallocated and allocated.  Discovery
//! only ever adds unseen NQNs; allocation and release flip the state and keep
//! the volume-name index in step.  The table lives for the life of the
//! process and can be rehydrated from a [`VolumeSource`] after a restart.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::error::NvmfError;
use crate::fabric::FabricHost;
use crate::fabric::discovery::discover_targets;
use crate::types::{TargetRecord, Transport, VolumeId};

/// A volume some earlier run of this driver provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedVolume {
    pub name: String,
    pub nqn: String,
    pub transport: Transport,
    pub endpoints: Vec<String>,
}

/// Source of truth for volumes that already exist.
#[async_trait]
pub trait VolumeSource: Send + Sync {
    /// Volumes provisioned by `driver_name`.
    async fn list_provisioned_volumes(
        &self,
        driver_name: &str,
    ) -> Result<Vec<ProvisionedVolume>, NvmfError>;
}

/// Binds volume names to storage.  The controller service is written
/// against this trait.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Bind `name` to a target and return it.
    async fn provision(
        &self,
        name: &str,
        capacity_bytes: u64,
        params: &HashMap<String, String>,
    ) -> Result<TargetRecord, NvmfError>;

    /// Release the storage behind `volume_id`.  Unknown ids succeed.
    async fn deprovision(&self, volume_id: &VolumeId) -> Result<(), NvmfError>;

    /// Restore bindings made by an earlier run.  Returns how many were
    /// restored.
    async fn recover(&self) -> Result<usize, NvmfError>;
}

#[derive(Debug, Clone)]
struct DeviceEntry {
    target: TargetRecord,
    allocated: bool,
}

#[derive(Debug, Default)]
struct RegistryTable {
    devices: HashMap<String, DeviceEntry>,
    /// Unallocated NQNs, ordered so allocation is deterministic.
    available: BTreeSet<String>,
    volume_to_nqn: HashMap<String, String>,
}

pub struct DeviceRegistry {
    driver_name: String,
    host: Arc<dyn FabricHost>,
    source: Arc<dyn VolumeSource>,
    table: Mutex<RegistryTable>,
    /// Set once the initial sync has succeeded.
    synced: Mutex<bool>,
}

impl DeviceRegistry {
    pub fn new(
        driver_name: impl Into<String>,
        host: Arc<dyn FabricHost>,
        source: Arc<dyn VolumeSource>,
    ) -> Self {
        Self {
            driver_name: driver_name.into(),
            host,
            source,
            table: Mutex::new(RegistryTable::default()),
            synced: Mutex::new(false),
        }
    }

    /// Run discovery and add every NQN not yet in the table as unallocated.
    /// Known NQNs are left alone.  Returns the number added.
    #[instrument(skip(self, params))]
    pub async fn discover_devices(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<usize, NvmfError> {
        let discovered = discover_targets(self.host.as_ref(), params).await?;

        let mut table = self.table.lock().await;
        if discovered.len() == table.devices.len() {
            debug!(count = discovered.len(), "no new devices discovered");
            return Ok(0);
        }

        let mut added = 0;
        for target in discovered {
            if table.devices.contains_key(&target.nqn) {
                continue;
            }
            debug!(nqn = %target.nqn, endpoints = ?target.endpoints, "new target");
            table.available.insert(target.nqn.clone());
            table.devices.insert(
                target.nqn.clone(),
                DeviceEntry {
                    target,
                    allocated: false,
                },
            );
            added += 1;
        }
        info!(
            added,
            total = table.devices.len(),
            available = table.available.len(),
            "device table updated"
        );
        Ok(added)
    }

    /// Bind `volume_name` to the first available target in NQN order.
    #[instrument(skip(self))]
    pub async fn allocate_device(&self, volume_name: &str) -> Result<TargetRecord, NvmfError> {
        let mut table = self.table.lock().await;
        if let Some(nqn) = table.volume_to_nqn.get(volume_name) {
            return Err(NvmfError::AlreadyAllocated {
                volume: volume_name.to_owned(),
                nqn: nqn.clone(),
            });
        }

        let mut chosen = None;
        for nqn in &table.available {
            match table.devices.get(nqn) {
                Some(entry) if !entry.allocated => {
                    chosen = Some(nqn.clone());
                    break;
                }
                Some(entry) => error!(
                    %nqn,
                    volume = %entry.target.volume_name,
                    "device marked available but allocated, skipping"
                ),
                None => error!(%nqn, "available device missing from table, skipping"),
            }
        }
        let Some(nqn) = chosen else {
            return Err(NvmfError::NoAvailableDevice);
        };

        table.available.remove(&nqn);
        table
            .volume_to_nqn
            .insert(volume_name.to_owned(), nqn.clone());
        let total = table.devices.len();
        let in_use = total - table.available.len();
        let entry = table
            .devices
            .get_mut(&nqn)
            .ok_or(NvmfError::NoAvailableDevice)?;
        entry.allocated = true;
        entry.target.volume_name = volume_name.to_owned();
        info!(%nqn, in_use, total, "device allocated");
        Ok(entry.target.clone())
    }

    /// Return `nqn` to the available set.  Unknown NQNs are a no-op.
    /// Returns the volume name that was bound, if any.
    #[instrument(skip(self))]
    pub async fn release_device(&self, nqn: &str) -> Option<String> {
        let mut table = self.table.lock().await;
        let Some(entry) = table.devices.get_mut(nqn) else {
            info!(%nqn, "release of unknown device");
            return None;
        };
        let was_allocated = entry.allocated;
        entry.allocated = false;
        let name = std::mem::take(&mut entry.target.volume_name);

        if !name.is_empty() {
            table.volume_to_nqn.remove(&name);
        }
        table.available.insert(nqn.to_owned());
        info!(
            %nqn,
            volume = %name,
            was_allocated,
            available = table.available.len(),
            "device released"
        );
        (!name.is_empty()).then_some(name)
    }

    /// Rehydrate allocations from the volume source, once.  A failed sync is
    /// retried on the next call.
    #[instrument(skip(self), fields(driver = %self.driver_name))]
    pub async fn ensure_initial_sync(&self) -> Result<usize, NvmfError> {
        let mut synced = self.synced.lock().await;
        if *synced {
            return Ok(0);
        }

        let volumes = self
            .source
            .list_provisioned_volumes(&self.driver_name)
            .await?;

        let mut table = self.table.lock().await;
        let mut restored = 0;
        for volume in volumes {
            if let Some(bound) = table.volume_to_nqn.get(&volume.name) {
                warn!(
                    volume = %volume.name,
                    nqn = %bound,
                    recovered = %volume.nqn,
                    "volume already bound, skipping recovered mapping"
                );
                continue;
            }
            if let Some(entry) = table.devices.get(&volume.nqn)
                && entry.allocated
            {
                warn!(
                    nqn = %volume.nqn,
                    owner = %entry.target.volume_name,
                    volume = %volume.name,
                    "device bound to another volume, skipping"
                );
                continue;
            }

            let entry = table
                .devices
                .entry(volume.nqn.clone())
                .or_insert_with(|| DeviceEntry {
                    target: TargetRecord::new(volume.nqn.clone(), volume.transport),
                    allocated: false,
                });
            for endpoint in volume.endpoints {
                entry.target.add_endpoint(endpoint);
            }
            entry.target.volume_name = volume.name.clone();
            entry.allocated = true;

            table.available.remove(&volume.nqn);
            debug!(volume = %volume.name, nqn = %volume.nqn, "recovered mapping");
            table.volume_to_nqn.insert(volume.name, volume.nqn);
            restored += 1;
        }

        *synced = true;
        info!(restored, "initial sync complete");
        Ok(restored)
    }
}

#[cfg(test)]
impl DeviceRegistry {
    pub(crate) async fn len(&self) -> usize {
        self.table.lock().await.devices.len()
    }

    pub(crate) async fn available_count(&self) -> usize {
        self.table.lock().await.available.len()
    }

    /// NQN bound to `volume_name`, if any.
    pub(crate) async fn nqn_for(&self, volume_name: &str) -> Option<String> {
        self.table
            .lock()
            .await
            .volume_to_nqn
            .get(volume_name)
            .cloned()
    }

    /// Current record for `nqn`, with its allocation flag.
    pub(crate) async fn device(&self, nqn: &str) -> Option<(TargetRecord, bool)> {
        self.table
            .lock()
            .await
            .devices
            .get(nqn)
            .map(|e| (e.target.clone(), e.allocated))
    }
}

#[async_trait]
impl Provisioner for DeviceRegistry {
    async fn provision(
        &self,
        name: &str,
        _capacity_bytes: u64,
        params: &HashMap<String, String>,
    ) -> Result<TargetRecord, NvmfError> {
        self.ensure_initial_sync().await?;
        self.discover_devices(params).await?;
        self.allocate_device(name).await
    }

    async fn deprovision(&self, volume_id: &VolumeId) -> Result<(), NvmfError> {
        self.release_device(&volume_id.0).await;
        Ok(())
    }

    async fn recover(&self) -> Result<usize, NvmfError> {
        self.ensure_initial_sync().await
    }
}
