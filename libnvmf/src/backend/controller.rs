//! Controller service: binds orchestrator volume names to NVMe-oF targets.
//!
//! Each name moves through `Creating → Created → Deleting`.  Created volumes
//! are kept in memory and as one JSON record per volume under `map_dir`:
//!
//! ```text
//! <map_dir>/
//!   <nqn>.json    # Volume record; carries _csi_name and _csi_provisioner
//! ```
//!
//! The record directory doubles as the recovery source for the device
//! registry after a restart.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::locks::VolumeLocks;
use crate::registry::Provisioner;
use crate::store::{self, PARAM_CSI_NAME, PARAM_CSI_PROVISIONER};
use crate::types::*;

#[derive(Debug, Default)]
struct VolumeTable {
    /// Created volumes, keyed by orchestrator name.
    created: HashMap<String, Volume>,
    creating: HashSet<String>,
    /// Volume ids being deleted.
    deleting: HashSet<String>,
}

impl VolumeTable {
    fn state_of(&self, name: &str) -> Option<VolumeState> {
        if self.created.contains_key(name) {
            Some(VolumeState::Created)
        } else if self.creating.contains(name) {
            Some(VolumeState::Creating)
        } else {
            None
        }
    }

    fn find_by_id(&self, volume_id: &VolumeId) -> Option<(String, Volume)> {
        self.created
            .iter()
            .find(|(_, v)| &v.volume_id == volume_id)
            .map(|(name, v)| (name.clone(), v.clone()))
    }
}

pub struct NvmfControllerServer {
    driver_name: String,
    map_dir: PathBuf,
    provisioner: Arc<dyn Provisioner>,
    volumes: Mutex<VolumeTable>,
    locks: VolumeLocks,
}

impl NvmfControllerServer {
    /// Call [`Self::recover`] afterwards to restore volumes recorded by a
    /// previous run.
    pub fn new(
        driver_name: impl Into<String>,
        map_dir: impl Into<PathBuf>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            driver_name: driver_name.into(),
            map_dir: map_dir.into(),
            provisioner,
            volumes: Mutex::new(VolumeTable::default()),
            locks: VolumeLocks::new(),
        }
    }

    /// Reload volume records from `map_dir` and let the provisioner restore
    /// its bindings.  Returns the number of volumes reloaded.
    pub async fn recover(&self) -> Result<usize, CsiError> {
        let records: Vec<Volume> = store::load_all_records(&self.map_dir)
            .await
            .map_err(|e| e.into_csi("recover volume records"))?;

        let mut restored = 0;
        {
            let mut table = self.volumes.lock().await;
            for volume in records {
                let Some(name) = volume.parameters.get(PARAM_CSI_NAME).cloned() else {
                    warn!(volume_id = %volume.volume_id, "record without volume name, skipping");
                    continue;
                };
                table.created.insert(name, volume);
                restored += 1;
            }
        }

        let rebound = self
            .provisioner
            .recover()
            .await
            .map_err(|e| e.into_csi("recover device bindings"))?;
        info!(
            map_dir = %self.map_dir.display(),
            restored,
            rebound,
            "recovery complete"
        );
        Ok(restored)
    }

    fn validate_create(req: &CreateVolumeRequest) -> Result<u64, CsiError> {
        if req.name.trim().is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume name must be provided".to_owned(),
            ));
        }
        let capacity = req
            .capacity_range
            .filter(|r| !r.is_empty())
            .map(|r| r.capacity_bytes())
            .ok_or_else(|| {
                CsiError::InvalidArgument(format!("volume {}: capacity range must be set", req.name))
            })?;
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(format!(
                "volume {}: volume capabilities must be provided",
                req.name
            )));
        }
        Ok(capacity)
    }

    /// Allocate storage and persist the record.  A failed persist releases
    /// the storage again.
    async fn provision_volume(
        &self,
        req: &CreateVolumeRequest,
        capacity_bytes: u64,
    ) -> Result<Volume, CsiError> {
        let scope = format!("create volume {}", req.name);
        let target = self
            .provisioner
            .provision(&req.name, capacity_bytes, &req.parameters)
            .await
            .map_err(|e| e.into_csi(&scope))?;

        let mut volume_context = req.parameters.clone();
        volume_context.extend(target.volume_context());
        let mut parameters = req.parameters.clone();
        parameters.insert(PARAM_CSI_NAME.to_owned(), req.name.clone());
        parameters.insert(PARAM_CSI_PROVISIONER.to_owned(), self.driver_name.clone());

        let volume = Volume {
            volume_id: VolumeId(target.nqn.clone()),
            capacity_bytes,
            parameters,
            volume_context,
        };

        let persisted = match store::record_path(&self.map_dir, &volume.volume_id.0) {
            Ok(path) => store::persist_record(&path, &volume).await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            error!(volume_id = %volume.volume_id, error = %e, "persist failed, releasing device");
            if let Err(release) = self.provisioner.deprovision(&volume.volume_id).await {
                error!(volume_id = %volume.volume_id, error = %release, "release after failed persist");
            }
            return Err(e.into_csi(&scope));
        }
        Ok(volume)
    }

    async fn remove_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let in_memory = self.volumes.lock().await.find_by_id(volume_id);
        let record_path = store::record_path(&self.map_dir, &volume_id.0);

        let known = match (&in_memory, &record_path) {
            (Some(_), _) => true,
            (None, Ok(path)) => store::load_record::<Volume>(path)
                .await
                .map(|r| r.is_some())
                .unwrap_or_else(|e| {
                    warn!(%volume_id, error = %e, "unreadable volume record");
                    true
                }),
            (None, Err(_)) => false,
        };
        if !known {
            debug!(%volume_id, "no record for volume, releasing anyway");
        }

        self.provisioner
            .deprovision(volume_id)
            .await
            .map_err(|e| e.into_csi(format!("delete volume {volume_id}")))?;

        if let Ok(path) = &record_path
            && let Err(e) = store::remove_record(path).await
        {
            warn!(%volume_id, error = %e, "failed to remove volume record");
        }
        if let Some((name, _)) = in_memory {
            self.volumes.lock().await.created.remove(&name);
        }
        Ok(())
    }
}

#[async_trait]
impl CsiController for NvmfControllerServer {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(
        &self,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, CsiError> {
        let capacity_bytes = Self::validate_create(&req)?;

        {
            let mut table = self.volumes.lock().await;
            match table.state_of(&req.name) {
                Some(VolumeState::Created) => {
                    let existing = table.created[&req.name].clone();
                    if existing.capacity_bytes != capacity_bytes {
                        return Err(CsiError::InvalidArgument(format!(
                            "volume {} already exists with size {}, requested {}",
                            req.name, existing.capacity_bytes, capacity_bytes
                        )));
                    }
                    debug!(volume_id = %existing.volume_id, "returning existing volume");
                    return Ok(CreateVolumeResponse {
                        volume: Some(existing),
                    });
                }
                Some(_) => {
                    debug!("create already in progress");
                    return Ok(CreateVolumeResponse::default());
                }
                None => {
                    table.creating.insert(req.name.clone());
                }
            }
        }

        let result = match self.locks.try_acquire(&req.name) {
            Some(_guard) => self.provision_volume(&req, capacity_bytes).await,
            None => Err(CsiError::Aborted(format!(
                "operation already in progress for volume {}",
                req.name
            ))),
        };

        let mut table = self.volumes.lock().await;
        table.creating.remove(&req.name);
        let volume = result?;
        table.created.insert(req.name.clone(), volume.clone());
        info!(volume_id = %volume.volume_id, capacity_bytes, "volume created");
        Ok(CreateVolumeResponse {
            volume: Some(volume),
        })
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        if volume_id.0.trim().is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume id must be provided".to_owned(),
            ));
        }
        if !self.volumes.lock().await.deleting.insert(volume_id.0.clone()) {
            debug!("delete already in progress");
            return Ok(());
        }

        let result = match self.locks.try_acquire(&volume_id.0) {
            Some(_guard) => self.remove_volume(volume_id).await,
            None => Err(CsiError::Aborted(format!(
                "operation already in progress for volume {volume_id}"
            ))),
        };

        self.volumes.lock().await.deleting.remove(&volume_id.0);
        result?;
        info!("volume deleted");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if self.volumes.lock().await.find_by_id(volume_id).is_none() {
            return Err(CsiError::NotFound(volume_id.to_string()));
        }
        if capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(format!(
                "volume {volume_id}: volume capabilities must be provided"
            )));
        }
        // A target is attached by one host at a time.
        Ok(capabilities
            .iter()
            .all(|c| c.access_mode.is_single_node()))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        let mut volumes: Vec<Volume> = self
            .volumes
            .lock()
            .await
            .created
            .values()
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.volume_id.0.cmp(&b.volume_id.0));
        Ok(volumes)
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        Err(CsiError::Unimplemented("GetCapacity".to_owned()))
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![ControllerCapability::CreateDeleteVolume])
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::error::Code;
    use crate::registry::DeviceRegistry;
    use crate::store::RecordDirSource;
    use crate::testing::{FakeHost, StaticSource, discovery_log};

    const GIB: u64 = 1 << 30;

    fn params() -> HashMap<String, String> {
        HashMap::from([
            (PARAM_ADDR.to_owned(), "10.0.0.1".to_owned()),
            (PARAM_PORT.to_owned(), "4420".to_owned()),
            (PARAM_TYPE.to_owned(), "tcp".to_owned()),
        ])
    }

    fn request(name: &str, bytes: u64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_owned(),
            capacity_range: Some(CapacityRange {
                required_bytes: bytes,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![VolumeCapability::default()],
            parameters: params(),
        }
    }

    fn host_with(nqns: &[&str]) -> Arc<FakeHost> {
        let host = Arc::new(FakeHost::new());
        let records: Vec<(&str, &str, &str)> =
            nqns.iter().map(|n| (*n, "10.0.0.1", "4420")).collect();
        host.set_discovery("10.0.0.1", "4420", discovery_log(&records));
        host
    }

    fn server(map_dir: &Path, nqns: &[&str]) -> (Arc<DeviceRegistry>, NvmfControllerServer) {
        let registry = Arc::new(DeviceRegistry::new(
            "csi.nvmf.com",
            host_with(nqns),
            Arc::new(StaticSource::default()),
        ));
        let server = NvmfControllerServer::new("csi.nvmf.com", map_dir, registry.clone());
        (registry, server)
    }

    #[tokio::test]
    async fn create_is_idempotent_by_name_and_size() {
        let tmp = tempfile::tempdir().unwrap();
        let (_registry, server) = server(tmp.path(), &["nqn.a", "nqn.b"]);

        let first = server.create_volume(request("pvc-1", GIB)).await.unwrap();
        let first = first.volume.unwrap();
        assert_eq!(first.volume_id, VolumeId::from("nqn.a"));
        assert_eq!(first.capacity_bytes, GIB);
        assert_eq!(first.volume_context[CONTEXT_NQN], "nqn.a");
        assert_eq!(first.volume_context[PARAM_ENDPOINT], "10.0.0.1:4420");
        assert_eq!(first.volume_context[PARAM_ADDR], "10.0.0.1");
        assert_eq!(first.parameters[PARAM_CSI_NAME], "pvc-1");
        assert!(tmp.path().join("nqn.a.json").exists());

        let again = server.create_volume(request("pvc-1", GIB)).await.unwrap();
        assert_eq!(again.volume, Some(first));

        let err = server
            .create_volume(request("pvc-1", 2 * GIB))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(server.list_volumes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_validates_request() {
        let tmp = tempfile::tempdir().unwrap();
        let (_registry, server) = server(tmp.path(), &["nqn.a"]);

        let no_name = request("", GIB);
        let mut no_range = request("pvc-1", GIB);
        no_range.capacity_range = None;
        let zero = request("pvc-1", 0);
        let mut no_caps = request("pvc-1", GIB);
        no_caps.volume_capabilities.clear();

        for req in [no_name, no_range, zero, no_caps] {
            let err = server.create_volume(req).await.unwrap_err();
            assert_eq!(err.code(), Code::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn in_flight_create_returns_empty_response() {
        let tmp = tempfile::tempdir().unwrap();
        let (_registry, server) = server(tmp.path(), &["nqn.a"]);
        server.volumes.lock().await.creating.insert("pvc-1".into());

        let resp = server.create_volume(request("pvc-1", GIB)).await.unwrap();
        assert!(resp.volume.is_none());
    }

    #[tokio::test]
    async fn busy_name_is_aborted_and_marker_cleared() {
        let tmp = tempfile::tempdir().unwrap();
        let (_registry, server) = server(tmp.path(), &["nqn.a"]);

        let guard = server.locks.try_acquire("pvc-1").unwrap();
        let err = server.create_volume(request("pvc-1", GIB)).await.unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
        drop(guard);

        let resp = server.create_volume(request("pvc-1", GIB)).await.unwrap();
        assert!(resp.volume.is_some());
    }

    #[tokio::test]
    async fn exhausted_targets() {
        let tmp = tempfile::tempdir().unwrap();
        let (_registry, server) = server(tmp.path(), &["nqn.a"]);
        server.create_volume(request("pvc-1", GIB)).await.unwrap();

        let err = server.create_volume(request("pvc-2", GIB)).await.unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert!(err.to_string().contains("pvc-2"));
    }

    #[tokio::test]
    async fn failed_persist_releases_device() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let (registry, server) = server(&blocker.join("volumes"), &["nqn.a"]);

        let err = server.create_volume(request("pvc-1", GIB)).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(registry.nqn_for("pvc-1").await.is_none());
        assert_eq!(registry.available_count().await, 1);

        // The creating marker was cleared, so a retry runs again.
        let err = server.create_volume(request("pvc-1", GIB)).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn delete_releases_and_forgets() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, server) = server(tmp.path(), &["nqn.a"]);
        let volume = server
            .create_volume(request("pvc-1", GIB))
            .await
            .unwrap()
            .volume
            .unwrap();

        server.delete_volume(&volume.volume_id).await.unwrap();
        assert!(!tmp.path().join("nqn.a.json").exists());
        assert!(server.list_volumes().await.unwrap().is_empty());
        assert_eq!(registry.available_count().await, 1);

        // The freed target can be handed out again.
        let again = server.create_volume(request("pvc-2", GIB)).await.unwrap();
        assert_eq!(again.volume.unwrap().volume_id, volume.volume_id);
    }

    #[tokio::test]
    async fn delete_unknown_or_in_flight_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let (_registry, server) = server(tmp.path(), &["nqn.a"]);

        server
            .delete_volume(&VolumeId::from("nqn.never-created"))
            .await
            .unwrap();
        server
            .delete_volume(&VolumeId::from("bad/id"))
            .await
            .unwrap();

        server.volumes.lock().await.deleting.insert("nqn.a".into());
        server.delete_volume(&VolumeId::from("nqn.a")).await.unwrap();

        let err = server
            .delete_volume(&VolumeId::from(""))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn recover_restores_volumes_and_bindings() {
        let tmp = tempfile::tempdir().unwrap();
        let created = {
            let (_registry, server) = server(tmp.path(), &["nqn.a", "nqn.b"]);
            server
                .create_volume(request("pvc-1", GIB))
                .await
                .unwrap()
                .volume
                .unwrap()
        };

        let registry = Arc::new(DeviceRegistry::new(
            "csi.nvmf.com",
            host_with(&["nqn.a", "nqn.b"]),
            Arc::new(RecordDirSource::new(tmp.path())),
        ));
        let server = NvmfControllerServer::new("csi.nvmf.com", tmp.path(), registry.clone());
        assert_eq!(server.recover().await.unwrap(), 1);
        assert_eq!(registry.nqn_for("pvc-1").await.as_deref(), Some("nqn.a"));

        let again = server.create_volume(request("pvc-1", GIB)).await.unwrap();
        assert_eq!(again.volume, Some(created));

        // The recovered target is not handed to a new name.
        let other = server.create_volume(request("pvc-2", GIB)).await.unwrap();
        assert_eq!(other.volume.unwrap().volume_id, VolumeId::from("nqn.b"));
    }

    #[tokio::test]
    async fn capabilities_and_unsupported_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let (_registry, server) = server(tmp.path(), &["nqn.a"]);
        let volume = server
            .create_volume(request("pvc-1", GIB))
            .await
            .unwrap()
            .volume
            .unwrap();

        assert!(
            server
                .validate_volume_capabilities(&volume.volume_id, &[VolumeCapability::block()])
                .await
                .unwrap()
        );
        let shared = VolumeCapability {
            access_mode: AccessMode::MultiNodeMultiWriter,
            access_type: AccessType::Block,
        };
        assert!(
            !server
                .validate_volume_capabilities(&volume.volume_id, &[shared])
                .await
                .unwrap()
        );
        assert!(matches!(
            server
                .validate_volume_capabilities(&VolumeId::from("nqn.x"), &[VolumeCapability::block()])
                .await,
            Err(CsiError::NotFound(_))
        ));
        assert!(matches!(
            server.get_capacity().await,
            Err(CsiError::Unimplemented(_))
        ));
        assert_eq!(
            server.get_capabilities().await.unwrap(),
            vec![ControllerCapability::CreateDeleteVolume]
        );
    }
}
