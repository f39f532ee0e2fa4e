//! Node service: attaches NVMe-oF volumes to this host and mounts them.
//!
//! Without staging, publish does the whole attach (connect, mount, record)
//! and unpublish undoes it.  With staging enabled the attach moves to
//! stage/unstage and publish only bind-mounts the staged volume.
//!
//! The connector that attached a volume is written next to the path it was
//! mounted at (`<path>.json`) so detach works after a plugin restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DriverConfig;
use crate::error::{CsiError, NvmfError};
use crate::fabric::connector::{Connector, HostIdentity};
use crate::fabric::device::{find_controller, resolve_device_path};
use crate::fabric::{CTRL_RESCAN, FabricHost};
use crate::mount::Mounter;
use crate::node::CsiNode;
use crate::store;
use crate::types::*;

/// Where and how an attached device gets mounted.
struct MountSpec<'a> {
    target: &'a Path,
    capability: &'a VolumeCapability,
    read_only: bool,
}

pub struct NvmfNodeServer {
    node_id: String,
    max_volumes: u64,
    enable_staging: bool,
    retry_count: i32,
    check_interval: i32,
    host_nqn_file: PathBuf,
    host_id_file: PathBuf,
    host: Arc<dyn FabricHost>,
    mounter: Arc<dyn Mounter>,
    /// Serializes publish and stage on this node.  Detach paths do not take
    /// it.
    attach_lock: Mutex<()>,
}

fn require(value: &str, what: &str) -> Result<(), CsiError> {
    if value.trim().is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} must be provided")));
    }
    Ok(())
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Create the mount target: an empty file for block access, a directory
/// otherwise.
async fn prepare_target(target: &Path, block: bool) -> Result<(), CsiError> {
    if !block {
        return tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| CsiError::mount_failed(target, e));
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CsiError::mount_failed(target, e))?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(target)
        .await
        .map(|_| ())
        .map_err(|e| CsiError::mount_failed(target, e))
}

/// Remove a file or empty directory left at a mount target.
async fn remove_target(path: &Path) -> Result<(), CsiError> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CsiError::unmount_failed(path, e)),
    };
    let removed = if meta.is_dir() {
        tokio::fs::remove_dir(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CsiError::unmount_failed(path, format!("remove target: {e}"))),
    }
}

impl NvmfNodeServer {
    pub fn new(config: &DriverConfig, host: Arc<dyn FabricHost>, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            node_id: config.node_id.clone(),
            max_volumes: config.max_volumes_per_node,
            enable_staging: config.enable_staging,
            retry_count: config.connect_retry_count,
            check_interval: config.connect_check_interval,
            host_nqn_file: config.fabric.host_nqn_file.clone(),
            host_id_file: config.fabric.host_id_file.clone(),
            host,
            mounter,
            attach_lock: Mutex::new(()),
        }
    }

    async fn connector_for(
        &self,
        volume_id: &VolumeId,
        volume_context: &HashMap<String, String>,
    ) -> Result<Connector, NvmfError> {
        let identity = HostIdentity::load(&self.host_nqn_file, &self.host_id_file).await;
        Connector::from_volume_context(
            volume_id,
            volume_context,
            &identity,
            self.retry_count,
            self.check_interval,
        )
    }

    /// Place `device` at the target: a bind onto a file for block access, a
    /// formatted filesystem otherwise.
    async fn mount_device(&self, device: &Path, spec: &MountSpec<'_>) -> Result<(), CsiError> {
        let target = spec.target;
        match &spec.capability.access_type {
            AccessType::Block => {
                prepare_target(target, true).await?;
                let mut options = vec!["bind".to_owned()];
                if spec.read_only {
                    options.push("ro".to_owned());
                }
                self.mounter.mount(device, target, None, &options).await
            }
            AccessType::Mount {
                fs_type,
                mount_flags,
            } => {
                prepare_target(target, false).await?;
                let mut options = mount_flags.clone();
                if spec.read_only {
                    options.push("ro".to_owned());
                }
                self.mounter
                    .format_and_mount(device, target, fs_type, &options)
                    .await
            }
        }
    }

    /// Connect, optionally mount, and record the connector at
    /// `<record_at>.json`.  Anything failing after the connect is undone.
    async fn attach_volume(
        &self,
        volume_id: &VolumeId,
        volume_context: &HashMap<String, String>,
        record_at: &Path,
        mount: Option<MountSpec<'_>>,
    ) -> Result<PathBuf, CsiError> {
        let scope = format!("attach volume {volume_id}");
        let connector = self
            .connector_for(volume_id, volume_context)
            .await
            .map_err(|e| e.into_csi(&scope))?;
        let device = connector
            .connect(self.host.as_ref())
            .await
            .map_err(|e| e.into_csi(&scope))?;

        let placed = async {
            if let Some(spec) = &mount {
                self.mount_device(&device, spec).await?;
            }
            connector
                .persist(&store::connector_path(record_at))
                .await
                .map_err(|e| e.into_csi(&scope))
        }
        .await;

        if let Err(e) = placed {
            error!(%volume_id, error = %e, "attach failed after connect, detaching");
            if let Some(spec) = &mount
                && self.mounter.is_mount_point(spec.target).await
                && let Err(unmount) = self.mounter.unmount(spec.target).await
            {
                warn!(%volume_id, error = %unmount, "unmount during rollback");
            }
            if let Err(disconnect) = connector.disconnect(self.host.as_ref()).await {
                error!(%volume_id, error = %disconnect, "disconnect during rollback");
            }
            if let Some(spec) = &mount
                && let Err(remove) = remove_target(spec.target).await
            {
                warn!(%volume_id, error = %remove, "target cleanup during rollback");
            }
            return Err(e);
        }
        Ok(device)
    }

    /// Unmount `path` if mounted, then disconnect using the connector
    /// recorded next to it.  A missing record means already detached.
    async fn detach_volume(&self, volume_id: &VolumeId, path: &Path) -> Result<(), CsiError> {
        let scope = format!("detach volume {volume_id}");
        if self.mounter.is_mount_point(path).await {
            self.mounter.unmount(path).await?;
        }

        let record = store::connector_path(path);
        let Some(connector) = Connector::load(&record)
            .await
            .map_err(|e| e.into_csi(&scope))?
        else {
            debug!(%volume_id, path = %path.display(), "no connector record, already detached");
            return Ok(());
        };

        match connector.disconnect(self.host.as_ref()).await {
            Ok(_) => {}
            Err(NvmfError::NoMatchingController(nqn)) => {
                debug!(%volume_id, %nqn, "no live controller, already disconnected");
            }
            Err(e) => return Err(e.into_csi(&scope)),
        }
        store::remove_record(&record)
            .await
            .map_err(|e| e.into_csi(&scope))?;
        Ok(())
    }

    async fn publish_staged(
        &self,
        req: &NodePublishVolumeRequest,
        capability: &VolumeCapability,
    ) -> Result<(), CsiError> {
        let staging = Path::new(&req.staging_target_path);
        let target = Path::new(&req.target_path);
        let source = if capability.is_block() {
            let nqn = req
                .volume_context
                .get(CONTEXT_NQN)
                .map(String::as_str)
                .filter(|n| !n.is_empty())
                .unwrap_or(req.volume_id.0.as_str());
            resolve_device_path(self.host.as_ref(), nqn)
                .await
                .map_err(|e| e.into_csi(format!("publish volume {}", req.volume_id)))?
                .ok_or_else(|| {
                    CsiError::NotFound(format!("volume {} has no attached device", req.volume_id))
                })?
        } else {
            if !self.mounter.is_mount_point(staging).await {
                return Err(CsiError::NotFound(format!(
                    "volume {} is not staged at {}",
                    req.volume_id,
                    staging.display()
                )));
            }
            staging.to_owned()
        };

        prepare_target(target, capability.is_block()).await?;
        let mut options = vec!["bind".to_owned()];
        if req.read_only {
            options.push("ro".to_owned());
        }
        self.mounter.mount(&source, target, None, &options).await?;
        info!(
            source = %source.display(),
            target_path = %req.target_path,
            read_only = req.read_only,
            "volume published (bind-mount)"
        );
        Ok(())
    }
}

#[async_trait]
impl CsiNode for NvmfNodeServer {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        if !self.enable_staging {
            debug!("staging disabled, nothing to do");
            return Ok(());
        }
        require(&req.volume_id.0, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| CsiError::InvalidArgument("volume capability must be provided".to_owned()))?;

        let _attach = self.attach_lock.lock().await;
        let staging = Path::new(&req.staging_target_path);
        if path_exists(&store::connector_path(staging)).await
            && (capability.is_block() || self.mounter.is_mount_point(staging).await)
        {
            debug!(path = %staging.display(), "already staged");
            return Ok(());
        }

        let mount = (!capability.is_block()).then_some(MountSpec {
            target: staging,
            capability,
            read_only: false,
        });
        let device = self
            .attach_volume(&req.volume_id, &req.volume_context, staging, mount)
            .await?;
        info!(device = %device.display(), path = %staging.display(), "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        if !self.enable_staging {
            return Ok(());
        }
        require(&volume_id.0, "volume id")?;
        require(staging_target_path, "staging target path")?;

        let staging = Path::new(staging_target_path);
        self.detach_volume(volume_id, staging).await?;
        remove_target(staging).await?;
        info!("volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| CsiError::InvalidArgument("volume capability must be provided".to_owned()))?;
        require(&req.volume_id.0, "volume id")?;
        require(&req.target_path, "target path")?;
        if self.enable_staging {
            require(&req.staging_target_path, "staging target path")?;
        }

        let _attach = self.attach_lock.lock().await;
        let target = Path::new(&req.target_path);
        if self.mounter.is_mount_point(target).await
            && (self.enable_staging || path_exists(&store::connector_path(target)).await)
        {
            debug!("target already mounted, assuming idempotent retry");
            return Ok(());
        }

        if self.enable_staging {
            return self.publish_staged(&req, capability).await;
        }

        let spec = MountSpec {
            target,
            capability,
            read_only: req.read_only,
        };
        let device = self
            .attach_volume(&req.volume_id, &req.volume_context, target, Some(spec))
            .await?;
        info!(
            device = %device.display(),
            read_only = req.read_only,
            block = capability.is_block(),
            "volume published"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        require(&volume_id.0, "volume id")?;
        require(target_path, "target path")?;

        let target = Path::new(target_path);
        if self.enable_staging {
            if self.mounter.is_mount_point(target).await {
                self.mounter.unmount(target).await?;
            }
        } else {
            self.detach_volume(volume_id, target).await?;
        }
        remove_target(target).await?;
        info!("volume unpublished");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn expand_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        require(&volume_id.0, "volume id")?;
        let scope = format!("expand volume {volume_id}");
        let controller = find_controller(self.host.as_ref(), &volume_id.0)
            .await
            .map_err(|e| e.into_csi(&scope))?
            .ok_or_else(|| CsiError::NotFound(format!("{scope}: no controller attached")))?;
        self.host
            .write_controller_control(&controller, CTRL_RESCAN, "1")
            .await
            .map_err(|e| e.into_csi(&scope))?;
        info!(%controller, "namespace rescan requested");
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: self.max_volumes,
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        let mut capabilities = vec![NodeCapability::ExpandVolume];
        if self.enable_staging {
            capabilities.push(NodeCapability::StageUnstageVolume);
        }
        Ok(capabilities)
    }
}
