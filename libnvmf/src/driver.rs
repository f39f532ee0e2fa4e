//! Driver wiring: builds the identity, controller and node roles from a
//! [`DriverConfig`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::backend::{NvmfControllerServer, NvmfNodeServer};
use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::fabric::{FabricHost, SysfsHost};
use crate::identity::CsiIdentity;
use crate::mount::{Mounter, SystemMounter};
use crate::registry::{DeviceRegistry, VolumeSource};
use crate::retry::RetryPolicy;
use crate::store::RecordDirSource;
use crate::types::{PluginCapability, PluginInfo};

pub struct NvmfDriver {
    name: String,
    version: String,
    controller: Option<NvmfControllerServer>,
    node: NvmfNodeServer,
}

impl NvmfDriver {
    /// Driver backed by the host's sysfs, mount(2) and the volume record
    /// directory.
    pub fn new(config: DriverConfig) -> Result<Self, CsiError> {
        let host = Arc::new(SysfsHost::new(config.fabric.clone()));
        let source = Arc::new(RecordDirSource::new(config.volume_map_dir.clone()));
        Self::with_components(config, host, Arc::new(SystemMounter::new()), source)
    }

    pub fn with_components(
        config: DriverConfig,
        host: Arc<dyn FabricHost>,
        mounter: Arc<dyn Mounter>,
        source: Arc<dyn VolumeSource>,
    ) -> Result<Self, CsiError> {
        if config.driver_name.trim().is_empty() {
            return Err(CsiError::InvalidArgument(
                "driver name must be specified".to_owned(),
            ));
        }
        RetryPolicy::from_settings(config.connect_retry_count, config.connect_check_interval)
            .map_err(|e| e.into_csi("driver config"))?;

        let controller = config.is_controller_server.then(|| {
            let registry = Arc::new(DeviceRegistry::new(
                config.driver_name.clone(),
                host.clone(),
                source,
            ));
            NvmfControllerServer::new(
                config.driver_name.clone(),
                config.volume_map_dir.clone(),
                registry,
            )
        });
        let node = NvmfNodeServer::new(&config, host, mounter);

        info!(
            driver = %config.driver_name,
            version = %config.version,
            node_id = %config.node_id,
            controller = config.is_controller_server,
            staging = config.enable_staging,
            "driver initialized"
        );
        Ok(Self {
            name: config.driver_name,
            version: config.version,
            controller,
            node,
        })
    }

    /// Restore controller state from disk.  Nodes have nothing to recover.
    pub async fn recover(&self) -> Result<usize, CsiError> {
        match &self.controller {
            Some(controller) => controller.recover().await,
            None => Ok(0),
        }
    }

    /// `None` unless the controller role is enabled.
    pub fn controller(&self) -> Option<&NvmfControllerServer> {
        self.controller.as_ref()
    }

    pub fn node(&self) -> &NvmfNodeServer {
        &self.node
    }
}

#[async_trait]
impl CsiIdentity for NvmfDriver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(self
            .controller
            .iter()
            .map(|_| PluginCapability::ControllerService)
            .collect())
    }
}
