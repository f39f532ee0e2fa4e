//! CSI Controller service trait.
//!
//! The Controller service manages the centralized volume lifecycle: it binds
//! orchestrator volume names to discovered NVMe-oF subsystems and releases
//! them again.  It runs once per cluster, next to the orchestrator.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, CreateVolumeRequest, CreateVolumeResponse, Volume, VolumeCapability,
    VolumeId,
};

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a volume by allocating a free NVMe-oF target.
    ///
    /// Repeating a completed request returns the same [`Volume`]; a request
    /// that races an in-flight one for the same name returns an empty
    /// response.
    async fn create_volume(
        &self,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, CsiError>;

    /// Release a previously provisioned volume.  Unknown ids succeed.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// List all volumes known to this controller.
    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError>;

    /// Return the total available capacity in bytes.
    async fn get_capacity(&self) -> Result<u64, CsiError>;

    /// Advertise the RPCs this controller implements.
    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}
