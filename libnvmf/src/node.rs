//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes a volume available to
//! workloads:
//!
//! 1. **Stage**: optionally connect the fabric and mount at a global path.
//! 2. **Publish**: connect (or reuse the staged attachment) and mount at the
//!    workload's target path.
//! 3. **Unpublish**: unmount, and disconnect when nothing was staged.
//! 4. **Unstage**: unmount the global path and disconnect.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
};

/// Node service: local attach and mount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at the global staging path.
    ///
    /// This is idempotent, and a no-op when the node does not stage volumes.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Undo [`CsiNode::stage_volume`].  Idempotent.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume at its target path.
    ///
    /// This is idempotent: calling it again for the same `target_path` should
    /// succeed without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume from its target path.  Idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Ask the fabric controller to rescan the volume's namespaces so a grown
    /// target size becomes visible.
    async fn expand_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    /// Advertise the RPCs this node service implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;
}
