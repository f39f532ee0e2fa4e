//! Core CSI types: volumes, capabilities, requests, and fabric targets.
//!
//! These types form the data model shared by the CSI traits, the device
//! registry, and the backend implementations.  They are all
//! [`Serialize`]/[`Deserialize`] so volume records can be persisted as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::NvmfError;

// ---------------------------------------------------------------------------
// Parameter and volume-context keys
// ---------------------------------------------------------------------------

/// Comma-separated target addresses used for discovery.
pub const PARAM_ADDR: &str = "targetTrAddr";
/// Comma-separated target ports used for discovery.
pub const PARAM_PORT: &str = "targetTrPort";
/// Transport type (`tcp` or `rdma`).
pub const PARAM_TYPE: &str = "targetTrType";
/// Comma-separated `address:port` endpoints of an allocated target.
pub const PARAM_ENDPOINT: &str = "targetTrEndpoint";
/// Subsystem NQN of an allocated target.
pub const CONTEXT_NQN: &str = "nqn";
/// Optional host NQN override handed to the node.
pub const CONTEXT_HOST_NQN: &str = "hostNqn";
/// Optional host id override handed to the node.
pub const CONTEXT_HOST_ID: &str = "hostId";

/// Maximum length of an NVMe Qualified Name in bytes.
pub const NVMF_NQN_SIZE: usize = 223;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.  For this driver it is the
/// subsystem NQN of the allocated target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Fabric targets
// ---------------------------------------------------------------------------

/// NVMe-oF transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Rdma,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Rdma => "rdma",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = NvmfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "rdma" => Ok(Self::Rdma),
            other => Err(NvmfError::InvalidArgument(format!(
                "transport type must be tcp or rdma, got: {other}"
            ))),
        }
    }
}

/// One discovered NVMe-oF subsystem, possibly reachable over several paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetRecord {
    /// Subsystem NQN; primary key.
    pub nqn: String,
    pub transport: Transport,
    /// `address:port` paths in order of first discovery.
    pub endpoints: Vec<String>,
    /// Bound orchestrator volume name; empty while unallocated.
    #[serde(default)]
    pub volume_name: String,
}

impl TargetRecord {
    pub fn new(nqn: impl Into<String>, transport: Transport) -> Self {
        Self {
            nqn: nqn.into(),
            transport,
            endpoints: Vec::new(),
            volume_name: String::new(),
        }
    }

    /// Append an endpoint unless it is already known.
    pub fn add_endpoint(&mut self, endpoint: String) -> bool {
        if self.endpoints.contains(&endpoint) {
            return false;
        }
        self.endpoints.push(endpoint);
        true
    }

    /// Volume context handed from the controller to the node role.
    pub fn volume_context(&self) -> HashMap<String, String> {
        HashMap::from([
            (CONTEXT_NQN.to_owned(), self.nqn.clone()),
            (PARAM_TYPE.to_owned(), self.transport.to_string()),
            (PARAM_ENDPOINT.to_owned(), self.endpoints.join(",")),
        ])
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    SingleNodeWriter,
    /// Single-node read-only.
    SingleNodeReaderOnly,
    /// Multi-node read-only.
    MultiNodeReaderOnly,
    /// Multi-node read-write.
    MultiNodeMultiWriter,
}

impl AccessMode {
    pub fn is_single_node(&self) -> bool {
        matches!(self, Self::SingleNodeWriter | Self::SingleNodeReaderOnly)
    }
}

/// Block or filesystem presentation of the volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// Raw block device bound onto a file.
    Block,
    /// Formatted filesystem mounted on a directory.
    Mount {
        /// Filesystem type; empty means the driver default.
        #[serde(default)]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    pub access_type: AccessType,
}

impl VolumeCapability {
    pub fn block() -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Block,
        }
    }

    pub fn mount(fs_type: &str) -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Mount {
                fs_type: fs_type.to_owned(),
                mount_flags: Vec::new(),
            },
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self.access_type, AccessType::Block)
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self::mount("")
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// Requested size bounds; zero means unbounded.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityRange {
    #[serde(default)]
    pub required_bytes: u64,
    #[serde(default)]
    pub limit_bytes: u64,
}

impl CapacityRange {
    pub fn is_empty(&self) -> bool {
        self.required_bytes == 0 && self.limit_bytes == 0
    }

    /// Size recorded for the volume: the required size, else the limit.
    pub fn capacity_bytes(&self) -> u64 {
        if self.required_bytes > 0 {
            self.required_bytes
        } else {
            self.limit_bytes
        }
    }
}

/// Full metadata for a provisioned volume; persisted by the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Unique volume identifier (the target NQN).
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// User-supplied parameters from the storage class / request.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Lifecycle of a volume name on the controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeState {
    Creating,
    Created,
    Deleting,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Orchestrator-level name for the volume.
    pub name: String,
    /// Desired size.
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters (discovery addresses, ports, transport).
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Result of `create_volume`.  `volume` is `None` when another request for
/// the same name is still in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub volume: Option<Volume>,
}

/// Request to stage (globally attach) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: VolumeId,
    /// Global staging mount point.
    pub staging_target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish a volume at a workload path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: VolumeId,
    /// Staging path; only consulted when the node stages volumes.
    #[serde(default)]
    pub staging_target_path: String,
    /// Target path inside the workload's volume directory.
    pub target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"csi.nvmf.com"`.
    pub name: String,
    pub vendor_version: String,
}

/// Capabilities advertised by the Identity service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
}

/// Capabilities advertised by the Controller service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
}

/// Capabilities advertised by the Node service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    ExpandVolume,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
}
