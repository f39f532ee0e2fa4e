//! Driver configuration.
//!
//! [`DriverConfig`] derives [`clap::Parser`] so a plugin binary can parse it
//! directly (or flatten it into a larger command line), and
//! [`Serialize`]/[`Deserialize`] so it can also be loaded from a file.  Every
//! flag has an environment fallback prefixed with `NVMF_`.

use std::path::PathBuf;

use clap::{Args, Parser, ValueEnum};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DRIVER_NAME: &str = "csi.nvmf.com";
pub const DEFAULT_DRIVER_VERSION: &str = "v1.0.0";
pub const DEFAULT_NODE_ID: &str = "CSINode";
pub const DEFAULT_VOLUME_MAP_DIR: &str = "/var/lib/kubelet/plugins/csi.nvmf.com/volumes";
pub const DEFAULT_MAX_VOLUMES: u64 = 256;
/// Device-path polls after a connect when the connector does not say.
pub const DEFAULT_RETRY_COUNT: i32 = 10;
/// Seconds between device-path polls when the connector does not say.
pub const DEFAULT_CHECK_INTERVAL_SECS: i32 = 1;

pub const SYS_CLASS_NVME: &str = "/sys/class/nvme";
pub const NVME_FABRICS_DEVICE: &str = "/dev/nvme-fabrics";
pub const RUN_NVMF: &str = "/run/nvmf";
pub const DISK_BY_ID: &str = "/dev/disk/by-id";
pub const HOST_NQN_FILE: &str = "/etc/nvme/hostnqn";
pub const HOST_ID_FILE: &str = "/etc/nvme/hostid";
pub const NVME_CLI: &str = "nvme";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Top-level configuration of the NVMe-oF CSI driver.
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "nvmfplugin", about = "CSI driver for NVMe over Fabrics volumes")]
#[serde(default)]
pub struct DriverConfig {
    /// CSI driver name advertised to the orchestrator.
    #[arg(long = "drivername", env = "NVMF_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    pub driver_name: String,

    /// Unique identifier of this node.
    #[arg(long = "nodeid", env = "NVMF_NODE_ID", default_value = DEFAULT_NODE_ID)]
    pub node_id: String,

    #[arg(long, env = "NVMF_DRIVER_VERSION", default_value = DEFAULT_DRIVER_VERSION)]
    pub version: String,

    /// Run the controller role in addition to identity and node.
    #[arg(long = "controller", env = "NVMF_CONTROLLER")]
    pub is_controller_server: bool,

    /// Attach volumes in NodeStageVolume and bind them in NodePublishVolume.
    #[arg(long, env = "NVMF_ENABLE_STAGING")]
    pub enable_staging: bool,

    /// Directory holding one JSON record per provisioned volume.
    #[arg(long = "nvmf-volume-map-dir", env = "NVMF_VOLUME_MAP_DIR", default_value = DEFAULT_VOLUME_MAP_DIR)]
    pub volume_map_dir: PathBuf,

    #[arg(long, env = "NVMF_MAX_VOLUMES", default_value_t = DEFAULT_MAX_VOLUMES)]
    pub max_volumes_per_node: u64,

    /// Device-path polls after a fabric connect.
    #[arg(long, env = "NVMF_CONNECT_RETRY_COUNT", default_value_t = DEFAULT_RETRY_COUNT)]
    pub connect_retry_count: i32,

    /// Seconds between device-path polls.
    #[arg(long, env = "NVMF_CONNECT_CHECK_INTERVAL", default_value_t = DEFAULT_CHECK_INTERVAL_SECS)]
    pub connect_check_interval: i32,

    #[arg(long, env = "NVMF_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub fabric: FabricPaths,
}

/// Host locations used by the fabric layer.  Overridable so the driver can
/// run against a relocated sysfs (containers, tests).
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricPaths {
    /// sysfs class directory listing NVMe controllers.
    #[arg(long, env = "NVMF_SYS_CLASS_NVME", default_value = SYS_CLASS_NVME)]
    pub sys_class_nvme: PathBuf,

    /// Kernel fabrics control device accepting connect directives.
    #[arg(long, env = "NVMF_FABRICS_DEVICE", default_value = NVME_FABRICS_DEVICE)]
    pub fabrics_device: PathBuf,

    /// Per-NQN host tracking directory.
    #[arg(long, env = "NVMF_TRACKING_DIR", default_value = RUN_NVMF)]
    pub tracking_dir: PathBuf,

    /// Directory of stable by-id device links.
    #[arg(long, env = "NVMF_DISK_BY_ID", default_value = DISK_BY_ID)]
    pub disk_by_id_dir: PathBuf,

    #[arg(long, env = "NVMF_HOST_NQN_FILE", default_value = HOST_NQN_FILE)]
    pub host_nqn_file: PathBuf,

    #[arg(long, env = "NVMF_HOST_ID_FILE", default_value = HOST_ID_FILE)]
    pub host_id_file: PathBuf,

    /// nvme-cli executable used for discovery.
    #[arg(long, env = "NVMF_NVME_CLI", default_value = NVME_CLI)]
    pub nvme_cli: String,
}

impl Default for FabricPaths {
    fn default() -> Self {
        Self {
            sys_class_nvme: PathBuf::from(SYS_CLASS_NVME),
            fabrics_device: PathBuf::from(NVME_FABRICS_DEVICE),
            tracking_dir: PathBuf::from(RUN_NVMF),
            disk_by_id_dir: PathBuf::from(DISK_BY_ID),
            host_nqn_file: PathBuf::from(HOST_NQN_FILE),
            host_id_file: PathBuf::from(HOST_ID_FILE),
            nvme_cli: NVME_CLI.to_owned(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            node_id: DEFAULT_NODE_ID.to_owned(),
            version: DEFAULT_DRIVER_VERSION.to_owned(),
            is_controller_server: false,
            enable_staging: false,
            volume_map_dir: PathBuf::from(DEFAULT_VOLUME_MAP_DIR),
            max_volumes_per_node: DEFAULT_MAX_VOLUMES,
            connect_retry_count: DEFAULT_RETRY_COUNT,
            connect_check_interval: DEFAULT_CHECK_INTERVAL_SECS,
            log_format: LogFormat::Text,
            fabric: FabricPaths::default(),
        }
    }
}
