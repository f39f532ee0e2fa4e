//! NVMe-oF host plumbing.
//!
//! Everything that touches the host's fabric state goes through
//! [`FabricHost`]: running discovery, writing connect directives to the
//! kernel fabrics device, and walking the sysfs controller tree.  The
//! production [`SysfsHost`] reads real paths from [`FabricPaths`]; tests swap
//! in an in-memory host.
//!
//! ```text
//! <sys_class_nvme>/
//!   nvme0/
//!     subsysnqn  hostnqn  delete_controller  rescan_controller
//!     nvme0n1/uuid  nvme0n1/nguid
//! <tracking_dir>/<nqn>/<base64(host_nqn)>
//! <disk_by_id_dir>/nvme-uuid.<uuid>
//! ```

pub mod connector;
pub mod device;
pub mod discovery;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::config::FabricPaths;
use crate::error::NvmfError;
use crate::types::Transport;

/// Controller attribute holding the subsystem NQN.
pub const ATTR_SUBSYS_NQN: &str = "subsysnqn";
/// Controller attribute holding the host NQN the controller was created with.
pub const ATTR_HOST_NQN: &str = "hostnqn";
/// Control file tearing a controller down.
pub const CTRL_DELETE: &str = "delete_controller";
/// Control file triggering a namespace rescan.
pub const CTRL_RESCAN: &str = "rescan_controller";
pub const NS_UUID: &str = "uuid";
pub const NS_NGUID: &str = "nguid";

/// Access to the host's NVMe-oF state.
#[async_trait]
pub trait FabricHost: Send + Sync {
    /// Run one discovery query and return its raw JSON log.
    async fn discover(
        &self,
        transport: Transport,
        address: &str,
        port: &str,
    ) -> Result<String, NvmfError>;

    /// Hand a connect directive to the kernel fabrics driver.
    async fn submit_connect(&self, directive: &str) -> Result<(), NvmfError>;

    /// Names of all live controllers (`nvme0`, `nvme1`, ...).
    async fn controllers(&self) -> Result<Vec<String>, NvmfError>;

    /// Trimmed value of a controller attribute, `None` if it does not exist.
    async fn read_controller_attr(
        &self,
        controller: &str,
        attr: &str,
    ) -> Result<Option<String>, NvmfError>;

    /// Write `value` to a controller control file.
    async fn write_controller_control(
        &self,
        controller: &str,
        attr: &str,
        value: &str,
    ) -> Result<(), NvmfError>;

    /// Namespace entries under a controller, sorted by name.
    async fn namespaces(&self, controller: &str) -> Result<Vec<String>, NvmfError>;

    /// Trimmed value of a namespace attribute, `None` if it does not exist.
    async fn read_namespace_attr(
        &self,
        controller: &str,
        namespace: &str,
        attr: &str,
    ) -> Result<Option<String>, NvmfError>;

    /// Stable by-id link for a namespace uuid, if present.
    async fn device_link(&self, uuid: &str) -> Option<PathBuf>;

    /// Root of the per-NQN host tracking directories.
    fn tracking_root(&self) -> &Path;
}

/// [`FabricHost`] over the real sysfs, the kernel fabrics device and
/// `nvme-cli`.
#[derive(Debug, Clone)]
pub struct SysfsHost {
    paths: FabricPaths,
}

impl SysfsHost {
    pub fn new(paths: FabricPaths) -> Self {
        Self { paths }
    }

    fn controller_dir(&self, controller: &str) -> PathBuf {
        self.paths.sys_class_nvme.join(controller)
    }
}

/// `nvme0n1` and `nvme0c0n1` style entries.
fn is_namespace_entry(name: &str) -> bool {
    name.strip_prefix("nvme").is_some_and(|rest| rest.contains('n'))
}

async fn read_trimmed(path: &Path) -> Result<Option<String>, NvmfError> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s.trim().to_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(NvmfError::io(format!("read {}", path.display()), e)),
    }
}

async fn list_dir(path: &Path) -> Result<Vec<String>, NvmfError> {
    let mut dir = match tokio::fs::read_dir(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(NvmfError::io(format!("read_dir {}", path.display()), e)),
    };
    let mut names = Vec::new();
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| NvmfError::io(format!("read_dir {}", path.display()), e))?
    {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }
    names.sort();
    Ok(names)
}

#[async_trait]
impl FabricHost for SysfsHost {
    #[instrument(skip(self))]
    async fn discover(
        &self,
        transport: Transport,
        address: &str,
        port: &str,
    ) -> Result<String, NvmfError> {
        let output = tokio::process::Command::new(&self.paths.nvme_cli)
            .args([
                "discover",
                "-a",
                address,
                "-s",
                port,
                "-t",
                transport.as_str(),
                "-o",
                "json",
            ])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| NvmfError::Discovery(format!("spawn {}: {e}", self.paths.nvme_cli)))?;

        if !output.status.success() {
            return Err(NvmfError::Discovery(format!(
                "{address}:{port} exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| NvmfError::Discovery(format!("{address}:{port} output not utf-8: {e}")))
    }

    async fn submit_connect(&self, directive: &str) -> Result<(), NvmfError> {
        let device = &self.paths.fabrics_device;
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .await
            .map_err(|e| NvmfError::io(format!("open {}", device.display()), e))?;
        file.write_all(directive.as_bytes())
            .await
            .map_err(|e| NvmfError::io(format!("write {}", device.display()), e))?;

        // The kernel answers with the created instance, e.g. "instance=3,cntlid=1".
        let mut reply = String::new();
        if file.read_to_string(&mut reply).await.is_ok() && !reply.trim().is_empty() {
            debug!(reply = reply.trim(), "fabrics device accepted connect");
        }
        Ok(())
    }

    async fn controllers(&self) -> Result<Vec<String>, NvmfError> {
        list_dir(&self.paths.sys_class_nvme).await
    }

    async fn read_controller_attr(
        &self,
        controller: &str,
        attr: &str,
    ) -> Result<Option<String>, NvmfError> {
        read_trimmed(&self.controller_dir(controller).join(attr)).await
    }

    async fn write_controller_control(
        &self,
        controller: &str,
        attr: &str,
        value: &str,
    ) -> Result<(), NvmfError> {
        let path = self.controller_dir(controller).join(attr);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| NvmfError::io(format!("open {}", path.display()), e))?;
        file.write_all(value.as_bytes())
            .await
            .map_err(|e| NvmfError::io(format!("write {}", path.display()), e))
    }

    async fn namespaces(&self, controller: &str) -> Result<Vec<String>, NvmfError> {
        let entries = list_dir(&self.controller_dir(controller)).await?;
        Ok(entries
            .into_iter()
            .filter(|name| is_namespace_entry(name))
            .collect())
    }

    async fn read_namespace_attr(
        &self,
        controller: &str,
        namespace: &str,
        attr: &str,
    ) -> Result<Option<String>, NvmfError> {
        read_trimmed(&self.controller_dir(controller).join(namespace).join(attr)).await
    }

    async fn device_link(&self, uuid: &str) -> Option<PathBuf> {
        let link = self.paths.disk_by_id_dir.join(format!("nvme-uuid.{uuid}"));
        match tokio::fs::try_exists(&link).await {
            Ok(true) => Some(link),
            _ => None,
        }
    }

    fn tracking_root(&self) -> &Path {
        &self.paths.tracking_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_entries() {
        assert!(is_namespace_entry("nvme0n1"));
        assert!(is_namespace_entry("nvme2c2n1"));
        assert!(!is_namespace_entry("subsysnqn"));
        assert!(!is_namespace_entry("ng0n1"));
        assert!(!is_namespace_entry("nvme0"));
        assert!(!is_namespace_entry("power"));
    }
}
