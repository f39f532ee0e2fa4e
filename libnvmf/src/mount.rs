//! Mounting block devices and bind targets.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use nix::mount::MsFlags;
use tracing::{debug, info, instrument, warn};

use crate::error::CsiError;

/// Filesystem used when the capability does not name one.
pub const DEFAULT_FS_TYPE: &str = "ext4";

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Host mount operations used by the node service.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `device` on `target`, creating a filesystem first if the
    /// device has none.  An empty `fs_type` means [`DEFAULT_FS_TYPE`].
    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError>;

    /// Plain mount; pass `"bind"` in `options` for a bind mount.
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), CsiError>;

    async fn unmount(&self, target: &Path) -> Result<(), CsiError>;

    async fn is_mount_point(&self, path: &Path) -> bool;
}

/// [`Mounter`] backed by mount(2), `blkid` and `mkfs.<fs>`.
#[derive(Debug, Clone, Default)]
pub struct SystemMounter;

impl SystemMounter {
    pub fn new() -> Self {
        Self
    }
}

/// Split mount options into kernel flags and the filesystem data string.
pub fn mount_flags(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options.iter().map(|o| o.trim()).filter(|o| !o.is_empty()) {
        match option {
            "bind" => flags |= MsFlags::MS_BIND,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" | "defaults" => {}
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}

fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Whether `path` appears as a mount point in a `/proc/self/mounts` dump.
pub fn mounts_contain(contents: &str, path: &Path) -> bool {
    contents.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|mount_point| Path::new(&unescape_mount_field(mount_point)) == path)
    })
}

/// Existing filesystem on `device`, `None` if it is unformatted.
async fn probe_fs_type(device: &Path) -> Result<Option<String>, CsiError> {
    let output = tokio::process::Command::new("blkid")
        .args(["-p", "-s", "TYPE", "-o", "value"])
        .arg(device)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| CsiError::mount_failed(device, format!("spawn blkid: {e}")))?;
    match output.status.code() {
        Some(0) => {
            let fs = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            Ok((!fs.is_empty()).then_some(fs))
        }
        // blkid exits with 2 when it finds nothing to identify.
        Some(2) => Ok(None),
        code => Err(CsiError::mount_failed(
            device,
            format!(
                "blkid exited with {code:?}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        )),
    }
}

async fn make_fs(device: &Path, fs_type: &str) -> Result<(), CsiError> {
    let mut cmd = tokio::process::Command::new(format!("mkfs.{fs_type}"));
    match fs_type {
        "ext2" | "ext3" | "ext4" => {
            cmd.arg("-F");
        }
        "xfs" => {
            cmd.arg("-f");
        }
        _ => {}
    }
    let output = cmd
        .arg(device)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| CsiError::mount_failed(device, format!("spawn mkfs.{fs_type}: {e}")))?;
    if !output.status.success() {
        return Err(CsiError::mount_failed(
            device,
            format!(
                "mkfs.{fs_type} exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    info!(device = %device.display(), fs_type, "filesystem created");
    Ok(())
}

#[async_trait]
impl Mounter for SystemMounter {
    #[instrument(skip(self, options))]
    async fn format_and_mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        let wanted = if fs_type.is_empty() {
            DEFAULT_FS_TYPE
        } else {
            fs_type
        };
        let fs = match probe_fs_type(device).await? {
            Some(existing) => {
                if existing != wanted {
                    warn!(%existing, %wanted, "device already formatted, keeping existing filesystem");
                }
                existing
            }
            None => {
                make_fs(device, wanted).await?;
                wanted.to_owned()
            }
        };

        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| CsiError::mount_failed(target, e))?;
        self.mount(device, target, Some(fs.as_str()), options).await
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> Result<(), CsiError> {
        let (flags, data) = mount_flags(options);
        let data = (!data.is_empty()).then_some(data.as_str());
        nix::mount::mount(Some(source), target, fs_type, flags, data)
            .map_err(|e| CsiError::mount_failed(target, e))?;

        // MS_RDONLY is ignored on the initial bind; enforce it with a remount.
        if flags.contains(MsFlags::MS_BIND | MsFlags::MS_RDONLY) {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| CsiError::mount_failed(target, format!("remount read-only: {e}")))?;
        }

        debug!(
            source = %source.display(),
            target = %target.display(),
            ?flags,
            "mounted"
        );
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        nix::mount::umount(target).map_err(|e| CsiError::unmount_failed(target, e))?;
        debug!(target = %target.display(), "unmounted");
        Ok(())
    }

    async fn is_mount_point(&self, path: &Path) -> bool {
        match tokio::fs::read_to_string(PROC_MOUNTS).await {
            Ok(contents) => mounts_contain(&contents, path),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn options_split_into_flags_and_data() {
        let (flags, data) = mount_flags(&opts(&["bind", "ro"]));
        assert_eq!(flags, MsFlags::MS_BIND | MsFlags::MS_RDONLY);
        assert!(data.is_empty());

        let (flags, data) = mount_flags(&opts(&["noatime", "discard", " ", "stripe=4"]));
        assert_eq!(flags, MsFlags::MS_NOATIME);
        assert_eq!(data, "discard,stripe=4");
    }

    #[test]
    fn mount_table_lookup() {
        let table = "\
/dev/nvme0n1 /var/lib/kubelet/pods/p1/volumes/mount ext4 rw,relatime 0 0
tmpfs /run/with\\040space tmpfs rw 0 0
";
        assert!(mounts_contain(
            table,
            Path::new("/var/lib/kubelet/pods/p1/volumes/mount")
        ));
        assert!(mounts_contain(table, Path::new("/run/with space")));
        assert!(!mounts_contain(table, Path::new("/var/lib/kubelet")));
    }

    #[tokio::test]
    async fn temp_dir_is_not_a_mount_point() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("not-mounted");
        assert!(!SystemMounter::new().is_mount_point(&dir).await);
    }
}
