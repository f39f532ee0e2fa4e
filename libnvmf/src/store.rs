//! JSON record files.
//!
//! The controller keeps one `<volume_id>.json` per provisioned volume in its
//! map directory; the node keeps a `<target_path>.json` connector next to each
//! attachment.  Writes go to a temporary sibling first and are renamed into
//! place, so a reader never sees a half-written record.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::NvmfError;
use crate::registry::{ProvisionedVolume, VolumeSource};
use crate::types::{CONTEXT_NQN, PARAM_ENDPOINT, PARAM_TYPE, Transport, Volume};

/// Reserved parameter holding the orchestrator volume name.
pub const PARAM_CSI_NAME: &str = "_csi_name";
/// Reserved parameter holding the driver that provisioned the volume.
pub const PARAM_CSI_PROVISIONER: &str = "_csi_provisioner";

const RECORD_SUFFIX: &str = ".json";

/// Path of the record for `id` inside `dir`.  The id must be a single,
/// normal path component.
pub fn record_path(dir: &Path, id: &str) -> Result<PathBuf, NvmfError> {
    let mut components = Path::new(id).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if id.is_empty() || id.contains('/') || !single_normal {
        return Err(NvmfError::InvalidArgument(format!(
            "record id {id:?} is not a single path component"
        )));
    }
    Ok(dir.join(format!("{id}{RECORD_SUFFIX}")))
}

/// Path of the connector file kept beside a mount target.
pub fn connector_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(RECORD_SUFFIX);
    PathBuf::from(name)
}

/// Serialize `record` to `path`, replacing any previous content.
pub async fn persist_record<T: Serialize>(path: &Path, record: &T) -> Result<(), NvmfError> {
    let json = serde_json::to_vec_pretty(record).map_err(|e| NvmfError::Record {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| NvmfError::io(format!("create dir {}", parent.display()), e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| NvmfError::io(format!("write {}", tmp.display()), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| NvmfError::io(format!("rename into {}", path.display()), e))?;
    debug!(path = %path.display(), "record persisted");
    Ok(())
}

/// Read a record back.  A missing file is `Ok(None)`.
pub async fn load_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, NvmfError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(NvmfError::io(format!("read {}", path.display()), e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| NvmfError::Record {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

/// Delete a record.  Returns `false` when there was nothing to delete.
pub async fn remove_record(path: &Path) -> Result<bool, NvmfError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(NvmfError::io(format!("remove {}", path.display()), e)),
    }
}

/// Load every `*.json` record in `dir`.  Unreadable or malformed files are
/// skipped with a warning; a missing directory yields nothing.
pub async fn load_all_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, NvmfError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(NvmfError::io(format!("read_dir {}", dir.display()), e)),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| NvmfError::io(format!("read_dir {}", dir.display()), e))?
    {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.ends_with(RECORD_SUFFIX) {
            continue;
        }
        match load_record(&path).await {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
        }
    }
    Ok(records)
}

/// [`VolumeSource`] over the controller's own record directory.
#[derive(Debug, Clone)]
pub struct RecordDirSource {
    dir: PathBuf,
}

impl RecordDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

fn provisioned_from_record(volume: &Volume) -> Option<ProvisionedVolume> {
    let name = volume.parameters.get(PARAM_CSI_NAME)?.clone();
    let nqn = volume
        .volume_context
        .get(CONTEXT_NQN)
        .cloned()
        .unwrap_or_else(|| volume.volume_id.0.clone());
    let transport = volume.volume_context.get(PARAM_TYPE)?.parse::<Transport>().ok()?;
    let endpoints = volume
        .volume_context
        .get(PARAM_ENDPOINT)
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    Some(ProvisionedVolume {
        name,
        nqn,
        transport,
        endpoints,
    })
}

#[async_trait]
impl VolumeSource for RecordDirSource {
    async fn list_provisioned_volumes(
        &self,
        driver_name: &str,
    ) -> Result<Vec<ProvisionedVolume>, NvmfError> {
        let records: Vec<Volume> = load_all_records(&self.dir).await?;
        let volumes: Vec<ProvisionedVolume> = records
            .iter()
            .filter(|v| {
                v.parameters.get(PARAM_CSI_PROVISIONER).map(String::as_str) == Some(driver_name)
            })
            .filter_map(|v| {
                let found = provisioned_from_record(v);
                if found.is_none() {
                    warn!(volume_id = %v.volume_id, "record lacks name or transport, skipping");
                }
                found
            })
            .collect();
        info!(dir = %self.dir.display(), count = volumes.len(), "listed provisioned volumes");
        Ok(volumes)
    }
}
