//! Fabric attachment of one volume on one host.
//!
//! A [`Connector`] carries everything needed to attach a subsystem and to
//! tear it down again later, possibly from a different process: it is
//! persisted next to the mount target after a successful attach.
//!
//! Disconnect is NQN-scoped.  Each attaching host leaves a marker at
//! `<tracking_root>/<nqn>/<base64(host_nqn)>`; controllers created without a
//! `hostnqn` attribute are only torn down once no other host marker remains.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::device::{find_controller, find_path_with_retry};
use super::{ATTR_HOST_NQN, ATTR_SUBSYS_NQN, CTRL_DELETE, FabricHost};
use crate::error::NvmfError;
use crate::retry::RetryPolicy;
use crate::store;
use crate::types::{
    CONTEXT_HOST_ID, CONTEXT_HOST_NQN, CONTEXT_NQN, NVMF_NQN_SIZE, PARAM_ADDR, PARAM_ENDPOINT,
    PARAM_PORT, PARAM_TYPE, Transport, VolumeId,
};

/// This host's NVMe identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostIdentity {
    pub nqn: String,
    pub id: String,
}

impl HostIdentity {
    /// Read the host NQN and host id files.  A missing file leaves the field
    /// empty.
    pub async fn load(nqn_file: &Path, id_file: &Path) -> Self {
        async fn read(path: &Path) -> String {
            match tokio::fs::read_to_string(path).await {
                Ok(s) => s.trim().to_owned(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "host identity file unreadable");
                    String::new()
                }
            }
        }
        Self {
            nqn: read(nqn_file).await,
            id: read(id_file).await,
        }
    }
}

/// Result of an NQN-scoped disconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectOutcome {
    /// Controllers that belonged to this subsystem and host.
    pub matched: usize,
    /// Controllers actually torn down.
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connector {
    pub volume_id: String,
    pub target_nqn: String,
    /// `address:port` paths, connected in order.
    pub target_endpoints: Vec<String>,
    pub transport: String,
    pub host_nqn: String,
    #[serde(default)]
    pub host_id: String,
    /// Device polls after connecting; zero means the default.
    #[serde(default)]
    pub retry_count: i32,
    /// Seconds between polls; zero means the default.
    #[serde(default)]
    pub check_interval_seconds: i32,
}

fn context_value<'a>(ctx: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    ctx.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Split `address:port` at the last colon; IPv6 brackets are stripped.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, String), NvmfError> {
    let malformed = |reason: &str| NvmfError::EndpointUnreachable {
        endpoint: endpoint.to_owned(),
        reason: reason.to_owned(),
    };
    let (address, port) = endpoint
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| malformed("expected address:port"))?;
    let address = address
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']');
    let port = port.trim();
    if address.is_empty() || port.is_empty() {
        return Err(malformed("empty address or port"));
    }
    if port.parse::<u16>().is_err() {
        return Err(malformed("port is not a number"));
    }
    Ok((address.to_owned(), port.to_owned()))
}

fn validate_nqn(nqn: &str) -> Result<(), NvmfError> {
    if nqn.is_empty() || nqn.contains('/') {
        return Err(NvmfError::InvalidArgument(format!("malformed nqn {nqn:?}")));
    }
    if nqn.len() > NVMF_NQN_SIZE {
        return Err(NvmfError::InvalidArgument(format!(
            "nqn is {} bytes, limit is {NVMF_NQN_SIZE}",
            nqn.len()
        )));
    }
    Ok(())
}

fn host_marker(host: &dyn FabricHost, nqn: &str, host_nqn: &str) -> PathBuf {
    host.tracking_root()
        .join(nqn)
        .join(URL_SAFE.encode(host_nqn.as_bytes()))
}

async fn count_entries(dir: &Path) -> Result<usize, NvmfError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(NvmfError::io(format!("read_dir {}", dir.display()), e)),
    };
    let mut count = 0;
    while entries
        .next_entry()
        .await
        .map_err(|e| NvmfError::io(format!("read_dir {}", dir.display()), e))?
        .is_some()
    {
        count += 1;
    }
    Ok(count)
}

/// Tear down this host's controllers for `nqn` and drop its tracking marker.
///
/// Unreadable controllers and failed teardowns are logged; the outcome tells
/// the caller how many controllers matched and how many went away.
#[instrument(skip(host))]
pub async fn disconnect_by_nqn(
    host: &dyn FabricHost,
    nqn: &str,
    host_nqn: &str,
) -> Result<DisconnectOutcome, NvmfError> {
    validate_nqn(nqn)?;

    let nqn_dir = host.tracking_root().join(nqn);
    if !host_nqn.is_empty() {
        let marker = host_marker(host, nqn, host_nqn);
        if let Err(e) = tokio::fs::remove_file(&marker).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(marker = %marker.display(), error = %e, "failed to remove host marker");
        }
    }

    let other_hosts = count_entries(&nqn_dir).await?;
    if other_hosts == 0
        && let Err(e) = tokio::fs::remove_dir_all(&nqn_dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(dir = %nqn_dir.display(), error = %e, "failed to remove tracking dir");
    }

    let mut outcome = DisconnectOutcome::default();
    for controller in host.controllers().await? {
        match host.read_controller_attr(&controller, ATTR_SUBSYS_NQN).await {
            Ok(Some(subsys)) if subsys == nqn => {}
            Ok(_) => continue,
            Err(e) => {
                debug!(%controller, error = %e, "unreadable controller, skipping");
                continue;
            }
        }

        let ours = match host.read_controller_attr(&controller, ATTR_HOST_NQN).await {
            Ok(Some(owner)) => host_nqn.is_empty() || owner == host_nqn,
            Ok(None) => {
                debug!(%controller, other_hosts, "controller has no hostnqn attribute");
                other_hosts == 0
            }
            Err(e) => {
                warn!(%controller, error = %e, "unreadable hostnqn, skipping");
                false
            }
        };
        if !ours {
            continue;
        }

        outcome.matched += 1;
        match host
            .write_controller_control(&controller, CTRL_DELETE, "1")
            .await
        {
            Ok(()) => {
                outcome.removed += 1;
                info!(%controller, %nqn, "controller deleted");
            }
            Err(e) => error!(%controller, %nqn, error = %e, "failed to delete controller"),
        }
    }
    Ok(outcome)
}

impl Connector {
    /// Build a connector from the volume context handed over by the
    /// controller, falling back to the host's own identity.
    pub fn from_volume_context(
        volume_id: &VolumeId,
        ctx: &HashMap<String, String>,
        identity: &HostIdentity,
        retry_count: i32,
        check_interval_seconds: i32,
    ) -> Result<Self, NvmfError> {
        let target_nqn = context_value(ctx, CONTEXT_NQN)
            .unwrap_or(volume_id.0.as_str())
            .to_owned();
        let transport = context_value(ctx, PARAM_TYPE)
            .ok_or_else(|| NvmfError::InvalidArgument(format!("volume context lacks {PARAM_TYPE}")))?
            .to_owned();

        let target_endpoints: Vec<String> = match context_value(ctx, PARAM_ENDPOINT) {
            Some(list) => split_list(list).map(str::to_owned).collect(),
            None => {
                let addresses: Vec<&str> = context_value(ctx, PARAM_ADDR)
                    .map(|v| split_list(v).collect())
                    .unwrap_or_default();
                let ports: Vec<&str> = context_value(ctx, PARAM_PORT)
                    .map(|v| split_list(v).collect())
                    .unwrap_or_default();
                addresses
                    .iter()
                    .flat_map(|a| ports.iter().map(move |p| format!("{a}:{p}")))
                    .collect()
            }
        };
        if target_endpoints.is_empty() {
            return Err(NvmfError::InvalidArgument(format!(
                "volume context lacks {PARAM_ENDPOINT} or {PARAM_ADDR}/{PARAM_PORT}"
            )));
        }

        Ok(Self {
            volume_id: volume_id.0.clone(),
            target_nqn,
            target_endpoints,
            transport,
            host_nqn: context_value(ctx, CONTEXT_HOST_NQN)
                .unwrap_or(identity.nqn.as_str())
                .to_owned(),
            host_id: context_value(ctx, CONTEXT_HOST_ID)
                .unwrap_or(identity.id.as_str())
                .to_owned(),
            retry_count,
            check_interval_seconds,
        })
    }

    fn directive(&self, transport: Transport, address: &str, port: &str) -> String {
        let mut directive = format!(
            "nqn={},transport={},traddr={address},trsvcid={port},hostnqn={}",
            self.target_nqn, transport, self.host_nqn
        );
        if !self.host_id.is_empty() {
            directive.push_str(",hostid=");
            directive.push_str(&self.host_id);
        }
        directive
    }

    /// Attach every endpoint, wait for the block device and record this
    /// host in the tracking directory.  Returns the device path.
    ///
    /// Settings are validated before anything is touched.  Any later failure
    /// runs one compensating disconnect before the error is returned, unless
    /// the subsystem was already attached when the call started.
    #[instrument(skip(self, host), fields(volume_id = %self.volume_id, nqn = %self.target_nqn))]
    pub async fn connect(&self, host: &dyn FabricHost) -> Result<PathBuf, NvmfError> {
        let policy = RetryPolicy::from_settings(self.retry_count, self.check_interval_seconds)?;
        let transport: Transport = self.transport.parse().map_err(|_| {
            NvmfError::InvalidConfiguration(format!(
                "transport must be tcp or rdma, got {:?}",
                self.transport
            ))
        })?;
        if self.target_endpoints.is_empty() {
            return Err(NvmfError::InvalidConfiguration(
                "connector has no endpoints".to_owned(),
            ));
        }
        validate_nqn(&self.target_nqn)?;

        let already_attached = match find_controller(host, &self.target_nqn).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                debug!(error = %e, "controller lookup before connect failed");
                false
            }
        };

        match self.attach(host, transport, &policy).await {
            Ok(device) => {
                info!(device = %device.display(), "volume connected");
                Ok(device)
            }
            Err(e) if already_attached => {
                warn!(error = %e, "connect failed, keeping existing attachment");
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "connect failed, rolling back");
                self.rollback(host).await;
                Err(e)
            }
        }
    }

    async fn attach(
        &self,
        host: &dyn FabricHost,
        transport: Transport,
        policy: &RetryPolicy,
    ) -> Result<PathBuf, NvmfError> {
        for endpoint in &self.target_endpoints {
            let (address, port) = parse_endpoint(endpoint)?;
            debug!(%transport, %address, %port, "connecting endpoint");
            host.submit_connect(&self.directive(transport, &address, &port))
                .await
                .map_err(|e| NvmfError::EndpointUnreachable {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })?;
        }

        let device = find_path_with_retry(host, &self.target_nqn, policy).await?;
        self.create_tracking_marker(host).await?;
        Ok(device)
    }

    async fn create_tracking_marker(&self, host: &dyn FabricHost) -> Result<(), NvmfError> {
        let dir = host.tracking_root().join(&self.target_nqn);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| NvmfError::io(format!("create dir {}", dir.display()), e))?;
        if self.host_nqn.is_empty() {
            warn!("no host nqn, skipping host marker");
            return Ok(());
        }
        let marker = host_marker(host, &self.target_nqn, &self.host_nqn);
        tokio::fs::write(&marker, b"")
            .await
            .map_err(|e| NvmfError::io(format!("create {}", marker.display()), e))
    }

    async fn rollback(&self, host: &dyn FabricHost) {
        match disconnect_by_nqn(host, &self.target_nqn, &self.host_nqn).await {
            Ok(outcome) => debug!(?outcome, "rollback finished"),
            Err(e) => error!(error = %e, "rollback failed"),
        }
    }

    /// Disconnect this connector's subsystem.  Returns the number of
    /// controllers removed.
    #[instrument(skip(self, host), fields(volume_id = %self.volume_id, nqn = %self.target_nqn))]
    pub async fn disconnect(&self, host: &dyn FabricHost) -> Result<usize, NvmfError> {
        let outcome = disconnect_by_nqn(host, &self.target_nqn, &self.host_nqn).await?;
        if outcome.matched == 0 {
            return Err(NvmfError::NoMatchingController(self.target_nqn.clone()));
        }
        if outcome.removed < outcome.matched {
            return Err(NvmfError::PartialDisconnect {
                nqn: self.target_nqn.clone(),
                removed: outcome.removed,
                matched: outcome.matched,
            });
        }
        info!(removed = outcome.removed, "volume disconnected");
        Ok(outcome.removed)
    }

    pub async fn persist(&self, path: &Path) -> Result<(), NvmfError> {
        store::persist_record(path, self).await
    }

    pub async fn load(path: &Path) -> Result<Option<Self>, NvmfError> {
        store::load_record(path).await
    }
}
