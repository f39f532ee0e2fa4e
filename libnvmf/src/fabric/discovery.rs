//! Target discovery.
//!
//! Queries every configured discovery address and port and folds the
//! answers into one [`TargetRecord`] per subsystem NQN.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::FabricHost;
use crate::error::NvmfError;
use crate::types::{PARAM_ADDR, PARAM_PORT, PARAM_TYPE, TargetRecord, Transport};

/// Substring marking a discovery-controller entry in the log.
const DISCOVERY_NQN_MARKER: &str = "discovery";

#[derive(Debug, Deserialize)]
struct DiscoveryLog {
    #[serde(default)]
    records: Vec<DiscoveryLogEntry>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryLogEntry {
    #[serde(default)]
    subnqn: String,
    #[serde(default)]
    traddr: String,
    #[serde(default)]
    trsvcid: String,
    #[serde(default)]
    trtype: String,
}

/// One usable subsystem path from a discovery log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPath {
    pub nqn: String,
    /// `None` when the entry carried no address or port.
    pub endpoint: Option<String>,
}

/// Parse an `nvme discover -o json` log, dropping discovery controllers and
/// entries of another transport.
pub fn parse_discovery_log(
    output: &str,
    transport: Transport,
) -> Result<Vec<DiscoveredPath>, NvmfError> {
    let log: DiscoveryLog = serde_json::from_str(output)
        .map_err(|e| NvmfError::Discovery(format!("unparsable discovery log: {e}")))?;

    let paths = log
        .records
        .into_iter()
        .filter(|entry| {
            let nqn = entry.subnqn.trim();
            !nqn.is_empty() && !nqn.to_ascii_lowercase().contains(DISCOVERY_NQN_MARKER)
        })
        .filter(|entry| entry.trtype.parse::<Transport>().ok() == Some(transport))
        .map(|entry| {
            let address = entry.traddr.trim();
            let port = entry.trsvcid.trim();
            let endpoint =
                (!address.is_empty() && !port.is_empty()).then(|| format!("{address}:{port}"));
            DiscoveredPath {
                nqn: entry.subnqn.trim().to_owned(),
                endpoint,
            }
        })
        .collect();
    Ok(paths)
}

fn split_list(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn required<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, NvmfError> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| NvmfError::InvalidArgument(format!("missing discovery parameter {key}")))
}

/// Discover the targets reachable through the addresses and ports in
/// `params`.
///
/// A failing address/port pair is logged and skipped, so the result may be
/// empty without being an error.  Output order is the order in which each
/// NQN was first seen.
#[instrument(skip(host, params))]
pub async fn discover_targets(
    host: &dyn FabricHost,
    params: &HashMap<String, String>,
) -> Result<Vec<TargetRecord>, NvmfError> {
    let addresses = split_list(required(params, PARAM_ADDR)?);
    let ports = split_list(required(params, PARAM_PORT)?);
    let transport: Transport = required(params, PARAM_TYPE)?.parse()?;
    if addresses.is_empty() || ports.is_empty() {
        return Err(NvmfError::InvalidArgument(
            "discovery address and port lists must not be empty".to_owned(),
        ));
    }

    let mut targets: Vec<TargetRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for address in &addresses {
        for port in &ports {
            let output = match host.discover(transport, address, port).await {
                Ok(o) => o,
                Err(e) => {
                    warn!(%address, %port, error = %e, "discovery query failed, skipping");
                    continue;
                }
            };
            let paths = match parse_discovery_log(&output, transport) {
                Ok(p) => p,
                Err(e) => {
                    warn!(%address, %port, error = %e, "discovery log rejected, skipping");
                    continue;
                }
            };

            for path in paths {
                let slot = *index.entry(path.nqn.clone()).or_insert_with(|| {
                    targets.push(TargetRecord::new(path.nqn.clone(), transport));
                    targets.len() - 1
                });
                match path.endpoint {
                    Some(endpoint) => {
                        targets[slot].add_endpoint(endpoint);
                    }
                    None => warn!(nqn = %path.nqn, %address, %port, "entry without address or port"),
                }
            }
        }
    }

    // A target only reported without a usable path cannot be attached.
    targets.retain(|t| {
        let usable = !t.endpoints.is_empty();
        if !usable {
            debug!(nqn = %t.nqn, "dropping target without endpoints");
        }
        usable
    });

    info!(
        count = targets.len(),
        %transport,
        pairs = addresses.len() * ports.len(),
        "discovery complete"
    );
    Ok(targets)
}
