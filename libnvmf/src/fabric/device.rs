//! Resolving a connected subsystem to its block device.

use std::path::PathBuf;

use tracing::{debug, info, instrument, trace};

use super::{ATTR_SUBSYS_NQN, FabricHost, NS_NGUID, NS_UUID};
use crate::error::NvmfError;
use crate::retry::RetryPolicy;

/// First controller whose subsystem NQN is `nqn`.
pub async fn find_controller(
    host: &dyn FabricHost,
    nqn: &str,
) -> Result<Option<String>, NvmfError> {
    for controller in host.controllers().await? {
        match host.read_controller_attr(&controller, ATTR_SUBSYS_NQN).await {
            Ok(Some(subsys)) if subsys == nqn => return Ok(Some(controller)),
            Ok(_) => {}
            Err(e) => trace!(%controller, error = %e, "unreadable controller, skipping"),
        }
    }
    Ok(None)
}

/// Reformat a 32-hex-digit NGUID into dashed UUID form.
pub fn nguid_to_uuid(nguid: &str) -> Option<String> {
    let compact: String = nguid.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    if compact.len() != 32 {
        return None;
    }
    uuid::Uuid::try_parse(&compact)
        .ok()
        .map(|u| u.hyphenated().to_string())
}

/// Namespace identifier of the controller's first namespace: its `uuid`, or
/// its `nguid` when the uuid is missing or all zeroes.
pub async fn namespace_uuid(
    host: &dyn FabricHost,
    controller: &str,
) -> Result<Option<String>, NvmfError> {
    let Some(namespace) = host.namespaces(controller).await?.into_iter().next() else {
        return Ok(None);
    };

    if let Some(raw) = host
        .read_namespace_attr(controller, &namespace, NS_UUID)
        .await?
        .filter(|s| !s.is_empty())
    {
        match uuid::Uuid::try_parse(&raw) {
            Ok(u) if !u.is_nil() => return Ok(Some(u.hyphenated().to_string())),
            Ok(_) => trace!(%controller, %namespace, "nil uuid, trying nguid"),
            Err(_) => return Ok(Some(raw)),
        }
    }

    Ok(host
        .read_namespace_attr(controller, &namespace, NS_NGUID)
        .await?
        .as_deref()
        .and_then(nguid_to_uuid))
}

/// One resolution attempt: controller, namespace identifier, device link.
pub async fn resolve_device_path(
    host: &dyn FabricHost,
    nqn: &str,
) -> Result<Option<PathBuf>, NvmfError> {
    let Some(controller) = find_controller(host, nqn).await? else {
        trace!(%nqn, "no controller yet");
        return Ok(None);
    };
    let Some(uuid) = namespace_uuid(host, &controller).await? else {
        trace!(%nqn, %controller, "no namespace identifier yet");
        return Ok(None);
    };
    let link = host.device_link(&uuid).await;
    if link.is_none() {
        trace!(%nqn, %uuid, "device link not present yet");
    }
    Ok(link)
}

/// Poll [`resolve_device_path`] under `policy`.  Lookup errors count as a
/// failed attempt.
#[instrument(skip(host, policy))]
pub async fn find_path_with_retry(
    host: &dyn FabricHost,
    nqn: &str,
    policy: &RetryPolicy,
) -> Result<PathBuf, NvmfError> {
    let found = policy
        .poll(|attempt| async move {
            match resolve_device_path(host, nqn).await {
                Ok(path) => path,
                Err(e) => {
                    debug!(attempt, error = %e, "device lookup failed");
                    None
                }
            }
        })
        .await;

    match found {
        Some(path) => {
            info!(%nqn, device = %path.display(), "device ready");
            Ok(path)
        }
        None => Err(NvmfError::DeviceNotReady {
            nqn: nqn.to_owned(),
            attempts: policy.attempts(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::FakeHost;

    const UUID: &str = "5c2e6a3b-1f4d-4e8a-9b7c-0d1e2f3a4b5c";

    #[test]
    fn nguid_reformat() {
        assert_eq!(
            nguid_to_uuid("5c2e6a3b1f4d4e8a9b7c0d1e2f3a4b5c").as_deref(),
            Some(UUID)
        );
        assert_eq!(
            nguid_to_uuid("5c2e6a3b 1f4d4e8a 9b7c0d1e 2f3a4b5c").as_deref(),
            Some(UUID)
        );
        assert!(nguid_to_uuid("1234").is_none());
        assert!(nguid_to_uuid("zz2e6a3b1f4d4e8a9b7c0d1e2f3a4b5c").is_none());
    }

    #[tokio::test]
    async fn uuid_preferred_over_nguid() {
        let host = FakeHost::new();
        let ctrl = host.add_controller("nqn.a", Some("host"));
        host.set_namespace_attr(&ctrl, NS_UUID, UUID);
        host.set_namespace_attr(&ctrl, NS_NGUID, "00000000000000000000000000000001");
        assert_eq!(namespace_uuid(&host, &ctrl).await.unwrap().as_deref(), Some(UUID));
    }

    #[tokio::test]
    async fn nil_uuid_falls_back_to_nguid() {
        let host = FakeHost::new();
        let ctrl = host.add_controller("nqn.a", Some("host"));
        host.set_namespace_attr(&ctrl, NS_UUID, "00000000-0000-0000-0000-000000000000");
        host.set_namespace_attr(&ctrl, NS_NGUID, "5c2e6a3b1f4d4e8a9b7c0d1e2f3a4b5c");
        assert_eq!(namespace_uuid(&host, &ctrl).await.unwrap().as_deref(), Some(UUID));
    }

    #[tokio::test]
    async fn resolves_link_for_matching_controller() {
        let host = FakeHost::new();
        host.add_controller("nqn.other", None);
        let ctrl = host.add_controller("nqn.a", Some("host"));
        host.set_namespace_attr(&ctrl, NS_UUID, UUID);
        assert_eq!(find_controller(&host, "nqn.a").await.unwrap(), Some(ctrl));

        let path = resolve_device_path(&host, "nqn.a").await.unwrap().unwrap();
        assert_eq!(path, host.device_path(UUID));
        assert!(resolve_device_path(&host, "nqn.missing").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_reports_attempts() {
        let host = FakeHost::new();
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let err = find_path_with_retry(&host, "nqn.a", &policy)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NvmfError::DeviceNotReady { attempts: 3, .. }
        ));
    }
}
