//! Error types.
//!
//! Two enums cover the crate:
//!
//! * [`NvmfError`]: failures of the allocation and fabric-attachment engine
//!   (discovery, connect, device polling, disconnect, allocation, records).
//! * [`CsiError`]: protocol-facing errors returned by the CSI service traits.
//!   They derive [`Serialize`]/[`Deserialize`] so an RPC frontend can carry
//!   them across the wire, and map onto a [`Code`] via [`CsiError::code`].
//!
//! Engine errors are converted with [`NvmfError::into_csi`], which prefixes an
//! operation scope (volume id, NQN) to the message.

use std::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status classes understood by the CSI transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Aborted,
    ResourceExhausted,
    Unavailable,
    Internal,
    Unimplemented,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid or incomplete request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested volume or record was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource already exists in a conflicting shape.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Another operation holds the volume; retry later.
    #[error("aborted: {0}")]
    Aborted(String),

    /// No free NVMe-oF target is left to allocate.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A downstream dependency (discovery, fabric, source of truth) failed.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The operation is not supported by this plugin.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::MountFailed`] for `path`.
    pub fn mount_failed<E: fmt::Display>(path: &Path, e: E) -> Self {
        Self::MountFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    }

    /// Create a [`CsiError::UnmountFailed`] for `path`.
    pub fn unmount_failed<E: fmt::Display>(path: &Path, e: E) -> Self {
        Self::UnmountFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    }

    /// Status class of this error.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::NotFound(_) => Code::NotFound,
            Self::AlreadyExists(_) => Code::AlreadyExists,
            Self::Aborted(_) => Code::Aborted,
            Self::ResourceExhausted(_) => Code::ResourceExhausted,
            Self::Unavailable(_) => Code::Unavailable,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::MountFailed { .. } | Self::UnmountFailed { .. } | Self::Internal(_) => {
                Code::Internal
            }
        }
    }
}

/// Errors raised by discovery, the device registry and the connector.
#[derive(Debug, Error)]
pub enum NvmfError {
    /// Malformed request input (discovery parameters, NQN length, context).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Connector settings that cannot be used (retry, interval, transport).
    #[error("invalid connector configuration: {0}")]
    InvalidConfiguration(String),

    /// A specific endpoint could not be parsed or connected.
    #[error("endpoint {endpoint} unreachable: {reason}")]
    EndpointUnreachable { endpoint: String, reason: String },

    /// The block device never appeared after connecting.
    #[error("device for {nqn} not ready after {attempts} attempts")]
    DeviceNotReady { nqn: String, attempts: u32 },

    /// No live controller matched the subsystem on disconnect.
    #[error("no controller found for {0}")]
    NoMatchingController(String),

    /// Some matching controllers could not be torn down.
    #[error("disconnect of {nqn} removed {removed} of {matched} controllers")]
    PartialDisconnect {
        nqn: String,
        removed: usize,
        matched: usize,
    },

    /// The volume name is already bound to a target.
    #[error("volume {volume} is already allocated to {nqn}")]
    AlreadyAllocated { volume: String, nqn: String },

    /// Every discovered target is allocated.
    #[error("no available devices found")]
    NoAvailableDevice,

    /// Target discovery failed outright.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// The external source of truth could not be queried.
    #[error("volume source error: {0}")]
    Source(String),

    /// A host file operation failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A persisted record could not be encoded or decoded.
    #[error("record {path}: {reason}")]
    Record { path: String, reason: String },
}

impl NvmfError {
    /// Wrap an I/O error with a short description of what was attempted.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Convert into a [`CsiError`] whose message is prefixed by `scope`.
    pub fn into_csi(self, scope: impl fmt::Display) -> CsiError {
        let message = format!("{scope}: {self}");
        match self {
            Self::InvalidArgument(_) | Self::InvalidConfiguration(_) => {
                CsiError::InvalidArgument(message)
            }
            Self::NoMatchingController(_) => CsiError::NotFound(message),
            Self::AlreadyAllocated { .. } => CsiError::AlreadyExists(message),
            Self::NoAvailableDevice => CsiError::ResourceExhausted(message),
            Self::EndpointUnreachable { .. } | Self::Discovery(_) | Self::Source(_) => {
                CsiError::Unavailable(message)
            }
            Self::DeviceNotReady { .. }
            | Self::PartialDisconnect { .. }
            | Self::Io { .. }
            | Self::Record { .. } => CsiError::Internal(message),
        }
    }
}

impl From<NvmfError> for CsiError {
    fn from(e: NvmfError) -> Self {
        e.into_csi("nvmf")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::NotFound("vol-123".into());
        assert_eq!(err.to_string(), "not found: vol-123");
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::MountFailed {
            path: "/mnt/test".into(),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
        assert_eq!(de.code(), Code::Internal);
    }

    #[test]
    fn engine_errors_map_to_status_classes() {
        let cases = [
            (NvmfError::InvalidArgument("x".into()), Code::InvalidArgument),
            (NvmfError::InvalidConfiguration("x".into()), Code::InvalidArgument),
            (NvmfError::NoAvailableDevice, Code::ResourceExhausted),
            (NvmfError::NoMatchingController("nqn".into()), Code::NotFound),
            (
                NvmfError::EndpointUnreachable {
                    endpoint: "10.0.0.1:4420".into(),
                    reason: "refused".into(),
                },
                Code::Unavailable,
            ),
            (
                NvmfError::DeviceNotReady {
                    nqn: "nqn".into(),
                    attempts: 3,
                },
                Code::Internal,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.into_csi("op").code(), code);
        }
    }

    #[test]
    fn scope_prefixes_message() {
        let err = NvmfError::NoAvailableDevice.into_csi("create volume vol-a");
        assert_eq!(
            err.to_string(),
            "resource exhausted: create volume vol-a: no available devices found"
        );
    }
}
