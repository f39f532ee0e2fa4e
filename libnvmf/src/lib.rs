//! # libnvmf: CSI volumes backed by NVMe over Fabrics
//!
//! `libnvmf` binds orchestrator volumes to pre-provisioned NVMe-oF subsystems
//! found by discovery, attaches them on worker nodes through the kernel
//! fabrics driver, and presents them as a mounted filesystem or a raw block
//! device.  It follows the RK8s conventions: Tokio for async I/O, `tracing`
//! for observability, `thiserror` for structured errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: targets, volumes, capabilities, requests. |
//! | [`error`] | [`NvmfError`] for the engine, [`CsiError`] for the CSI surface. |
//! | [`config`] | [`DriverConfig`], parsed with clap or loaded with serde. |
//! | [`logging`] | `tracing-subscriber` setup. |
//! | [`identity`], [`controller`], [`node`] | The three CSI service traits. |
//! | [`fabric`] | Discovery, connect/disconnect and device resolution. |
//! | [`registry`] | [`DeviceRegistry`]: discovered targets and their bindings. |
//! | [`store`] | JSON records for volumes and connectors. |
//! | [`mount`] | [`Mounter`] seam over mount(2), `blkid` and `mkfs`. |
//! | [`backend`] | Controller and node service implementations. |
//! | [`driver`] | [`NvmfDriver`]: wires the roles from a config. |

pub mod backend;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod fabric;
pub mod identity;
pub mod locks;
pub mod logging;
pub mod mount;
pub mod node;
pub mod registry;
pub mod retry;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{DriverConfig, FabricPaths, LogFormat};
pub use controller::CsiController;
pub use driver::NvmfDriver;
pub use error::{Code, CsiError, NvmfError};
pub use fabric::connector::Connector;
pub use fabric::{FabricHost, SysfsHost};
pub use identity::CsiIdentity;
pub use mount::{Mounter, SystemMounter};
pub use node::CsiNode;
pub use registry::{DeviceRegistry, Provisioner, VolumeSource};
pub use types::*;
