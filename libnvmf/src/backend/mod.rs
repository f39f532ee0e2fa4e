//! Service implementations over the NVMe-oF engine.
//!
//! [`NvmfControllerServer`] implements [`CsiController`] on top of a
//! [`Provisioner`]; [`NvmfNodeServer`] implements [`CsiNode`] on top of a
//! [`FabricHost`] and a [`Mounter`].  [`crate::NvmfDriver`] wires both.
//!
//! [`CsiController`]: crate::controller::CsiController
//! [`CsiNode`]: crate::node::CsiNode
//! [`Provisioner`]: crate::registry::Provisioner
//! [`FabricHost`]: crate::fabric::FabricHost
//! [`Mounter`]: crate::mount::Mounter

pub mod controller;
pub mod node;

pub use controller::NvmfControllerServer;
pub use node::NvmfNodeServer;
