//! Container network provisioning and task launching.
//!
//! This crate implements the two cores of the container daemon: the
//! network engine (device inventory, per-device HTB class trees, virtual
//! interface realisation inside network namespaces, NAT pools) and the
//! task launcher (the fork/clone choreography that joins a container's
//! namespaces, applies credentials and limits, and execs the user command
//! while reporting pids over a private control socket).
//!
//! Network state is driven over rtnetlink; namespace-bound netlink
//! sockets are opened through scoped `setns` guards. The launcher is
//! plain blocking code meant for a dedicated thread.

pub mod addr;
pub mod bitmap;
pub mod child;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod launcher;
pub mod nat;
pub mod netcfg;
pub mod netlink;
pub mod netns;
pub mod task;
pub mod tc;

// Re-export commonly used types
pub use addr::NetAddr;
pub use config::{DeviceGroups, NetworkConfig};
pub use control::ControlSocket;
pub use error::{Error, ErrorKind, Result};
pub use launcher::{start_task, TaskPids};
pub use netcfg::{NetConfig, NsSource};
pub use netns::{NetRegistry, NetworkNamespace};
pub use task::TaskEnv;
