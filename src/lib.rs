//! microvmd - single-host microVM orchestration agent
//!
//! microvmd exposes a small HTTP control plane through which clients create,
//! manage, and delete lightweight QEMU virtual machines booted from arbitrary
//! container images.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  HTTP control plane (axum)                      │
//! ├─────────────────────────────────────────────────┤
//! │  Instance manager (table, counters, rollback)   │
//! ├──────────┬──────────┬──────────┬────────────────┤
//! │  Image   │  Network │  Seed /  │  Process       │
//! │  cache   │  (TAP +  │  inject  │  supervisor    │
//! │  (docker │  NAT)    │  (cloud- │  (QEMU child)  │
//! │  export) │          │  init)   │                │
//! └──────────┴──────────┴──────────┴────────────────┘
//! ```
//!
//! For each create request the agent converts the container image into a
//! cached raw ext4 disk, copies it per-instance, provisions a TAP device and
//! NAT rules, seeds credentials via a cloud-init cidata ISO (plus a direct
//! loop-mount injection as fallback), and launches QEMU with a direct kernel
//! boot. In-memory state is snapshotted to `state.json` on every mutation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod cloudinit;
pub mod command;
pub mod config;
pub mod error;
pub mod image;
pub mod inject;
pub mod manager;
pub mod network;
pub mod supervisor;

pub use config::AgentConfig;
pub use error::{Error, Result};
pub use manager::{Action, Instance, InstanceConfig, Manager};
pub use supervisor::VmProcess;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
