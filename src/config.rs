//! Agent configuration.
//!
//! Paths and fixed parameters for the agent: where the guest kernel and image
//! cache live, where per-instance directories go, and how host ports are
//! derived. Loaded from the `confy` config file when present, with defaults
//! matching a stock `/var/lib/microvmd` install.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application name for config file storage.
const APP_NAME: &str = "microvmd";

/// First host port; an instance's port is `start_port + mac_suffix`.
pub const DEFAULT_START_PORT: u16 = 20000;

/// Gateway address on the private bridge subnet (host side of each TAP).
pub const GATEWAY_IP: &str = "172.16.0.1";

/// The private subnet shared by all guests, masqueraded on egress.
pub const GUEST_SUBNET: &str = "172.16.0.0/24";

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Configuration format version.
    pub version: u8,

    /// Address the HTTP control plane listens on.
    pub listen: String,

    /// Guest kernel image used for direct boot.
    pub kernel_path: PathBuf,

    /// Hypervisor binary, resolved via PATH.
    pub hypervisor: String,

    /// Per-instance directories (disk copy, seed ISO, vm.log) live here.
    pub instances_dir: PathBuf,

    /// Cached raw disks, one `<safe-name>.raw` per image reference.
    pub image_cache_dir: PathBuf,

    /// Cloud-init user-data template with the `{{.SSHKey}}` placeholder.
    pub user_data_template: PathBuf,

    /// Base of the host port range forwarded to guest SSH.
    pub start_port: u16,

    /// Root password set by the fallback credential injector. Off by
    /// default; cloud-init key injection is the primary path.
    #[serde(default)]
    pub root_password: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            version: 1,
            listen: "0.0.0.0:8080".to_string(),
            kernel_path: PathBuf::from("/var/lib/microvmd/images/vmlinux"),
            hypervisor: "qemu-system-x86_64".to_string(),
            instances_dir: PathBuf::from("/var/lib/microvmd/instances"),
            image_cache_dir: PathBuf::from("/var/lib/microvmd/images"),
            user_data_template: PathBuf::from("/etc/microvmd/user-data.yaml"),
            start_port: DEFAULT_START_PORT,
            root_password: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from disk. A missing config file is created with
    /// the defaults, so operators get an editable template on first run.
    pub fn load() -> Result<Self> {
        confy::load(APP_NAME, None).map_err(|e| Error::config("load", e.to_string()))
    }

    /// Directory owned by a single instance.
    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.instances_dir.join(id)
    }

    /// Path of the state snapshot written on every table mutation.
    pub fn state_path(&self) -> PathBuf {
        self.instances_dir.join("state.json")
    }
}
