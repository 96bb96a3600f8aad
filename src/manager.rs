//! Instance lifecycle management.
//!
//! The manager owns the instance table and sequences the image cache, network
//! provisioner, seed generator, and process supervisor under one exclusive
//! mutex: every public operation holds the lock for its entire body, so
//! create/delete/manage are serialised and never observe each other's partial
//! state. Acquired host resources are protected by rollback guards that are
//! disarmed only once the whole creation commits.
//!
//! The table is snapshotted to `state.json` on every mutation and reloaded at
//! startup; hypervisor children from a previous agent life are not reattached
//! (records come back stopped).

use crate::cloudinit;
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::image::ImageCache;
use crate::inject;
use crate::network;
use crate::supervisor::{self, LaunchSpec, VmProcess};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// IP-echo service queried once at startup for the connection hint.
const PUBLIC_IP_PROBE_URL: &str = "https://api.ipify.org";

/// Probe timeout; on expiry the hint falls back to 127.0.0.1.
const PUBLIC_IP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between stop and relaunch on reboot.
const REBOOT_DELAY: Duration = Duration::from_secs(1);

/// Guest user advertised in the connection hint (cloud-init provisioned).
const GUEST_USER: &str = "ubuntu";

/// Lifecycle action accepted by [`Manager::manage_instance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Launch the hypervisor if not already running.
    Start,
    /// Terminate the hypervisor; network rules and disk remain.
    Stop,
    /// Stop, wait a second, relaunch.
    Reboot,
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            "reboot" => Ok(Action::Reboot),
            other => Err(Error::unknown_action(other)),
        }
    }
}

/// Caller-supplied instance configuration, retained for start/reboot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// vCPU count.
    pub cpu: u32,
    /// Memory in MiB.
    pub memory: u32,
    /// Container image reference the root disk is derived from.
    pub image: String,
    /// SSH public key seeded into the guest.
    pub public_key: String,
}

/// One tracked microVM and the host resources it owns.
#[derive(Debug, Serialize, Deserialize)]
pub struct Instance {
    /// Primary key for the control plane.
    pub id: String,
    /// Host TCP port forwarded to the guest's SSH port.
    pub host_port: u16,
    /// Guest address on the private bridge subnet.
    pub guest_ip: Ipv4Addr,
    /// Host TAP interface bound to this VM.
    pub tap_name: String,
    /// Low byte of the synthesised MAC; also the subnet offset.
    pub mac_suffix: u8,
    /// Original request config, reused on start/reboot.
    pub config: InstanceConfig,
    /// Directory owning the disk copy, seed ISO, and vm.log.
    pub instance_dir: PathBuf,
    /// Running hypervisor child, or None when stopped.
    #[serde(skip)]
    pub process: Option<VmProcess>,
}

/// Mutable state behind the manager's single mutex.
#[derive(Debug, Serialize, Deserialize)]
struct ManagerState {
    /// Monotonic allocator for the final address octet. Starts at 2 so the
    /// first instance gets .3; never decremented, so names stay unique for
    /// the whole agent lifetime.
    #[serde(default = "initial_ip_counter")]
    ip_counter: u8,
    #[serde(default)]
    instances: HashMap<String, Instance>,
}

fn initial_ip_counter() -> u8 {
    2
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            ip_counter: initial_ip_counter(),
            instances: HashMap::new(),
        }
    }
}

/// Top-level coordinator: instance table, counters, and the global lock.
pub struct Manager {
    cfg: AgentConfig,
    images: ImageCache,
    public_ip: String,
    state: Mutex<ManagerState>,
}

impl Manager {
    /// Create a manager: instances dir, IP forwarding, persisted state, and
    /// the public-IP probe.
    pub fn new(cfg: AgentConfig) -> Result<Self> {
        let public_ip = discover_public_ip();
        Self::with_public_ip(cfg, public_ip)
    }

    /// Create a manager with a known public IP (skips the probe).
    pub fn with_public_ip(cfg: AgentConfig, public_ip: String) -> Result<Self> {
        std::fs::create_dir_all(&cfg.instances_dir)?;

        if let Err(e) = network::ensure_ip_forward() {
            tracing::warn!(error = %e, "could not enable ip forwarding, guest egress may fail");
        }

        let state = load_snapshot(&cfg);
        let images = ImageCache::new(cfg.image_cache_dir.clone());

        tracing::info!(
            public_ip = %public_ip,
            instances = state.instances.len(),
            "manager ready"
        );

        Ok(Self {
            cfg,
            images,
            public_ip,
            state: Mutex::new(state),
        })
    }

    /// Publicly reachable address used in connection hints.
    pub fn public_ip(&self) -> &str {
        &self.public_ip
    }

    /// Create a new instance and return `(id, ssh_command)`.
    ///
    /// Runs entirely under the global lock. A failure at any step releases
    /// every resource acquired before it: the host is left exactly as it was
    /// before the call.
    pub fn create_instance(&self, config: InstanceConfig) -> Result<(String, String)> {
        let mut state = self.state.lock();

        let source_disk = self.images.ensure_ready(&config.image)?;

        let id = Uuid::new_v4().to_string();
        let (guest_ip, mac_suffix, host_port) = allocate(&mut state, self.cfg.start_port)?;
        let tap = network::tap_name(&id);
        let instance_dir = self.cfg.instance_dir(&id);

        tracing::info!(
            id = %id,
            guest_ip = %guest_ip,
            host_port,
            tap = %tap,
            "creating instance"
        );

        std::fs::create_dir_all(&instance_dir)?;
        let dir_rollback = Rollback::new(|| {
            let _ = std::fs::remove_dir_all(&instance_dir);
        });

        network::provision(&tap, guest_ip, host_port)?;
        let net_rollback = Rollback::new(|| network::teardown(&tap, guest_ip, host_port));

        let disk_path = instance_dir.join("disk.raw");
        std::fs::copy(&source_disk, &disk_path).map_err(|e| {
            Error::disk_copy(format!(
                "{} -> {}: {}",
                source_disk.display(),
                disk_path.display(),
                e
            ))
        })?;

        let seed_path = cloudinit::generate_seed(
            &instance_dir,
            &self.cfg.user_data_template,
            &config.public_key,
            &id,
            guest_ip,
        )?;

        // Cloud-init is the primary credential path; the direct injection is
        // redundant, so its failure only warns.
        if let Err(e) = inject::inject_credentials(
            &disk_path,
            &config.public_key,
            self.cfg.root_password.as_deref(),
        ) {
            tracing::warn!(id = %id, error = %e, "direct credential injection failed");
        }

        let process = supervisor::launch(&LaunchSpec {
            hypervisor: &self.cfg.hypervisor,
            kernel_path: &self.cfg.kernel_path,
            instance_dir: &instance_dir,
            disk_path: &disk_path,
            seed_path: &seed_path,
            tap: &tap,
            mac_suffix,
            cpu: config.cpu,
            memory: config.memory,
        })?;

        net_rollback.disarm();
        dir_rollback.disarm();

        let pid = process.pid();
        let ssh_command = format!("ssh -p {} {}@{}", host_port, GUEST_USER, self.public_ip);
        state.instances.insert(
            id.clone(),
            Instance {
                id: id.clone(),
                host_port,
                guest_ip,
                tap_name: tap,
                mac_suffix,
                config,
                instance_dir,
                process: Some(process),
            },
        );
        self.snapshot(&state);

        tracing::info!(id = %id, pid, "instance created");
        Ok((id, ssh_command))
    }

    /// Stop the instance, tear down its network, remove its directory, and
    /// drop it from the table.
    pub fn delete_instance(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();

        let mut instance = state
            .instances
            .remove(id)
            .ok_or_else(|| Error::not_found(id))?;

        tracing::info!(id = %id, "deleting instance");

        if let Some(process) = instance.process.as_mut() {
            if let Err(e) = process.stop() {
                tracing::warn!(id = %id, error = %e, "failed to stop hypervisor cleanly");
            }
        }

        network::teardown(&instance.tap_name, instance.guest_ip, instance.host_port);

        let dir_result = std::fs::remove_dir_all(&instance.instance_dir);
        self.snapshot(&state);

        match dir_result {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                // The record and host rules are gone; only the directory
                // lingers for the operator to clean up.
                Err(Error::Io(e))
            }
            _ => {
                tracing::info!(id = %id, "instance deleted");
                Ok(())
            }
        }
    }

    /// Apply a lifecycle action to an existing instance.
    pub fn manage_instance(&self, id: &str, action: &str) -> Result<()> {
        let mut state = self.state.lock();

        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| Error::not_found(id))?;
        let action: Action = action.parse()?;

        tracing::info!(id = %id, ?action, "managing instance");

        match action {
            Action::Stop => {
                if let Some(process) = instance.process.as_mut() {
                    process.stop()?;
                }
                instance.process = None;
            }
            Action::Start => {
                if instance
                    .process
                    .as_mut()
                    .is_some_and(|p| p.is_running())
                {
                    tracing::debug!(id = %id, "already running, start is a no-op");
                    return Ok(());
                }
                let process = relaunch(&self.cfg, instance)?;
                tracing::info!(id = %id, pid = process.pid(), "hypervisor started");
                instance.process = Some(process);
            }
            Action::Reboot => {
                if let Some(process) = instance.process.as_mut() {
                    process.stop()?;
                }
                instance.process = None;
                std::thread::sleep(REBOOT_DELAY);
                let process = relaunch(&self.cfg, instance)?;
                tracing::info!(id = %id, pid = process.pid(), "hypervisor relaunched");
                instance.process = Some(process);
            }
        }

        self.snapshot(&state);
        Ok(())
    }

    /// Write the state snapshot. Failures are logged, never fatal: in-memory
    /// state stays authoritative.
    fn snapshot(&self, state: &ManagerState) {
        let path = self.cfg.state_path();
        match serde_json::to_vec_pretty(state) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to write state snapshot");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialise state snapshot");
            }
        }
    }
}

/// Allocate the next subnet slot: final octet, MAC suffix, and host port.
/// Slots are never recycled; the pool holds 253 instances per agent lifetime.
fn allocate(state: &mut ManagerState, start_port: u16) -> Result<(Ipv4Addr, u8, u16)> {
    if state.ip_counter == u8::MAX {
        return Err(Error::AddressPoolExhausted(
            "all 253 guest addresses allocated for this agent lifetime".into(),
        ));
    }
    state.ip_counter += 1;
    let suffix = state.ip_counter;
    let guest_ip = Ipv4Addr::new(172, 16, 0, suffix);
    let host_port = start_port + u16::from(suffix);
    Ok((guest_ip, suffix, host_port))
}

/// Relaunch the hypervisor for an existing instance from its retained
/// config. `vm.log` is appended, not truncated.
fn relaunch(cfg: &AgentConfig, instance: &Instance) -> Result<VmProcess> {
    supervisor::launch(&LaunchSpec {
        hypervisor: &cfg.hypervisor,
        kernel_path: &cfg.kernel_path,
        instance_dir: &instance.instance_dir,
        disk_path: &instance.instance_dir.join("disk.raw"),
        seed_path: &instance.instance_dir.join("cloud-init.disk"),
        tap: &instance.tap_name,
        mac_suffix: instance.mac_suffix,
        cpu: instance.config.cpu,
        memory: instance.config.memory,
    })
}

/// Load the persisted table, or start fresh when there is none (or it does
/// not parse). Restored records carry no process handle.
fn load_snapshot(cfg: &AgentConfig) -> ManagerState {
    let path = cfg.state_path();
    if !path.exists() {
        return ManagerState::default();
    }
    match std::fs::read(&path).map_err(|e| e.to_string()).and_then(|bytes| {
        serde_json::from_slice::<ManagerState>(&bytes).map_err(|e| e.to_string())
    }) {
        Ok(state) => {
            tracing::info!(
                path = %path.display(),
                instances = state.instances.len(),
                "restored state snapshot"
            );
            state
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable state snapshot");
            ManagerState::default()
        }
    }
}

/// Probe the publicly reachable address for connection hints, falling back
/// to loopback when the echo service is unreachable.
fn discover_public_ip() -> String {
    let fallback = || "127.0.0.1".to_string();
    let client = match reqwest::blocking::Client::builder()
        .timeout(PUBLIC_IP_PROBE_TIMEOUT)
        .build()
    {
        Ok(c) => c,
        Err(_) => return fallback(),
    };
    match client
        .get(PUBLIC_IP_PROBE_URL)
        .send()
        .and_then(|r| r.text())
    {
        Ok(body) if !body.trim().is_empty() => body.trim().to_string(),
        _ => {
            tracing::debug!("public ip probe failed, using loopback");
            fallback()
        }
    }
}

/// Runs a cleanup closure on drop unless disarmed. Each acquisition during
/// create registers one; all are disarmed together once the instance
/// commits, so any early return unwinds exactly the resources acquired so
/// far.
struct Rollback<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> Rollback<F> {
    fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    /// Consume the guard without running its cleanup, releasing any borrows
    /// the closure held.
    fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for Rollback<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}
