//! Hypervisor process supervision.
//!
//! Spawns QEMU with a direct kernel boot, the instance's root and seed disks,
//! and a TAP-backed virtio-net device. Stdout and stderr are appended to the
//! instance's `vm.log`. Stopping sends SIGTERM, waits up to three seconds,
//! then SIGKILLs and reaps.

use crate::error::{Error, Result};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Graceful-shutdown window before SIGKILL.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll interval while waiting for the child to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Guest kernel command line. Raw whole-device disks boot from /dev/vda.
const KERNEL_CMDLINE: &str = "console=ttyS0 root=/dev/vda rw panic=1";

/// Everything needed to compose a hypervisor invocation.
#[derive(Debug)]
pub struct LaunchSpec<'a> {
    /// Hypervisor binary name or path.
    pub hypervisor: &'a str,
    /// Guest kernel image.
    pub kernel_path: &'a Path,
    /// Instance directory holding `vm.log`.
    pub instance_dir: &'a Path,
    /// Per-instance root disk.
    pub disk_path: &'a Path,
    /// Cloud-init seed ISO, attached read-only.
    pub seed_path: &'a Path,
    /// Host TAP device bound to the guest NIC.
    pub tap: &'a str,
    /// Low byte of the synthesised guest MAC.
    pub mac_suffix: u8,
    /// vCPU count.
    pub cpu: u32,
    /// Memory in MiB.
    pub memory: u32,
}

/// Whether hardware acceleration is available on this host.
fn kvm_available() -> bool {
    Path::new("/dev/kvm").exists()
}

/// Compose the QEMU argument vector. KVM uses the host CPU model; the TCG
/// fallback uses `max`.
pub fn build_args(spec: &LaunchSpec, kvm: bool) -> Vec<String> {
    let (accel, cpu_model) = if kvm { ("kvm", "host") } else { ("tcg", "max") };
    vec![
        "-nographic".into(),
        "-smp".into(),
        spec.cpu.to_string(),
        "-m".into(),
        spec.memory.to_string(),
        "-accel".into(),
        accel.into(),
        "-cpu".into(),
        cpu_model.into(),
        "-kernel".into(),
        spec.kernel_path.to_string_lossy().into_owned(),
        "-append".into(),
        KERNEL_CMDLINE.into(),
        "-drive".into(),
        format!(
            "file={},format=raw,if=virtio",
            spec.disk_path.to_string_lossy()
        ),
        "-drive".into(),
        format!(
            "file={},format=raw,if=virtio,readonly=on",
            spec.seed_path.to_string_lossy()
        ),
        "-netdev".into(),
        format!(
            "tap,id=net0,ifname={},script=no,downscript=no",
            spec.tap
        ),
        "-device".into(),
        format!(
            "virtio-net-pci,netdev=net0,mac={}",
            crate::network::format_mac(spec.mac_suffix)
        ),
    ]
}

/// Spawn the hypervisor, appending its output to `vm.log`.
pub fn launch(spec: &LaunchSpec) -> Result<VmProcess> {
    let log_path = spec.instance_dir.join("vm.log");
    let log = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&log_path)
        .map_err(|e| Error::launch(format!("open vm.log: {}", e)))?;
    let log_err = log
        .try_clone()
        .map_err(|e| Error::launch(format!("clone vm.log handle: {}", e)))?;

    let kvm = kvm_available();
    let args = build_args(spec, kvm);

    tracing::info!(
        hypervisor = spec.hypervisor,
        accel = if kvm { "kvm" } else { "tcg" },
        tap = spec.tap,
        "launching hypervisor"
    );

    let child = Command::new(spec.hypervisor)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .map_err(|e| Error::launch(format!("spawn {}: {}", spec.hypervisor, e)))?;

    Ok(VmProcess { child })
}

/// Handle to a running hypervisor child.
#[derive(Debug)]
pub struct VmProcess {
    child: Child,
}

impl VmProcess {
    /// Process id of the hypervisor child.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Whether the child is still running. Reaps on the spot if it exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                tracing::warn!(pid = self.child.id(), error = %e, "liveness check failed");
                false
            }
        }
    }

    /// Stop the child: SIGTERM, wait up to [`STOP_TIMEOUT`], then SIGKILL.
    ///
    /// Returns promptly once the child exits; worst-case latency is the
    /// timeout plus one reap.
    pub fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        let pid = self.child.id() as libc::pid_t;
        // SAFETY: kill with a valid pid and signal constant.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < STOP_TIMEOUT {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(pid, ?status, "hypervisor exited on SIGTERM");
                    return Ok(());
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(Error::launch(format!("wait on pid {}: {}", pid, e))),
            }
        }

        tracing::debug!(pid, "SIGTERM timeout, sending SIGKILL");
        let _ = self.child.kill();
        let status = self
            .child
            .wait()
            .map_err(|e| Error::launch(format!("reap pid {}: {}", pid, e)))?;
        tracing::debug!(pid, ?status, "hypervisor reaped after SIGKILL");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec<'a>(
        kernel: &'a Path,
        dir: &'a Path,
        disk: &'a Path,
        seed: &'a Path,
    ) -> LaunchSpec<'a> {
        LaunchSpec {
            hypervisor: "qemu-system-x86_64",
            kernel_path: kernel,
            instance_dir: dir,
            disk_path: disk,
            seed_path: seed,
            tap: "tap-550e8400",
            mac_suffix: 3,
            cpu: 2,
            memory: 2048,
        }
    }

    #[test]
    fn test_build_args_kvm() {
        let kernel = PathBuf::from("/var/lib/microvmd/images/vmlinux");
        let dir = PathBuf::from("/var/lib/microvmd/instances/x");
        let disk = dir.join("disk.raw");
        let seed = dir.join("cloud-init.disk");
        let args = build_args(&spec(&kernel, &dir, &disk, &seed), true);

        let joined = args.join(" ");
        assert!(joined.contains("-accel kvm"));
        assert!(joined.contains("-cpu host"));
        assert!(joined.contains("-smp 2"));
        assert!(joined.contains("-m 2048"));
        assert!(joined.contains("console=ttyS0 root=/dev/vda rw panic=1"));
        assert!(joined.contains("file=/var/lib/microvmd/instances/x/disk.raw,format=raw,if=virtio"));
        assert!(joined.contains("cloud-init.disk,format=raw,if=virtio,readonly=on"));
        assert!(joined.contains("tap,id=net0,ifname=tap-550e8400,script=no,downscript=no"));
        assert!(joined.contains("virtio-net-pci,netdev=net0,mac=52:54:00:12:34:03"));
    }

    #[test]
    fn test_build_args_tcg_fallback() {
        let kernel = PathBuf::from("/k");
        let dir = PathBuf::from("/i");
        let disk = dir.join("disk.raw");
        let seed = dir.join("cloud-init.disk");
        let args = build_args(&spec(&kernel, &dir, &disk, &seed), false);

        let joined = args.join(" ");
        assert!(joined.contains("-accel tcg"));
        assert!(joined.contains("-cpu max"));
        assert!(!joined.contains("-accel kvm"));
    }

    #[test]
    fn test_stop_terminates_child() {
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let mut vm = VmProcess { child };
        assert!(vm.is_running());

        let start = Instant::now();
        vm.stop().unwrap();
        assert!(!vm.is_running());
        // sleep dies on SIGTERM, so this must not hit the SIGKILL path.
        assert!(start.elapsed() < STOP_TIMEOUT);
    }

    #[test]
    fn test_stop_already_exited_is_noop() {
        let child = Command::new("true").spawn().unwrap();
        let mut vm = VmProcess { child };
        // Give the child a moment to exit.
        std::thread::sleep(Duration::from_millis(50));
        vm.stop().unwrap();
        vm.stop().unwrap();
        assert!(!vm.is_running());
    }
}
