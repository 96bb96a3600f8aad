//! Direct credential injection into a raw disk.
//!
//! Loop-mounts an instance's root filesystem and writes the caller's key into
//! `/root/.ssh/authorized_keys`, plus sshd configuration for root login. This
//! is the fallback credential path next to cloud-init: the manager treats a
//! failure here as a warning, not an abort.
//!
//! The loop device and mount are owned exclusively for the duration of the
//! call; both are released on every exit path.

use crate::command::{run, run_quiet};
use crate::error::{Error, Result};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

/// sshd options appended so key and password logins reach root.
const SSHD_CONFIG_APPEND: &str =
    "\nPermitRootLogin yes\nPasswordAuthentication yes\nPubkeyAuthentication yes\n";

/// Highest partition index probed when the disk carries a partition table.
const MAX_PARTITIONS: u32 = 5;

/// Mount a raw disk's root filesystem and write SSH credentials into it.
///
/// The root password is only set when one is configured.
pub fn inject_credentials(disk: &Path, public_key: &str, root_password: Option<&str>) -> Result<()> {
    tracing::info!(disk = %disk.display(), "injecting credentials");

    let disk_str = disk.to_string_lossy().to_string();
    let loop_dev = run("losetup", &["-fP", "--show", &disk_str])
        .map_err(|e| Error::inject(format!("attach loop device: {}", e)))?;
    let _loop_guard = LoopGuard { device: &loop_dev };

    // Give udev a moment to surface partition nodes.
    std::thread::sleep(Duration::from_millis(500));

    let mountpoint = tempfile::Builder::new()
        .prefix("microvmd-inject-")
        .tempdir()
        .map_err(|e| Error::inject(format!("create mountpoint: {}", e)))?;
    let mnt = mountpoint.path();
    let mnt_str = mnt.to_string_lossy().to_string();

    mount_root(&loop_dev, &mnt_str, mnt)?;
    let _mount_guard = MountGuard { mountpoint: &mnt_str };

    write_authorized_keys(mnt, public_key)?;
    append_sshd_config(mnt);

    if let Some(password) = root_password {
        set_root_password(&mnt_str, password);
    }

    Ok(())
}

/// Mount whichever device exposes the root tree: the whole disk first, then
/// partitions `p1..p5` until one contains `/etc`.
fn mount_root(loop_dev: &str, mnt_str: &str, mnt: &Path) -> Result<()> {
    if run_quiet("mount", &[loop_dev, mnt_str]) {
        if mnt.join("etc").exists() {
            return Ok(());
        }
        run_quiet("umount", &[mnt_str]);
    }

    for i in 1..=MAX_PARTITIONS {
        let part = format!("{}p{}", loop_dev, i);
        if !Path::new(&part).exists() {
            continue;
        }
        if run_quiet("mount", &[&part, mnt_str]) {
            if mnt.join("etc").exists() {
                return Ok(());
            }
            run_quiet("umount", &[mnt_str]);
        }
    }

    Err(Error::inject("no mountable root filesystem on disk"))
}

/// Write `/root/.ssh/authorized_keys` (0700 dir, 0600 file, root-owned).
fn write_authorized_keys(mnt: &Path, public_key: &str) -> Result<()> {
    let ssh_dir = mnt.join("root/.ssh");
    std::fs::create_dir_all(&ssh_dir)
        .map_err(|e| Error::inject(format!("create .ssh dir: {}", e)))?;
    std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| Error::inject(format!("chmod .ssh dir: {}", e)))?;

    let keys_path = ssh_dir.join("authorized_keys");
    std::fs::write(&keys_path, public_key)
        .map_err(|e| Error::inject(format!("write authorized_keys: {}", e)))?;
    std::fs::set_permissions(&keys_path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::inject(format!("chmod authorized_keys: {}", e)))?;

    run_quiet("chown", &["-R", "0:0", &ssh_dir.to_string_lossy()]);
    Ok(())
}

/// Append root-login options to the guest's sshd_config. Best-effort: a
/// missing sshd_config is left alone (cloud-init remains the primary path).
fn append_sshd_config(mnt: &Path) {
    let config = mnt.join("etc/ssh/sshd_config");
    match std::fs::OpenOptions::new().append(true).open(&config) {
        Ok(mut f) => {
            if let Err(e) = f.write_all(SSHD_CONFIG_APPEND.as_bytes()) {
                tracing::warn!(path = %config.display(), error = %e, "failed to append sshd config");
            }
        }
        Err(e) => {
            tracing::debug!(path = %config.display(), error = %e, "sshd_config not writable, skipping");
        }
    }
}

/// Set the guest root password via a chrooted chpasswd. Best-effort.
fn set_root_password(mnt_str: &str, password: &str) {
    let cmd = format!("echo 'root:{}' | chpasswd", password);
    if !run_quiet("chroot", &[mnt_str, "/bin/sh", "-c", &cmd]) {
        tracing::warn!("chrooted chpasswd failed, password login unavailable");
    }
}

/// Detaches the loop device on all exit paths.
struct LoopGuard<'a> {
    device: &'a str,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        run_quiet("losetup", &["-d", self.device]);
    }
}

/// Unmounts the scratch mountpoint on all exit paths.
struct MountGuard<'a> {
    mountpoint: &'a str,
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        run_quiet("umount", &[self.mountpoint]);
    }
}
