//! Container-image to bootable-disk conversion and caching.
//!
//! [`ImageCache::ensure_ready`] turns an arbitrary container image reference
//! into a raw ext4 disk a microVM can boot, caching the result under
//! `<cache>/<safe-name>.raw`. The source image is wrapped in an overlay that
//! installs systemd, sshd, and cloud-init so plain OS images become usable
//! guests, then a disposable container's filesystem is exported into a
//! loop-mounted sparse disk.
//!
//! Builds are locked per image reference: concurrent requests for the same
//! reference wait on one build, distinct references build in parallel.

use crate::command::{run, run_piped, run_quiet};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Size of the sparse root disk allocated per cached image.
const DISK_SIZE: &str = "10G";

/// Dockerfile overlay that turns a plain OS image into a bootable guest:
/// an init system, sshd for access, cloud-init for first-boot seeding, and
/// enough networking userland to bring up eth0.
const WRAPPER_DOCKERFILE: &str = r#"ARG BASE_IMAGE
FROM ${BASE_IMAGE}

ENV DEBIAN_FRONTEND=noninteractive

RUN apt-get update && \
    apt-get install -y \
    systemd \
    cloud-init \
    openssh-server \
    sudo \
    iproute2 \
    net-tools \
    udev \
    && apt-get clean

RUN echo 'datasource_list: [ NoCloud, None ]' > /etc/cloud/cloud.cfg.d/90_dpkg.cfg

RUN mkdir -p /var/run/sshd

CMD ["/lib/systemd/systemd"]
"#;

/// Canonicalise an image reference into a filesystem-safe cache key.
///
/// `/` and `:` are replaced with `_`; equality of safe names defines cache
/// equality.
pub fn safe_name(image_ref: &str) -> String {
    image_ref.replace(['/', ':'], "_")
}

/// Cache of raw bootable disks keyed by sanitised image reference.
pub struct ImageCache {
    cache_dir: PathBuf,
    /// One lock per safe name; holds builds for the same reference to
    /// at most one at a time.
    builds: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ImageCache {
    /// Create a cache rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            builds: Mutex::new(HashMap::new()),
        }
    }

    /// Path a cached reference resolves to, built or not.
    pub fn raw_path(&self, image_ref: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.raw", safe_name(image_ref)))
    }

    /// Ensure a bootable raw disk exists for `image_ref` and return its path.
    ///
    /// Idempotent: an existing cache file is returned as-is without
    /// validation. A failed build never leaves a partial `.raw` behind.
    pub fn ensure_ready(&self, image_ref: &str) -> Result<PathBuf> {
        let safe = safe_name(image_ref);
        let raw_path = self.raw_path(image_ref);

        let build_lock = {
            let mut builds = self.builds.lock();
            builds.entry(safe.clone()).or_default().clone()
        };
        let _held = build_lock.lock();

        // Re-check under the build lock: a concurrent build may have
        // populated the cache while we waited.
        if raw_path.exists() {
            tracing::info!(image = %image_ref, path = %raw_path.display(), "image found in cache");
            return Ok(raw_path);
        }

        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|e| Error::image(format!("create cache dir: {}", e)))?;

        tracing::info!(image = %image_ref, "converting image to bootable disk");
        self.build(image_ref, &safe, &raw_path)?;

        tracing::info!(image = %image_ref, path = %raw_path.display(), "bootable disk ready");
        Ok(raw_path)
    }

    /// Full build pipeline: wrap, create, allocate, format, mount, export.
    fn build(&self, image_ref: &str, safe: &str, raw_path: &Path) -> Result<()> {
        // Build dir is deleted on every exit path.
        let build_dir = tempfile::Builder::new()
            .prefix("microvmd-build-")
            .tempdir()
            .map_err(|e| Error::image(format!("create build dir: {}", e)))?;

        std::fs::write(build_dir.path().join("Dockerfile"), WRAPPER_DOCKERFILE)
            .map_err(|e| Error::image(format!("write dockerfile: {}", e)))?;

        let vm_tag = format!("microvmd-vm:{}", safe);
        let build_path = build_dir.path().to_string_lossy().to_string();
        run(
            "docker",
            &[
                "build",
                "--build-arg",
                &format!("BASE_IMAGE={}", image_ref),
                "-t",
                &vm_tag,
                &build_path,
            ],
        )
        .map_err(|e| Error::image(format!("wrap image (base must be Debian/Ubuntu): {}", e)))?;

        // Disposable export container; a stale one from a crashed build is
        // cleared first.
        let container = format!("microvmd-export-{}", safe);
        run_quiet("docker", &["rm", "-f", &container]);
        run("docker", &["create", "--name", &container, &vm_tag])
            .map_err(|e| Error::image(format!("create export container: {}", e)))?;
        let _container_guard = ContainerGuard { name: &container };

        // From here on a partial artifact may exist; remove it on any failure
        // so the cache never retains a usable-looking corrupt disk.
        let mut artifact = ArtifactGuard {
            path: raw_path,
            armed: true,
        };

        let raw_str = raw_path.to_string_lossy().to_string();
        run("truncate", &["-s", DISK_SIZE, &raw_str])
            .map_err(|e| Error::image(format!("allocate sparse disk: {}", e)))?;

        run("mkfs.ext4", &["-F", &raw_str])
            .map_err(|e| Error::image(format!("format ext4: {}", e)))?;

        let mountpoint = tempfile::Builder::new()
            .prefix("microvmd-mnt-")
            .tempdir()
            .map_err(|e| Error::image(format!("create mountpoint: {}", e)))?;
        let mnt_str = mountpoint.path().to_string_lossy().to_string();

        run("mount", &["-o", "loop", &raw_str, &mnt_str])
            .map_err(|e| Error::image(format!("loop mount: {}", e)))?;
        let _mount_guard = MountGuard { mountpoint: &mnt_str };

        run_piped(
            "docker",
            &["export", &container],
            "tar",
            &["-x", "-C", &mnt_str],
        )
        .map_err(|e| Error::image(format!("export rootfs: {}", e)))?;

        artifact.armed = false;
        Ok(())
    }
}

/// Removes the disposable export container on all exit paths.
struct ContainerGuard<'a> {
    name: &'a str,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        run_quiet("docker", &["rm", "-f", self.name]);
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

/// Removes the in-progress raw disk unless the build completed.
struct ArtifactGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl Drop for ArtifactGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to remove partial disk");
                }
            }
        }
    }
}
