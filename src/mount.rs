//! Scoped read-only mounts of verified base images.
//!
//! A [`MountSession`] owns the mount and the loop device behind it. Dropping
//! the session unmounts and then detaches, whatever path the caller took out
//! of the scope, including `?` on an `Interrupted` error.

use anyhow::anyhow;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::artifact::image::ImageArtifact;
use crate::error::{RemasterError, Result};
use crate::host::Host;

/// How the image ended up mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMechanism {
    /// `losetup --read-only` followed by `mount -t iso9660`.
    LoopDevice,
    /// `mount -o loop,ro`, letting the kernel pick the loop device.
    ImplicitLoop,
}

pub struct MountSession<'h> {
    host: &'h dyn Host,
    image: PathBuf,
    mount_point: PathBuf,
    loop_device: Option<PathBuf>,
    mechanism: Option<MountMechanism>,
    lock: Option<File>,
    closed: bool,
}

impl std::fmt::Debug for MountSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountSession")
            .field("image", &self.image)
            .field("mount_point", &self.mount_point)
            .field("loop_device", &self.loop_device)
            .field("mechanism", &self.mechanism)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<'h> MountSession<'h> {
    /// Mount `image` read-only at `mount_point`.
    ///
    /// Only verified images are accepted. The mount point is locked for the
    /// lifetime of the session.
    pub fn open(host: &'h dyn Host, image: &ImageArtifact, mount_point: &Path) -> Result<Self> {
        if !image.is_valid() {
            return Err(RemasterError::Precondition(format!(
                "refusing to mount unverified image {}",
                image.path().display()
            )));
        }

        let mount_err = |source: anyhow::Error| RemasterError::Mount {
            image: image.path().to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            source: source.into(),
        };

        fs::create_dir_all(mount_point).map_err(|e| mount_err(e.into()))?;
        let lock = lock_mount_point(mount_point).map_err(mount_err)?;

        let mut session = MountSession {
            host,
            image: image.path().to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            loop_device: None,
            mechanism: None,
            lock: Some(lock),
            closed: false,
        };

        if host.is_mounted(mount_point) {
            warn!(mount_point = %mount_point.display(), "unmounting stale mount from a previous run");
            host.unmount(mount_point).map_err(mount_err)?;
        }

        match session.mount_with_loop_device() {
            Ok(()) => {}
            Err(primary) => {
                warn!(
                    image = %image.path().display(),
                    error = %format!("{:#}", primary),
                    "loop device mount failed, falling back to mount -o loop"
                );
                session.release_loop_device();
                host.mount_image(image.path(), mount_point).map_err(|fallback| {
                    mount_err(anyhow!(
                        "{:#}; fallback mount -o loop,ro also failed: {:#}",
                        primary,
                        fallback
                    ))
                })?;
                session.mechanism = Some(MountMechanism::ImplicitLoop);
            }
        }

        info!(
            arch = %image.arch(),
            mount_point = %mount_point.display(),
            mechanism = ?session.mechanism,
            "base image mounted"
        );
        Ok(session)
    }

    fn mount_with_loop_device(&mut self) -> anyhow::Result<()> {
        let device = self.host.attach_loop(&self.image)?;
        self.loop_device = Some(device.clone());
        self.host.mount_device(&device, &self.mount_point)?;
        self.mechanism = Some(MountMechanism::LoopDevice);
        Ok(())
    }

    fn release_loop_device(&mut self) {
        if let Some(device) = self.loop_device.take() {
            if let Err(e) = self.host.detach_loop(&device) {
                warn!(device = %device.display(), error = %format!("{:#}", e), "failed to detach loop device");
            }
        }
    }

    /// Root of the mounted image tree.
    pub fn root(&self) -> &Path {
        &self.mount_point
    }

    pub fn mechanism(&self) -> Option<MountMechanism> {
        self.mechanism
    }

    /// Unmount, then detach the loop device. Safe to call more than once;
    /// only the first call does anything.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let unmounted = self.host.unmount(&self.mount_point);
        let detached = match self.loop_device.take() {
            Some(device) => self.host.detach_loop(&device),
            None => Ok(()),
        };
        if let Some(lock) = self.lock.take() {
            let _ = lock.unlock();
        }
        debug!(mount_point = %self.mount_point.display(), "mount session closed");

        unmounted.and(detached).map_err(|e| RemasterError::Mount {
            image: self.image.clone(),
            mount_point: self.mount_point.clone(),
            source: e.into(),
        })
    }
}

impl Drop for MountSession<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e.chain_message(), "mount teardown failed");
        }
    }
}

/// Run `f` with the image mounted, tearing the mount down afterwards.
///
/// An error from `f` wins over a teardown error; a teardown error after a
/// successful `f` is reported as `MountError`.
pub fn with_mounted<T>(
    host: &dyn Host,
    image: &ImageArtifact,
    mount_point: &Path,
    f: impl FnOnce(&Path) -> Result<T>,
) -> Result<T> {
    let mut session = MountSession::open(host, image, mount_point)?;
    let value = f(session.root());
    let closed = session.close();
    let value = value?;
    closed?;
    Ok(value)
}

/// Sibling lock file so the lock is not hidden by the mount itself.
fn lock_mount_point(mount_point: &Path) -> anyhow::Result<File> {
    let lock_path = PathBuf::from(format!("{}.lock", mount_point.display()));
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| anyhow!("cannot open {}: {}", lock_path.display(), e))?;
    file.try_lock_exclusive().map_err(|_| {
        anyhow!(
            "{} is in use by another mount session",
            mount_point.display()
        )
    })?;
    Ok(file)
}
