//! Host system operations used by the pipeline.
//!
//! Loop devices, mounts, package installation and the ISO mastering tool all
//! need root or host state, so they sit behind the [`Host`] trait. The real
//! implementation shells out through [`Cmd`]; tests substitute a fake.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::artifact::iso_utils::create_efi_boot_image;
use crate::process::Cmd;

/// Host facilities the pipeline depends on.
///
/// Teardown methods must tolerate the resource already being released.
pub trait Host: Send + Sync {
    /// Bind `image` to a free loop device read-only, returning the device.
    fn attach_loop(&self, image: &Path) -> Result<PathBuf>;

    /// Release a loop device. No-op if it is no longer bound.
    fn detach_loop(&self, device: &Path) -> Result<()>;

    /// Whether `device` is still bound to a backing file.
    fn loop_attached(&self, device: &Path) -> bool;

    /// Mount an ISO 9660 block device read-only at `target`.
    fn mount_device(&self, device: &Path, target: &Path) -> Result<()>;

    /// Mount an image file read-only through the kernel's implicit loop
    /// support (`mount -o loop`).
    fn mount_image(&self, image: &Path, target: &Path) -> Result<()>;

    /// Unmount `target`. No-op if nothing is mounted there.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Whether something is mounted at `target`.
    fn is_mounted(&self, target: &Path) -> bool;

    /// Install a package from the host's package source.
    fn install_package(&self, package: &str) -> Result<()>;

    /// First existing host file among `candidates`.
    fn locate_file(&self, candidates: &[&str]) -> Option<PathBuf>;

    /// Build a FAT EFI boot image at `output` containing `efi_files`.
    fn build_efi_image(&self, efi_files: &[PathBuf], output: &Path) -> Result<()>;

    /// Run the ISO mastering tool (`xorriso`) with the given arguments.
    fn run_xorriso(&self, args: &[OsString]) -> Result<()>;
}

/// [`Host`] backed by the real system tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        let out = Cmd::new("losetup")
            .args(["--find", "--show", "--read-only"])
            .arg_path(image)
            .error_msg("losetup failed. Install util-linux and run as root.")
            .run()?;
        let device = out.stdout.trim();
        if device.is_empty() {
            bail!("losetup printed no device for {}", image.display());
        }
        debug!(device, image = %image.display(), "loop device attached");
        Ok(PathBuf::from(device))
    }

    fn detach_loop(&self, device: &Path) -> Result<()> {
        if !self.loop_attached(device) {
            return Ok(());
        }
        Cmd::new("losetup")
            .arg("--detach")
            .arg_path(device)
            .error_msg(format!("losetup --detach {} failed", device.display()))
            .run()?;
        Ok(())
    }

    fn loop_attached(&self, device: &Path) -> bool {
        let Some(name) = device.file_name() else {
            return false;
        };
        Path::new("/sys/block")
            .join(name)
            .join("loop/backing_file")
            .exists()
    }

    fn mount_device(&self, device: &Path, target: &Path) -> Result<()> {
        Cmd::new("mount")
            .args(["-t", "iso9660", "-o", "ro"])
            .arg_path(device)
            .arg_path(target)
            .error_msg(format!("mounting {} failed", device.display()))
            .run()?;
        Ok(())
    }

    fn mount_image(&self, image: &Path, target: &Path) -> Result<()> {
        Cmd::new("mount")
            .args(["-o", "loop,ro"])
            .arg_path(image)
            .arg_path(target)
            .error_msg(format!("mount -o loop {} failed", image.display()))
            .run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        if !self.is_mounted(target) {
            return Ok(());
        }
        Cmd::new("umount")
            .arg_path(target)
            .error_msg(format!("umount {} failed", target.display()))
            .run()?;
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> bool {
        let target = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
        match fs::read_to_string("/proc/self/mounts") {
            Ok(mounts) => mounts_contain(&mounts, &target),
            Err(_) => false,
        }
    }

    fn install_package(&self, package: &str) -> Result<()> {
        info!(package, "installing package from host package source");
        if which::which("apt-get").is_ok() {
            Cmd::new("apt-get")
                .args(["install", "-y", "--no-install-recommends", package])
                .error_msg(format!("apt-get install {} failed", package))
                .run()?;
        } else if which::which("dnf").is_ok() {
            Cmd::new("dnf")
                .args(["install", "-y", package])
                .error_msg(format!("dnf install {} failed", package))
                .run()?;
        } else {
            bail!(
                "no supported package manager (apt-get, dnf) found to install '{}'",
                package
            );
        }
        Ok(())
    }

    fn locate_file(&self, candidates: &[&str]) -> Option<PathBuf> {
        candidates
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
    }

    fn build_efi_image(&self, efi_files: &[PathBuf], output: &Path) -> Result<()> {
        create_efi_boot_image(output, efi_files)
    }

    fn run_xorriso(&self, args: &[OsString]) -> Result<()> {
        let xorriso = which::which("xorriso").context("xorriso not found. Install xorriso.")?;
        Cmd::new(xorriso)
            .args(args)
            .error_msg("xorriso failed")
            .run()?;
        Ok(())
    }
}

/// Check a `/proc/self/mounts` listing for a mount at `target`.
///
/// The kernel escapes spaces, tabs, newlines and backslashes in mount paths
/// as octal sequences (`\040` and friends).
fn mounts_contain(mounts: &str, target: &Path) -> bool {
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| Path::new(&unescape_mount_path(mount_point)) == target)
}

fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
