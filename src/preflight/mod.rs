//! Preflight checks for build validation.
//!
//! Validates that the host has the required tools and enough free space in
//! the work directory before building. This prevents cryptic errors halfway
//! through a remaster.
//!
//! # Example
//!
//! ```rust
//! use obelion_builder::preflight::{command_exists, check_required_tools};
//!
//! // Check a single command
//! if !command_exists("xorriso") {
//!     println!("xorriso not installed");
//! }
//!
//! // Check multiple tools
//! let tools = &[("losetup", "util-linux"), ("xorriso", "xorriso")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::ImageSource;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools every build needs. Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("xorriso", "xorriso"),
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
];

/// Tools only needed when a base image lacks a ready-made EFI boot image
/// or boot assets must be installed.
pub const OPTIONAL_TOOLS: &[(&str, &str)] = &[
    ("mkfs.fat", "dosfstools"),
    ("mmd", "mtools"),
    ("mcopy", "mtools"),
    ("apt-get", "apt"),
];

/// Free space needed per architecture, as a multiple of the base image.
pub const SPACE_FACTOR: u64 = 2;

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check [`REQUIRED_TOOLS`] and warn about missing [`OPTIONAL_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    for (tool, package) in OPTIONAL_TOOLS {
        if !command_exists(tool) {
            warn!(tool, package, "optional host tool missing");
        }
    }
    check_required_tools(REQUIRED_TOOLS)
}

/// Bytes of free space a build of `images` needs: twice each base image,
/// using the cached size when it is larger than the configured minimum.
pub fn required_space(images: &[ImageSource], cache_dir: &Path) -> u64 {
    images
        .iter()
        .map(|image| {
            let cached = fs::metadata(cache_dir.join(&image.cache_name))
                .map(|m| m.len())
                .unwrap_or(0);
            cached.max(image.min_size_bytes) * SPACE_FACTOR
        })
        .sum()
}

/// Fail if the filesystem holding `dir` has less than `needed` bytes free.
///
/// `dir` does not have to exist yet; the nearest existing ancestor is
/// measured.
pub fn check_disk_space(dir: &Path, needed: u64) -> Result<u64> {
    let probe = existing_ancestor(dir)
        .with_context(|| format!("no existing ancestor of {}", dir.display()))?;
    let available = fs2::available_space(&probe)
        .with_context(|| format!("Failed to query free space on {}", probe.display()))?;

    if available < needed {
        bail!(
            "{} has {} MiB free, need at least {} MiB",
            probe.display(),
            available / 1024 / 1024,
            needed / 1024 / 1024
        );
    }
    info!(
        path = %probe.display(),
        free_mib = available / 1024 / 1024,
        needed_mib = needed / 1024 / 1024,
        "disk space ok"
    );
    Ok(available)
}

fn existing_ancestor(dir: &Path) -> Option<PathBuf> {
    let absolute = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(dir)
    };
    absolute.ancestors().find(|p| p.exists()).map(Path::to_path_buf)
}

/// Whether the process can attach loop devices and mount.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}
