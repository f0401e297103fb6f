//! Build context: the work directory and every path derived from it.
//!
//! Components never join path fragments themselves; they ask the context for
//! the architecture-scoped paths of their run.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::arch::Architecture;
use crate::config::{DistroInfo, ImageSource};

const ISO_CACHE_DIR: &str = "iso";
const MOUNT_DIR: &str = "mnt";
const OUTPUT_DIR: &str = "output";
const REPORT_FILENAME: &str = "build-report.json";

/// Resolved paths for one architecture's pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchPaths {
    pub arch: Architecture,
    /// `{workdir}/iso/{cache-name}`
    pub cache: PathBuf,
    /// `{workdir}/mnt/{arch}`
    pub mount_point: PathBuf,
    /// `{workdir}/custom-{arch}`
    pub working_tree: PathBuf,
    /// `{workdir}/output/{distro}-{version}-{arch}.iso`
    pub output: PathBuf,
}

/// Shared, read-only state for a build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    work_dir: PathBuf,
    pub distro: DistroInfo,
    /// Use cached base images only; never touch the network.
    pub skip_download: bool,
    /// Leave working trees on disk after a successful compose.
    pub keep_work: bool,
}

impl BuildContext {
    pub fn new(work_dir: &Path, distro: DistroInfo) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            distro,
            skip_download: false,
            keep_work: false,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn iso_cache_dir(&self) -> PathBuf {
        self.work_dir.join(ISO_CACHE_DIR)
    }

    pub fn mount_root(&self) -> PathBuf {
        self.work_dir.join(MOUNT_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.work_dir.join(OUTPUT_DIR)
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_dir().join(REPORT_FILENAME)
    }

    pub fn paths_for(&self, image: &ImageSource) -> ArchPaths {
        let arch = image.arch;
        ArchPaths {
            arch,
            cache: self.iso_cache_dir().join(&image.cache_name),
            mount_point: self.mount_root().join(arch.as_str()),
            working_tree: self.work_dir.join(format!("custom-{}", arch)),
            output: self
                .output_dir()
                .join(format!("{}.iso", self.distro.artifact_stem(arch))),
        }
    }

    /// Create the shared directories (cache, mount root, output).
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [self.iso_cache_dir(), self.mount_root(), self.output_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
