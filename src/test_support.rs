//! In-process [`Host`] used by tests.
//!
//! Loop devices and mounts are tracked in a ledger instead of touching the
//! kernel; "mounting" copies a prepared directory into the mount point and
//! "unmounting" empties it again. xorriso writes a small placeholder image.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::artifact::filesystem::copy_dir_recursive;
use crate::host::Host;

/// Switches for failure injection.
#[derive(Debug, Default, Clone)]
pub struct FakeFailures {
    pub attach_loop: bool,
    pub mount_device: bool,
    pub mount_image: bool,
    pub xorriso: bool,
    /// xorriso "succeeds" but leaves an empty output file.
    pub xorriso_empty_output: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    next_loop: u32,
    loops: BTreeMap<PathBuf, PathBuf>,
    mounts: BTreeMap<PathBuf, PathBuf>,
    installed: Vec<String>,
    xorriso_runs: Vec<Vec<OsString>>,
    efi_images: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct FakeHost {
    tree: PathBuf,
    pub failures: FakeFailures,
    /// Host file candidates that exist, mapped to real files.
    host_files: Mutex<HashMap<String, PathBuf>>,
    /// Files a package install makes available.
    packages: HashMap<String, Vec<(String, PathBuf)>>,
    ledger: Mutex<Ledger>,
}

impl FakeHost {
    /// A host whose every image mounts as a copy of `tree`.
    pub fn new(tree: &Path) -> Self {
        Self {
            tree: tree.to_path_buf(),
            failures: FakeFailures::default(),
            host_files: Mutex::new(HashMap::new()),
            packages: HashMap::new(),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn with_failures(mut self, failures: FakeFailures) -> Self {
        self.failures = failures;
        self
    }

    /// Make `candidate` resolvable through `locate_file`, backed by `real`.
    pub fn with_host_file(self, candidate: &str, real: &Path) -> Self {
        self.lock_files()
            .insert(candidate.to_string(), real.to_path_buf());
        self
    }

    /// Installing `package` makes `candidate` available, backed by `real`.
    pub fn with_package(mut self, package: &str, candidate: &str, real: &Path) -> Self {
        self.packages
            .entry(package.to_string())
            .or_default()
            .push((candidate.to_string(), real.to_path_buf()));
        self
    }

    pub fn attached_loops(&self) -> usize {
        self.lock_ledger().loops.len()
    }

    pub fn active_mounts(&self) -> usize {
        self.lock_ledger().mounts.len()
    }

    pub fn installed_packages(&self) -> Vec<String> {
        self.lock_ledger().installed.clone()
    }

    pub fn xorriso_runs(&self) -> Vec<Vec<OsString>> {
        self.lock_ledger().xorriso_runs.clone()
    }

    pub fn efi_images_built(&self) -> usize {
        self.lock_ledger().efi_images.len()
    }

    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_files(&self) -> std::sync::MutexGuard<'_, HashMap<String, PathBuf>> {
        self.host_files.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn populate(&self, target: &Path) -> Result<()> {
        copy_dir_recursive(&self.tree, target)
            .with_context(|| format!("fake mount of {}", self.tree.display()))
    }
}

fn empty_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

impl Host for FakeHost {
    fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        if self.failures.attach_loop {
            bail!("losetup: no free loop devices");
        }
        let mut ledger = self.lock_ledger();
        let device = PathBuf::from(format!("/dev/loop{}", ledger.next_loop));
        ledger.next_loop += 1;
        ledger.loops.insert(device.clone(), image.to_path_buf());
        Ok(device)
    }

    fn detach_loop(&self, device: &Path) -> Result<()> {
        self.lock_ledger().loops.remove(device);
        Ok(())
    }

    fn loop_attached(&self, device: &Path) -> bool {
        self.lock_ledger().loops.contains_key(device)
    }

    fn mount_device(&self, device: &Path, target: &Path) -> Result<()> {
        if self.failures.mount_device {
            bail!("mount: wrong fs type on {}", device.display());
        }
        if !self.loop_attached(device) {
            bail!("{} is not a bound loop device", device.display());
        }
        self.populate(target)?;
        self.lock_ledger()
            .mounts
            .insert(target.to_path_buf(), device.to_path_buf());
        Ok(())
    }

    fn mount_image(&self, image: &Path, target: &Path) -> Result<()> {
        if self.failures.mount_image {
            bail!("mount: failed to setup loop device for {}", image.display());
        }
        self.populate(target)?;
        self.lock_ledger()
            .mounts
            .insert(target.to_path_buf(), image.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        if self.lock_ledger().mounts.remove(target).is_some() {
            empty_dir(target)?;
        }
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> bool {
        self.lock_ledger().mounts.contains_key(target)
    }

    fn install_package(&self, package: &str) -> Result<()> {
        let provides = self
            .packages
            .get(package)
            .ok_or_else(|| anyhow!("E: Unable to locate package {}", package))?;
        let mut files = self.lock_files();
        for (candidate, real) in provides {
            files.insert(candidate.clone(), real.clone());
        }
        drop(files);
        self.lock_ledger().installed.push(package.to_string());
        Ok(())
    }

    fn locate_file(&self, candidates: &[&str]) -> Option<PathBuf> {
        let files = self.lock_files();
        candidates.iter().find_map(|c| files.get(*c).cloned())
    }

    fn build_efi_image(&self, efi_files: &[PathBuf], output: &Path) -> Result<()> {
        if efi_files.is_empty() {
            bail!("no EFI loaders to put in {}", output.display());
        }
        fs::write(output, b"FAT16 placeholder")?;
        self.lock_ledger().efi_images.push(output.to_path_buf());
        Ok(())
    }

    fn run_xorriso(&self, args: &[OsString]) -> Result<()> {
        self.lock_ledger().xorriso_runs.push(args.to_vec());
        if self.failures.xorriso {
            bail!("xorriso : FAILURE : simulated");
        }

        let value_after = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .map(PathBuf::from)
        };
        let output = value_after("-o").context("xorriso: no -o")?;
        let tree = args.last().map(PathBuf::from).context("xorriso: no tree")?;

        for flag in ["-b", "-e"] {
            if let Some(rel) = value_after(flag) {
                if !tree.join(&rel).is_file() {
                    bail!("xorriso : FAILURE : cannot find boot image {}", rel.display());
                }
            }
        }
        if let Some(mbr) = value_after("-isohybrid-mbr") {
            if !mbr.is_file() {
                bail!("xorriso : FAILURE : cannot open {}", mbr.display());
            }
        }

        let contents: &[u8] = if self.failures.xorriso_empty_output {
            b""
        } else {
            b"hybrid iso placeholder"
        };
        fs::write(&output, contents)?;
        Ok(())
    }
}
