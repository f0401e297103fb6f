//! Content stager and filesystem helpers.
//!
//! [`stage_tree`] copies a mounted base image into a fresh working tree.
//! Symlinks are recreated rather than followed, and permission bits,
//! timestamps and (when running as root) ownership are carried over.

use anyhow::{Context, Result as AnyResult};
use std::ffi::CString;
use std::fs::{self, Metadata, Permissions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::arch::BootProfile;
use crate::error::{RemasterError, Result};
use crate::interrupt;

/// Subtrees the boot profile cannot do without.
pub fn critical_subtrees(profile: BootProfile) -> Vec<&'static str> {
    let mut dirs = vec!["isolinux"];
    if profile.needs_uefi() {
        dirs.extend(["EFI", "boot/grub"]);
    }
    dirs
}

/// Copy `mount_root` into a fresh `working_tree`.
///
/// Any previous working tree is removed first. On failure the partial tree
/// is left in place for inspection.
pub fn stage_tree(mount_root: &Path, working_tree: &Path, profile: BootProfile) -> Result<()> {
    if working_tree.exists() || working_tree.is_symlink() {
        debug!(path = %working_tree.display(), "removing previous working tree");
        fs::remove_dir_all(working_tree).map_err(|e| RemasterError::stage(working_tree, e))?;
    }

    let mut copier = TreeCopier::new();
    copier.copy(mount_root, working_tree)?;

    for subtree in critical_subtrees(profile) {
        let src = mount_root.join(subtree);
        let dst = working_tree.join(subtree);
        if dst.is_dir() {
            continue;
        }
        if src.is_dir() {
            warn!(subtree, "critical subtree missing after copy, copying explicitly");
            copier.copy(&src, &dst)?;
        } else {
            warn!(subtree, profile = %profile, "base image has no such subtree");
        }
    }

    let entries = copier.finish()?;
    info!(
        entries,
        from = %mount_root.display(),
        to = %working_tree.display(),
        "staged base image contents"
    );
    Ok(())
}

/// Recursively copy a directory, preserving symlinks and metadata.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    let mut copier = TreeCopier::new();
    copier.copy(src, dst)?;
    copier.finish()?;
    Ok(())
}

/// Directory metadata is applied after all content is in place, deepest
/// first, so read-only source directories can still be populated and
/// their mtimes are not disturbed by later writes.
struct TreeCopier {
    as_root: bool,
    pending_dirs: Vec<(PathBuf, Metadata)>,
    entries: usize,
}

impl TreeCopier {
    fn new() -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let as_root = unsafe { libc::geteuid() } == 0;
        Self {
            as_root,
            pending_dirs: Vec::new(),
            entries: 0,
        }
    }

    fn copy(&mut self, src: &Path, dst: &Path) -> Result<()> {
        for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
            interrupt::check()?;
            let entry = entry.map_err(|e| RemasterError::stage(src, e))?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| RemasterError::stage(entry.path(), e))?;
            let target = dst.join(rel);
            self.copy_entry(entry.path(), &target)
                .map_err(|e| RemasterError::stage(entry.path(), e))?;
            self.entries += 1;
        }
        Ok(())
    }

    fn copy_entry(&mut self, src: &Path, dst: &Path) -> AnyResult<()> {
        let meta = fs::symlink_metadata(src)
            .with_context(|| format!("Failed to stat {}", src.display()))?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(src)?;
            if dst.exists() || dst.is_symlink() {
                fs::remove_file(dst)?;
            }
            std::os::unix::fs::symlink(&target, dst)
                .with_context(|| format!("Failed to create symlink: {}", dst.display()))?;
            self.apply_owner(dst, &meta)?;
            set_times(dst, &meta)?;
        } else if file_type.is_dir() {
            fs::create_dir_all(dst)
                .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
            self.pending_dirs.push((dst.to_path_buf(), meta));
        } else if file_type.is_file() {
            fs::copy(src, dst)
                .with_context(|| format!("Failed to copy file: {}", src.display()))?;
            self.apply_owner(dst, &meta)?;
            set_mode(dst, &meta)?;
            set_times(dst, &meta)?;
        } else {
            debug!(path = %src.display(), "skipping special file");
        }
        Ok(())
    }

    fn apply_owner(&self, path: &Path, meta: &Metadata) -> AnyResult<()> {
        if self.as_root {
            std::os::unix::fs::lchown(path, Some(meta.uid()), Some(meta.gid()))
                .with_context(|| format!("Failed to chown {}", path.display()))?;
        }
        Ok(())
    }

    /// Apply deferred directory metadata. Returns the number of entries copied.
    fn finish(self) -> Result<usize> {
        for (dir, meta) in self.pending_dirs.iter().rev() {
            self.apply_owner(dir, meta)
                .and_then(|_| set_mode(dir, meta))
                .and_then(|_| set_times(dir, meta))
                .map_err(|e| RemasterError::stage(dir, e))?;
        }
        Ok(self.entries)
    }
}

fn set_mode(path: &Path, meta: &Metadata) -> AnyResult<()> {
    fs::set_permissions(path, Permissions::from_mode(meta.mode() & 0o7777))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

/// Copy access and modification times without following symlinks.
fn set_times(path: &Path, meta: &Metadata) -> AnyResult<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("Path contains NUL: {}", path.display()))?;
    let times = [
        libc::timespec {
            tv_sec: meta.atime() as libc::time_t,
            tv_nsec: meta.atime_nsec() as _,
        },
        libc::timespec {
            tv_sec: meta.mtime() as libc::time_t,
            tv_nsec: meta.mtime_nsec() as _,
        },
    ];
    // SAFETY: c_path is a valid NUL-terminated string and times points to
    // two initialized timespec values, as utimensat requires.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to set times on {}", path.display()));
    }
    Ok(())
}

/// A file to be written by [`write_files_atomic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub path: PathBuf,
    pub contents: Vec<u8>,
    pub mode: Option<u32>,
}

impl PendingFile {
    pub fn new(path: PathBuf, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path,
            contents: contents.into(),
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    fn temp_path(&self) -> AnyResult<PathBuf> {
        let name = self
            .path
            .file_name()
            .with_context(|| format!("{} has no file name", self.path.display()))?;
        Ok(self
            .path
            .with_file_name(format!(".{}.tmp", name.to_string_lossy())))
    }
}

/// Write a group of files as one unit.
///
/// Every file is first written to a temp name in its target directory; only
/// when all temps are complete are they renamed into place. On failure the
/// temps are removed and no target is touched, unless a rename itself fails.
pub fn write_files_atomic(files: &[PendingFile]) -> AnyResult<()> {
    let mut temps = Vec::with_capacity(files.len());
    let result = (|| -> AnyResult<()> {
        for file in files {
            let tmp = file.temp_path()?;
            if let Some(dir) = tmp.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
            temps.push(tmp.clone());
            write_temp(&tmp, file)?;
        }
        for (file, tmp) in files.iter().zip(&temps) {
            fs::rename(tmp, &file.path).with_context(|| {
                format!("Failed to rename {} to {}", tmp.display(), file.path.display())
            })?;
        }
        Ok(())
    })();

    if result.is_err() {
        for tmp in &temps {
            let _ = fs::remove_file(tmp);
        }
    }
    result
}

fn write_temp(tmp: &Path, file: &PendingFile) -> AnyResult<()> {
    let mut out =
        fs::File::create(tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
    out.write_all(&file.contents)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Some(mode) = file.mode {
        out.set_permissions(Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set mode on {}", tmp.display()))?;
    }
    out.sync_all()
        .with_context(|| format!("Failed to sync {}", tmp.display()))
}

/// Atomically move a file by renaming, with fallback to copy+delete.
///
/// Useful for the "atomic artifacts" pattern where we build to a temp file
/// and then atomically move to the final destination.
pub fn atomic_move(src: &Path, dst: &Path) -> AnyResult<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystem, fall back to copy+delete
            fs::copy(src, dst)
                .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}
