//! Base image artifacts and the integrity verifier.
//!
//! An [`ImageArtifact`] only becomes valid by passing through [`verify`].
//! The validity flag is private, so a mount or compose step holding a valid
//! artifact knows both checks passed.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::arch::Architecture;
use crate::artifact::iso_utils::sha256_file;
use crate::error::{RemasterError, Result};

/// Byte offset of the first volume descriptor (sector 16 of 2048 bytes).
pub const ISO9660_DESCRIPTOR_OFFSET: u64 = 16 * 2048;

/// Standard identifier following the descriptor type byte.
pub const ISO9660_MAGIC: &[u8; 5] = b"CD001";

/// A base or produced disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    source: String,
    path: PathBuf,
    arch: Architecture,
    min_size: u64,
    valid: bool,
}

impl ImageArtifact {
    /// A freshly fetched, not yet verified image.
    pub(crate) fn unverified(
        source: &str,
        path: &Path,
        arch: Architecture,
        min_size: u64,
    ) -> Self {
        Self {
            source: source.to_string(),
            path: path.to_path_buf(),
            arch,
            min_size,
            valid: false,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    pub fn min_size(&self) -> u64 {
        self.min_size
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Verify a cached image and return a fresh, valid artifact.
///
/// Checks, in order: size against the artifact's minimum, the ISO 9660
/// signature, and (if given) the SHA-256 digest. Any failure deletes the
/// cached file so the next run fetches it again.
pub fn verify(artifact: &ImageArtifact, expected_sha256: Option<&str>) -> Result<ImageArtifact> {
    let path = artifact.path();

    let actual = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    if actual < artifact.min_size() {
        discard(path);
        return Err(RemasterError::Size {
            path: path.to_path_buf(),
            actual,
            minimum: artifact.min_size(),
        });
    }

    if let Err(reason) = check_iso9660_signature(path) {
        discard(path);
        return Err(RemasterError::Format {
            path: path.to_path_buf(),
            reason,
        });
    }

    if let Some(expected) = expected_sha256 {
        check_digest(path, expected)?;
    }

    info!(
        arch = %artifact.arch(),
        path = %path.display(),
        size_mib = actual / 1024 / 1024,
        "base image verified"
    );

    Ok(ImageArtifact {
        valid: true,
        ..artifact.clone()
    })
}

/// Check for the `CD001` identifier of the first volume descriptor.
pub fn check_iso9660_signature(path: &Path) -> std::result::Result<(), String> {
    let mut file = File::open(path).map_err(|e| format!("cannot open: {}", e))?;
    file.seek(SeekFrom::Start(ISO9660_DESCRIPTOR_OFFSET))
        .map_err(|e| format!("cannot seek to volume descriptor: {}", e))?;

    let mut descriptor = [0u8; 6];
    file.read_exact(&mut descriptor)
        .map_err(|_| "file too short for a volume descriptor".to_string())?;

    if &descriptor[1..6] != ISO9660_MAGIC {
        return Err(format!(
            "volume descriptor identifier is {:?}, expected \"CD001\"",
            String::from_utf8_lossy(&descriptor[1..6])
        ));
    }
    Ok(())
}

/// Compare the SHA-256 of `path` with `expected`. A file that cannot be
/// read counts as a mismatch and is discarded like any other.
fn check_digest(path: &Path, expected: &str) -> Result<()> {
    let actual = match sha256_file(path) {
        Ok((digest, _)) if digest.eq_ignore_ascii_case(expected) => return Ok(()),
        Ok((digest, _)) => digest,
        Err(e) => format!("unreadable file ({:#})", e),
    };
    discard(path);
    Err(RemasterError::Checksum {
        path: path.to_path_buf(),
        expected: expected.to_ascii_lowercase(),
        actual,
    })
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => warn!(path = %path.display(), "deleted invalid cached image"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete invalid cached image"),
    }
}

/// Write a sparse file of `size` bytes carrying a primary volume descriptor
/// signature. Used by tests across the crate.
#[cfg(test)]
pub(crate) fn write_fake_iso(path: &Path, size: u64) {
    use std::io::Write;

    let mut file = File::create(path).unwrap();
    file.set_len(size).unwrap();
    file.seek(SeekFrom::Start(ISO9660_DESCRIPTOR_OFFSET)).unwrap();
    file.write_all(&[1]).unwrap();
    file.write_all(ISO9660_MAGIC).unwrap();
    file.write_all(&[1]).unwrap();
}
