//! Base image fetcher.
//!
//! Downloads land in `<cache>.partial` and are renamed into place only once
//! complete, so the canonical cache path never holds a half-written file.
//! Re-running with a non-empty cached file is a no-op; an empty one is
//! discarded and fetched again.

use anyhow::{anyhow, bail, Context};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::artifact::filesystem::atomic_move;
use crate::artifact::image::ImageArtifact;
use crate::config::ImageSource;
use crate::error::{RemasterError, Result};
use crate::interrupt;

const CHUNK_SIZE: usize = 1024 * 1024;
const PROGRESS_EVERY: u64 = 256 * 1024 * 1024;

/// Where a base image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SourceKind {
    Http(String),
    Local(PathBuf),
}

fn classify(location: &str) -> SourceKind {
    if location.starts_with("http://") || location.starts_with("https://") {
        SourceKind::Http(location.to_string())
    } else if let Some(path) = location.strip_prefix("file://") {
        SourceKind::Local(PathBuf::from(path))
    } else {
        SourceKind::Local(PathBuf::from(location))
    }
}

/// Make sure `destination` holds a non-empty copy of `image`'s base image.
///
/// With `skip_download` set, a missing cache entry fails instead of touching
/// the network.
pub fn fetch(image: &ImageSource, destination: &Path, skip_download: bool) -> Result<ImageArtifact> {
    let artifact =
        ImageArtifact::unverified(&image.location, destination, image.arch, image.min_size_bytes);

    match fs::metadata(destination) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {
            debug!(path = %destination.display(), "using cached base image");
            return Ok(artifact);
        }
        Ok(_) => {
            warn!(path = %destination.display(), "discarding empty cached base image");
            fs::remove_file(destination)
                .map_err(|e| RemasterError::transfer(&image.location, e))?;
        }
        Err(_) => {}
    }

    if skip_download {
        return Err(RemasterError::transfer(
            &image.location,
            anyhow!(
                "{} is not cached and downloads are disabled",
                destination.display()
            ),
        ));
    }

    let partial = partial_path(destination);
    let result = transfer(&image.location, destination, &partial);
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    let bytes = result.map_err(|e| match e.downcast::<RemasterError>() {
        Ok(RemasterError::Interrupted) => RemasterError::Interrupted,
        Ok(other) => RemasterError::transfer(&image.location, anyhow!(other.chain_message())),
        Err(e) => RemasterError::transfer(&image.location, e),
    })?;

    info!(
        arch = %image.arch,
        path = %destination.display(),
        size_mib = bytes / 1024 / 1024,
        "base image fetched"
    );
    Ok(artifact)
}

fn partial_path(destination: &Path) -> PathBuf {
    PathBuf::from(format!("{}.partial", destination.display()))
}

fn transfer(location: &str, destination: &Path, partial: &Path) -> anyhow::Result<u64> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let bytes = match classify(location) {
        SourceKind::Http(url) => {
            info!(url = %url, "downloading base image");
            let response = ureq::get(&url)
                .call()
                .with_context(|| format!("GET {} failed", url))?;
            copy_to(response.into_reader(), partial)?
        }
        SourceKind::Local(path) => {
            info!(path = %path.display(), "copying base image");
            let file = File::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            copy_to(file, partial)?
        }
    };

    if bytes == 0 {
        bail!("transfer from {} produced an empty file", location);
    }

    atomic_move(partial, destination)?;
    Ok(bytes)
}

fn copy_to(mut reader: impl Read, partial: &Path) -> anyhow::Result<u64> {
    let file = File::create(partial)
        .with_context(|| format!("Failed to create {}", partial.display()))?;
    let mut writer = BufWriter::new(file);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        interrupt::check()?;
        let n = reader.read(&mut buf).context("reading from source")?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .with_context(|| format!("Failed to write {}", partial.display()))?;
        let before = total;
        total += n as u64;
        if before / PROGRESS_EVERY != total / PROGRESS_EVERY {
            debug!(mib = total / 1024 / 1024, "transfer progress");
        }
    }
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .and_then(|f| f.sync_all())
        .with_context(|| format!("Failed to flush {}", partial.display()))?;
    Ok(total)
}
