//! Base images in, remastered images out.
//!
//! - [`fetch`] - Download or copy a base image into the cache
//! - [`image`] - The [`image::ImageArtifact`] type and integrity verifier
//! - [`filesystem`] - Content stager and atomic file helpers
//! - [`iso`] - Image composer (hybrid ISO via xorriso)
//! - [`iso_utils`] - xorriso arguments, EFI boot images, checksums

pub mod fetch;
pub mod filesystem;
pub mod image;
pub mod iso;
pub mod iso_utils;
