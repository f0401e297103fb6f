//! Remastering of stock installer ISOs into branded, pre-provisioned images.
//!
//! For each target architecture the pipeline fetches a base image, verifies
//! it, mounts it read-only, stages its contents into a working tree, injects
//! the package manifest, branding, provisioning script and boot menus, and
//! reassembles a hybrid BIOS/UEFI bootable ISO.
//!
//! # Architecture
//!
//! ```text
//! build::pipeline
//!     │
//!     ├── artifact::fetch       base image -> {workdir}/iso/
//!     ├── artifact::image       size + ISO 9660 signature (+ sha256)
//!     ├── mount                 loop device, RAII teardown
//!     ├── artifact::filesystem  mounted tree -> {workdir}/custom-{arch}
//!     ├── customize             manifest, branding, provisioning, boot menus
//!     └── artifact::iso         xorriso -> {workdir}/output/
//! ```
//!
//! Everything needing root goes through [`host::Host`].
//!
//! # Example
//!
//! ```rust,ignore
//! use obelion_builder::{BuildContext, CustomizationBundle, Pipeline, RemasterConfig, SystemHost};
//!
//! let config = RemasterConfig::load_or_default(None)?;
//! let ctx = BuildContext::new(Path::new("work"), config.distro.clone());
//! let bundle = CustomizationBundle::from_sources(&config.customization, &config.distro)?;
//! let report = Pipeline::new(&ctx, &SystemHost, &bundle).run_all(&config.images, false)?;
//! print!("{}", report.summary());
//! ```

pub mod arch;
pub mod artifact;
pub mod build;
pub mod config;
pub mod customize;
pub mod error;
pub mod host;
pub mod interrupt;
pub mod mount;
pub mod preflight;
pub mod process;

#[cfg(test)]
pub(crate) mod test_support;

pub use arch::{Architecture, BootProfile};
pub use artifact::image::ImageArtifact;
pub use build::context::BuildContext;
pub use build::pipeline::Pipeline;
pub use build::report::{BuildReport, BuildResult, BuildState};
pub use config::RemasterConfig;
pub use customize::{CustomizationBundle, WorkingTree};
pub use error::RemasterError;
pub use host::{Host, SystemHost};
