//! The customization bundle: everything injected into a working tree.
//!
//! A bundle is validated once at construction and read-only afterwards, so
//! parallel architecture builds can share one by reference.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{CustomizationSources, DistroInfo};
use crate::customize::boot_menu::BootMenu;
use crate::customize::manifest::PackageManifest;

const DEFAULT_MANIFEST: &str = include_str!("../../assets/packages.list");
const DEFAULT_PROVISIONING_SCRIPT: &str = include_str!("../../assets/provision.sh");

/// A branding file, addressed relative to the branding directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrandingAsset {
    path: PathBuf,
    contents: Vec<u8>,
}

impl BrandingAsset {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            bail!("branding asset path is empty");
        }
        if !path.components().all(|c| matches!(c, Component::Normal(_))) {
            bail!(
                "branding asset path '{}' must be relative without '..'",
                path.display()
            );
        }
        Ok(Self {
            path,
            contents: contents.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomizationBundle {
    manifest: PackageManifest,
    provisioning_script: Vec<u8>,
    branding: Vec<BrandingAsset>,
    boot_menu: BootMenu,
}

impl CustomizationBundle {
    pub fn new(
        manifest: PackageManifest,
        provisioning_script: Vec<u8>,
        branding: Vec<BrandingAsset>,
        boot_menu: BootMenu,
    ) -> Result<Self> {
        if provisioning_script.is_empty() {
            bail!("provisioning script is empty");
        }
        let mut seen = HashSet::new();
        for asset in &branding {
            if !seen.insert(asset.path()) {
                bail!("branding asset '{}' given twice", asset.path().display());
            }
        }
        Ok(Self {
            manifest,
            provisioning_script,
            branding,
            boot_menu,
        })
    }

    /// Assemble a bundle from configured files, falling back to the
    /// built-in manifest, script and branding.
    pub fn from_sources(sources: &CustomizationSources, distro: &DistroInfo) -> Result<Self> {
        let manifest_text = match &sources.manifest {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("reading manifest {}", path.display()))?,
            None => DEFAULT_MANIFEST.to_string(),
        };
        let manifest = PackageManifest::parse(&manifest_text).context("invalid package manifest")?;

        let script = match &sources.provisioning_script {
            Some(path) => fs::read(path)
                .with_context(|| format!("reading provisioning script {}", path.display()))?,
            None => DEFAULT_PROVISIONING_SCRIPT.as_bytes().to_vec(),
        };

        let branding = match &sources.branding_dir {
            Some(dir) => load_branding_dir(dir)?,
            None => default_branding(distro)?,
        };

        let boot_menu = BootMenu::standard(
            distro,
            &sources.kernel,
            &sources.initrd,
            &sources.kernel_args,
        )?;

        Self::new(manifest, script, branding, boot_menu)
    }

    pub fn manifest(&self) -> &PackageManifest {
        &self.manifest
    }

    pub fn provisioning_script(&self) -> &[u8] {
        &self.provisioning_script
    }

    pub fn branding(&self) -> &[BrandingAsset] {
        &self.branding
    }

    pub fn boot_menu(&self) -> &BootMenu {
        &self.boot_menu
    }
}

fn load_branding_dir(dir: &Path) -> Result<Vec<BrandingAsset>> {
    let mut assets = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("reading branding dir {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir)?;
        let contents = fs::read(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?;
        assets.push(BrandingAsset::new(rel, contents)?);
    }
    Ok(assets)
}

fn default_branding(distro: &DistroInfo) -> Result<Vec<BrandingAsset>> {
    let release = format!(
        "NAME=\"{}\"\nVERSION=\"{}\"\nID={}\n",
        distro.name,
        distro.version,
        distro.slug()
    );
    let motd = format!("Welcome to {} {}\n", distro.name, distro.version);
    Ok(vec![
        BrandingAsset::new("release", release)?,
        BrandingAsset::new("motd", motd)?,
    ])
}
