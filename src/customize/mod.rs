//! Customizer: overlays a [`CustomizationBundle`] onto a staged working tree.
//!
//! Steps run in the order of [`CustomizationStep::ALL`]. Each step writes
//! its files through temp names and renames them only once all of them are
//! complete. A failed step leaves earlier steps applied and the tree marked
//! uncustomized, which the composer refuses.

pub mod boot_menu;
pub mod bundle;
pub mod manifest;

pub use boot_menu::{BootEntry, BootMenu};
pub use bundle::{BrandingAsset, CustomizationBundle};
pub use manifest::{ManifestSection, PackageManifest};

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::arch::{Architecture, BootProfile};
use crate::artifact::filesystem::{write_files_atomic, PendingFile};
use crate::config::DistroInfo;
use crate::error::{CustomizationStep, RemasterError, Result};
use crate::interrupt;

pub const MANIFEST_FILENAME: &str = "packages.list";
pub const PROVISIONING_FILENAME: &str = "provision.sh";
pub const BRANDING_DIR: &str = "branding";
pub const ISOLINUX_MENU: &str = "isolinux/txt.cfg";
pub const GRUB_MENU: &str = "boot/grub/grub.cfg";

const PROVISIONING_MODE: u32 = 0o755;

/// A staged copy of a base image for one architecture.
#[derive(Debug)]
pub struct WorkingTree {
    root: PathBuf,
    arch: Architecture,
    customized: bool,
}

impl WorkingTree {
    pub fn new(root: &Path, arch: Architecture) -> Self {
        Self {
            root: root.to_path_buf(),
            arch,
            customized: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    pub fn is_customized(&self) -> bool {
        self.customized
    }
}

/// Apply every bundle element to `tree`.
pub fn customize(
    tree: &mut WorkingTree,
    bundle: &CustomizationBundle,
    distro: &DistroInfo,
    profile: BootProfile,
) -> Result<()> {
    let distro_dir = tree.root.join(distro.slug());

    for step in CustomizationStep::ALL {
        interrupt::check()?;
        let files = plan_step(step, &tree.root, &distro_dir, bundle, profile);
        debug!(arch = %tree.arch, step = %step, files = files.len(), "applying customization step");
        write_files_atomic(&files).map_err(|e| RemasterError::Customization {
            step,
            source: e.into(),
        })?;
    }

    tree.customized = true;
    info!(
        arch = %tree.arch,
        packages = bundle.manifest().len(),
        branding = bundle.branding().len(),
        "working tree customized"
    );
    Ok(())
}

fn plan_step(
    step: CustomizationStep,
    root: &Path,
    distro_dir: &Path,
    bundle: &CustomizationBundle,
    profile: BootProfile,
) -> Vec<PendingFile> {
    match step {
        CustomizationStep::Manifest => vec![PendingFile::new(
            distro_dir.join(MANIFEST_FILENAME),
            bundle.manifest().render(),
        )],
        CustomizationStep::Branding => bundle
            .branding()
            .iter()
            .map(|asset| {
                PendingFile::new(
                    distro_dir.join(BRANDING_DIR).join(asset.path()),
                    asset.contents(),
                )
            })
            .collect(),
        CustomizationStep::Provisioning => vec![PendingFile::new(
            distro_dir.join(PROVISIONING_FILENAME),
            bundle.provisioning_script(),
        )
        .with_mode(PROVISIONING_MODE)],
        CustomizationStep::BootMenu => {
            let menu = bundle.boot_menu();
            let mut files = vec![PendingFile::new(root.join(ISOLINUX_MENU), menu.render_isolinux())];
            if profile.needs_uefi() {
                files.push(PendingFile::new(root.join(GRUB_MENU), menu.render_grub()));
            }
            files
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomizationSources;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn setup() -> (TempDir, WorkingTree, CustomizationBundle, DistroInfo) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("custom-amd64");
        fs::create_dir_all(root.join("isolinux")).unwrap();
        fs::create_dir_all(root.join("boot/grub")).unwrap();
        let distro = DistroInfo::new("Obelion", "1.0").unwrap();
        let bundle =
            CustomizationBundle::from_sources(&CustomizationSources::default(), &distro).unwrap();
        let tree = WorkingTree::new(&root, Architecture::Amd64);
        (temp, tree, bundle, distro)
    }

    #[test]
    fn test_customize_applies_every_step() {
        let (_temp, mut tree, bundle, distro) = setup();

        customize(&mut tree, &bundle, &distro, BootProfile::LegacyPlusUefi).unwrap();

        let root = tree.root().to_path_buf();
        assert!(tree.is_customized());
        assert_eq!(
            fs::read_to_string(root.join("obelion/packages.list")).unwrap(),
            bundle.manifest().render()
        );
        assert!(root.join("obelion/branding/release").is_file());
        let script = root.join("obelion/provision.sh");
        assert_eq!(fs::read(&script).unwrap(), bundle.provisioning_script());
        assert_eq!(fs::metadata(&script).unwrap().permissions().mode() & 0o777, 0o755);
        assert!(fs::read_to_string(root.join(ISOLINUX_MENU))
            .unwrap()
            .contains("Install Obelion"));
        assert!(root.join(GRUB_MENU).is_file());
    }

    #[test]
    fn test_legacy_only_skips_grub_menu() {
        let (_temp, mut tree, bundle, distro) = setup();

        customize(&mut tree, &bundle, &distro, BootProfile::LegacyOnly).unwrap();

        assert!(tree.root().join(ISOLINUX_MENU).is_file());
        assert!(!tree.root().join(GRUB_MENU).exists());
    }

    #[test]
    fn test_failing_provisioning_keeps_earlier_steps_and_flag_unset() {
        let (_temp, mut tree, bundle, distro) = setup();
        // A directory where the script should go makes the rename fail.
        fs::create_dir_all(tree.root().join("obelion/provision.sh/blocker")).unwrap();

        let err = customize(&mut tree, &bundle, &distro, BootProfile::LegacyPlusUefi).unwrap_err();

        match &err {
            RemasterError::Customization { step, .. } => {
                assert_eq!(*step, CustomizationStep::Provisioning)
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!tree.is_customized());
        assert!(tree.root().join("obelion/packages.list").is_file());
        assert!(tree.root().join("obelion/branding/motd").is_file());
        assert!(!tree.root().join(ISOLINUX_MENU).exists());
        assert!(!tree.root().join("obelion/.provision.sh.tmp").exists());
    }
}
