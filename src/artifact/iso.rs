//! Image composer.
//!
//! Turns a customized working tree into a hybrid bootable ISO with
//! `xorriso`. The image is built as `<output>.partial` and renamed into
//! place only after it exists and is non-empty, followed by a `.sha512`
//! checksum file.

use anyhow::anyhow;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::arch::BootProfile;
use crate::artifact::filesystem::{atomic_move, write_files_atomic, PendingFile};
use crate::artifact::iso_utils::{
    generate_iso_checksum, xorriso_args, XorrisoOptions, EFI_IMAGE, ISOLINUX_BIN, ISOLINUX_CFG,
    LDLINUX_C32,
};
use crate::customize::WorkingTree;
use crate::error::{BoxError, RemasterError, Result};
use crate::host::Host;
use crate::interrupt;

/// Debian/Ubuntu package shipping both `isolinux.bin` and `isohdpfx.bin`.
pub const ISOLINUX_PACKAGE: &str = "isolinux";

/// Debian/Ubuntu package shipping the BIOS `ldlinux.c32` core module.
pub const SYSLINUX_MODULES_PACKAGE: &str = "syslinux-common";

/// Known host locations of the isohybrid MBR template.
pub const MBR_TEMPLATE_CANDIDATES: &[&str] = &[
    "/usr/lib/ISOLINUX/isohdpfx.bin",
    "/usr/lib/syslinux/bios/isohdpfx.bin",
    "/usr/share/syslinux/isohdpfx.bin",
    "/usr/lib/syslinux/isohdpfx.bin",
];

/// Known host locations of the isolinux boot loader.
pub const ISOLINUX_BIN_CANDIDATES: &[&str] = &[
    "/usr/lib/ISOLINUX/isolinux.bin",
    "/usr/lib/syslinux/bios/isolinux.bin",
    "/usr/share/syslinux/isolinux.bin",
    "/usr/lib/syslinux/isolinux.bin",
];

/// Known host locations of the BIOS core module.
pub const LDLINUX_CANDIDATES: &[&str] = &[
    "/usr/lib/syslinux/modules/bios/ldlinux.c32",
    "/usr/lib/syslinux/bios/ldlinux.c32",
    "/usr/share/syslinux/ldlinux.c32",
    "/usr/lib/ISOLINUX/ldlinux.c32",
];

/// Top-level isolinux config written when the base image has none. The
/// boot menu itself lives in `txt.cfg`.
const ISOLINUX_CFG_CONTENTS: &str = "include txt.cfg\nprompt 0\ntimeout 50\n";

const MBR_TEMPLATE_NAME: &str = "isohdpfx.bin";
const EFI_LOADER_DIR: &str = "EFI/BOOT";

/// Options for building an ISO image.
#[derive(Debug, Clone)]
pub struct IsoOptions<'a> {
    /// Volume label (used for boot device detection).
    pub label: &'a str,
    pub profile: BootProfile,
}

/// A finished image on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedImage {
    pub path: PathBuf,
    pub checksum: PathBuf,
    pub size: u64,
}

/// Build `output` from `tree`.
pub fn compose(
    host: &dyn Host,
    tree: &WorkingTree,
    output: &Path,
    options: &IsoOptions,
) -> Result<ComposedImage> {
    if !tree.is_customized() {
        return Err(RemasterError::Precondition(format!(
            "working tree {} has not been customized",
            tree.root().display()
        )));
    }

    ensure_legacy_boot_set(host, tree.root())?;
    let mbr_template = acquire_host_file(
        host,
        MBR_TEMPLATE_NAME,
        MBR_TEMPLATE_CANDIDATES,
        ISOLINUX_PACKAGE,
    )?;
    if options.profile.needs_uefi() {
        ensure_efi_image(host, tree.root())?;
    }

    interrupt::check()?;

    let partial = PathBuf::from(format!("{}.partial", output.display()));
    let result = build_image(host, tree, output, &partial, &mbr_template, options);
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    let size = result?;

    let checksum = match generate_iso_checksum(output) {
        Ok(path) => path,
        Err(e) => {
            let _ = fs::remove_file(output);
            return Err(RemasterError::compose(output, e));
        }
    };

    info!(
        arch = %tree.arch(),
        profile = %options.profile,
        path = %output.display(),
        size_mib = size / 1024 / 1024,
        "image composed"
    );
    Ok(ComposedImage {
        path: output.to_path_buf(),
        checksum,
        size,
    })
}

fn build_image(
    host: &dyn Host,
    tree: &WorkingTree,
    output: &Path,
    partial: &Path,
    mbr_template: &Path,
    options: &IsoOptions,
) -> Result<u64> {
    if let Some(dir) = output.parent() {
        fs::create_dir_all(dir).map_err(|e| RemasterError::compose(output, e))?;
    }
    let _ = fs::remove_file(partial);

    let args = xorriso_args(&XorrisoOptions {
        tree: tree.root(),
        output: partial,
        label: options.label,
        mbr_template,
        profile: options.profile,
    });
    host.run_xorriso(&args)
        .map_err(|e| RemasterError::compose(output, e))?;

    let size = fs::metadata(partial).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(RemasterError::compose(
            output,
            anyhow!("xorriso reported success but {} is missing or empty", partial.display()),
        ));
    }

    atomic_move(partial, output).map_err(|e| RemasterError::compose(output, e))?;
    Ok(size)
}

/// Find a host file, installing `package` if it is not there yet.
fn acquire_host_file(
    host: &dyn Host,
    asset: &str,
    candidates: &[&str],
    package: &str,
) -> Result<PathBuf> {
    if let Some(path) = host.locate_file(candidates) {
        return Ok(path);
    }

    warn!(asset, package, "boot asset not found on host, installing");
    let install_error: Option<BoxError> = host.install_package(package).err().map(Into::into);

    host.locate_file(candidates)
        .ok_or_else(|| RemasterError::MissingBootAsset {
            asset: asset.to_string(),
            source: install_error,
        })
}

/// Make sure `isolinux/` can actually boot: the loader, its core module and
/// a config that pulls in the boot menu.
fn ensure_legacy_boot_set(host: &dyn Host, root: &Path) -> Result<()> {
    copy_from_host(host, root, ISOLINUX_BIN, ISOLINUX_BIN_CANDIDATES, ISOLINUX_PACKAGE)?;
    copy_from_host(
        host,
        root,
        LDLINUX_C32,
        LDLINUX_CANDIDATES,
        SYSLINUX_MODULES_PACKAGE,
    )?;

    if !root.join(ISOLINUX_CFG).is_file() {
        write_files_atomic(&[PendingFile::new(
            root.join(ISOLINUX_CFG),
            ISOLINUX_CFG_CONTENTS,
        )])
        .map_err(|e| RemasterError::MissingBootAsset {
            asset: ISOLINUX_CFG.to_string(),
            source: Some(e.into()),
        })?;
        debug!("wrote default {}", ISOLINUX_CFG);
    }
    Ok(())
}

/// Copy `rel` into the tree from the host unless the tree already has it.
fn copy_from_host(
    host: &dyn Host,
    root: &Path,
    rel: &str,
    candidates: &[&str],
    package: &str,
) -> Result<()> {
    let target = root.join(rel);
    if target.is_file() {
        return Ok(());
    }
    let found = acquire_host_file(host, rel, candidates, package)?;
    let copied = target
        .parent()
        .map(fs::create_dir_all)
        .unwrap_or(Ok(()))
        .and_then(|_| fs::copy(&found, &target));
    if let Err(e) = copied {
        return Err(RemasterError::MissingBootAsset {
            asset: rel.to_string(),
            source: Some(e.into()),
        });
    }
    debug!(asset = rel, from = %found.display(), "copied boot asset from host");
    Ok(())
}

/// Build `boot/grub/efi.img` from the tree's EFI loaders when the base
/// image does not ship one.
fn ensure_efi_image(host: &dyn Host, root: &Path) -> Result<()> {
    let target = root.join(EFI_IMAGE);
    if target.is_file() {
        return Ok(());
    }

    let missing = |source: Option<BoxError>| RemasterError::MissingBootAsset {
        asset: EFI_IMAGE.to_string(),
        source,
    };

    let mut loaders: Vec<PathBuf> = match fs::read_dir(root.join(EFI_LOADER_DIR)) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect(),
        Err(_) => Vec::new(),
    };
    if loaders.is_empty() {
        return Err(missing(None));
    }
    loaders.sort();

    warn!(loaders = loaders.len(), "no {} in base image, building one", EFI_IMAGE);
    if let Some(dir) = target.parent() {
        fs::create_dir_all(dir).map_err(|e| missing(Some(e.into())))?;
    }
    host.build_efi_image(&loaders, &target).map_err(|e| {
        let _ = fs::remove_file(&target);
        missing(Some(e.into()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::config::{CustomizationSources, DistroInfo};
    use crate::customize::{customize, CustomizationBundle};
    use crate::test_support::{FakeFailures, FakeHost};
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        tree: WorkingTree,
        mbr: PathBuf,
    }

    impl Fixture {
        fn new(profile: BootProfile, customized: bool) -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().join("custom-amd64");
            fs::create_dir_all(root.join("isolinux")).unwrap();
            fs::create_dir_all(root.join("boot/grub")).unwrap();
            fs::create_dir_all(root.join("EFI/BOOT")).unwrap();
            fs::write(root.join(ISOLINUX_BIN), b"isolinux").unwrap();
            fs::write(root.join(LDLINUX_C32), b"ldlinux").unwrap();
            fs::write(root.join(EFI_IMAGE), b"fat").unwrap();
            fs::write(root.join("EFI/BOOT/BOOTx64.EFI"), b"shim").unwrap();

            let mbr = temp.path().join("host-isohdpfx.bin");
            fs::write(&mbr, [0u8; 432]).unwrap();

            let mut tree = WorkingTree::new(&root, Architecture::Amd64);
            if customized {
                apply_default_bundle(&mut tree, profile);
            }
            Self { temp, tree, mbr }
        }

        fn output(&self) -> PathBuf {
            self.temp.path().join("output/obelion-1.0-amd64.iso")
        }

        fn host(&self) -> FakeHost {
            FakeHost::new(self.tree.root()).with_host_file(MBR_TEMPLATE_CANDIDATES[0], &self.mbr)
        }
    }

    fn apply_default_bundle(tree: &mut WorkingTree, profile: BootProfile) {
        let distro = DistroInfo::new("Obelion", "1.0").unwrap();
        let bundle =
            CustomizationBundle::from_sources(&CustomizationSources::default(), &distro).unwrap();
        customize(tree, &bundle, &distro, profile).unwrap();
    }

    fn options(profile: BootProfile) -> IsoOptions<'static> {
        IsoOptions {
            label: "OBELION",
            profile,
        }
    }

    #[test]
    fn test_compose_produces_image_and_checksum() {
        let fx = Fixture::new(BootProfile::LegacyPlusUefi, true);
        let host = fx.host();

        let image = compose(&host, &fx.tree, &fx.output(), &options(BootProfile::LegacyPlusUefi)).unwrap();

        assert_eq!(image.path, fx.output());
        assert!(image.size > 0);
        assert!(fs::metadata(fx.output()).unwrap().len() > 0);
        assert!(image.checksum.is_file());
        assert!(!fx.temp.path().join("output/obelion-1.0-amd64.iso.partial").exists());
        let runs = host.xorriso_runs();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].iter().any(|a| a == "-eltorito-alt-boot"));
    }

    #[test]
    fn test_uncustomized_tree_is_refused() {
        let fx = Fixture::new(BootProfile::LegacyOnly, false);
        let host = fx.host();

        let err = compose(&host, &fx.tree, &fx.output(), &options(BootProfile::LegacyOnly)).unwrap_err();

        assert_eq!(err.kind(), "PreconditionError");
        assert!(!fx.output().exists());
        assert!(host.xorriso_runs().is_empty());
    }

    #[test]
    fn test_missing_mbr_template_is_installed() {
        let fx = Fixture::new(BootProfile::LegacyOnly, true);
        let host = FakeHost::new(fx.tree.root()).with_package(
            ISOLINUX_PACKAGE,
            MBR_TEMPLATE_CANDIDATES[1],
            &fx.mbr,
        );

        compose(&host, &fx.tree, &fx.output(), &options(BootProfile::LegacyOnly)).unwrap();

        assert_eq!(host.installed_packages(), vec![ISOLINUX_PACKAGE.to_string()]);
        assert!(fx.output().is_file());
    }

    #[test]
    fn test_unobtainable_mbr_template_is_missing_boot_asset() {
        let fx = Fixture::new(BootProfile::LegacyOnly, true);
        let host = FakeHost::new(fx.tree.root());

        let err = compose(&host, &fx.tree, &fx.output(), &options(BootProfile::LegacyOnly)).unwrap_err();

        assert_eq!(err.kind(), "MissingBootAssetError");
        assert!(err.to_string().contains("isohdpfx.bin"));
        assert!(!fx.output().exists());
    }

    #[test]
    fn test_missing_isolinux_bin_copied_from_host() {
        let fx = Fixture::new(BootProfile::LegacyOnly, true);
        fs::remove_file(fx.tree.root().join(ISOLINUX_BIN)).unwrap();
        let host_bin = fx.temp.path().join("host-isolinux.bin");
        fs::write(&host_bin, b"host isolinux").unwrap();
        let host = fx.host().with_host_file(ISOLINUX_BIN_CANDIDATES[0], &host_bin);

        compose(&host, &fx.tree, &fx.output(), &options(BootProfile::LegacyOnly)).unwrap();

        assert_eq!(
            fs::read(fx.tree.root().join(ISOLINUX_BIN)).unwrap(),
            b"host isolinux"
        );
    }

    #[test]
    fn test_grub_only_tree_gets_full_legacy_boot_set() {
        let mut fx = Fixture::new(BootProfile::LegacyPlusUefi, false);
        fs::remove_dir_all(fx.tree.root().join("isolinux")).unwrap();
        apply_default_bundle(&mut fx.tree, BootProfile::LegacyPlusUefi);

        let host_bin = fx.temp.path().join("host-isolinux.bin");
        let host_ldlinux = fx.temp.path().join("host-ldlinux.c32");
        fs::write(&host_bin, b"host isolinux").unwrap();
        fs::write(&host_ldlinux, b"host ldlinux").unwrap();
        let host = fx
            .host()
            .with_host_file(ISOLINUX_BIN_CANDIDATES[0], &host_bin)
            .with_package(SYSLINUX_MODULES_PACKAGE, LDLINUX_CANDIDATES[0], &host_ldlinux);

        compose(&host, &fx.tree, &fx.output(), &options(BootProfile::LegacyPlusUefi)).unwrap();

        let isolinux = fx.tree.root().join("isolinux");
        for name in ["isolinux.bin", "ldlinux.c32", "isolinux.cfg", "txt.cfg"] {
            assert!(isolinux.join(name).is_file(), "isolinux/{} missing", name);
        }
        assert_eq!(fs::read(fx.tree.root().join(LDLINUX_C32)).unwrap(), b"host ldlinux");
        let cfg = fs::read_to_string(fx.tree.root().join(ISOLINUX_CFG)).unwrap();
        assert!(cfg.contains("include txt.cfg"));
        assert_eq!(
            host.installed_packages(),
            vec![SYSLINUX_MODULES_PACKAGE.to_string()]
        );
        assert!(fx.output().is_file());
    }

    #[test]
    fn test_unobtainable_ldlinux_is_missing_boot_asset() {
        let fx = Fixture::new(BootProfile::LegacyOnly, true);
        fs::remove_file(fx.tree.root().join(LDLINUX_C32)).unwrap();
        let host = fx.host();

        let err = compose(&host, &fx.tree, &fx.output(), &options(BootProfile::LegacyOnly)).unwrap_err();

        assert_eq!(err.kind(), "MissingBootAssetError");
        assert!(err.to_string().contains("ldlinux.c32"));
        assert!(!fx.output().exists());
        assert!(host.xorriso_runs().is_empty());
    }

    #[test]
    fn test_existing_isolinux_cfg_is_kept() {
        let fx = Fixture::new(BootProfile::LegacyOnly, true);
        let base_cfg = "ui menu.c32\ninclude menu.cfg\n";
        fs::write(fx.tree.root().join(ISOLINUX_CFG), base_cfg).unwrap();
        let host = fx.host();

        compose(&host, &fx.tree, &fx.output(), &options(BootProfile::LegacyOnly)).unwrap();

        assert_eq!(
            fs::read_to_string(fx.tree.root().join(ISOLINUX_CFG)).unwrap(),
            base_cfg
        );
    }

    #[test]
    fn test_efi_image_built_from_loaders() {
        let fx = Fixture::new(BootProfile::HybridGptApm, true);
        fs::remove_file(fx.tree.root().join(EFI_IMAGE)).unwrap();
        let host = fx.host();

        compose(&host, &fx.tree, &fx.output(), &options(BootProfile::HybridGptApm)).unwrap();

        assert_eq!(host.efi_images_built(), 1);
        assert!(fx.tree.root().join(EFI_IMAGE).is_file());
    }

    #[test]
    fn test_efi_image_without_loaders_is_missing_boot_asset() {
        let fx = Fixture::new(BootProfile::LegacyPlusUefi, true);
        fs::remove_file(fx.tree.root().join(EFI_IMAGE)).unwrap();
        fs::remove_dir_all(fx.tree.root().join("EFI")).unwrap();
        let host = fx.host();

        let err = compose(&host, &fx.tree, &fx.output(), &options(BootProfile::LegacyPlusUefi)).unwrap_err();

        assert_eq!(err.kind(), "MissingBootAssetError");
        assert!(err.to_string().contains(EFI_IMAGE));
    }

    #[test]
    fn test_xorriso_failure_leaves_nothing() {
        let fx = Fixture::new(BootProfile::LegacyOnly, true);
        let host = fx.host().with_failures(FakeFailures {
            xorriso: true,
            ..Default::default()
        });

        let err = compose(&host, &fx.tree, &fx.output(), &options(BootProfile::LegacyOnly)).unwrap_err();

        assert_eq!(err.kind(), "ComposeError");
        assert!(!fx.output().exists());
        assert!(!fx.temp.path().join("output/obelion-1.0-amd64.iso.partial").exists());
    }

    #[test]
    fn test_empty_xorriso_output_is_compose_error() {
        let fx = Fixture::new(BootProfile::LegacyOnly, true);
        let host = fx.host().with_failures(FakeFailures {
            xorriso_empty_output: true,
            ..Default::default()
        });

        let err = compose(&host, &fx.tree, &fx.output(), &options(BootProfile::LegacyOnly)).unwrap_err();

        assert_eq!(err.kind(), "ComposeError");
        assert!(!fx.output().exists());
    }
}
