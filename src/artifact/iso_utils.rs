//! ISO mastering utilities: xorriso arguments, EFI boot images, checksums.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256, Sha512};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::arch::BootProfile;
use crate::process::Cmd;

/// BIOS El Torito boot image, relative to the tree root.
pub const ISOLINUX_BIN: &str = "isolinux/isolinux.bin";

/// Core module `isolinux.bin` loads from its own directory at boot.
pub const LDLINUX_C32: &str = "isolinux/ldlinux.c32";

/// Config `isolinux.bin` reads first. It must pull in the boot menu.
pub const ISOLINUX_CFG: &str = "isolinux/isolinux.cfg";

/// Boot catalog written by xorriso, relative to the tree root.
pub const BOOT_CATALOG: &str = "isolinux/boot.cat";

/// UEFI El Torito boot image (FAT), relative to the tree root.
pub const EFI_IMAGE: &str = "boot/grub/efi.img";

/// Two spaces between hash and file name, as `sha512sum -c` expects.
const CHECKSUM_SEPARATOR: &str = "  ";

/// Inputs for one xorriso invocation.
#[derive(Debug, Clone)]
pub struct XorrisoOptions<'a> {
    pub tree: &'a Path,
    pub output: &'a Path,
    /// Volume label (used for boot device detection).
    pub label: &'a str,
    /// Host MBR template for isohybrid (`isohdpfx.bin`).
    pub mbr_template: &'a Path,
    pub profile: BootProfile,
}

/// Build the xorriso argument list for a boot profile.
///
/// - every profile: Rock Ridge, BIOS El Torito from isolinux, isohybrid MBR
/// - UEFI profiles: an alternate El Torito entry for the EFI image, GPT hybrid
/// - `HybridGptApm`: Joliet long names and an APM table as well
pub fn xorriso_args(opts: &XorrisoOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-as", "mkisofs", "-r", "-V"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(opts.label.into());
    args.push("-o".into());
    args.push(opts.output.into());

    if opts.profile.uses_joliet() {
        args.extend(["-J", "-joliet-long"].map(OsString::from));
    }

    args.push("-isohybrid-mbr".into());
    args.push(opts.mbr_template.into());
    args.extend(
        [
            "-c",
            BOOT_CATALOG,
            "-b",
            ISOLINUX_BIN,
            "-no-emul-boot",
            "-boot-load-size",
            "4",
            "-boot-info-table",
        ]
        .map(OsString::from),
    );

    if opts.profile.needs_uefi() {
        args.extend(
            [
                "-eltorito-alt-boot",
                "-e",
                EFI_IMAGE,
                "-no-emul-boot",
                "-isohybrid-gpt-basdat",
            ]
            .map(OsString::from),
        );
    }

    if matches!(opts.profile, BootProfile::HybridGptApm) {
        args.push("-isohybrid-apm-hfsplus".into());
    }

    args.push(opts.tree.into());
    args
}

/// Size of a generated EFI boot image. FAT16 needs at least 16 MiB.
const EFIBOOT_SIZE_MB: u32 = 16;

/// Create an empty FAT16 image.
///
/// Creates a zero-filled file with `dd` and formats it with `mkfs.fat`, ready
/// to be populated with mtools (mmd, mcopy).
///
/// # Arguments
///
/// * `output` - Path for the image file
/// * `size_mb` - Size of the image in megabytes (minimum 16 for FAT16)
///
/// # Example
///
/// ```rust,ignore
/// use obelion_builder::artifact::iso_utils::create_fat16_image;
/// use std::path::Path;
///
/// create_fat16_image(Path::new("/tmp/efi.img"), 16)?;
/// ```
pub fn create_fat16_image(output: &Path, size_mb: u32) -> Result<()> {
    Cmd::new("dd")
        .arg("if=/dev/zero")
        .arg(format!("of={}", output.display()))
        .args(["bs=1M".to_string(), format!("count={}", size_mb)])
        .error_msg("Failed to create FAT16 image with dd")
        .run()?;

    Cmd::new("mkfs.fat")
        .args(["-F", "16"])
        .arg_path(output)
        .error_msg("mkfs.fat failed. Install dosfstools.")
        .run()?;

    Ok(())
}

/// Build a FAT EFI boot image holding `efi_files` under `::EFI/BOOT/`.
///
/// Used when a base image ships its EFI loaders in `EFI/BOOT/` but no
/// `boot/grub/efi.img` for the El Torito alternate entry. Needs dosfstools
/// and mtools on the host.
///
/// # Arguments
///
/// * `output` - Path for the image file, usually `<tree>/boot/grub/efi.img`
/// * `efi_files` - Loader files copied flat into `::EFI/BOOT/`
///
/// # Example
///
/// ```rust,ignore
/// use obelion_builder::artifact::iso_utils::create_efi_boot_image;
/// use std::path::{Path, PathBuf};
///
/// let loaders = vec![PathBuf::from("/work/custom-amd64/EFI/BOOT/BOOTx64.EFI")];
/// create_efi_boot_image(Path::new("/work/custom-amd64/boot/grub/efi.img"), &loaders)?;
/// ```
pub fn create_efi_boot_image(output: &Path, efi_files: &[PathBuf]) -> Result<()> {
    create_fat16_image(output, EFIBOOT_SIZE_MB)?;

    let image = output.to_string_lossy().into_owned();
    for dir in ["::EFI", "::EFI/BOOT"] {
        Cmd::new("mmd")
            .args(["-i", image.as_str(), dir])
            .error_msg("mmd failed. Install mtools.")
            .run()?;
    }

    for src in efi_files {
        Cmd::new("mcopy")
            .args(["-i", image.as_str()])
            .arg_path(src)
            .arg("::EFI/BOOT/")
            .error_msg(format!("mcopy failed to copy {}", src.display()))
            .run()?;
    }

    Ok(())
}

/// Streaming SHA-256 of a file. Returns (hex digest, size in bytes).
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    digest_file::<Sha256>(path)
}

fn digest_file<D: Digest>(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = D::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let hex = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    Ok((hex, size))
}

/// Generate a SHA512 checksum file for an ISO.
///
/// Writes checksum in standard format: "<hash>  <filename>" (two spaces).
/// Uses just the file name (not full path) so users can verify with:
///   cd output && sha512sum -c obelion-1.0-amd64.iso.sha512
///
/// # Arguments
///
/// * `iso_path` - Path to the ISO file to checksum
///
/// # Returns
///
/// Path to the generated checksum file (`iso_path` with `.sha512` appended)
///
/// # Example
///
/// ```rust,ignore
/// use obelion_builder::artifact::iso_utils::generate_iso_checksum;
/// use std::path::Path;
///
/// let sums = generate_iso_checksum(Path::new("output/obelion-1.0-amd64.iso"))?;
/// ```
pub fn generate_iso_checksum(iso_path: &Path) -> Result<PathBuf> {
    let (hash, _) = digest_file::<Sha512>(iso_path)?;

    let filename = iso_path
        .file_name()
        .context("Could not get ISO filename")?
        .to_string_lossy();

    let checksum_path = PathBuf::from(format!("{}.sha512", iso_path.display()));
    fs::write(
        &checksum_path,
        format!("{}{}{}\n", hash, CHECKSUM_SEPARATOR, filename),
    )
    .with_context(|| format!("Failed to write {}", checksum_path.display()))?;

    info!(
        sha512 = %format!("{}...{}", &hash[..8], &hash[hash.len() - 8..]),
        path = %checksum_path.display(),
        "wrote checksum"
    );

    Ok(checksum_path)
}
