//! Build configuration.
//!
//! Loaded from an optional TOML file; every field has a built-in default so
//! `obelion-builder build` works without one. Relative paths resolve against
//! the directory containing the config file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::arch::{Architecture, BootProfile};

pub const DEFAULT_DISTRO_NAME: &str = "Obelion";
pub const DEFAULT_DISTRO_VERSION: &str = "1.0";

/// Smallest plausible full server install image.
pub const DEFAULT_MIN_SIZE_MIB: u64 = 500;

const DEFAULT_KERNEL: &str = "/casper/vmlinuz";
const DEFAULT_INITRD: &str = "/casper/initrd";
const DEFAULT_KERNEL_ARGS: &str = "quiet splash ---";

/// ISO 9660 volume identifiers are limited to 32 characters.
const MAX_VOLUME_LABEL_LEN: usize = 32;

const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    distro: Option<DistroToml>,
    image: Option<Vec<ImageToml>>,
    customization: Option<CustomizationToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DistroToml {
    name: Option<String>,
    version: Option<String>,
    volume_label: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    arch: String,
    url: String,
    cache_name: Option<String>,
    min_size_mib: Option<u64>,
    sha256: Option<String>,
    boot_profile: Option<BootProfile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CustomizationToml {
    manifest: Option<String>,
    provisioning_script: Option<String>,
    branding_dir: Option<String>,
    kernel: Option<String>,
    initrd: Option<String>,
    kernel_args: Option<String>,
}

/// Identity of the produced distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistroInfo {
    pub name: String,
    pub version: String,
    pub volume_label: String,
}

impl DistroInfo {
    pub fn new(name: &str, version: &str) -> Result<Self> {
        let volume_label = default_volume_label(name);
        Self::with_label(name, version, &volume_label)
    }

    pub fn with_label(name: &str, version: &str, volume_label: &str) -> Result<Self> {
        let name = name.trim();
        let version = version.trim();
        if name.is_empty() || name.contains('/') {
            bail!("invalid distro name '{}'", name);
        }
        if version.is_empty() || version.contains('/') {
            bail!("invalid distro version '{}'", version);
        }
        if volume_label.is_empty() || volume_label.len() > MAX_VOLUME_LABEL_LEN {
            bail!(
                "volume label '{}' must be 1-{} characters",
                volume_label,
                MAX_VOLUME_LABEL_LEN
            );
        }
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            volume_label: volume_label.to_string(),
        })
    }

    /// Lower-cased name used in paths (`obelion`).
    pub fn slug(&self) -> String {
        self.name.to_ascii_lowercase().replace(' ', "-")
    }

    /// Output artifact stem, e.g. `obelion-1.0-arm64`.
    pub fn artifact_stem(&self, arch: Architecture) -> String {
        format!("{}-{}-{}", self.slug(), self.version, arch)
    }
}

fn default_volume_label(name: &str) -> String {
    name.trim()
        .to_ascii_uppercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(MAX_VOLUME_LABEL_LEN)
        .collect()
}

/// Where to get the base image for one architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    pub arch: Architecture,
    /// HTTP(S) URL, `file://` URL or local path.
    pub location: String,
    /// File name under `{workdir}/iso/`.
    pub cache_name: String,
    pub min_size_bytes: u64,
    pub sha256: Option<String>,
    pub boot_profile: BootProfile,
}

impl ImageSource {
    pub fn new(arch: Architecture, location: &str) -> Result<Self> {
        Ok(Self {
            arch,
            location: location.to_string(),
            cache_name: cache_name_from_location(location)?,
            min_size_bytes: DEFAULT_MIN_SIZE_MIB * 1024 * 1024,
            sha256: None,
            boot_profile: arch.default_boot_profile(),
        })
    }
}

fn cache_name_from_location(location: &str) -> Result<String> {
    let name = location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    if name.is_empty() || name == ".." || name == "." {
        bail!("cannot derive a cache file name from '{}'", location);
    }
    Ok(name.to_string())
}

/// Inputs for the customization bundle. `None` selects the built-in asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomizationSources {
    pub manifest: Option<PathBuf>,
    pub provisioning_script: Option<PathBuf>,
    pub branding_dir: Option<PathBuf>,
    pub kernel: String,
    pub initrd: String,
    pub kernel_args: String,
}

impl Default for CustomizationSources {
    fn default() -> Self {
        Self {
            manifest: None,
            provisioning_script: None,
            branding_dir: None,
            kernel: DEFAULT_KERNEL.to_string(),
            initrd: DEFAULT_INITRD.to_string(),
            kernel_args: DEFAULT_KERNEL_ARGS.to_string(),
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct RemasterConfig {
    pub distro: DistroInfo,
    pub images: Vec<ImageSource>,
    pub customization: CustomizationSources,
}

impl RemasterConfig {
    /// Built-in configuration: Obelion 1.0 remastered from Ubuntu 24.04.1
    /// live server images.
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            distro: DistroInfo::new(DEFAULT_DISTRO_NAME, DEFAULT_DISTRO_VERSION)?,
            images: vec![
                ImageSource::new(
                    Architecture::Amd64,
                    "https://releases.ubuntu.com/24.04.1/ubuntu-24.04.1-live-server-amd64.iso",
                )?,
                ImageSource::new(
                    Architecture::Arm64,
                    "https://cdimage.ubuntu.com/releases/24.04.1/release/ubuntu-24.04.1-live-server-arm64.iso",
                )?,
            ],
            customization: CustomizationSources::default(),
        })
    }

    /// Load `path`, or the user config file if present, or the built-in
    /// defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        if let Some(user_config) = user_config_path().filter(|p| p.is_file()) {
            debug!(path = %user_config.display(), "using user config file");
            return Self::load(&user_config);
        }
        Self::builtin()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&raw, base_dir)
            .with_context(|| format!("invalid config '{}'", path.display()))
    }

    /// Parse TOML text, resolving relative paths against `base_dir`.
    pub fn parse(raw: &str, base_dir: &Path) -> Result<Self> {
        let parsed: ConfigToml = toml::from_str(raw).context("parsing TOML")?;
        let builtin = Self::builtin()?;

        let distro = match parsed.distro {
            Some(d) => {
                let name = d.name.unwrap_or_else(|| DEFAULT_DISTRO_NAME.to_string());
                let version = d
                    .version
                    .unwrap_or_else(|| DEFAULT_DISTRO_VERSION.to_string());
                match d.volume_label {
                    Some(label) => DistroInfo::with_label(&name, &version, label.trim())?,
                    None => DistroInfo::new(&name, &version)?,
                }
            }
            None => builtin.distro,
        };

        let images = match parsed.image {
            Some(entries) => {
                let mut images = Vec::with_capacity(entries.len());
                for entry in entries {
                    let image = resolve_image(entry)?;
                    if images.iter().any(|i: &ImageSource| i.arch == image.arch) {
                        bail!("architecture '{}' is configured more than once", image.arch);
                    }
                    // The cache directory is shared, so names must not collide.
                    if let Some(other) = images
                        .iter()
                        .find(|i: &&ImageSource| i.cache_name == image.cache_name)
                    {
                        bail!(
                            "{} and {} would share cache file '{}'; set a distinct cache_name",
                            other.arch,
                            image.arch,
                            image.cache_name
                        );
                    }
                    images.push(image);
                }
                images
            }
            None => builtin.images,
        };

        let c = parsed.customization.unwrap_or_default();
        let defaults = CustomizationSources::default();
        let customization = CustomizationSources {
            manifest: c.manifest.map(|p| resolve_path(base_dir, &p)),
            provisioning_script: c.provisioning_script.map(|p| resolve_path(base_dir, &p)),
            branding_dir: c.branding_dir.map(|p| resolve_path(base_dir, &p)),
            kernel: c.kernel.unwrap_or(defaults.kernel),
            initrd: c.initrd.unwrap_or(defaults.initrd),
            kernel_args: c.kernel_args.unwrap_or(defaults.kernel_args),
        };

        Ok(Self {
            distro,
            images,
            customization,
        })
    }

    pub fn image_for(&self, arch: Architecture) -> Option<&ImageSource> {
        self.images.iter().find(|image| image.arch == arch)
    }

    pub fn architectures(&self) -> Vec<Architecture> {
        self.images.iter().map(|image| image.arch).collect()
    }
}

fn resolve_image(entry: ImageToml) -> Result<ImageSource> {
    let arch: Architecture = entry.arch.parse()?;
    let mut image = ImageSource::new(arch, entry.url.trim())?;
    if let Some(cache_name) = entry.cache_name {
        let cache_name = cache_name.trim();
        if cache_name.is_empty()
            || cache_name.contains('/')
            || cache_name == "."
            || cache_name == ".."
        {
            bail!("invalid cache_name '{}' for {}", cache_name, arch);
        }
        image.cache_name = cache_name.to_string();
    }
    if let Some(min) = entry.min_size_mib {
        image.min_size_bytes = match min.checked_mul(1024 * 1024) {
            Some(bytes) => bytes,
            None => bail!("min_size_mib {} for {} is too large", min, arch),
        };
    }
    if let Some(sha256) = entry.sha256 {
        let sha256 = sha256.trim().to_ascii_lowercase();
        if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("sha256 for {} must be 64 hex characters", arch);
        }
        image.sha256 = Some(sha256);
    }
    if let Some(profile) = entry.boot_profile {
        image.boot_profile = profile;
    }
    Ok(image)
}

fn resolve_path(base_dir: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path.trim());
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    }
}

/// `~/.config/obelion-builder/config.toml`
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("obelion-builder").join(CONFIG_FILENAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_config() {
        let config = RemasterConfig::builtin().unwrap();
        assert_eq!(config.distro.artifact_stem(Architecture::Arm64), "obelion-1.0-arm64");
        assert_eq!(config.distro.volume_label, "OBELION");
        assert_eq!(config.architectures(), vec![Architecture::Amd64, Architecture::Arm64]);
        let amd64 = config.image_for(Architecture::Amd64).unwrap();
        assert_eq!(amd64.cache_name, "ubuntu-24.04.1-live-server-amd64.iso");
        assert_eq!(amd64.min_size_bytes, 500 * 1024 * 1024);
    }

    #[test]
    fn test_parse_overrides_and_resolves_paths() {
        let raw = r#"
[distro]
name = "Obelion"
version = "2.0"

[[image]]
arch = "x86_64"
url = "https://mirror.example/base.iso?download=1"
min_size_mib = 1
boot_profile = "legacy_only"

[customization]
manifest = "packages.list"
provisioning_script = "/abs/provision.sh"
"#;
        let config = RemasterConfig::parse(raw, Path::new("/etc/obelion")).unwrap();
        assert_eq!(config.distro.version, "2.0");
        assert_eq!(config.images.len(), 1);
        let image = &config.images[0];
        assert_eq!(image.arch, Architecture::Amd64);
        assert_eq!(image.cache_name, "base.iso");
        assert_eq!(image.min_size_bytes, 1024 * 1024);
        assert_eq!(image.boot_profile, BootProfile::LegacyOnly);
        assert_eq!(
            config.customization.manifest,
            Some(PathBuf::from("/etc/obelion/packages.list"))
        );
        assert_eq!(
            config.customization.provisioning_script,
            Some(PathBuf::from("/abs/provision.sh"))
        );
        assert_eq!(config.customization.kernel, "/casper/vmlinuz");
    }

    #[test]
    fn test_parse_rejects_unknown_fields() {
        let raw = "[distro]\nflavour = \"x\"\n";
        assert!(RemasterConfig::parse(raw, Path::new(".")).is_err());
    }

    #[test]
    fn test_parse_rejects_duplicate_arch() {
        let raw = r#"
[[image]]
arch = "amd64"
url = "https://a/one.iso"

[[image]]
arch = "amd64"
url = "https://a/two.iso"
"#;
        let err = RemasterConfig::parse(raw, Path::new(".")).unwrap_err();
        assert!(format!("{:#}", err).contains("more than once"));
    }

    #[test]
    fn test_parse_rejects_shared_cache_name() {
        let raw = r#"
[[image]]
arch = "amd64"
url = "https://mirror/amd64/current.iso"

[[image]]
arch = "arm64"
url = "https://mirror/arm64/current.iso"
"#;
        let err = RemasterConfig::parse(raw, Path::new(".")).unwrap_err();
        assert!(format!("{:#}", err).contains("share cache file 'current.iso'"));

        let renamed = format!("{}cache_name = \"current-arm64.iso\"\n", raw);
        let config = RemasterConfig::parse(&renamed, Path::new(".")).unwrap();
        assert_eq!(config.image_for(Architecture::Arm64).unwrap().cache_name, "current-arm64.iso");
        assert_eq!(config.image_for(Architecture::Amd64).unwrap().cache_name, "current.iso");
    }

    #[test]
    fn test_parse_rejects_overflowing_min_size() {
        let raw = format!(
            "[[image]]\narch = \"amd64\"\nurl = \"https://a/one.iso\"\nmin_size_mib = {}\n",
            i64::MAX
        );
        let err = RemasterConfig::parse(&raw, Path::new(".")).unwrap_err();
        assert!(format!("{:#}", err).contains("too large"));
    }

    #[test]
    fn test_parse_rejects_bad_sha256() {
        let raw = r#"
[[image]]
arch = "arm64"
url = "https://a/one.iso"
sha256 = "abc"
"#;
        assert!(RemasterConfig::parse(raw, Path::new(".")).is_err());
    }

    #[test]
    fn test_volume_label_length_limit() {
        assert!(DistroInfo::with_label("Obelion", "1.0", &"X".repeat(33)).is_err());
        let info = DistroInfo::new("My Distro", "1.0").unwrap();
        assert_eq!(info.volume_label, "MY_DISTRO");
        assert_eq!(info.slug(), "my-distro");
    }

    #[test]
    fn test_cache_name_from_location() {
        assert_eq!(cache_name_from_location("/srv/isos/base.iso").unwrap(), "base.iso");
        assert!(cache_name_from_location("").is_err());
        assert!(cache_name_from_location("https://host/isos/..").is_err());
    }
}
