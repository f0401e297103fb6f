//! Package manifest.
//!
//! Newline-delimited package identifiers. A `#` line starts a cosmetic
//! section; blank lines are ignored. Order is preserved and an identifier
//! may appear only once across all sections.

use anyhow::{bail, Result};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSection {
    pub title: Option<String>,
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageManifest {
    sections: Vec<ManifestSection>,
}

impl PackageManifest {
    pub fn new(sections: Vec<ManifestSection>) -> Result<Self> {
        let mut seen = HashSet::new();
        for section in &sections {
            for package in &section.packages {
                validate_identifier(package)?;
                if !seen.insert(package.as_str()) {
                    bail!("package '{}' is listed more than once", package);
                }
            }
        }
        if seen.is_empty() {
            bail!("package manifest lists no packages");
        }
        Ok(Self { sections })
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut sections = vec![ManifestSection {
            title: None,
            packages: Vec::new(),
        }];

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(title) = line.strip_prefix('#') {
                sections.push(ManifestSection {
                    title: Some(title.trim().to_string()),
                    packages: Vec::new(),
                });
                continue;
            }
            if line.split_whitespace().count() > 1 {
                bail!("line {}: expected one package per line, got '{}'", lineno + 1, line);
            }
            if let Some(current) = sections.last_mut() {
                current.packages.push(line.to_string());
            }
        }

        // Untitled leading section only exists if something precedes the first header.
        if sections[0].packages.is_empty() {
            sections.remove(0);
        }
        Self::new(sections)
    }

    pub fn sections(&self) -> &[ManifestSection] {
        &self.sections
    }

    /// All identifiers in manifest order.
    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .flat_map(|s| s.packages.iter().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.packages().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Canonical text form, as installed into the image.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            if !out.is_empty() {
                out.push('\n');
            }
            if let Some(title) = &section.title {
                out.push_str(&format!("# {}\n", title));
            }
            for package in &section.packages {
                out.push_str(package);
                out.push('\n');
            }
        }
        out
    }
}

fn validate_identifier(package: &str) -> Result<()> {
    if package.is_empty() || package.contains(char::is_whitespace) || package.contains('#') {
        bail!("invalid package identifier '{}'", package);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sections_in_order() {
        let text = "\
# Desktop Environment
ubuntu-desktop-minimal

# Development Tools
build-essential
git

# Libraries
nvidia-cuda-toolkit
";
        let manifest = PackageManifest::parse(text).unwrap();
        assert_eq!(manifest.sections().len(), 3);
        assert_eq!(
            manifest.sections()[1].title.as_deref(),
            Some("Development Tools")
        );
        assert_eq!(
            manifest.packages().collect::<Vec<_>>(),
            vec!["ubuntu-desktop-minimal", "build-essential", "git", "nvidia-cuda-toolkit"]
        );
    }

    #[test]
    fn test_untitled_packages_before_first_header() {
        let manifest = PackageManifest::parse("curl\n# System Tools\nhtop\n").unwrap();
        assert_eq!(manifest.sections()[0].title, None);
        assert_eq!(manifest.len(), 2);
    }

    #[test]
    fn test_duplicates_rejected_across_sections() {
        let err = PackageManifest::parse("# A\ngit\n# B\ngit\n").unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_multiple_tokens_on_a_line_rejected() {
        assert!(PackageManifest::parse("vim emacs\n").is_err());
    }

    #[test]
    fn test_empty_manifest_rejected() {
        assert!(PackageManifest::parse("# Only a header\n\n").is_err());
    }

    #[test]
    fn test_render_parses_back_to_same_manifest() {
        let manifest = PackageManifest::parse("# IDEs/Editors\nvim\n# System Tools\nhtop\n").unwrap();
        let rendered = manifest.render();
        assert_eq!(rendered, "# IDEs/Editors\nvim\n\n# System Tools\nhtop\n");
        assert_eq!(PackageManifest::parse(&rendered).unwrap(), manifest);
    }
}
