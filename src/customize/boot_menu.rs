//! Boot menus for the legacy (isolinux) and UEFI (GRUB) loaders.

use anyhow::{bail, Result};

use crate::config::DistroInfo;

/// Kernel arguments for the media self-check entry.
const CHECK_DISC_ARGS: &str = "boot=casper integrity-check quiet splash ---";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub label: String,
    pub kernel: String,
    pub initrd: String,
    pub args: String,
}

impl BootEntry {
    pub fn new(label: &str, kernel: &str, initrd: &str, args: &str) -> Self {
        Self {
            label: label.to_string(),
            kernel: kernel.to_string(),
            initrd: initrd.to_string(),
            args: args.to_string(),
        }
    }
}

/// Ordered boot entries; the first one is the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootMenu {
    entries: Vec<BootEntry>,
}

impl BootMenu {
    pub fn new(entries: Vec<BootEntry>) -> Result<Self> {
        if entries.is_empty() {
            bail!("boot menu needs at least one entry");
        }
        for entry in &entries {
            if entry.label.trim().is_empty() {
                bail!("boot entry label is empty");
            }
            if entry.label.contains(['"', '\n', '\r']) {
                bail!("boot entry label '{}' contains a quote or newline", entry.label);
            }
            for (what, value) in [("kernel", &entry.kernel), ("initrd", &entry.initrd)] {
                if !value.starts_with('/') || value.contains(char::is_whitespace) {
                    bail!(
                        "boot entry '{}': {} path '{}' must be absolute without spaces",
                        entry.label,
                        what,
                        value
                    );
                }
            }
            if entry.args.contains(['\n', '\r']) {
                bail!("boot entry '{}': arguments contain a newline", entry.label);
            }
        }
        Ok(Self { entries })
    }

    /// "Install {Distro}" followed by the media check entry.
    pub fn standard(distro: &DistroInfo, kernel: &str, initrd: &str, args: &str) -> Result<Self> {
        Self::new(vec![
            BootEntry::new(&format!("Install {}", distro.name), kernel, initrd, args),
            BootEntry::new("Check disc for defects", kernel, initrd, CHECK_DISC_ARGS),
        ])
    }

    pub fn entries(&self) -> &[BootEntry] {
        &self.entries
    }

    /// `isolinux/txt.cfg`
    pub fn render_isolinux(&self) -> String {
        let mut out = String::from("default entry0\n");
        for (i, entry) in self.entries.iter().enumerate() {
            out.push_str(&format!("label entry{}\n", i));
            out.push_str(&format!("  menu label ^{}\n", entry.label));
            out.push_str(&format!("  kernel {}\n", entry.kernel));
            let mut append = format!("initrd={}", entry.initrd);
            if !entry.args.trim().is_empty() {
                append.push(' ');
                append.push_str(entry.args.trim());
            }
            out.push_str(&format!("  append {}\n", append));
        }
        out
    }

    /// `boot/grub/grub.cfg`
    pub fn render_grub(&self) -> String {
        let mut out = String::from(
            "set timeout=30\n\
             set default=0\n\n\
             loadfont unicode\n\n\
             set menu_color_normal=white/black\n\
             set menu_color_highlight=black/light-gray\n",
        );
        for entry in &self.entries {
            out.push('\n');
            out.push_str(&format!("menuentry \"{}\" {{\n", entry.label));
            out.push_str("\tset gfxpayload=keep\n");
            let args = entry.args.trim();
            if args.is_empty() {
                out.push_str(&format!("\tlinux\t{}\n", entry.kernel));
            } else {
                out.push_str(&format!("\tlinux\t{} {}\n", entry.kernel, args));
            }
            out.push_str(&format!("\tinitrd\t{}\n", entry.initrd));
            out.push_str("}\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn menu() -> BootMenu {
        let distro = DistroInfo::new("Obelion", "1.0").unwrap();
        BootMenu::standard(&distro, "/casper/vmlinuz", "/casper/initrd", "quiet splash ---").unwrap()
    }

    #[test]
    fn test_standard_entries() {
        let menu = menu();
        let labels: Vec<_> = menu.entries().iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["Install Obelion", "Check disc for defects"]);
    }

    #[test]
    fn test_render_isolinux() {
        let cfg = menu().render_isolinux();
        assert!(cfg.starts_with("default entry0\nlabel entry0\n  menu label ^Install Obelion\n"));
        assert!(cfg.contains("  kernel /casper/vmlinuz\n"));
        assert!(cfg.contains("  append initrd=/casper/initrd quiet splash ---\n"));
        assert!(cfg.contains("label entry1\n  menu label ^Check disc for defects\n"));
    }

    #[test]
    fn test_render_grub() {
        let cfg = menu().render_grub();
        assert!(cfg.contains("menuentry \"Install Obelion\" {\n"));
        assert!(cfg.contains("\tlinux\t/casper/vmlinuz quiet splash ---\n"));
        assert!(cfg.contains("\tinitrd\t/casper/initrd\n"));
        assert_eq!(cfg.matches("menuentry").count(), 2);
    }

    #[test]
    fn test_invalid_menus_rejected() {
        assert!(BootMenu::new(Vec::new()).is_err());
        assert!(BootMenu::new(vec![BootEntry::new("Say \"hi\"", "/k", "/i", "")]).is_err());
        assert!(BootMenu::new(vec![BootEntry::new("Install", "casper/vmlinuz", "/i", "")]).is_err());
    }
}
