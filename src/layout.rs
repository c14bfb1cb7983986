//! Where each hardware family keeps its firmware layers.
//!
//! Models differ in which files they ship, never in what a given file name
//! means, so every stage is a lookup over candidate names and the first file
//! present wins.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result};
use crate::unpack::Container;

/// Pipeline stage consuming a layout entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    KernelImage,
    Ramdisk,
    /// UBI volume holding the root filesystem and a `boot/` copy of the rest
    FlashVolume,
    RootFilesystem,
    RootfsExtension,
    PackageArchive,
}

/// One candidate file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    pub name: &'static str,
    pub stage: Stage,
    pub container: Container,
    /// File inside the container that carries the real payload
    pub nested: Option<&'static str>,
}

const fn entry(name: &'static str, stage: Stage, container: Container) -> LayoutEntry {
    LayoutEntry {
        name,
        stage,
        container,
        nested: None,
    }
}

/// QNAP firmware layouts across the ARM and x86 families
pub const QNAP_LAYOUT: &[LayoutEntry] = &[
    entry("uImage", Stage::KernelImage, Container::Auto),
    entry("initrd.boot", Stage::Ramdisk, Container::Auto),
    entry("initrd", Stage::Ramdisk, Container::Auto),
    entry("rootfs2.ubi", Stage::FlashVolume, Container::Ubi),
    entry("rootfs2.tgz", Stage::RootFilesystem, Container::CompressedTar),
    entry("rootfs2.bz", Stage::RootFilesystem, Container::CompressedTar),
    LayoutEntry {
        name: "rootfs2.img",
        stage: Stage::RootFilesystem,
        container: Container::Ext2,
        nested: Some("rootfs2.bz"),
    },
    entry("rootfs_ext.tgz", Stage::RootfsExtension, Container::CompressedTar),
    entry("qpkg.tar", Stage::PackageArchive, Container::Tar),
];

/// Read-only table of candidate files per stage
#[derive(Debug, Clone, Copy)]
pub struct LayoutSpec {
    entries: &'static [LayoutEntry],
}

impl Default for LayoutSpec {
    fn default() -> Self {
        Self::new(QNAP_LAYOUT)
    }
}

impl LayoutSpec {
    pub fn new(entries: &'static [LayoutEntry]) -> Self {
        Self { entries }
    }

    pub fn candidates(&self, stage: Stage) -> impl Iterator<Item = &'static LayoutEntry> + '_ {
        self.entries.iter().filter(move |e| e.stage == stage)
    }

    /// First candidate for `stage` present as a file under `root`
    pub fn find(&self, stage: Stage, root: &Path) -> Option<(PathBuf, &'static LayoutEntry)> {
        self.candidates(stage).find_map(|entry| {
            let path = root.join(entry.name);
            path.is_file().then_some((path, entry))
        })
    }
}

/// What an output directory is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Fw,
    Sysroot,
    Qpkg,
    Scratch,
}

impl Role {
    pub fn dir_name(self) -> &'static str {
        match self {
            Role::Fw => "fw",
            Role::Sysroot => "sysroot",
            Role::Qpkg => "qpkg",
            Role::Scratch => ".scratch",
        }
    }
}

/// A directory under the destination root, created on first write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionTarget {
    pub role: Role,
    path: PathBuf,
}

impl ExtractionTarget {
    pub fn new(root: &Path, role: Role) -> Self {
        Self {
            role,
            path: root.join(role.dir_name()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subdirectory inside the target, e.g. `usr/local` of the sysroot
    pub fn join(&self, rel: &str) -> PathBuf {
        self.path.join(rel)
    }

    pub fn ensure(&self) -> Result<&Path> {
        fs::create_dir_all(&self.path).context_path("creating", &self.path)?;
        tracing::debug!(role = ?self.role, path = %self.path.display(), "target ready");
        Ok(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rootfs_candidates_in_order() {
        let layout = LayoutSpec::default();
        let names: Vec<_> = layout
            .candidates(Stage::RootFilesystem)
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["rootfs2.tgz", "rootfs2.bz", "rootfs2.img"]);
    }

    #[test]
    fn test_first_present_wins() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("rootfs2.img"), b"img").unwrap();
        fs::write(dir.path().join("rootfs2.bz"), b"bz").unwrap();

        let (path, entry) = LayoutSpec::default()
            .find(Stage::RootFilesystem, dir.path())
            .unwrap();
        assert_eq!(path, dir.path().join("rootfs2.bz"));
        assert_eq!(entry.container, Container::CompressedTar);
    }

    #[test]
    fn test_missing_and_directories_ignored() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("initrd.boot")).unwrap();
        fs::write(dir.path().join("initrd"), b"ramdisk").unwrap();

        let layout = LayoutSpec::default();
        assert!(layout.find(Stage::KernelImage, dir.path()).is_none());
        let (path, _) = layout.find(Stage::Ramdisk, dir.path()).unwrap();
        assert_eq!(path, dir.path().join("initrd"));
    }

    #[test]
    fn test_ext2_rootfs_names_nested_payload() {
        let entry = LayoutSpec::default()
            .candidates(Stage::RootFilesystem)
            .find(|e| e.container == Container::Ext2)
            .unwrap();
        assert_eq!(entry.nested, Some("rootfs2.bz"));
    }

    #[test]
    fn test_targets() {
        let dir = TempDir::new().unwrap();
        let sysroot = ExtractionTarget::new(dir.path(), Role::Sysroot);
        assert!(!sysroot.path().exists());
        sysroot.ensure().unwrap();
        assert!(dir.path().join("sysroot").is_dir());
        assert_eq!(sysroot.join("usr/local"), dir.path().join("sysroot/usr/local"));
        assert_eq!(Role::Qpkg.dir_name(), "qpkg");
    }
}
