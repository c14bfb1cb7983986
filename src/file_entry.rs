use std::path::{Path, PathBuf};

use crate::display::collect_tree;
use crate::error::Result;
use crate::file_types::{classify, Kind};

/// Packages merged into `usr/local` of the sysroot
pub const USR_LOCAL_PACKAGES: &[&str] = &["apache_php5", "mysql5", "mariadb5"];
pub const BOOST_PACKAGE: &str = "libboost";
/// Bundle carrying boost when no dedicated package exists
pub const BOOST_FALLBACK_BUNDLE: &str = "DSv3";

/// Where a package's payload ends up in the sysroot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    UsrLocal,
    Boost,
    BoostFallback,
    None,
}

impl MergeRule {
    pub fn for_name(name: &str) -> Self {
        if USR_LOCAL_PACKAGES.contains(&name) {
            MergeRule::UsrLocal
        } else if name == BOOST_PACKAGE {
            MergeRule::Boost
        } else if name == BOOST_FALLBACK_BUNDLE {
            MergeRule::BoostFallback
        } else {
            MergeRule::None
        }
    }
}

/// A `.tgz` payload found in the unpacked package archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageArchiveEntry {
    /// File stem, e.g. `mysql5`
    pub name: String,
    pub path: PathBuf,
    pub compressed: bool,
    pub rule: MergeRule,
}

impl PackageArchiveEntry {
    pub fn from_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let name = file_name.strip_suffix(".tgz")?;
        Some(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            compressed: classify(path) == Kind::Gzip,
            rule: MergeRule::for_name(name),
        })
    }

    /// Sidecar listing written next to the payload
    pub fn listing_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".txt");
        PathBuf::from(name)
    }
}

/// Collect every `.tgz` file under the unpacked package archive, sorted by path
pub fn scan_package_archive(root: &Path) -> Result<Vec<PackageArchiveEntry>> {
    Ok(collect_tree(root)?
        .into_iter()
        .filter(|rel| rel.is_file)
        .filter_map(|rel| PackageArchiveEntry::from_path(&root.join(&rel.path)))
        .collect())
}
