//! Drives a firmware image through every layer down to a flat sysroot.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use crate::decrypt::Decryptor;
use crate::display::{print_hexdump_preview_indented, write_tar_listing, write_tree_manifest};
use crate::error::{Error, IoContext, Result};
use crate::file_entry::{scan_package_archive, MergeRule, PackageArchiveEntry};
use crate::file_types::{kind_name, read_prefix, FirmwareBlob, Kind};
use crate::gzip_stream::extract_ramdisk;
use crate::layout::{ExtractionTarget, LayoutEntry, LayoutSpec, Role, Stage};
use crate::mount::BlockDeviceMounter;
use crate::report::Report;
use crate::unpack::{extract_matching, Container, Outcome, UnpackReport, Unpacker};

/// Legacy U-Boot header in front of `uImage` payloads
const UIMAGE_MAGIC: [u8; 4] = [0x27, 0x05, 0x19, 0x56];
const UIMAGE_HEADER_LEN: u64 = 64;

const BOOST_PREFIX: &str = "libboost";

pub const REPORT_FILE: &str = "report.json";
pub const MANIFEST_FILE: &str = "sysroot.txt";

/// Resolves the firmware layout and unpacks each layer it finds
pub struct Extractor<'a> {
    layout: LayoutSpec,
    mounter: &'a dyn BlockDeviceMounter,
    decryptor: &'a dyn Decryptor,
}

impl<'a> Extractor<'a> {
    pub fn new(mounter: &'a dyn BlockDeviceMounter, decryptor: &'a dyn Decryptor) -> Self {
        Self {
            layout: LayoutSpec::default(),
            mounter,
            decryptor,
        }
    }

    /// Extract `source` (an image file or an unpacked firmware directory) into
    /// `dest`, which must not exist yet
    pub fn run(&self, source: &Path, dest: &Path) -> Result<Report> {
        if fs::symlink_metadata(source).is_err() {
            return Err(Error::SourceMissing(source.to_path_buf()));
        }
        if fs::symlink_metadata(dest).is_ok() {
            return Err(Error::DestinationExists(dest.to_path_buf()));
        }
        fs::create_dir_all(dest).context_path("creating", dest)?;

        let scratch = tempfile::Builder::new()
            .prefix(Role::Scratch.dir_name())
            .tempdir_in(dest)
            .context_path("creating scratch directory in", dest)?;

        let mut run = Run {
            layout: self.layout,
            decryptor: self.decryptor,
            unpacker: Unpacker::new(self.mounter, scratch.path()),
            scratch: scratch.path().to_path_buf(),
            dest: dest.to_path_buf(),
            sysroot: ExtractionTarget::new(dest, Role::Sysroot),
            report: Report::new(source),
        };
        run.execute(source)?;
        let report = run.report;

        if let Err(e) = scratch.close() {
            tracing::warn!(error = %e, "could not remove scratch directory");
        }
        finish(&report, dest)?;
        Ok(report)
    }
}

/// State of one extraction
struct Run<'a> {
    layout: LayoutSpec,
    decryptor: &'a dyn Decryptor,
    unpacker: Unpacker<'a>,
    scratch: PathBuf,
    dest: PathBuf,
    sysroot: ExtractionTarget,
    report: Report,
}

impl Run<'_> {
    fn execute(&mut self, source: &Path) -> Result<()> {
        let fw_root = self.resolve_input(source)?;
        self.sysroot.ensure()?;

        self.unwrap_kernel(&fw_root)?;
        self.unpack_ramdisk(&fw_root)?;
        let search_root = self.unpack_root_filesystem(&fw_root)?;
        self.unpack_extension(&search_root)?;
        self.unpack_extra_packages()?;
        let packages = self.unpack_package_archive(&search_root)?;
        self.merge_packages(&packages)
    }

    /// Peel the outer wrapping until a firmware directory is reached
    fn resolve_input(&mut self, source: &Path) -> Result<PathBuf> {
        let mut blob = FirmwareBlob::open(source);
        self.report.input_kind = kind_name(&blob.kind).to_string();
        println!("[input] {} ({})", source.display(), kind_name(&blob.kind));

        let mut unzipped = false;
        let mut decrypted = false;
        loop {
            match blob.kind {
                Kind::Directory => return Ok(blob.path),
                Kind::Zip if !unzipped => {
                    let image = crate::zip_utils::extract_firmware_image(&blob.path, &self.scratch)?;
                    blob = FirmwareBlob::open(&image);
                    println!("[input] bundle member {} ({})", image.display(), kind_name(&blob.kind));
                    unzipped = true;
                }
                Kind::Encrypted if !decrypted => {
                    let plaintext = self.scratch.join(decrypted_name(&blob.path));
                    println!("[decrypt] {}", blob.path.display());
                    self.decryptor.decrypt(&blob.path, &plaintext)?;
                    blob = FirmwareBlob::open(&plaintext);
                    println!("[decrypt] -> {}", kind_name(&blob.kind));
                    decrypted = true;
                }
                Kind::Gzip | Kind::Tar => {
                    let fw = ExtractionTarget::new(&self.dest, Role::Fw);
                    let container = if blob.kind == Kind::Tar {
                        Container::Tar
                    } else {
                        Container::CompressedTar
                    };
                    println!("[fw] {} -> {}", blob.path.display(), fw.path().display());
                    let result = self.unpacker.unpack(&blob.path, container, fw.path());
                    self.report.record_result("fw", &blob.path, fw.path(), result)?;
                    return Ok(fw.path().to_path_buf());
                }
                other => {
                    if let Ok(prefix) = read_prefix(&blob.path, blob.offset, 64) {
                        print_hexdump_preview_indented(&prefix, 4, "  ");
                    }
                    return Err(Error::UnsupportedInput {
                        path: blob.path,
                        kind: kind_name(&other),
                    });
                }
            }
        }
    }

    fn unwrap_kernel(&mut self, root: &Path) -> Result<()> {
        let Some((path, entry)) = self.layout.find(Stage::KernelImage, root) else {
            return Ok(());
        };
        println!("[kernel] {}", path.display());
        let result = self.kernel_ramdisk(&path, entry);
        self.report
            .record_result("kernel", &path, self.sysroot.path(), result)
    }

    fn kernel_ramdisk(&self, path: &Path, entry: &LayoutEntry) -> Result<UnpackReport> {
        let mut blob = FirmwareBlob::open(path);
        if blob.starts_with(&UIMAGE_MAGIC) {
            blob = blob.window(UIMAGE_HEADER_LEN, None);
            tracing::debug!(payload = kind_name(&blob.kind), "skipped U-Boot header");
        }
        let image = blob.read().context_path("reading", path)?;

        let Some(ramdisk) = extract_ramdisk(&image) else {
            println!("[kernel] no gzip members, skipping");
            return Ok(UnpackReport::default());
        };

        let staging = self.unpacker.scratch()?;
        let staged = staging.path().join("ramdisk");
        fs::write(&staged, &ramdisk).context_path("writing", &staged)?;
        self.unpacker
            .unpack(&staged, entry.container, self.sysroot.path())
    }

    fn unpack_ramdisk(&mut self, root: &Path) -> Result<()> {
        let Some((path, entry)) = self.layout.find(Stage::Ramdisk, root) else {
            return Ok(());
        };
        println!("[ramdisk] {}", path.display());
        let result = self.unpacker.unpack(&path, entry.container, self.sysroot.path());
        self.report
            .record_result("ramdisk", &path, self.sysroot.path(), result)
    }

    /// Unpack the root filesystem and return the directory later stages search.
    ///
    /// A flash volume carries copies of the remaining layers under `boot/`, so
    /// once it is unpacked that directory replaces the firmware root.
    fn unpack_root_filesystem(&mut self, root: &Path) -> Result<PathBuf> {
        let mut search_root = root.to_path_buf();

        if let Some((path, entry)) = self.layout.find(Stage::FlashVolume, root) {
            println!("[rootfs] {} (flash volume)", path.display());
            let result = self.unpacker.unpack(&path, entry.container, self.sysroot.path());
            self.report
                .record_result("flash-volume", &path, self.sysroot.path(), result)?;
            search_root = self.sysroot.join("boot");
        }

        if let Some((path, entry)) = self.layout.find(Stage::RootFilesystem, &search_root) {
            println!("[rootfs] {}", path.display());
            let result = self.unpack_entry(&path, entry);
            self.report
                .record_result("rootfs", &path, self.sysroot.path(), result)?;
        }
        Ok(search_root)
    }

    fn unpack_entry(&self, path: &Path, entry: &LayoutEntry) -> Result<UnpackReport> {
        let Some(inner) = entry.nested else {
            return self.unpacker.unpack(path, entry.container, self.sysroot.path());
        };

        let staging = self.unpacker.scratch()?;
        let outer = self.unpacker.unpack(path, entry.container, staging.path())?;
        let nested = staging.path().join(inner);
        if !nested.is_file() {
            let mut report = outer;
            report.files = 0;
            report.note(Outcome::Failed(format!(
                "{} has no {}",
                path.display(),
                inner
            )));
            return Ok(report);
        }

        let mut report = self
            .unpacker
            .unpack(&nested, Container::CompressedTar, self.sysroot.path())?;
        report.warnings.extend(outer.warnings);
        Ok(report)
    }

    fn unpack_extension(&mut self, search_root: &Path) -> Result<()> {
        let Some((path, entry)) = self.layout.find(Stage::RootfsExtension, search_root) else {
            return Ok(());
        };
        println!("[rootfs] {}", path.display());
        let result = self.unpacker.unpack(&path, entry.container, self.sysroot.path());
        self.report
            .record_result("rootfs-ext", &path, self.sysroot.path(), result)
    }

    /// `opt/source/*.tgz` shipped inside the root filesystem belong in `usr/local`
    fn unpack_extra_packages(&mut self) -> Result<()> {
        let source_dir = self.sysroot.join("opt/source");
        let Ok(dir) = fs::read_dir(&source_dir) else {
            return Ok(());
        };
        let mut archives: Vec<PathBuf> = dir
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "tgz"))
            .collect();
        archives.sort();

        let usr_local = self.sysroot.join("usr/local");
        for archive in archives {
            println!("[extra] {}", archive.display());
            let result = self
                .unpacker
                .unpack(&archive, Container::CompressedTar, &usr_local);
            self.report
                .record_result("extra-package", &archive, &usr_local, result)?;
        }
        Ok(())
    }

    fn unpack_package_archive(&mut self, search_root: &Path) -> Result<Vec<PackageArchiveEntry>> {
        let Some((path, entry)) = self.layout.find(Stage::PackageArchive, search_root) else {
            return Ok(Vec::new());
        };
        let qpkg = ExtractionTarget::new(&self.dest, Role::Qpkg);
        println!("[qpkg] {} -> {}", path.display(), qpkg.path().display());
        let result = self.unpacker.unpack(&path, entry.container, qpkg.path());
        self.report.record_result("qpkg", &path, qpkg.path(), result)?;

        let packages = match scan_package_archive(qpkg.path()) {
            Ok(packages) => packages,
            Err(e) => {
                self.report
                    .record("qpkg", &path, qpkg.path(), UnpackReport::failed(e.to_string()));
                return Ok(Vec::new());
            }
        };

        for package in packages.iter().filter(|p| p.compressed) {
            let listing = package.listing_path();
            let result = write_tar_listing(&package.path, &listing);
            self.report
                .record_result("qpkg-listing", &package.path, &listing, result)?;
        }
        Ok(packages)
    }

    fn merge_packages(&mut self, packages: &[PackageArchiveEntry]) -> Result<()> {
        let usr_local = self.sysroot.join("usr/local");
        for package in packages.iter().filter(|p| p.rule == MergeRule::UsrLocal) {
            println!("[merge] {} -> usr/local", package.name);
            let result = self
                .unpacker
                .unpack(&package.path, Container::CompressedTar, &usr_local);
            self.report
                .record_result("merge", &package.path, &usr_local, result)?;
        }

        let usr_lib = self.sysroot.join("usr/lib");
        let boost = packages.iter().find(|p| p.rule == MergeRule::Boost);
        let fallback = packages.iter().find(|p| p.rule == MergeRule::BoostFallback);
        if let Some(package) = boost {
            println!("[merge] {} -> usr/lib", package.name);
            let result = self
                .unpacker
                .unpack(&package.path, Container::CompressedTar, &usr_lib);
            self.report
                .record_result("merge-boost", &package.path, &usr_lib, result)?;
        } else if let Some(bundle) = fallback {
            println!("[merge] {} libraries -> usr/lib", bundle.name);
            let result =
                extract_matching(&bundle.path, &usr_lib, |name| name.starts_with(BOOST_PREFIX));
            self.report
                .record_result("merge-boost", &bundle.path, &usr_lib, result)?;
        } else {
            return Ok(());
        }

        match link_versioned_libraries(&usr_lib, BOOST_PREFIX) {
            Ok(links) => {
                for link in &links {
                    println!("[merge] linked {}", link.display());
                }
                self.report.links.extend(links);
            }
            Err(e) => tracing::warn!(dir = %usr_lib.display(), error = %e, "could not link libraries"),
        }
        Ok(())
    }
}

/// Write the run report, then the sysroot manifest as the very last artefact
fn finish(report: &Report, dest: &Path) -> Result<()> {
    report.write_json(&dest.join(REPORT_FILE))?;
    let sysroot = ExtractionTarget::new(dest, Role::Sysroot);
    let entries = write_tree_manifest(sysroot.path(), &dest.join(MANIFEST_FILE))?;
    println!(
        "[done] {} entries in {}, {} warnings",
        entries,
        sysroot.path().display(),
        report.warning_count()
    );
    Ok(())
}

fn decrypted_name(ciphertext: &Path) -> String {
    let stem = ciphertext
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "firmware".to_string());
    format!("{}.tgz", stem)
}

/// `libfoo.so.1.42.0` -> `libfoo.so`
fn unversioned_name(name: &str) -> Option<&str> {
    let idx = name.find(".so.")?;
    let version = &name[idx + 4..];
    let numeric = !version.is_empty() && version.chars().all(|c| c.is_ascii_digit() || c == '.');
    numeric.then(|| &name[..idx + 3])
}

/// Give every versioned `<prefix>*.so.<ver>` in `dir` an unversioned symlink.
/// Existing names are left alone.
pub fn link_versioned_libraries(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .context_path("listing", dir)?
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with(prefix))
        .collect();
    names.sort();

    let mut links = Vec::new();
    for name in &names {
        let Some(base) = unversioned_name(name) else {
            continue;
        };
        let link = dir.join(base);
        if fs::symlink_metadata(&link).is_ok() {
            continue;
        }
        match symlink(name, &link) {
            Ok(()) => links.push(link),
            Err(e) => tracing::warn!(link = %link.display(), error = %e, "symlink failed"),
        }
    }
    Ok(links)
}
