//! Mounting filesystem images and provisioning simulated flash.
//!
//! Everything privileged goes through [`BlockDeviceMounter`]. The production
//! implementation shells out to the usual util-linux and mtd-utils programs;
//! tests substitute a fake that copies plain directory trees.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::FlashConfig;
use crate::error::{Error, IoContext, Result};

/// Filesystem type passed to the mounter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Ext2,
    Ubifs,
}

impl FsType {
    pub fn as_str(self) -> &'static str {
        match self {
            FsType::Ext2 => "ext2",
            FsType::Ubifs => "ubifs",
        }
    }
}

/// Capability to mount images and to emulate a NAND flash chip
pub trait BlockDeviceMounter {
    /// Mount `source` read-only on `mount_point`
    fn mount_readonly(&self, source: &Path, fs: FsType, mount_point: &Path) -> Result<()>;

    fn unmount(&self, mount_point: &Path) -> Result<()>;

    /// Device node of the simulated flash chip
    fn flash_device(&self) -> PathBuf;

    fn flash_device_present(&self) -> bool {
        self.flash_device().exists()
    }

    /// Create the simulated flash, write the UBI image to it and attach it.
    /// Returns the UBI volume to mount.
    fn provision_flash(&self, image: &Path) -> Result<PathBuf>;

    /// Detach the UBI volume and remove the simulated flash
    fn release_flash(&self, volume: &Path) -> Result<()>;
}

/// Unmounts when dropped
pub struct MountGuard<'a> {
    mounter: &'a dyn BlockDeviceMounter,
    mount_point: PathBuf,
}

impl<'a> MountGuard<'a> {
    pub fn mount(
        mounter: &'a dyn BlockDeviceMounter,
        source: &Path,
        fs: FsType,
        mount_point: &Path,
    ) -> Result<Self> {
        mounter.mount_readonly(source, fs, mount_point)?;
        tracing::debug!(
            source = %source.display(),
            fs = fs.as_str(),
            mount_point = %mount_point.display(),
            "mounted"
        );
        Ok(Self {
            mounter,
            mount_point: mount_point.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.mount_point
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mounter.unmount(&self.mount_point) {
            tracing::warn!(mount_point = %self.mount_point.display(), error = %e, "unmount failed");
        }
    }
}

/// Detaches and removes the simulated flash when dropped
pub struct FlashGuard<'a> {
    mounter: &'a dyn BlockDeviceMounter,
    volume: PathBuf,
}

impl<'a> FlashGuard<'a> {
    /// Refuses to run if a simulated flash device already exists
    pub fn provision(mounter: &'a dyn BlockDeviceMounter, image: &Path) -> Result<Self> {
        if mounter.flash_device_present() {
            return Err(Error::FlashDeviceExists(mounter.flash_device()));
        }
        let volume = mounter.provision_flash(image)?;
        tracing::debug!(image = %image.display(), volume = %volume.display(), "flash attached");
        Ok(Self { mounter, volume })
    }

    pub fn volume(&self) -> &Path {
        &self.volume
    }
}

impl Drop for FlashGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mounter.release_flash(&self.volume) {
            tracing::warn!(volume = %self.volume.display(), error = %e, "flash release failed");
        }
    }
}

/// Run an external program to completion
pub(crate) fn run_tool(program: &str, args: &[&str]) -> Result<()> {
    tracing::debug!(program, ?args, "running");
    let status = Command::new(program)
        .args(args)
        .status()
        .context_path("running", Path::new(program))?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Tool {
            program: program.to_string(),
            status,
        })
    }
}

/// Mounter backed by `mount`, `nandsim` and mtd-utils. Requires root.
pub struct SystemMounter {
    flash: FlashConfig,
}

impl SystemMounter {
    pub fn new(flash: FlashConfig) -> Self {
        Self { flash }
    }

    fn nandsim_args(&self) -> Vec<String> {
        let names = [
            "first_id_byte",
            "second_id_byte",
            "third_id_byte",
            "fourth_id_byte",
        ];
        let mut args = vec!["nandsim".to_string()];
        args.extend(
            names
                .iter()
                .zip(self.flash.nandsim_ids.iter())
                .map(|(name, id)| format!("{}=0x{:02x}", name, id)),
        );
        args
    }

    fn format_and_attach(&self, image: &Path) -> Result<PathBuf> {
        let mtd = self.flash.mtd_device.to_string_lossy();
        let image = image.to_string_lossy();
        run_tool("ubiformat", &[&*mtd, "-y", "-f", &*image])?;
        run_tool("ubiattach", &["-p", &*mtd])?;
        Ok(self.flash.ubi_volume.clone())
    }
}

impl BlockDeviceMounter for SystemMounter {
    fn mount_readonly(&self, source: &Path, fs: FsType, mount_point: &Path) -> Result<()> {
        let options = match fs {
            FsType::Ext2 => "loop,ro",
            FsType::Ubifs => "ro",
        };
        run_tool(
            "mount",
            &[
                "-t",
                fs.as_str(),
                "-o",
                options,
                &*source.to_string_lossy(),
                &*mount_point.to_string_lossy(),
            ],
        )
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        run_tool("umount", &[&*mount_point.to_string_lossy()])
    }

    fn flash_device(&self) -> PathBuf {
        self.flash.mtd_device.clone()
    }

    fn provision_flash(&self, image: &Path) -> Result<PathBuf> {
        let args = self.nandsim_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_tool("modprobe", &args)?;

        self.format_and_attach(image).inspect_err(|_| {
            let mtd = self.flash.mtd_device.to_string_lossy();
            let _ = run_tool("ubidetach", &["-p", &*mtd]);
            if let Err(e) = run_tool("rmmod", &["nandsim"]) {
                tracing::warn!(error = %e, "removing nandsim failed");
            }
        })
    }

    fn release_flash(&self, _volume: &Path) -> Result<()> {
        let mtd = self.flash.mtd_device.to_string_lossy();
        let detached = run_tool("ubidetach", &["-p", &*mtd]);
        let removed = run_tool("rmmod", &["nandsim"]);
        detached.and(removed)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A mounter that "mounts" an image by copying the directory tree whose
    //! path is written inside the image file.

    use super::*;
    use std::cell::{Cell, RefCell};
    use std::fs;

    use crate::unpack::copy_tree;

    const PATH_OFFSET: usize = 16;

    fn image_with_path(magic_at: usize, magic: &[u8], tree: &Path) -> Vec<u8> {
        let mut data = vec![0u8; 2048];
        let path = tree.to_string_lossy();
        data[PATH_OFFSET..PATH_OFFSET + path.len()].copy_from_slice(path.as_bytes());
        data[magic_at..magic_at + magic.len()].copy_from_slice(magic);
        data
    }

    /// Fake ext2 image pointing at `tree`
    pub(crate) fn ext2_image(tree: &Path) -> Vec<u8> {
        image_with_path(1080, &[0x53, 0xef], tree)
    }

    /// Fake UBI image pointing at `tree`
    pub(crate) fn ubi_image(tree: &Path) -> Vec<u8> {
        image_with_path(0, b"UBI#", tree)
    }

    fn tree_of(image: &Path) -> Result<PathBuf> {
        let data = fs::read(image).context_path("reading", image)?;
        let raw = &data[PATH_OFFSET..];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(PathBuf::from(String::from_utf8_lossy(&raw[..end]).to_string()))
    }

    #[derive(Default)]
    pub(crate) struct FakeMounter {
        pub(crate) flash_present: bool,
        pub(crate) fail_mount: bool,
        pub(crate) fail_unmount: bool,
        pub(crate) fail_release: bool,
        pub(crate) calls: RefCell<Vec<String>>,
        pub(crate) attached: Cell<bool>,
    }

    impl FakeMounter {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl BlockDeviceMounter for FakeMounter {
        fn mount_readonly(&self, source: &Path, fs: FsType, mount_point: &Path) -> Result<()> {
            self.calls.borrow_mut().push(format!("mount {}", fs.as_str()));
            if self.fail_mount {
                return Err(Error::Extraction("mount refused".to_string()));
            }
            let tree = tree_of(source)?;
            copy_tree(&tree, mount_point);
            Ok(())
        }

        fn unmount(&self, _mount_point: &Path) -> Result<()> {
            self.calls.borrow_mut().push("umount".to_string());
            if self.fail_unmount {
                return Err(Error::Extraction("target is busy".to_string()));
            }
            Ok(())
        }

        fn flash_device(&self) -> PathBuf {
            PathBuf::from("/dev/fake-mtd0")
        }

        fn flash_device_present(&self) -> bool {
            self.flash_present || self.attached.get()
        }

        fn provision_flash(&self, image: &Path) -> Result<PathBuf> {
            self.calls.borrow_mut().push("attach".to_string());
            self.attached.set(true);
            Ok(image.to_path_buf())
        }

        fn release_flash(&self, _volume: &Path) -> Result<()> {
            self.calls.borrow_mut().push("detach".to_string());
            if self.fail_release {
                return Err(Error::Extraction("ubidetach failed".to_string()));
            }
            self.attached.set(false);
            Ok(())
        }
    }
}
