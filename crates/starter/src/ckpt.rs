//! Disk accounting and image updates for checkpoints written on this
//! machine. Both are traits so the checkpoint decisions can be tested
//! without real images.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::sys::statvfs::statvfs;

/// Fixed allowance for the image header, in KB.
pub const HEADER_KB: u64 = 4;

/// Size queries the checkpoint path makes, in KB.
pub trait DiskProbe {
    /// Space available to unprivileged users on the filesystem holding `dir`.
    fn free_kb(&self, dir: &Path) -> io::Result<u64>;

    /// Size of `path`, rounded up.
    fn file_kb(&self, path: &Path) -> io::Result<u64>;

    /// Size of an image's header.
    fn header_kb(&self, image: &Path) -> io::Result<u64>;

    /// Size of an image's text.
    fn text_kb(&self, image: &Path) -> io::Result<u64>;
}

/// Builds a new image from the current one plus a core dump.
pub trait ImageUpdater {
    fn update(&self, image: &Path, core: &Path, new_image: &Path) -> io::Result<()>;
}

/// Probe backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDisk;

impl DiskProbe for LocalDisk {
    // statvfs field widths differ between targets.
    #[allow(clippy::unnecessary_cast)]
    fn free_kb(&self, dir: &Path) -> io::Result<u64> {
        let st = statvfs(dir).map_err(io::Error::from)?;
        Ok((st.blocks_available() as u64).saturating_mul(st.fragment_size() as u64) / 1024)
    }

    fn file_kb(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len().div_ceil(1024))
    }

    fn header_kb(&self, _image: &Path) -> io::Result<u64> {
        Ok(HEADER_KB)
    }

    // The text is not split out of the image; its full size bounds it.
    fn text_kb(&self, image: &Path) -> io::Result<u64> {
        self.file_kb(image)
    }
}

/// Writes the current image followed by the core. The result is a
/// self-contained file the checkpoint runtime restores from.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppendCore;

impl ImageUpdater for AppendCore {
    fn update(&self, image: &Path, core: &Path, new_image: &Path) -> io::Result<()> {
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o755)
            .open(new_image)?;
        io::copy(&mut File::open(image)?, &mut out)?;
        io::copy(&mut File::open(core)?, &mut out)?;
        out.sync_all()
    }
}

/// Space a new image is expected to take, in KB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CkptEstimate {
    pub header_kb: u64,
    pub text_kb: u64,
    pub core_kb: u64,
    pub slop_kb: u64,
}

impl CkptEstimate {
    pub fn total_kb(&self) -> u64 {
        self.header_kb
            .saturating_add(self.text_kb)
            .saturating_add(self.core_kb)
            .saturating_add(self.slop_kb)
    }

    /// An update only goes ahead with strictly more room than estimated.
    pub fn fits(&self, free_kb: u64) -> bool {
        free_kb > self.total_kb()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_adds_parts() {
        let e = CkptEstimate {
            header_kb: 4096,
            text_kb: 1200,
            core_kb: 2,
            slop_kb: 50,
        };
        assert_eq!(e.total_kb(), 5348);
        assert!(!e.fits(5000));
        assert!(!e.fits(5348));
        assert!(e.fits(5349));
    }

    #[test]
    fn append_core_concatenates() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image");
        let core = dir.path().join("core");
        let new_image = dir.path().join("image.tmp");
        fs::write(&image, b"text").unwrap();
        fs::write(&core, b"+core").unwrap();
        AppendCore.update(&image, &core, &new_image).unwrap();
        assert_eq!(fs::read(&new_image).unwrap(), b"text+core");
    }

    #[test]
    fn local_disk_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, vec![0u8; 1025]).unwrap();
        assert_eq!(LocalDisk.file_kb(&f).unwrap(), 2);
        assert_eq!(LocalDisk.text_kb(&f).unwrap(), 2);
        assert_eq!(LocalDisk.header_kb(&f).unwrap(), HEADER_KB);
        assert!(LocalDisk.free_kb(dir.path()).unwrap() > 0);
        assert!(LocalDisk.file_kb(&dir.path().join("missing")).is_err());
    }
}
