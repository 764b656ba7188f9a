//! Operating system capabilities consumed by the erase pipeline.
//!
//! Everything platform-conditional lives behind the [`Platform`] trait so the
//! rest of the crate never branches on the target OS. [`NativePlatform`] is
//! the implementation used by the binary.

use crate::error::{EtdkError, Result};
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

/// Shape of an erase target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    File,
    BlockDevice,
}

impl TargetKind {
    pub fn label(&self) -> &'static str {
        match self {
            TargetKind::File => "Regular File",
            TargetKind::BlockDevice => "Block Device",
        }
    }
}

pub trait Platform {
    /// Size of the target in bytes.
    fn query_target_size(&self, path: &Path) -> Result<u64>;

    /// Decide whether `path` is a regular file or a raw block device.
    fn classify_target(&self, path: &Path) -> Result<TargetKind>;

    /// Ask the OS to keep `region` out of swap. Best effort.
    fn lock_memory(&self, region: &[u8]) -> Result<()>;

    fn unlock_memory(&self, region: &[u8]) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NativePlatform;

impl Platform for NativePlatform {
    fn query_target_size(&self, path: &Path) -> Result<u64> {
        // Raw Windows disks report their length only through
        // IOCTL_DISK_GET_LENGTH_INFO, which this build does not issue.
        if is_physical_drive_path(path) {
            return Err(EtdkError::platform(format!(
                "sizing raw disk {} is not supported on this platform",
                path.display()
            )));
        }

        let meta = fs::metadata(path)
            .map_err(|e| EtdkError::platform(format!("stat {}: {}", path.display(), e)))?;
        if meta.is_file() {
            return Ok(meta.len());
        }

        // Block devices report a zero length through stat; the end offset is
        // the device extent.
        let mut device = File::open(path)
            .map_err(|e| EtdkError::platform(format!("opening {}: {}", path.display(), e)))?;
        let size = device
            .seek(SeekFrom::End(0))
            .map_err(|e| EtdkError::platform(format!("sizing {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), size, "queried device size");
        Ok(size)
    }

    fn classify_target(&self, path: &Path) -> Result<TargetKind> {
        if path.as_os_str().is_empty() {
            return Err(EtdkError::invalid_input("target path is empty"));
        }

        if is_windows_physical_drive(path) {
            return Ok(TargetKind::BlockDevice);
        }

        let meta = fs::metadata(path)
            .map_err(|e| EtdkError::platform(format!("cannot access {}: {}", path.display(), e)))?;

        if meta.is_file() {
            reject_extra_hard_links(path, &meta)?;
            return Ok(TargetKind::File);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if meta.file_type().is_block_device() {
                return Ok(TargetKind::BlockDevice);
            }
        }

        Err(EtdkError::invalid_input(format!(
            "{} is neither a regular file nor a block device",
            path.display()
        )))
    }

    fn lock_memory(&self, region: &[u8]) -> Result<()> {
        mlock(region)
    }

    fn unlock_memory(&self, region: &[u8]) -> Result<()> {
        munlock(region)
    }
}

fn is_windows_physical_drive(path: &Path) -> bool {
    cfg!(windows) && is_physical_drive_path(path)
}

fn is_physical_drive_path(path: &Path) -> bool {
    path.to_string_lossy().starts_with(r"\\.\PhysicalDrive")
}

/// Replacing one name of a multiply linked file leaves the plaintext
/// reachable through the others.
#[cfg(unix)]
fn reject_extra_hard_links(path: &Path, meta: &fs::Metadata) -> Result<()> {
    use std::os::unix::fs::MetadataExt;
    let links = meta.nlink();
    if links > 1 {
        return Err(EtdkError::invalid_input(format!(
            "{} has {} hard links; remove the other links first",
            path.display(),
            links
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn reject_extra_hard_links(_path: &Path, _meta: &fs::Metadata) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn mlock(region: &[u8]) -> Result<()> {
    // SAFETY: the pointer and length describe a live borrowed allocation.
    let rc = unsafe { libc::mlock(region.as_ptr() as *const libc::c_void, region.len()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(EtdkError::platform(format!("mlock failed: {}", io::Error::last_os_error())))
    }
}

#[cfg(unix)]
fn munlock(region: &[u8]) -> Result<()> {
    // SAFETY: the pointer and length describe a live borrowed allocation.
    let rc = unsafe { libc::munlock(region.as_ptr() as *const libc::c_void, region.len()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(EtdkError::platform(format!("munlock failed: {}", io::Error::last_os_error())))
    }
}

#[cfg(not(unix))]
fn mlock(_region: &[u8]) -> Result<()> {
    Err(EtdkError::platform(format!(
        "memory locking is not supported on this platform ({})",
        io::ErrorKind::Unsupported
    )))
}

#[cfg(not(unix))]
fn munlock(_region: &[u8]) -> Result<()> {
    Err(EtdkError::platform(format!(
        "memory unlocking is not supported on this platform ({})",
        io::ErrorKind::Unsupported
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_classify_regular_file() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("plain.txt");
        fs::write(&path, b"data").expect("write");

        let kind = NativePlatform.classify_target(&path).expect("classify");
        assert_eq!(kind, TargetKind::File);
        assert_eq!(NativePlatform.query_target_size(&path).expect("size"), 4);
    }

    #[test]
    fn test_classify_directory_is_invalid() {
        let tmp = TempDir::new().expect("tempdir");
        let err = NativePlatform.classify_target(tmp.path()).unwrap_err();
        assert!(matches!(err, EtdkError::InvalidInput(_)));
    }

    #[test]
    fn test_classify_missing_path() {
        let tmp = TempDir::new().expect("tempdir");
        let err = NativePlatform
            .classify_target(&tmp.path().join("absent"))
            .unwrap_err();
        assert!(matches!(err, EtdkError::Platform(_)));
    }

    #[test]
    fn test_classify_empty_path() {
        let err = NativePlatform.classify_target(Path::new("")).unwrap_err();
        assert!(matches!(err, EtdkError::InvalidInput(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_rejects_hard_linked_file() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("a.txt");
        fs::write(&path, b"data").expect("write");
        fs::hard_link(&path, tmp.path().join("b.txt")).expect("hard link");

        let err = NativePlatform.classify_target(&path).unwrap_err();
        assert!(matches!(err, EtdkError::InvalidInput(_)));
    }

    #[test]
    fn test_physical_drive_size_is_unsupported() {
        let drive = Path::new(r"\\.\PhysicalDrive0");
        assert!(is_physical_drive_path(drive));
        assert!(!is_physical_drive_path(Path::new("/dev/sdb")));

        let err = NativePlatform.query_target_size(drive).unwrap_err();
        assert!(matches!(err, EtdkError::Platform(_)));
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_lock_and_unlock_are_paired() {
        let region = Box::new([7u8; 48]);
        // Locking may be refused under a tight RLIMIT_MEMLOCK; unlocking a
        // region that was locked must succeed.
        if NativePlatform.lock_memory(&region[..]).is_ok() {
            NativePlatform.unlock_memory(&region[..]).expect("munlock");
        }
    }
}
