//! Host filesystem primitives the protocol engine consumes.
//!
//! Two operations need platform support beyond std: querying filesystem
//! capacity and rewriting a file's modification time. Both return plain
//! `io::Error`s so errno details stay on this side of the boundary.

use std::io;
use std::path::Path;

/// Capacity figures for the filesystem holding a path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsInfo {
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub block_size: u32,
}

#[cfg(unix)]
pub fn fsinfo(path: &Path) -> io::Result<FsInfo> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    // Safety: c_path is NUL-terminated and stats is a zeroed out-param.
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(FsInfo {
        free_bytes: stats.f_bfree as u64 * stats.f_bsize as u64,
        total_bytes: stats.f_blocks as u64 * stats.f_bsize as u64,
        block_size: stats.f_bsize as u32,
    })
}

#[cfg(not(unix))]
pub fn fsinfo(_path: &Path) -> io::Result<FsInfo> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "filesystem info not available on this platform",
    ))
}

#[cfg(unix)]
pub fn set_mtime(path: &Path, unix_secs: u64) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let times = libc::utimbuf {
        actime: unix_secs as libc::time_t,
        modtime: unix_secs as libc::time_t,
    };
    // Safety: both arguments are valid for the duration of the call.
    if unsafe { libc::utime(c_path.as_ptr(), &times) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn set_mtime(path: &Path, unix_secs: u64) -> io::Result<()> {
    use std::time::{Duration, SystemTime};
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(unix_secs))
}
