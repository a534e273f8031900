//! Whole-file POSIX locking of the UIDVALIDITY/UID-map sidecar (spec
//! §4.4.2): `fcntl(F_SETLKW)` everywhere, plus an advisory Linux `flock`
//! for compatibility with legacy tools that only honor that API.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use crate::error::{Result, SyncError};

/// Holds the open, locked sidecar file. Both locks are released when
/// this (and the underlying fd) is dropped.
pub struct MailboxLock {
    file: File,
}

impl MailboxLock {
    /// Open `path` for read/write (creating it if absent) and block
    /// until an exclusive whole-file lock is acquired.
    pub fn acquire(path: &std::path::Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| SyncError::box_bad(format!("opening {}: {}", path.display(), e)))?;

        lock_fcntl(&file).map_err(|e| SyncError::box_bad(format!("locking {}: {}", path.display(), e)))?;
        #[cfg(target_os = "linux")]
        lock_flock(&file).map_err(|e| SyncError::box_bad(format!("flock {}: {}", path.display(), e)))?;

        Ok(MailboxLock { file })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

fn lock_fcntl(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_WRLCK as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0; // whole file
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLKW, &mut fl as *mut libc::flock) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn lock_flock(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
