//! Present fences and their signal times, read through the sync_file ioctl.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

use anyhow::Context;

/// `_IOWR('>', 4, struct sync_file_info)`.
const SYNC_IOC_FILE_INFO: u32 = 0xC038_3E04;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SyncFileInfo {
    name: [u8; 32],
    status: i32,
    flags: u32,
    num_fences: u32,
    pad: u32,
    sync_fence_info: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SyncFenceInfo {
    obj_name: [u8; 32],
    driver_name: [u8; 32],
    status: i32,
    flags: u32,
    timestamp_ns: u64,
}

impl Default for SyncFileInfo {
    fn default() -> Self {
        Self {
            name: [0; 32],
            status: 0,
            flags: 0,
            num_fences: 0,
            pad: 0,
            sync_fence_info: 0,
        }
    }
}

impl Default for SyncFenceInfo {
    fn default() -> Self {
        Self {
            obj_name: [0; 32],
            driver_name: [0; 32],
            status: 0,
            flags: 0,
            timestamp_ns: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTime {
    Signaled(i64),
    Pending,
    /// Not a sync file, or the fence completed with an error.
    Invalid,
}

/// A present fence duplicated from the caller's descriptor.
#[derive(Debug)]
pub struct PresentFence {
    fd: OwnedFd,
}

impl PresentFence {
    /// Duplicates `fd`; the caller keeps ownership of the original.
    pub fn dup(fd: BorrowedFd<'_>) -> anyhow::Result<Self> {
        let fd = fd
            .try_clone_to_owned()
            .context("error duplicating present fence")?;
        Ok(Self { fd })
    }

    fn file_info(&self, info: &mut SyncFileInfo) -> io::Result<()> {
        // SAFETY: fd is open and info is a valid sync_file_info whose fence array pointer, if
        // set, covers num_fences entries.
        let rv = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                SYNC_IOC_FILE_INFO as _,
                info as *mut SyncFileInfo,
            )
        };
        if rv < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Time the last fence in the sync file signaled.
    pub fn signal_time(&self) -> SignalTime {
        let mut info = SyncFileInfo::default();
        if let Err(err) = self.file_info(&mut info) {
            trace!("error querying fence: {err}");
            return SignalTime::Invalid;
        }
        match info.status {
            1 => (),
            0 => return SignalTime::Pending,
            _ => return SignalTime::Invalid,
        }
        if info.num_fences == 0 {
            return SignalTime::Invalid;
        }

        let mut fences = vec![SyncFenceInfo::default(); info.num_fences as usize];
        let mut info = SyncFileInfo {
            num_fences: info.num_fences,
            sync_fence_info: fences.as_mut_ptr() as u64,
            ..SyncFileInfo::default()
        };
        if let Err(err) = self.file_info(&mut info) {
            trace!("error querying fence details: {err}");
            return SignalTime::Invalid;
        }

        let count = (info.num_fences as usize).min(fences.len());
        fences[..count]
            .iter()
            .map(|fence| i64::try_from(fence.timestamp_ns).unwrap_or(i64::MAX))
            .max()
            .map_or(SignalTime::Invalid, SignalTime::Signaled)
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn ioctl_layout() {
        assert_eq!(std::mem::size_of::<SyncFileInfo>(), 56);
        assert_eq!(std::mem::size_of::<SyncFenceInfo>(), 80);
    }

    #[test]
    fn dup_leaves_original_open() {
        let mut file = File::options().write(true).open("/dev/null").unwrap();
        let fence = PresentFence::dup(file.as_fd()).unwrap();
        assert_ne!(fence.fd.as_raw_fd(), file.as_raw_fd());

        drop(fence);
        file.write_all(b"still open").unwrap();
    }

    #[test]
    fn non_sync_file_is_invalid() {
        let file = File::open("/dev/null").unwrap();
        let fence = PresentFence::dup(file.as_fd()).unwrap();
        assert_eq!(fence.signal_time(), SignalTime::Invalid);
    }
}
