//! Live kernel snapshot detection.
//!
//! `/proc/kcore` looks like an ordinary ELF core with an `NT_TASKSTRUCT` note.
//! What sets it apart is the filesystem it lives on.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

/// `f_type` reported by `fstatfs` for procfs.
pub const PROC_SUPER_MAGIC: i64 = 0x9fa0;

/// Decides whether an opened core file is a live view of kernel memory.
pub type SnapshotProbe = fn(&File) -> io::Result<bool>;

/// Whether `file` resides on procfs.
///
/// ## Errors
///
/// The `fstatfs` failure, if any.
pub fn is_procfs(file: &File) -> io::Result<bool>
{
    let mut stat = std::mem::MaybeUninit::<libc::statfs>::uninit();
    // SAFETY: the descriptor is owned by `file` and `stat` is a valid out pointer.
    let ret = unsafe { libc::fstatfs(file.as_raw_fd(), stat.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fstatfs succeeded and filled the struct.
    let stat = unsafe { stat.assume_init() };
    #[allow(clippy::unnecessary_cast, clippy::cast_lossless)]
    let f_type = stat.f_type as i64;
    Ok(f_type == PROC_SUPER_MAGIC)
}
