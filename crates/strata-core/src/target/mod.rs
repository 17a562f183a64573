//! # Target Acquisition
//!
//! Turns a target (core file, kdump vmcore, live process or running kernel) into
//! an address space plus metadata.
//!
//! ## Backends
//!
//! | Source | Backend | Flags |
//! |--------|---------|-------|
//! | ELF core | [`elfcore`] | none |
//! | ELF core with `VMCOREINFO` | [`elfcore`] or [`kdump`] | kernel |
//! | kdump vmcore | [`kdump`] | kernel |
//! | `/proc/kcore` | [`elfcore`] + [`kcore`] probe | kernel, live |
//! | `/proc/<pid>/mem` | [`process`] | live |
//!
//! Every backend builds an [`Acquired`] without touching the program. The
//! program installs it in one step, so a failed acquisition drops whatever was
//! opened along the way and leaves the program as it was.

pub mod elfcore;
pub mod kcore;
pub mod kdump;
pub(crate) mod process;

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use self::elfcore::{NT_FILE, NT_TASKSTRUCT};
pub use self::kcore::{is_procfs, SnapshotProbe, PROC_SUPER_MAGIC};
pub use self::kdump::{has_kdump_signature, KdumpContext, KdumpDecoder, KDUMP_SIGNATURE};
use crate::config::ProgramConfig;
use crate::error::Result;
use crate::memory::MemoryReader;
use crate::platform::Platform;
use crate::program::ProgramFlags;
use crate::vmcoreinfo::VmcoreInfo;

/// Where a program's memory comes from
#[derive(Clone)]
pub enum TargetSource
{
    /// ELF core dump read natively
    CoreDump
    {
        /// Path the core was opened from
        path: PathBuf,
        /// Open core file
        file: Arc<File>,
    },
    /// vmcore read through a kdump decoder
    Kdump
    {
        /// Path the vmcore was opened from
        path: PathBuf,
        /// Decoder context owning the file
        context: Arc<dyn KdumpContext>,
    },
    /// Running process
    Process
    {
        /// Process id
        pid: u32,
        /// Open `/proc/<pid>/mem`
        file: Arc<File>,
    },
    /// Running kernel through `/proc/kcore`
    KernelSnapshot
    {
        /// Path of the snapshot file
        path: PathBuf,
        /// Open snapshot file
        file: Arc<File>,
    },
}

impl TargetSource
{
    /// Path of a file-backed source.
    pub fn path(&self) -> Option<&Path>
    {
        match self {
            TargetSource::CoreDump { path, .. }
            | TargetSource::Kdump { path, .. }
            | TargetSource::KernelSnapshot { path, .. } => Some(path),
            TargetSource::Process { .. } => None,
        }
    }
}

impl fmt::Debug for TargetSource
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            TargetSource::CoreDump { path, .. } => f.debug_struct("CoreDump").field("path", path).finish(),
            TargetSource::Kdump { path, .. } => f.debug_struct("Kdump").field("path", path).finish(),
            TargetSource::Process { pid, .. } => f.debug_struct("Process").field("pid", pid).finish(),
            TargetSource::KernelSnapshot { path, .. } => f.debug_struct("KernelSnapshot").field("path", path).finish(),
        }
    }
}

/// Raw `NT_FILE` note of a userspace core, kept for module discovery
#[derive(Debug, Clone)]
pub struct FileNote
{
    /// Note descriptor
    pub desc: Vec<u8>,
    /// Words are 8 bytes rather than 4
    pub is_64_bit: bool,
    /// Words are little-endian
    pub little_endian: bool,
}

/// Everything an acquisition produced, not yet installed in a program
#[derive(Debug)]
pub(crate) struct Acquired
{
    pub source: TargetSource,
    pub memory: MemoryReader,
    pub flags: ProgramFlags,
    pub vmcoreinfo: Option<VmcoreInfo>,
    /// Installed only if the program has no platform yet.
    pub platform: Option<Platform>,
    pub file_note: Option<FileNote>,
    pub pid: Option<u32>,
}

/// Acquire a core file, kdump vmcore or kernel snapshot.
pub(crate) fn acquire_core_dump(path: &Path, config: &ProgramConfig) -> Result<Acquired>
{
    self::elfcore::acquire(path, config)
}

/// Acquire the running kernel.
pub(crate) fn acquire_kernel(config: &ProgramConfig) -> Result<Acquired>
{
    self::elfcore::acquire(&config.proc_root.join("kcore"), config)
}

/// Acquire a running process.
pub(crate) fn acquire_process(pid: u32, config: &ProgramConfig) -> Result<Acquired>
{
    process::acquire(pid, config)
}
