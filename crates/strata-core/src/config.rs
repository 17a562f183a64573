//! # Program Configuration
//!
//! Everything a [`Program`](crate::Program) consults while acquiring a target
//! and bootstrapping debug info.
//!
//! Most fields exist so that the pieces living outside this crate (a kdump
//! decoder, the live kernel's sysfs, `/proc`) can be swapped for something
//! else. The defaults read the real system.
//!
//! ## Environment
//!
//! - `STRATA_USE_KDUMP_FOR_ELF`: when set, a nonzero integer makes ELF vmcores
//!   go through the kdump decoder and zero (or anything non-numeric) makes them
//!   parse natively. When unset, the `kdump` Cargo feature decides. The
//!   variable is read each time a core file is classified, and an explicit
//!   [`ProgramConfig::kdump_for_elf`] takes precedence over it.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::debuginfo::discovery::{KernelDebugInfo, VmlinuxSearch};
use crate::target::kcore::{is_procfs, SnapshotProbe};
use crate::target::kdump::KdumpDecoder;
use crate::vmcoreinfo::{SysfsVmcoreInfo, VmcoreInfoFallback};

/// Environment variable overriding how ELF vmcores are read.
pub const USE_KDUMP_FOR_ELF_ENV: &str = "STRATA_USE_KDUMP_FOR_ELF";

/// Acquisition and bootstrap settings
#[derive(Clone)]
pub struct ProgramConfig
{
    /// Read ELF vmcores with the kdump decoder (`Some(true)`) or natively
    /// (`Some(false)`); `None` defers to `STRATA_USE_KDUMP_FOR_ELF`, then to
    /// the `kdump` Cargo feature.
    pub kdump_for_elf: Option<bool>,
    /// kdump decoder; without one kdump vmcores cannot be opened
    pub kdump: Option<Arc<dyn KdumpDecoder>>,
    /// Mount point of procfs
    pub proc_root: PathBuf,
    /// Decides whether a core with a task struct note is a live snapshot
    pub snapshot_probe: SnapshotProbe,
    /// Recovers `VMCOREINFO` from a snapshot that lacks the note
    pub vmcoreinfo_fallback: Arc<dyn VmcoreInfoFallback>,
    /// Finds and reports kernel debug info
    pub kernel_debug_info: Arc<dyn KernelDebugInfo>,
}

impl Default for ProgramConfig
{
    fn default() -> Self
    {
        ProgramConfig {
            kdump_for_elf: None,
            kdump: None,
            proc_root: PathBuf::from("/proc"),
            snapshot_probe: is_procfs,
            vmcoreinfo_fallback: Arc::new(SysfsVmcoreInfo::default()),
            kernel_debug_info: Arc::new(VmlinuxSearch::default()),
        }
    }
}

impl ProgramConfig
{
    /// Whether ELF vmcores carrying `VMCOREINFO` go to the kdump decoder.
    ///
    /// Checked in order: [`kdump_for_elf`](Self::kdump_for_elf),
    /// `STRATA_USE_KDUMP_FOR_ELF` as it is set right now, the `kdump` feature.
    pub fn use_kdump_for_elf(&self) -> bool
    {
        self.kdump_for_elf
            .or_else(|| env::var(USE_KDUMP_FOR_ELF_ENV).ok().map(|value| atoi(&value) != 0))
            .unwrap_or(cfg!(feature = "kdump"))
    }

    /// Set the kdump decoder.
    #[must_use]
    pub fn with_kdump_decoder(mut self, decoder: Option<Arc<dyn KdumpDecoder>>) -> Self
    {
        self.kdump = decoder;
        self
    }

    /// Force or release the ELF vmcore routing decision.
    #[must_use]
    pub fn with_kdump_for_elf(mut self, kdump_for_elf: Option<bool>) -> Self
    {
        self.kdump_for_elf = kdump_for_elf;
        self
    }

    /// Use a different procfs mount point.
    #[must_use]
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self
    {
        self.proc_root = proc_root.into();
        self
    }

    /// Replace the live snapshot probe.
    #[must_use]
    pub fn with_snapshot_probe(mut self, probe: SnapshotProbe) -> Self
    {
        self.snapshot_probe = probe;
        self
    }

    /// Replace the `VMCOREINFO` fallback.
    #[must_use]
    pub fn with_vmcoreinfo_fallback(mut self, fallback: Arc<dyn VmcoreInfoFallback>) -> Self
    {
        self.vmcoreinfo_fallback = fallback;
        self
    }

    /// Replace kernel debug info discovery.
    #[must_use]
    pub fn with_kernel_debug_info(mut self, kernel: Arc<dyn KernelDebugInfo>) -> Self
    {
        self.kernel_debug_info = kernel;
        self
    }
}

impl fmt::Debug for ProgramConfig
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ProgramConfig")
            .field("kdump_for_elf", &self.kdump_for_elf)
            .field("kdump", &self.kdump.is_some())
            .field("proc_root", &self.proc_root)
            .finish_non_exhaustive()
    }
}

/// C `atoi`: optional whitespace and sign, then leading digits; zero otherwise.
fn atoi(value: &str) -> i64
{
    let value = value.trim_start();
    let (negative, digits) = match value.as_bytes().first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };
    let magnitude = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, digit| acc.saturating_mul(10).saturating_add(i64::from(digit - b'0')));
    if negative {
        -magnitude
    } else {
        magnitude
    }
}
