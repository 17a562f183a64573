//! Live process backend.
//!
//! Memory of a running process is read through `/proc/<pid>/mem`, which accepts
//! positional reads at virtual addresses. Unmapped addresses fail with `EIO`,
//! which surfaces as a fault.

use std::fs::File;
use std::sync::Arc;

use tracing::info;

use super::{Acquired, TargetSource};
use crate::config::ProgramConfig;
use crate::error::{Result, StrataError};
use crate::memory::{AddressSpace, Backing, MemoryReader};
use crate::platform::Platform;
use crate::program::ProgramFlags;

/// Open the memory of process `pid`.
pub(crate) fn acquire(pid: u32, config: &ProgramConfig) -> Result<Acquired>
{
    let path = config.proc_root.join(pid.to_string()).join("mem");
    let file = File::open(&path).map_err(|err| StrataError::os("open", &path, err))?;
    let file = Arc::new(file);

    let mut memory = MemoryReader::new();
    memory.add_segment(
        AddressSpace::Virtual,
        0,
        u64::MAX,
        Backing::File {
            file: Arc::clone(&file),
            offset: 0,
            size: u64::MAX,
        },
    );
    info!(pid, "attached to process memory");

    Ok(Acquired {
        source: TargetSource::Process { pid, file },
        memory,
        flags: ProgramFlags::IS_LIVE,
        vmcoreinfo: None,
        platform: Some(Platform::host()),
        file_note: None,
        pid: Some(pid),
    })
}
