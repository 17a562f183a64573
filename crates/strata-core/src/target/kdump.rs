//! # Kdump Backend
//!
//! Compressed kdump vmcores (makedumpfile's format, and ELF vmcores when the
//! decoder is preferred over native parsing) are read through an external
//! decoder. The decoder is a capability supplied through
//! [`ProgramConfig::kdump`](crate::config::ProgramConfig::kdump); this module
//! only detects the format and wires a decoder context into the address space.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use super::{Acquired, TargetSource};
use crate::config::ProgramConfig;
use crate::error::{Result, StrataError};
use crate::memory::{AddressSpace, Backing, MemoryRead, MemoryReader};
use crate::platform::Platform;
use crate::program::ProgramFlags;
use crate::vmcoreinfo::VmcoreInfo;

/// Leading bytes of a kdump-compressed vmcore.
pub const KDUMP_SIGNATURE: &[u8; 8] = b"KDUMP   ";

/// Whether `file` starts with [`KDUMP_SIGNATURE`].
///
/// A file shorter than the signature is not kdump.
///
/// ## Errors
///
/// Any read error other than hitting end of file.
pub fn has_kdump_signature(file: &File) -> io::Result<bool>
{
    let mut signature = [0u8; KDUMP_SIGNATURE.len()];
    match file.read_exact_at(&mut signature, 0) {
        Ok(()) => Ok(&signature == KDUMP_SIGNATURE),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}

/// Opens kdump contexts
pub trait KdumpDecoder: Send + Sync
{
    /// Take ownership of `file` and open a decoding context on it.
    fn open(&self, file: File, path: &Path) -> Result<Box<dyn KdumpContext>>;
}

/// An opened kdump vmcore
pub trait KdumpContext: Send + Sync
{
    /// Fill `buf` from virtual or physical memory at `address`.
    fn read(&self, buf: &mut [u8], address: u64, physical: bool) -> Result<()>;

    /// Raw descriptor of the dump's `VMCOREINFO` note.
    fn vmcoreinfo(&self) -> &[u8];

    /// Platform of the dumped machine, if the decoder knows it.
    fn platform(&self) -> Option<Platform>
    {
        None
    }
}

struct KdumpMemory(Arc<dyn KdumpContext>);

impl MemoryRead for KdumpMemory
{
    fn read(&self, buf: &mut [u8], address: u64, _offset: u64, physical: bool) -> Result<()>
    {
        self.0.read(buf, address, physical)
    }
}

/// Hand `file` to the configured decoder and map its whole address space.
pub(crate) fn acquire(file: File, path: &Path, config: &ProgramConfig) -> Result<Acquired>
{
    let decoder = config
        .kdump
        .as_ref()
        .ok_or_else(|| StrataError::InvalidArgument("kdump support is not available".into()))?;
    debug!(path = %path.display(), "opening vmcore with kdump decoder");
    let context: Arc<dyn KdumpContext> = Arc::from(decoder.open(file, path)?);

    let mut memory = MemoryReader::new();
    let reader: Arc<dyn MemoryRead> = Arc::new(KdumpMemory(Arc::clone(&context)));
    memory.add_segment(AddressSpace::Virtual, 0, u64::MAX, Backing::Callback(Arc::clone(&reader)));
    memory.add_segment(AddressSpace::Physical, 0, u64::MAX, Backing::Callback(reader));

    let vmcoreinfo = VmcoreInfo::parse(context.vmcoreinfo())?;
    info!(release = %vmcoreinfo.osrelease, "acquired kdump vmcore");

    Ok(Acquired {
        platform: context.platform(),
        source: TargetSource::Kdump {
            path: path.to_path_buf(),
            context,
        },
        memory,
        flags: ProgramFlags::IS_LINUX_KERNEL,
        vmcoreinfo: Some(vmcoreinfo),
        file_note: None,
        pid: None,
    })
}
