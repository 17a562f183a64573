//! # ELF Core Backend
//!
//! Classifies an ELF core file and maps its `PT_LOAD` segments.
//!
//! One pass over the program headers collects everything needed: the loadable
//! segments, whether any of them has a physical address, and the notes that
//! change how the file is treated:
//!
//! | Note | Owner | Effect |
//! |------|-------|--------|
//! | `NT_TASKSTRUCT` | `CORE` | may be a live kernel snapshot (`/proc/kcore`) |
//! | (any) | `VMCOREINFO` | kernel core; may be redirected to the kdump decoder |
//! | `NT_FILE` | `CORE` | kept for module discovery |
//!
//! Nothing is committed to the program here. The result is returned as an
//! [`Acquired`] and the caller installs it in one step.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use object::elf::{self, FileHeader32, FileHeader64};
use object::read::elf::{FileHeader, NoteIterator, ProgramHeader};
use object::read::{ReadCache, ReadRef};
use object::{Endian, Endianness, FileKind};
use tracing::{debug, info};

use super::{kdump, Acquired, FileNote, TargetSource};
use crate::config::ProgramConfig;
use crate::error::{Result, StrataError};
use crate::memory::{AddressSpace, Backing, MemoryReader};
use crate::platform::{ElfHeaderInfo, Platform};
use crate::program::ProgramFlags;
use crate::vmcoreinfo::{VmcoreInfo, VMCOREINFO_NOTE_NAME};

/// Kernel task structure note written by the kernel into `/proc/kcore`.
pub const NT_TASKSTRUCT: u32 = 4;

/// Mapped files note (`"FILE"`) written into userspace core dumps.
pub const NT_FILE: u32 = 0x4649_4c45;

const CORE_NOTE_NAME: &[u8] = b"CORE";

#[derive(Debug, Clone, Copy)]
struct LoadSegment
{
    vaddr: u64,
    paddr: u64,
    offset: u64,
    filesz: u64,
    memsz: u64,
}

#[derive(Debug)]
struct CoreScan
{
    header: ElfHeaderInfo,
    loads: Vec<LoadSegment>,
    has_physical: bool,
    has_task_struct: bool,
    vmcoreinfo: Option<Vec<u8>>,
    file_note: Option<FileNote>,
}

fn scan_core<'data, Elf, R>(data: R) -> Result<CoreScan>
where
    Elf: FileHeader<Endian = Endianness>,
    R: ReadRef<'data>,
{
    let header = Elf::parse(data)?;
    let endian = header.endian()?;
    let info = ElfHeaderInfo {
        machine: header.e_machine(endian),
        class: header.e_ident().class,
        data: header.e_ident().data,
        e_type: header.e_type(endian),
    };
    if info.e_type != elf::ET_CORE {
        return Err(StrataError::Format("not an ELF core file".into()));
    }

    let mut scan = CoreScan {
        header: info,
        loads: Vec::new(),
        has_physical: false,
        has_task_struct: false,
        vmcoreinfo: None,
        file_note: None,
    };

    for phdr in header.program_headers(endian, data)? {
        match phdr.p_type(endian) {
            elf::PT_LOAD => {
                let segment = LoadSegment {
                    vaddr: phdr.p_vaddr(endian).into(),
                    paddr: phdr.p_paddr(endian).into(),
                    offset: phdr.p_offset(endian).into(),
                    filesz: phdr.p_filesz(endian).into(),
                    memsz: phdr.p_memsz(endian).into(),
                };
                scan.has_physical |= segment.paddr != 0;
                scan.loads.push(segment);
            }
            elf::PT_NOTE => {
                // Records are 8-byte aligned only when p_align is exactly 8.
                let p_align = phdr.p_align(endian);
                let align = if Into::<u64>::into(p_align) == 8 { p_align } else { Default::default() };
                let bytes = phdr
                    .data(endian, data)
                    .map_err(|()| StrataError::Format("invalid ELF note segment offset or size".into()))?;
                let mut notes = NoteIterator::<Elf>::new(endian, align, bytes)?;
                while let Some(note) = notes.next()? {
                    let name = note.name();
                    if name == CORE_NOTE_NAME {
                        match note.n_type(endian) {
                            NT_TASKSTRUCT => scan.has_task_struct = true,
                            NT_FILE => {
                                scan.file_note = Some(FileNote {
                                    desc: note.desc().to_vec(),
                                    is_64_bit: info.class == elf::ELFCLASS64,
                                    little_endian: endian.is_little_endian(),
                                });
                            }
                            _ => {}
                        }
                    } else if name == VMCOREINFO_NOTE_NAME {
                        scan.vmcoreinfo = Some(note.desc().to_vec());
                    }
                }
            }
            _ => {}
        }
    }
    Ok(scan)
}

/// Classify and map the core file at `path`.
///
/// Dispatches to the kdump backend when the file carries the kdump signature,
/// or when it is a kernel vmcore and the kdump decoder is preferred.
pub(crate) fn acquire(path: &Path, config: &ProgramConfig) -> Result<Acquired>
{
    let file = File::open(path).map_err(|err| StrataError::os("open", path, err))?;

    if kdump::has_kdump_signature(&file).map_err(|err| StrataError::os("read", path, err))? {
        debug!(path = %path.display(), "kdump signature found");
        return kdump::acquire(file, path, config);
    }

    let scan = {
        let cache = ReadCache::new(&file);
        match FileKind::parse(&cache)? {
            FileKind::Elf32 => scan_core::<FileHeader32<Endianness>, _>(&cache)?,
            FileKind::Elf64 => scan_core::<FileHeader64<Endianness>, _>(&cache)?,
            _ => return Err(StrataError::Format("not an ELF core file".into())),
        }
    };
    let platform = Platform::from_elf_header(&scan.header);

    let is_snapshot = if scan.has_task_struct {
        (config.snapshot_probe)(&file).map_err(|err| StrataError::os("fstatfs", path, err))?
    } else {
        false
    };

    if scan.vmcoreinfo.is_some() && !is_snapshot && config.use_kdump_for_elf() {
        debug!(path = %path.display(), "using kdump decoder for ELF vmcore");
        return kdump::acquire(file, path, config);
    }

    let file = Arc::new(file);
    let mut memory = MemoryReader::new();
    let no_physical = platform.word_max();
    for load in &scan.loads {
        let backing = Backing::File {
            file: Arc::clone(&file),
            offset: load.offset,
            size: load.filesz,
        };
        memory.add_segment(AddressSpace::Virtual, load.vaddr, load.memsz, backing.clone());
        if scan.has_physical && load.paddr != no_physical {
            memory.add_segment(AddressSpace::Physical, load.paddr, load.memsz, backing);
        }
    }

    let mut vmcoreinfo = scan.vmcoreinfo.as_deref().map(VmcoreInfo::parse).transpose()?;
    if is_snapshot && vmcoreinfo.is_none() {
        debug!("no VMCOREINFO note in kernel snapshot, falling back to a live read");
        vmcoreinfo = Some(config.vmcoreinfo_fallback.read_vmcoreinfo(&memory)?);
    }

    let flags = if is_snapshot {
        ProgramFlags::IS_LINUX_KERNEL | ProgramFlags::IS_LIVE
    } else if vmcoreinfo.is_some() {
        ProgramFlags::IS_LINUX_KERNEL
    } else {
        ProgramFlags::empty()
    };
    info!(
        path = %path.display(),
        virtual_segments = memory.segments_in(AddressSpace::Virtual).count(),
        physical_segments = memory.segments_in(AddressSpace::Physical).count(),
        ?flags,
        "acquired core file"
    );

    let source = if is_snapshot {
        TargetSource::KernelSnapshot {
            path: path.to_path_buf(),
            file,
        }
    } else {
        TargetSource::CoreDump {
            path: path.to_path_buf(),
            file,
        }
    };
    Ok(Acquired {
        source,
        memory,
        flags,
        vmcoreinfo,
        platform: Some(platform),
        file_note: scan.file_note,
        pid: None,
    })
}
