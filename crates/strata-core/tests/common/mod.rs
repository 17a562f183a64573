//! Shared fixtures: hand-built ELF cores, ELF modules with symbols and DWARF,
//! and a fake kdump decoder.

#![allow(dead_code)]

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gimli::write::{AttributeValue, DwarfUnit, EndianVec, Sections};
use gimli::{Encoding, Format, LittleEndian};
use object::elf;
use object::write::elf::{FileHeader, ProgramHeader, SectionHeader, Sym, Writer};
use object::Endianness;
use strata_core::target::kdump::{KdumpContext, KdumpDecoder};
use strata_core::{Platform, Result};

pub const VMCOREINFO: &[u8] = b"OSRELEASE=6.8.0-strata\nPAGESIZE=4096\nKERNELOFFSET=1000000\n";

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

fn align_to(value: usize, align: usize) -> usize
{
    value.div_ceil(align) * align
}

#[derive(Debug, Clone)]
struct Load
{
    vaddr: u64,
    paddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

/// Builds little-endian ELF64 core files
#[derive(Debug, Clone)]
pub struct CoreBuilder
{
    machine: u16,
    e_type: u16,
    note_align: usize,
    note_p_align: Option<u64>,
    notes: Vec<(Vec<u8>, u32, Vec<u8>)>,
    loads: Vec<Load>,
}

impl Default for CoreBuilder
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl CoreBuilder
{
    pub fn new() -> Self
    {
        CoreBuilder {
            machine: elf::EM_X86_64,
            e_type: elf::ET_CORE,
            note_align: 4,
            note_p_align: None,
            notes: Vec::new(),
            loads: Vec::new(),
        }
    }

    pub fn machine(mut self, machine: u16) -> Self
    {
        self.machine = machine;
        self
    }

    pub fn e_type(mut self, e_type: u16) -> Self
    {
        self.e_type = e_type;
        self
    }

    pub fn note_align(mut self, align: usize) -> Self
    {
        self.note_align = align;
        self
    }

    /// Declare `p_align` on the note segment without changing how records are padded.
    pub fn note_segment_align(mut self, p_align: u64) -> Self
    {
        self.note_p_align = Some(p_align);
        self
    }

    pub fn load(self, vaddr: u64, paddr: u64, data: &[u8]) -> Self
    {
        let memsz = data.len() as u64;
        self.load_with_memsz(vaddr, paddr, data, memsz)
    }

    pub fn load_with_memsz(mut self, vaddr: u64, paddr: u64, data: &[u8], memsz: u64) -> Self
    {
        self.loads.push(Load {
            vaddr,
            paddr,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    pub fn note(mut self, name: &[u8], n_type: u32, desc: &[u8]) -> Self
    {
        self.notes.push((name.to_vec(), n_type, desc.to_vec()));
        self
    }

    pub fn task_struct(self) -> Self
    {
        self.note(b"CORE", 4, &[0u8; 16])
    }

    pub fn vmcoreinfo(self, desc: &[u8]) -> Self
    {
        self.note(b"VMCOREINFO", 0, desc)
    }

    /// `NT_FILE` note mapping each path at `[start, end)`.
    pub fn file_note(self, files: &[(&Path, u64, u64)]) -> Self
    {
        let mut desc = Vec::new();
        desc.extend_from_slice(&(files.len() as u64).to_le_bytes());
        desc.extend_from_slice(&4096u64.to_le_bytes());
        for (_, start, end) in files {
            desc.extend_from_slice(&start.to_le_bytes());
            desc.extend_from_slice(&end.to_le_bytes());
            desc.extend_from_slice(&0u64.to_le_bytes());
        }
        for (path, _, _) in files {
            desc.extend_from_slice(path.to_str().unwrap().as_bytes());
            desc.push(0);
        }
        self.note(b"CORE", 0x4649_4c45, &desc)
    }

    fn encode_notes(&self) -> Vec<u8>
    {
        let align = self.note_align;
        let mut out = Vec::new();
        for (name, n_type, desc) in &self.notes {
            let start = out.len();
            out.extend_from_slice(&(name.len() as u32 + 1).to_le_bytes());
            out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
            out.extend_from_slice(&n_type.to_le_bytes());
            out.extend_from_slice(name);
            out.push(0);
            out.resize(start + align_to(out.len() - start, align), 0);
            out.extend_from_slice(desc);
            out.resize(start + align_to(out.len() - start, align), 0);
        }
        out
    }

    pub fn build(&self) -> Vec<u8>
    {
        let notes = self.encode_notes();
        let phnum = self.loads.len() + usize::from(!notes.is_empty());
        let notes_offset = align_to(EHDR_SIZE + phnum * PHDR_SIZE, 8);
        let mut data_offset = align_to(notes_offset + notes.len(), 8);

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', elf::ELFCLASS64, elf::ELFDATA2LSB, elf::EV_CURRENT]);
        out.resize(16, 0);
        out.extend_from_slice(&self.e_type.to_le_bytes());
        out.extend_from_slice(&self.machine.to_le_bytes());
        out.extend_from_slice(&u32::from(elf::EV_CURRENT).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        out.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(phnum as u16).to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

        let phdr = |out: &mut Vec<u8>, p_type: u32, offset: usize, vaddr: u64, paddr: u64, filesz: usize, memsz: u64, align: u64| {
            out.extend_from_slice(&p_type.to_le_bytes());
            out.extend_from_slice(&elf::PF_R.to_le_bytes());
            out.extend_from_slice(&(offset as u64).to_le_bytes());
            out.extend_from_slice(&vaddr.to_le_bytes());
            out.extend_from_slice(&paddr.to_le_bytes());
            out.extend_from_slice(&(filesz as u64).to_le_bytes());
            out.extend_from_slice(&memsz.to_le_bytes());
            out.extend_from_slice(&align.to_le_bytes());
        };
        if !notes.is_empty() {
            phdr(&mut out, elf::PT_NOTE, notes_offset, 0, 0, notes.len(), 0, self.note_p_align.unwrap_or(self.note_align as u64));
        }
        let mut offsets = Vec::new();
        for load in &self.loads {
            phdr(&mut out, elf::PT_LOAD, data_offset, load.vaddr, load.paddr, load.data.len(), load.memsz, 8);
            offsets.push(data_offset);
            data_offset = align_to(data_offset + load.data.len(), 8);
        }

        out.resize(notes_offset, 0);
        out.extend_from_slice(&notes);
        for (load, offset) in self.loads.iter().zip(offsets) {
            out.resize(offset, 0);
            out.extend_from_slice(&load.data);
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> PathBuf
    {
        fs::write(path, self.build()).unwrap();
        path.to_path_buf()
    }
}

/// A symbol in an [`elf_module`]
#[derive(Debug, Clone, Copy)]
pub struct FixtureSymbol
{
    pub name: &'static str,
    pub address: u64,
    pub size: u64,
    pub function: bool,
}

pub const MODULE_SYMBOLS: &[FixtureSymbol] = &[
    FixtureSymbol {
        name: "main",
        address: 0x1000,
        size: 0x40,
        function: true,
    },
    FixtureSymbol {
        name: "helper",
        address: 0x1040,
        size: 0x20,
        function: true,
    },
    FixtureSymbol {
        name: "counter",
        address: 0x2000,
        size: 8,
        function: false,
    },
];

/// Size of the single `PT_LOAD` of an [`elf_module`], starting at 0.
pub const MODULE_SPAN: u64 = 0x3000;

const TEXT_ADDR: u64 = 0x1000;
const TEXT_SIZE: usize = 0x100;
const DATA_ADDR: u64 = 0x2000;
const DATA_SIZE: usize = 0x10;

/// Shared object with `.text`, `.data`, a symbol table and optional DWARF.
pub fn elf_module(symbols: &[FixtureSymbol], dwarf: &[(&'static str, Vec<u8>)]) -> Vec<u8>
{
    let mut out = Vec::new();
    let mut writer = Writer::new(Endianness::Little, true, &mut out);

    writer.reserve_file_header();
    writer.reserve_program_headers(1);
    writer.reserve_null_section_index();
    let text_name = writer.add_section_name(b".text");
    let text_index = writer.reserve_section_index();
    let text_offset = writer.reserve(TEXT_SIZE, 16);
    let data_name = writer.add_section_name(b".data");
    let data_index = writer.reserve_section_index();
    let data_offset = writer.reserve(DATA_SIZE, 8);
    let mut debug_sections = Vec::new();
    for (name, bytes) in dwarf {
        let section_name = writer.add_section_name(name.as_bytes());
        writer.reserve_section_index();
        let offset = writer.reserve(bytes.len(), 1);
        debug_sections.push((section_name, offset, bytes));
    }

    writer.reserve_null_symbol_index();
    let mut symbol_names = Vec::new();
    for symbol in symbols {
        let section = if symbol.function { text_index } else { data_index };
        symbol_names.push(writer.add_string(symbol.name.as_bytes()));
        writer.reserve_symbol_index(Some(section));
    }
    writer.reserve_symtab_section_index();
    writer.reserve_symtab();
    writer.reserve_strtab_section_index();
    writer.reserve_strtab();
    writer.reserve_shstrtab_section_index();
    writer.reserve_shstrtab();
    writer.reserve_section_headers();

    writer
        .write_file_header(&FileHeader {
            os_abi: elf::ELFOSABI_NONE,
            abi_version: 0,
            e_type: elf::ET_DYN,
            e_machine: elf::EM_X86_64,
            e_entry: 0,
            e_flags: 0,
        })
        .unwrap();
    writer.write_align_program_headers();
    writer.write_program_header(&ProgramHeader {
        p_type: elf::PT_LOAD,
        p_flags: elf::PF_R | elf::PF_X,
        p_offset: 0,
        p_vaddr: 0,
        p_paddr: 0,
        p_filesz: 0,
        p_memsz: MODULE_SPAN,
        p_align: 0x1000,
    });

    writer.pad_until(text_offset);
    writer.write(&[0xccu8; TEXT_SIZE]);
    writer.pad_until(data_offset);
    writer.write(&[0u8; DATA_SIZE]);
    for (_, offset, bytes) in &debug_sections {
        writer.pad_until(*offset);
        writer.write(bytes);
    }

    writer.write_null_symbol();
    for (symbol, name) in symbols.iter().zip(&symbol_names) {
        let (section, st_type) = if symbol.function {
            (text_index, elf::STT_FUNC)
        } else {
            (data_index, elf::STT_OBJECT)
        };
        writer.write_symbol(&Sym {
            name: Some(*name),
            section: Some(section),
            st_info: (elf::STB_GLOBAL << 4) | st_type,
            st_other: elf::STV_DEFAULT,
            st_shndx: 0,
            st_value: symbol.address,
            st_size: symbol.size,
        });
    }
    writer.write_strtab();
    writer.write_shstrtab();

    writer.write_null_section_header();
    writer.write_section_header(&SectionHeader {
        name: Some(text_name),
        sh_type: elf::SHT_PROGBITS,
        sh_flags: u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
        sh_addr: TEXT_ADDR,
        sh_offset: text_offset as u64,
        sh_size: TEXT_SIZE as u64,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 16,
        sh_entsize: 0,
    });
    writer.write_section_header(&SectionHeader {
        name: Some(data_name),
        sh_type: elf::SHT_PROGBITS,
        sh_flags: u64::from(elf::SHF_ALLOC | elf::SHF_WRITE),
        sh_addr: DATA_ADDR,
        sh_offset: data_offset as u64,
        sh_size: DATA_SIZE as u64,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 8,
        sh_entsize: 0,
    });
    for (name, offset, bytes) in &debug_sections {
        writer.write_section_header(&SectionHeader {
            name: Some(*name),
            sh_type: elf::SHT_PROGBITS,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: *offset as u64,
            sh_size: bytes.len() as u64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
        });
    }
    writer.write_symtab_section_header(1);
    writer.write_strtab_section_header();
    writer.write_shstrtab_section_header();
    debug_assert_eq!(writer.reserved_len(), writer.len());

    out
}

/// DWARF describing `int`, `struct point { int x; int y; }`, `point_t` and a
/// declaration-only `struct opaque`.
pub fn point_dwarf() -> Vec<(&'static str, Vec<u8>)>
{
    let encoding = Encoding {
        format: Format::Dwarf32,
        version: 4,
        address_size: 8,
    };
    let mut dwarf = DwarfUnit::new(encoding);
    let root = dwarf.unit.root();

    let int = dwarf.unit.add(root, gimli::DW_TAG_base_type);
    let entry = dwarf.unit.get_mut(int);
    entry.set(gimli::DW_AT_name, AttributeValue::String(b"int".to_vec()));
    entry.set(gimli::DW_AT_byte_size, AttributeValue::Udata(4));
    entry.set(gimli::DW_AT_encoding, AttributeValue::Encoding(gimli::DW_ATE_signed));

    let point = dwarf.unit.add(root, gimli::DW_TAG_structure_type);
    let entry = dwarf.unit.get_mut(point);
    entry.set(gimli::DW_AT_name, AttributeValue::String(b"point".to_vec()));
    entry.set(gimli::DW_AT_byte_size, AttributeValue::Udata(8));
    for (name, offset) in [("x", 0u64), ("y", 4)] {
        let member = dwarf.unit.add(point, gimli::DW_TAG_member);
        let entry = dwarf.unit.get_mut(member);
        entry.set(gimli::DW_AT_name, AttributeValue::String(name.as_bytes().to_vec()));
        entry.set(gimli::DW_AT_type, AttributeValue::UnitRef(int));
        entry.set(gimli::DW_AT_data_member_location, AttributeValue::Udata(offset));
    }

    let typedef = dwarf.unit.add(root, gimli::DW_TAG_typedef);
    let entry = dwarf.unit.get_mut(typedef);
    entry.set(gimli::DW_AT_name, AttributeValue::String(b"point_t".to_vec()));
    entry.set(gimli::DW_AT_type, AttributeValue::UnitRef(point));

    let opaque = dwarf.unit.add(root, gimli::DW_TAG_structure_type);
    let entry = dwarf.unit.get_mut(opaque);
    entry.set(gimli::DW_AT_name, AttributeValue::String(b"opaque".to_vec()));
    entry.set(gimli::DW_AT_declaration, AttributeValue::Flag(true));

    let mut sections = Sections::new(EndianVec::new(LittleEndian));
    dwarf.write(&mut sections).unwrap();
    let mut out = Vec::new();
    sections
        .for_each(|id, data| {
            if !data.slice().is_empty() {
                out.push((id.name(), data.slice().to_vec()));
            }
            Ok::<_, gimli::Error>(())
        })
        .unwrap();
    out
}

/// Kdump decoder returning `address + i` truncated to a byte for every byte.
#[derive(Debug, Default)]
pub struct FakeKdump
{
    pub vmcoreinfo: Vec<u8>,
    pub platform: Option<Platform>,
    pub opened: AtomicUsize,
}

impl FakeKdump
{
    pub fn new(vmcoreinfo: &[u8]) -> Arc<Self>
    {
        Arc::new(FakeKdump {
            vmcoreinfo: vmcoreinfo.to_vec(),
            ..Self::default()
        })
    }

    pub fn opened(&self) -> usize
    {
        self.opened.load(Ordering::SeqCst)
    }
}

struct FakeKdumpContext
{
    _file: File,
    vmcoreinfo: Vec<u8>,
    platform: Option<Platform>,
}

impl KdumpDecoder for FakeKdump
{
    fn open(&self, file: File, _path: &Path) -> Result<Box<dyn KdumpContext>>
    {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeKdumpContext {
            _file: file,
            vmcoreinfo: self.vmcoreinfo.clone(),
            platform: self.platform,
        }))
    }
}

impl KdumpContext for FakeKdumpContext
{
    fn read(&self, buf: &mut [u8], address: u64, _physical: bool) -> Result<()>
    {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = address.wrapping_add(i as u64) as u8;
        }
        Ok(())
    }

    fn vmcoreinfo(&self) -> &[u8]
    {
        &self.vmcoreinfo
    }

    fn platform(&self) -> Option<Platform>
    {
        self.platform
    }
}

/// Route test logging through the shared subscriber; repeated calls are fine.
pub fn init_logging()
{
    let _ = strata_utils::init_logging_with_level(strata_utils::LogLevel::Debug, strata_utils::LogFormat::Pretty);
}

/// Write an [`elf_module`] with the fixture symbols into `dir`.
pub fn write_module(dir: &Path, name: &str, with_dwarf: bool) -> PathBuf
{
    let dwarf = if with_dwarf { point_dwarf() } else { Vec::new() };
    let path = dir.join(name);
    fs::write(&path, elf_module(MODULE_SYMBOLS, &dwarf)).unwrap();
    path
}

/// Config that never touches the host's kdump settings, `/proc` or `/sys`.
pub fn isolated_config(proc_root: &Path) -> strata_core::ProgramConfig
{
    strata_core::ProgramConfig::default()
        .with_kdump_for_elf(Some(false))
        .with_proc_root(proc_root)
        .with_kernel_debug_info(Arc::new(strata_core::debuginfo::VmlinuxSearch::with_templates([format!(
            "{}/vmlinux-{{release}}",
            proc_root.display()
        )])))
}
