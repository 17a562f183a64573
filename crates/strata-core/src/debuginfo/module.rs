//! ELF modules and their symbol tables and DWARF sections.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use gimli::{Dwarf, EndianArcSlice, RunTimeEndian, SectionId, Unit};
use object::elf::{self, FileHeader32, FileHeader64};
use object::read::elf::{FileHeader, ProgramHeader};
use object::{Endianness, FileKind, Object as _, ObjectSection, ObjectSymbol, SymbolKind};
use once_cell::sync::OnceCell;

use super::dwarf::TypeExtractor;
use super::{OwnedDwarf, OwnedReader};
use crate::error::{Result, StrataError};
use crate::object::{ObjectKind, Symbol};
use crate::platform::{ElfHeaderInfo, Platform};
use crate::types::{Type, TypeKind};

/// Where a module sits in the target's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleLoad
{
    /// Load address unknown; the module only contributes types
    Unloaded,
    /// Mapped at `[start, end)`; the bias follows from the ELF segments
    Mapped
    {
        /// First mapped address
        start: u64,
        /// One past the last mapped address
        end: u64,
    },
    /// Link-time addresses shifted by `bias`
    Biased
    {
        /// Added to every link-time address
        bias: u64,
    },
}

const DWARF_SECTIONS: &[&str] = &[
    ".debug_abbrev",
    ".debug_addr",
    ".debug_info",
    ".debug_line",
    ".debug_line_str",
    ".debug_ranges",
    ".debug_rnglists",
    ".debug_str",
    ".debug_str_offsets",
    ".debug_types",
    ".debug_loc",
    ".debug_loclists",
];

fn section_name(id: SectionId) -> &'static str
{
    match id {
        SectionId::DebugAbbrev => ".debug_abbrev",
        SectionId::DebugAddr => ".debug_addr",
        SectionId::DebugInfo => ".debug_info",
        SectionId::DebugLine => ".debug_line",
        SectionId::DebugLineStr => ".debug_line_str",
        SectionId::DebugRanges => ".debug_ranges",
        SectionId::DebugRngLists => ".debug_rnglists",
        SectionId::DebugStr => ".debug_str",
        SectionId::DebugStrOffsets => ".debug_str_offsets",
        SectionId::DebugTypes => ".debug_types",
        SectionId::DebugLoc => ".debug_loc",
        SectionId::DebugLocLists => ".debug_loclists",
        _ => "",
    }
}

fn load_section_bytes(file: &object::File<'_>, name: &str) -> Result<Option<Arc<[u8]>>>
{
    let Some(section) = file.section_by_name(name) else {
        return Ok(None);
    };
    let data = section
        .uncompressed_data()
        .map_err(|err| StrataError::Format(format!("failed to read {name}: {err}")))?;
    Ok(Some(match data {
        Cow::Borrowed(bytes) => Arc::<[u8]>::from(bytes),
        Cow::Owned(vec) => vec.into(),
    }))
}

/// Header fields plus the lowest and highest `PT_LOAD` addresses.
fn elf_layout(data: &[u8]) -> Result<(ElfHeaderInfo, Option<(u64, u64)>)>
{
    fn layout<Elf: FileHeader<Endian = Endianness>>(data: &[u8]) -> Result<(ElfHeaderInfo, Option<(u64, u64)>)>
    {
        let header = Elf::parse(data)?;
        let endian = header.endian()?;
        let info = ElfHeaderInfo {
            machine: header.e_machine(endian),
            class: header.e_ident().class,
            data: header.e_ident().data,
            e_type: header.e_type(endian),
        };
        let mut range: Option<(u64, u64)> = None;
        for phdr in header.program_headers(endian, data)? {
            if phdr.p_type(endian) != elf::PT_LOAD {
                continue;
            }
            let start: u64 = phdr.p_vaddr(endian).into();
            let end = start.saturating_add(phdr.p_memsz(endian).into());
            range = Some(match range {
                Some((lo, hi)) => (lo.min(start), hi.max(end)),
                None => (start, end),
            });
        }
        Ok((info, range))
    }

    match FileKind::parse(data)? {
        FileKind::Elf32 => layout::<FileHeader32<Endianness>>(data),
        FileKind::Elf64 => layout::<FileHeader64<Endianness>>(data),
        _ => Err(StrataError::Format("not an ELF file".into())),
    }
}

#[derive(Debug, Clone)]
struct ModuleSymbol
{
    name: String,
    address: u64,
    size: u64,
    kind: ObjectKind,
}

type TypeCacheKey = (Option<TypeKind>, String);

/// A loaded ELF file
pub struct DebugModule
{
    name: String,
    path: PathBuf,
    platform: Platform,
    endian: RunTimeEndian,
    bias: Option<u64>,
    range: Option<(u64, u64)>,
    symbols: Vec<ModuleSymbol>,
    debug_sections: HashMap<&'static str, Arc<[u8]>>,
    dwarf_cache: OnceCell<OwnedDwarf>,
    units_cache: OnceCell<Vec<Unit<OwnedReader>>>,
    type_cache: RwLock<HashMap<TypeCacheKey, Option<Arc<Type>>>>,
}

impl DebugModule
{
    /// Read and parse the ELF file at `path`.
    ///
    /// Relocatable objects are always treated as [`ModuleLoad::Unloaded`].
    ///
    /// ## Errors
    ///
    /// `Os` if the file cannot be read, `Format` if it is not a usable ELF file.
    pub fn open(path: &Path, name: Option<&str>, load: ModuleLoad) -> Result<Self>
    {
        let bytes = fs::read(path).map_err(|err| StrataError::os("open", path, err))?;
        let (header, link_range) = elf_layout(&bytes)?;
        let file = object::File::parse(&*bytes)?;

        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let load = if header.e_type == elf::ET_REL {
            ModuleLoad::Unloaded
        } else {
            load
        };
        let (bias, range) = match (load, link_range) {
            (ModuleLoad::Unloaded, _) => (None, None),
            (ModuleLoad::Mapped { start, end }, Some((lo, _))) => {
                let bias = if header.e_type == elf::ET_EXEC {
                    0
                } else {
                    start.wrapping_sub(lo & !0xfff)
                };
                (Some(bias), Some((start, end)))
            }
            (ModuleLoad::Mapped { start, end }, None) => (Some(start), Some((start, end))),
            (ModuleLoad::Biased { bias }, Some((lo, hi))) => {
                (Some(bias), Some((lo.wrapping_add(bias), hi.wrapping_add(bias))))
            }
            (ModuleLoad::Biased { bias }, None) => (Some(bias), None),
        };

        let mut symbols: Vec<ModuleSymbol> = file
            .symbols()
            .chain(file.dynamic_symbols())
            .filter(|symbol| symbol.is_definition())
            .filter_map(|symbol| {
                let kind = match symbol.kind() {
                    SymbolKind::Text => ObjectKind::Function,
                    SymbolKind::Data | SymbolKind::Tls => ObjectKind::Variable,
                    _ => return None,
                };
                let name = symbol.name().ok().filter(|name| !name.is_empty())?;
                Some(ModuleSymbol {
                    name: name.to_string(),
                    address: symbol.address(),
                    size: symbol.size(),
                    kind,
                })
            })
            .collect();
        symbols.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.name.cmp(&b.name)));
        symbols.dedup_by(|a, b| a.address == b.address && a.name == b.name);

        let mut debug_sections = HashMap::new();
        for name in DWARF_SECTIONS {
            if let Some(data) = load_section_bytes(&file, name)? {
                debug_sections.insert(*name, data);
            }
        }

        Ok(DebugModule {
            name: name.map_or_else(|| path.display().to_string(), str::to_string),
            path: path.to_path_buf(),
            platform: Platform::from_elf_header(&header),
            endian,
            bias,
            range,
            symbols,
            debug_sections,
            dwarf_cache: OnceCell::new(),
            units_cache: OnceCell::new(),
            type_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Display name.
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// File the module was read from.
    pub fn path(&self) -> &Path
    {
        &self.path
    }

    /// Platform described by the ELF header.
    pub fn platform(&self) -> Platform
    {
        self.platform
    }

    /// Bias applied to link-time addresses, `None` if the load address is unknown.
    pub fn bias(&self) -> Option<u64>
    {
        self.bias
    }

    /// Address range occupied in the target, if known.
    pub fn address_range(&self) -> Option<(u64, u64)>
    {
        self.range
    }

    /// Whether the module carries DWARF.
    pub fn has_debug_info(&self) -> bool
    {
        self.debug_sections.get(".debug_info").is_some_and(|data| !data.is_empty())
    }

    /// Whether `address` falls inside the module's range.
    pub fn contains(&self, address: u64) -> bool
    {
        self.range.is_some_and(|(start, end)| address >= start && address < end)
    }

    /// Symbol containing `address`, relocated into the target.
    pub fn symbol_at(&self, address: u64) -> Option<Symbol>
    {
        let bias = self.bias?;
        if !self.contains(address) {
            return None;
        }
        let file_address = address.wrapping_sub(bias);
        let end = self.symbols.partition_point(|symbol| symbol.address <= file_address);
        self.symbols[..end]
            .iter()
            .rev()
            .find(|symbol| file_address - symbol.address < symbol.size.max(1))
            .map(|symbol| self.relocate(symbol))
    }

    /// Symbol named `name`, relocated into the target.
    pub fn symbol_named(&self, name: &str) -> Option<(Symbol, ObjectKind)>
    {
        self.bias?;
        self.symbols
            .iter()
            .find(|symbol| symbol.name == name)
            .map(|symbol| (self.relocate(symbol), symbol.kind))
    }

    fn relocate(&self, symbol: &ModuleSymbol) -> Symbol
    {
        Symbol {
            name: symbol.name.clone(),
            address: symbol.address.wrapping_add(self.bias.unwrap_or(0)),
            size: symbol.size,
        }
    }

    fn dwarf(&self) -> Result<&OwnedDwarf>
    {
        self.dwarf_cache.get_or_try_init(|| {
            Dwarf::load(|section| Ok::<_, gimli::Error>(self.section_reader(section))).map_err(StrataError::from)
        })
    }

    fn section_reader(&self, id: SectionId) -> OwnedReader
    {
        let data = self
            .debug_sections
            .get(section_name(id))
            .cloned()
            .unwrap_or_else(|| Arc::<[u8]>::from(Vec::new()));
        EndianArcSlice::new(data, self.endian)
    }

    fn units(&self) -> Result<&[Unit<OwnedReader>]>
    {
        let units = self.units_cache.get_or_try_init(|| {
            let dwarf = self.dwarf()?;
            let mut units = Vec::new();
            let mut headers = dwarf.units();
            while let Some(header) = headers.next()? {
                units.push(dwarf.unit(header)?);
            }
            let mut type_headers = dwarf.type_units();
            while let Some(header) = type_headers.next()? {
                units.push(dwarf.unit(header)?);
            }
            Ok::<_, StrataError>(units)
        })?;
        Ok(units)
    }

    /// Look up a named type in the module's DWARF.
    ///
    /// ## Errors
    ///
    /// `Format` if the DWARF is malformed.
    pub fn find_type(&self, kind: Option<TypeKind>, name: &str) -> Result<Option<Arc<Type>>>
    {
        if !self.has_debug_info() {
            return Ok(None);
        }
        let key = (kind, name.to_string());
        if let Some(cached) = self.type_cache.read().unwrap_or_else(PoisonError::into_inner).get(&key) {
            return Ok(cached.clone());
        }

        let extractor = TypeExtractor::new(self.dwarf()?, self.units()?, u64::from(self.platform.word_size()));
        let found = extractor.find(kind, name)?.map(Arc::new);
        self.type_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, found.clone());
        Ok(found)
    }
}

impl fmt::Debug for DebugModule
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("DebugModule")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("range", &self.range)
            .field("symbols", &self.symbols.len())
            .field("has_debug_info", &self.has_debug_info())
            .finish_non_exhaustive()
    }
}
