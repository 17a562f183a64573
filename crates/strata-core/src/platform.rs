//! # Platform Model
//!
//! A [`Platform`] is a CPU architecture plus the two properties that decide how
//! target memory is interpreted: word size and byte order.
//!
//! Platforms come from three places:
//! - explicitly, through [`Platform::create`] or [`Platform::from_raw`]
//! - from an ELF header, through [`Platform::from_elf_header`]
//! - from the introspecting machine, through [`Platform::host`]
//!
//! ## Recognized architectures
//!
//! | Architecture | ELF machine | Default flags |
//! |--------------|-------------|---------------|
//! | `X86_64`     | 62          | 64-bit, little-endian |
//! | `Aarch64`    | 183         | 64-bit, little-endian |
//!
//! Anything else is [`Architecture::Unknown`], which has no default flags.

use std::fmt;
use std::ptr;

use bitflags::bitflags;
use object::elf;

use crate::error::{Result, StrataError};

bitflags! {
    /// Word size and byte order of a platform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PlatformFlags: u32
    {
        /// Words are 64 bits wide.
        const IS_64_BIT = 1 << 0;
        /// Multi-byte values are little-endian.
        const IS_LITTLE_ENDIAN = 1 << 1;
    }
}

/// CPU architecture of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Architecture
{
    /// Architecture could not be determined
    Unknown = 0,
    /// 64-bit x86 (Intel/AMD)
    X86_64 = 1,
    /// 64-bit ARM
    Aarch64 = 2,
}

impl Architecture
{
    /// Architecture this crate was compiled for.
    pub const fn current() -> Self
    {
        #[cfg(target_arch = "x86_64")]
        {
            Architecture::X86_64
        }

        #[cfg(target_arch = "aarch64")]
        {
            Architecture::Aarch64
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            Architecture::Unknown
        }
    }

    /// Architecture matching an ELF `e_machine` value.
    pub const fn from_elf_machine(machine: u16) -> Self
    {
        match machine {
            elf::EM_X86_64 => Architecture::X86_64,
            elf::EM_AARCH64 => Architecture::Aarch64,
            _ => Architecture::Unknown,
        }
    }

    /// Static descriptor for this architecture.
    pub fn info(self) -> &'static ArchitectureInfo
    {
        match self {
            Architecture::Unknown => &ARCH_UNKNOWN,
            Architecture::X86_64 => &ARCH_X86_64,
            Architecture::Aarch64 => &ARCH_AARCH64,
        }
    }
}

impl TryFrom<u32> for Architecture
{
    type Error = StrataError;

    fn try_from(value: u32) -> Result<Self>
    {
        match value {
            0 => Ok(Architecture::Unknown),
            1 => Ok(Architecture::X86_64),
            2 => Ok(Architecture::Aarch64),
            _ => Err(StrataError::InvalidArgument("invalid architecture".into())),
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.info().name)
    }
}

/// Fixed, process-wide description of an architecture.
///
/// Platforms point at one of these; two platforms have the same architecture
/// exactly when they point at the same descriptor.
#[derive(Debug)]
pub struct ArchitectureInfo
{
    /// Display name
    pub name: &'static str,
    /// Enumerated architecture
    pub arch: Architecture,
    /// Flags used when the caller asks for the defaults, `None` for unknown
    pub default_flags: Option<PlatformFlags>,
}

static ARCH_UNKNOWN: ArchitectureInfo = ArchitectureInfo {
    name: "unknown",
    arch: Architecture::Unknown,
    default_flags: None,
};

static ARCH_X86_64: ArchitectureInfo = ArchitectureInfo {
    name: "x86-64",
    arch: Architecture::X86_64,
    default_flags: Some(PlatformFlags::IS_64_BIT.union(PlatformFlags::IS_LITTLE_ENDIAN)),
};

static ARCH_AARCH64: ArchitectureInfo = ArchitectureInfo {
    name: "AArch64",
    arch: Architecture::Aarch64,
    default_flags: Some(PlatformFlags::IS_64_BIT.union(PlatformFlags::IS_LITTLE_ENDIAN)),
};

/// Identification fields of an ELF header
///
/// Only the fields platform inference and target classification need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeaderInfo
{
    /// `e_machine`
    pub machine: u16,
    /// `e_ident[EI_CLASS]`
    pub class: u8,
    /// `e_ident[EI_DATA]`
    pub data: u8,
    /// `e_type`
    pub e_type: u16,
}

/// Sentinel accepted by [`Platform::from_raw`] meaning "default flags".
pub const DEFAULT_FLAGS: u32 = u32::MAX;

/// Architecture plus word size and byte order
#[derive(Debug, Clone, Copy)]
pub struct Platform
{
    arch: &'static ArchitectureInfo,
    flags: PlatformFlags,
}

impl Platform
{
    /// Create a platform.
    ///
    /// `flags = None` selects the architecture's default flags.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if the flags contain unrecognized bits, or if default
    /// flags are requested for [`Architecture::Unknown`].
    pub fn create(arch: Architecture, flags: Option<PlatformFlags>) -> Result<Self>
    {
        let info = arch.info();
        let flags = match flags {
            Some(flags) => {
                if !PlatformFlags::all().contains(flags) {
                    return Err(StrataError::InvalidArgument("invalid platform flags".into()));
                }
                flags
            }
            None => info.default_flags.ok_or_else(|| {
                StrataError::InvalidArgument("cannot get default platform flags of unknown architecture".into())
            })?,
        };
        Ok(Platform { arch: info, flags })
    }

    /// Create a platform from raw numeric values.
    ///
    /// `flags == DEFAULT_FLAGS` selects the defaults.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` for an unrecognized architecture value or flag bits,
    /// as well as every case [`Platform::create`] rejects.
    pub fn from_raw(arch: u32, flags: u32) -> Result<Self>
    {
        let arch = Architecture::try_from(arch)?;
        let flags = if flags == DEFAULT_FLAGS {
            None
        } else {
            Some(
                PlatformFlags::from_bits(flags)
                    .ok_or_else(|| StrataError::InvalidArgument("invalid platform flags".into()))?,
            )
        };
        Self::create(arch, flags)
    }

    /// Platform of the machine running this code.
    pub fn host() -> Self
    {
        let mut flags = PlatformFlags::empty();
        if cfg!(target_pointer_width = "64") {
            flags |= PlatformFlags::IS_64_BIT;
        }
        if cfg!(target_endian = "little") {
            flags |= PlatformFlags::IS_LITTLE_ENDIAN;
        }
        Platform {
            arch: Architecture::current().info(),
            flags,
        }
    }

    /// Infer a platform from an ELF header.
    ///
    /// A recognized machine is assumed little-endian with the word size taken
    /// from the class field. For an unrecognized machine both the word size and
    /// the byte order are copied from the header.
    pub fn from_elf_header(header: &ElfHeaderInfo) -> Self
    {
        let arch = Architecture::from_elf_machine(header.machine);
        let mut flags = PlatformFlags::empty();
        if header.class == elf::ELFCLASS64 {
            flags |= PlatformFlags::IS_64_BIT;
        }
        match arch {
            Architecture::Unknown => {
                if header.data == elf::ELFDATA2LSB {
                    flags |= PlatformFlags::IS_LITTLE_ENDIAN;
                }
            }
            _ => flags |= PlatformFlags::IS_LITTLE_ENDIAN,
        }
        Platform {
            arch: arch.info(),
            flags,
        }
    }

    /// Architecture of this platform.
    pub fn arch(&self) -> Architecture
    {
        self.arch.arch
    }

    /// Architecture descriptor.
    pub fn arch_info(&self) -> &'static ArchitectureInfo
    {
        self.arch
    }

    /// Word size and byte order flags.
    pub fn flags(&self) -> PlatformFlags
    {
        self.flags
    }

    /// Whether words are 64 bits.
    pub fn is_64_bit(&self) -> bool
    {
        self.flags.contains(PlatformFlags::IS_64_BIT)
    }

    /// Whether the platform is little-endian.
    pub fn is_little_endian(&self) -> bool
    {
        self.flags.contains(PlatformFlags::IS_LITTLE_ENDIAN)
    }

    /// Word size in bytes.
    pub fn word_size(&self) -> u8
    {
        if self.is_64_bit() {
            8
        } else {
            4
        }
    }

    /// All-ones value of the word width.
    pub fn word_max(&self) -> u64
    {
        if self.is_64_bit() {
            u64::MAX
        } else {
            u64::from(u32::MAX)
        }
    }
}

impl PartialEq for Platform
{
    fn eq(&self, other: &Self) -> bool
    {
        ptr::eq(self.arch, other.arch) && self.flags == other.flags
    }
}

impl Eq for Platform {}

impl fmt::Display for Platform
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "{} ({}-bit, {}-endian)",
            self.arch.name,
            if self.is_64_bit() { 64 } else { 32 },
            if self.is_little_endian() { "little" } else { "big" }
        )
    }
}
