//! # Kernel Metadata
//!
//! Linux kernels export a `VMCOREINFO` note describing themselves: release
//! string, page size, KASLR offset and a long list of symbol and structure
//! offsets. Only the first three are consumed here.
//!
//! The note is normally found in the core's `PT_NOTE` segments. `/proc/kcore` on
//! older kernels does not carry it, so a [`VmcoreInfoFallback`] can recover it by
//! reading the note directly out of physical memory.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::error::{Result, StrataError};
use crate::memory::MemoryReader;

/// Owner name of the kernel metadata note.
pub const VMCOREINFO_NOTE_NAME: &[u8] = b"VMCOREINFO";

/// Parsed kernel metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmcoreInfo
{
    /// `OSRELEASE`, e.g. `6.8.0-45-generic`
    pub osrelease: String,
    /// `PAGESIZE` in bytes
    pub page_size: u64,
    /// `KERNELOFFSET`, zero when KASLR is off
    pub kaslr_offset: u64,
}

impl VmcoreInfo
{
    /// Parse the descriptor of a `VMCOREINFO` note.
    ///
    /// The descriptor is a list of `KEY=value` lines. Unknown keys are ignored.
    ///
    /// ## Errors
    ///
    /// `Format` if `OSRELEASE` or `PAGESIZE` is missing or invalid, or if
    /// `KERNELOFFSET` is not hexadecimal.
    pub fn parse(desc: &[u8]) -> Result<Self>
    {
        let mut osrelease = None;
        let mut page_size = None;
        let mut kaslr_offset = 0;

        for line in desc.split(|&b| b == b'\n') {
            let Some(eq) = line.iter().position(|&b| b == b'=') else {
                continue;
            };
            let (key, value) = (&line[..eq], &line[eq + 1..]);
            // The note is NUL padded.
            let value = value.split(|&b| b == 0).next().unwrap_or_default();
            match key {
                b"OSRELEASE" => {
                    let release = std::str::from_utf8(value)
                        .map_err(|_| StrataError::Format("OSRELEASE in VMCOREINFO is not valid UTF-8".into()))?;
                    osrelease = Some(release.to_string());
                }
                b"PAGESIZE" => {
                    let size = parse_number(value, 10)
                        .ok_or_else(|| StrataError::Format("PAGESIZE in VMCOREINFO is invalid".into()))?;
                    page_size = Some(size);
                }
                b"KERNELOFFSET" => {
                    kaslr_offset = parse_number(value, 16)
                        .ok_or_else(|| StrataError::Format("KERNELOFFSET in VMCOREINFO is invalid".into()))?;
                }
                _ => {}
            }
        }

        let osrelease = osrelease
            .filter(|release| !release.is_empty())
            .ok_or_else(|| StrataError::Format("VMCOREINFO does not contain valid OSRELEASE".into()))?;
        let page_size = page_size
            .filter(|size| size.is_power_of_two())
            .ok_or_else(|| StrataError::Format("VMCOREINFO does not contain valid PAGESIZE".into()))?;

        Ok(VmcoreInfo {
            osrelease,
            page_size,
            kaslr_offset,
        })
    }
}

impl fmt::Display for VmcoreInfo
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "Linux {} (page size {}, KASLR offset 0x{:x})",
            self.osrelease, self.page_size, self.kaslr_offset
        )
    }
}

fn parse_number(value: &[u8], radix: u32) -> Option<u64>
{
    let text = std::str::from_utf8(value).ok()?.trim();
    let text = if radix == 16 {
        text.strip_prefix("0x").unwrap_or(text)
    } else {
        text
    };
    u64::from_str_radix(text, radix).ok()
}

/// Recovers kernel metadata from a live kernel when the core has no note
pub trait VmcoreInfoFallback: Send + Sync
{
    /// Locate and parse the metadata, reading target memory through `memory`.
    fn read_vmcoreinfo(&self, memory: &MemoryReader) -> Result<VmcoreInfo>;
}

/// Default fallback: ask sysfs where the note lives and read it physically
///
/// `/sys/kernel/vmcoreinfo` contains the physical address and size of the
/// note, both in hexadecimal.
#[derive(Debug, Clone)]
pub struct SysfsVmcoreInfo
{
    path: PathBuf,
}

impl SysfsVmcoreInfo
{
    /// Read the location from a different file than `/sys/kernel/vmcoreinfo`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self
    {
        SysfsVmcoreInfo { path: path.into() }
    }
}

impl Default for SysfsVmcoreInfo
{
    fn default() -> Self
    {
        Self::with_path("/sys/kernel/vmcoreinfo")
    }
}

impl VmcoreInfoFallback for SysfsVmcoreInfo
{
    fn read_vmcoreinfo(&self, memory: &MemoryReader) -> Result<VmcoreInfo>
    {
        let text = fs::read_to_string(&self.path).map_err(|err| StrataError::os("read", &self.path, err))?;
        let mut fields = text.split_whitespace();
        let (Some(address), Some(size)) = (fields.next(), fields.next()) else {
            return Err(StrataError::Format(format!("{} is invalid", self.path.display())));
        };
        let address = parse_number(address.as_bytes(), 16)
            .ok_or_else(|| StrataError::Format(format!("{} is invalid", self.path.display())))?;
        let size = parse_number(size.as_bytes(), 16)
            .and_then(|size| usize::try_from(size).ok())
            .ok_or_else(|| StrataError::Format(format!("{} is invalid", self.path.display())))?;
        debug!(address = format_args!("0x{address:x}"), size, "reading VMCOREINFO from physical memory");

        let mut note = Vec::new();
        note.try_reserve_exact(size)?;
        note.resize(size, 0);
        memory.read(&mut note, address, true)?;
        VmcoreInfo::parse(note_descriptor(&note)?)
    }
}

/// Descriptor of a raw, host-endian `VMCOREINFO` note.
fn note_descriptor(note: &[u8]) -> Result<&[u8]>
{
    let invalid = || StrataError::Format("VMCOREINFO in memory is invalid".into());
    let word = |at: usize| -> Result<usize> {
        let bytes: [u8; 4] = note.get(at..at + 4).and_then(|b| b.try_into().ok()).ok_or_else(invalid)?;
        Ok(u32::from_ne_bytes(bytes) as usize)
    };
    let namesz = word(0)?;
    let descsz = word(4)?;
    let name_start = 12;
    let name = note.get(name_start..name_start + namesz).ok_or_else(invalid)?;
    if name.strip_suffix(b"\0") != Some(VMCOREINFO_NOTE_NAME) {
        return Err(invalid());
    }
    let desc_start = name_start + namesz.next_multiple_of(4);
    note.get(desc_start..desc_start + descsz).ok_or_else(invalid)
}
