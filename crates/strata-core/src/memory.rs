//! # Memory Registry
//!
//! The address space of a target is a list of [`MemorySegment`]s, each mapping an
//! address range in either the virtual or the physical address space to a
//! backing source.
//!
//! ## Backing sources
//!
//! - **File**: a byte range of a shared file, read with positional reads. If the
//!   segment is larger than the file range (the `.bss` shape of a core segment),
//!   the tail reads as zeros.
//! - **Callback**: any [`MemoryRead`] implementation, used for live processes
//!   through `/proc/<pid>/mem` and for kdump decoders.
//!
//! ## Overlaps
//!
//! Segments registered later shadow earlier ones. A single read may span several
//! segments; it either fills the whole buffer or fails without touching it.

use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Result, StrataError};

/// Address space selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace
{
    /// Virtual addresses
    Virtual,
    /// Physical addresses
    Physical,
}

impl AddressSpace
{
    /// Selector for a `physical` flag.
    pub const fn from_physical(physical: bool) -> Self
    {
        if physical {
            AddressSpace::Physical
        } else {
            AddressSpace::Virtual
        }
    }

    /// Whether this is the physical address space.
    pub const fn is_physical(self) -> bool
    {
        matches!(self, AddressSpace::Physical)
    }
}

/// A source of target memory
///
/// `buf` must be filled completely or an error returned. `offset` is the offset
/// of `address` from the start of the segment the callback was registered for.
pub trait MemoryRead: Send + Sync
{
    /// Read `buf.len()` bytes at `address`.
    fn read(&self, buf: &mut [u8], address: u64, offset: u64, physical: bool) -> Result<()>;
}

impl<F> MemoryRead for F
where
    F: Fn(&mut [u8], u64, u64, bool) -> Result<()> + Send + Sync,
{
    fn read(&self, buf: &mut [u8], address: u64, offset: u64, physical: bool) -> Result<()>
    {
        self(buf, address, offset, physical)
    }
}

/// What a segment reads from
#[derive(Clone)]
pub enum Backing
{
    /// Byte range of a file
    File
    {
        /// Shared file handle; virtual and physical segments may share it
        file: Arc<File>,
        /// Offset of the segment's first byte in the file
        offset: u64,
        /// Number of bytes present in the file; the rest of the segment is zero
        size: u64,
    },
    /// Arbitrary reader
    Callback(Arc<dyn MemoryRead>),
}

impl fmt::Debug for Backing
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Backing::File { offset, size, .. } => f
                .debug_struct("File")
                .field("offset", &format_args!("0x{offset:x}"))
                .field("size", &format_args!("0x{size:x}"))
                .finish_non_exhaustive(),
            Backing::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// One address range and its backing
#[derive(Debug, Clone)]
pub struct MemorySegment
{
    /// Address space the range belongs to
    pub space: AddressSpace,
    /// First address of the range
    pub start: u64,
    /// Length of the range in bytes (never zero)
    pub size: u64,
    /// Where the bytes come from
    pub backing: Backing,
}

impl MemorySegment
{
    /// Last address covered, inclusive.
    pub fn last(&self) -> u64
    {
        self.start.saturating_add(self.size - 1)
    }

    fn contains(&self, address: u64) -> bool
    {
        address >= self.start && address - self.start < self.size
    }

    fn read_into(&self, buf: &mut [u8], address: u64) -> Result<()>
    {
        let seg_offset = address - self.start;
        match &self.backing {
            Backing::File { file, offset, size } => {
                let in_file = size.saturating_sub(seg_offset).min(buf.len() as u64) as usize;
                let (data, zeros) = buf.split_at_mut(in_file);
                if !data.is_empty() {
                    let file_offset = offset
                        .checked_add(seg_offset)
                        .ok_or_else(|| StrataError::fault(address, "memory file offset overflows"))?;
                    file.read_exact_at(data, file_offset).map_err(|err| {
                        let message = if err.kind() == io::ErrorKind::UnexpectedEof {
                            "short read from memory file".to_string()
                        } else {
                            format!("could not read memory file: {err}")
                        };
                        StrataError::fault(address, message)
                    })?;
                }
                zeros.fill(0);
                Ok(())
            }
            Backing::Callback(reader) => reader.read(buf, address, seg_offset, self.space.is_physical()),
        }
    }
}

/// Ordered set of memory segments
#[derive(Debug, Default, Clone)]
pub struct MemoryReader
{
    segments: Vec<MemorySegment>,
}

impl MemoryReader
{
    /// Create an empty reader.
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Register a segment. Zero-sized segments are ignored.
    pub fn add_segment(&mut self, space: AddressSpace, start: u64, size: u64, backing: Backing)
    {
        if size == 0 {
            return;
        }
        trace!(?space, start = format_args!("0x{start:x}"), size = format_args!("0x{size:x}"), "adding memory segment");
        self.segments.push(MemorySegment {
            space,
            start,
            size,
            backing,
        });
    }

    /// Whether no segment has been registered.
    pub fn is_empty(&self) -> bool
    {
        self.segments.is_empty()
    }

    /// All segments, oldest first.
    pub fn segments(&self) -> &[MemorySegment]
    {
        &self.segments
    }

    /// Segments of one address space, oldest first.
    pub fn segments_in(&self, space: AddressSpace) -> impl Iterator<Item = &MemorySegment> + '_
    {
        self.segments.iter().filter(move |seg| seg.space == space)
    }

    /// Drop every segment.
    pub fn clear(&mut self)
    {
        self.segments.clear();
    }

    /// Read `buf.len()` bytes at `address`.
    ///
    /// ## Errors
    ///
    /// `Fault` if any byte of the range is not covered by a segment or a backing
    /// source comes up short. `buf` is left untouched on failure.
    pub fn read(&self, buf: &mut [u8], address: u64, physical: bool) -> Result<()>
    {
        if buf.is_empty() {
            return Ok(());
        }
        let space = AddressSpace::from_physical(physical);
        let mut scratch = Vec::new();
        scratch.try_reserve_exact(buf.len())?;
        scratch.resize(buf.len(), 0);

        let mut pos = 0usize;
        while pos < scratch.len() {
            let addr = address
                .checked_add(pos as u64)
                .ok_or_else(|| StrataError::fault(address, "read wraps around the address space"))?;
            let (index, segment) = self
                .segments
                .iter()
                .enumerate()
                .rev()
                .find(|(_, seg)| seg.space == space && seg.contains(addr))
                .ok_or_else(|| StrataError::fault(addr, "could not find memory segment"))?;

            let remaining = (scratch.len() - pos) as u64;
            let mut chunk = remaining.min(segment.size - (addr - segment.start));
            // A newer segment starting inside this chunk takes over from there.
            for newer in &self.segments[index + 1..] {
                if newer.space == space && newer.start > addr && newer.start - addr < chunk {
                    chunk = newer.start - addr;
                }
            }
            let end = pos + chunk as usize;
            segment.read_into(&mut scratch[pos..end], addr)?;
            pos = end;
        }

        buf.copy_from_slice(&scratch);
        Ok(())
    }
}
