//! # Module Discovery
//!
//! Finds the ELF files that make up a target:
//! - live processes: file-backed mappings in `/proc/<pid>/maps`
//! - userspace core dumps: the `NT_FILE` note
//! - kernels: a `vmlinux` matching the running release, through [`KernelDebugInfo`]
//!
//! Each mapped file is reduced to one address range covering all of its
//! mappings.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use tracing::{debug, info};

use super::module::ModuleLoad;
use super::ReportSession;
use crate::error::{Result, StrataError};
use crate::target::FileNote;
use crate::vmcoreinfo::VmcoreInfo;

/// A file mapped into the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedFile
{
    /// Absolute path of the file
    pub path: PathBuf,
    /// Lowest mapped address
    pub start: u64,
    /// One past the highest mapped address
    pub end: u64,
}

fn group(mappings: impl IntoIterator<Item = (PathBuf, u64, u64)>) -> Vec<MappedFile>
{
    let mut files: BTreeMap<PathBuf, (u64, u64)> = BTreeMap::new();
    for (path, start, end) in mappings {
        files
            .entry(path)
            .and_modify(|range| {
                range.0 = range.0.min(start);
                range.1 = range.1.max(end);
            })
            .or_insert((start, end));
    }
    let mut files: Vec<MappedFile> = files
        .into_iter()
        .map(|(path, (start, end))| MappedFile { path, start, end })
        .collect();
    files.sort_by_key(|file| file.start);
    files
}

/// Parse the contents of `/proc/<pid>/maps`.
///
/// Anonymous mappings and pseudo-paths such as `[heap]` are skipped.
pub fn parse_proc_maps(contents: &str) -> Vec<MappedFile>
{
    let mappings = contents.lines().filter_map(|line| {
        // start-end perms offset dev inode path
        let mut fields = line.splitn(6, ' ');
        let range = fields.next()?;
        let path = fields.nth(4)?.trim_start();
        if !path.starts_with('/') {
            return None;
        }
        let path = path.strip_suffix(" (deleted)").unwrap_or(path);
        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        Some((PathBuf::from(path), start, end))
    });
    group(mappings)
}

/// Parse an `NT_FILE` note.
///
/// The descriptor holds a count and a page size, then `count` triples of
/// (start, end, file offset in pages), then `count` NUL-terminated paths.
///
/// ## Errors
///
/// `Format` if the note is truncated.
pub fn parse_file_note(note: &FileNote) -> Result<Vec<MappedFile>>
{
    let truncated = || StrataError::Format("NT_FILE note is truncated".into());
    let word_size = if note.is_64_bit { 8 } else { 4 };
    let desc = note.desc.as_slice();
    let word = |index: usize| -> Result<u64> {
        let at = index * word_size;
        let bytes = desc.get(at..at + word_size).ok_or_else(truncated)?;
        let mut buf = [0u8; 8];
        if note.little_endian {
            buf[..word_size].copy_from_slice(bytes);
            Ok(u64::from_le_bytes(buf))
        } else {
            buf[8 - word_size..].copy_from_slice(bytes);
            Ok(u64::from_be_bytes(buf))
        }
    };

    let count = usize::try_from(word(0)?).map_err(|_| truncated())?;
    let names_start = count
        .checked_mul(3)
        .and_then(|n| n.checked_add(2))
        .and_then(|n| n.checked_mul(word_size))
        .ok_or_else(truncated)?;
    let mut names = desc.get(names_start..).ok_or_else(truncated)?.split(|&b| b == 0);

    let mut mappings = Vec::with_capacity(count.min(4096));
    for i in 0..count {
        let start = word(2 + 3 * i)?;
        let end = word(3 + 3 * i)?;
        let name = names.next().ok_or_else(truncated)?;
        let name = std::str::from_utf8(name).map_err(|_| StrataError::Format("NT_FILE path is not UTF-8".into()))?;
        if name.starts_with('/') {
            mappings.push((PathBuf::from(name), start, end));
        }
    }
    Ok(group(mappings))
}

/// Finds and reports debug info for a kernel target
pub trait KernelDebugInfo: Send + Sync
{
    /// Report `paths` and, with `auto`, whatever can be discovered for the
    /// kernel described by `vmcoreinfo`.
    ///
    /// Per-file failures go to the session; an `Err` aborts the whole report.
    fn report(
        &self,
        session: &mut ReportSession<'_>,
        paths: &[PathBuf],
        auto: bool,
        vmcoreinfo: Option<&VmcoreInfo>,
    ) -> Result<()>;
}

/// Default kernel discovery: look for `vmlinux` in the usual places
///
/// Templates contain `{release}`, replaced by the kernel release.
#[derive(Clone)]
pub struct VmlinuxSearch
{
    templates: Vec<String>,
}

impl VmlinuxSearch
{
    /// Search a custom list of path templates.
    pub fn with_templates(templates: impl IntoIterator<Item = impl Into<String>>) -> Self
    {
        VmlinuxSearch {
            templates: templates.into_iter().map(Into::into).collect(),
        }
    }

    /// Candidate paths for `release`, in search order.
    pub fn candidates(&self, release: &str) -> Vec<PathBuf>
    {
        self.templates
            .iter()
            .map(|template| PathBuf::from(template.replace("{release}", release)))
            .collect()
    }
}

impl Default for VmlinuxSearch
{
    fn default() -> Self
    {
        Self::with_templates([
            "/usr/lib/debug/boot/vmlinux-{release}",
            "/usr/lib/debug/lib/modules/{release}/vmlinux",
            "/boot/vmlinux-{release}",
            "/lib/modules/{release}/build/vmlinux",
            "/lib/modules/{release}/vmlinux",
        ])
    }
}

impl fmt::Debug for VmlinuxSearch
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_list().entries(&self.templates).finish()
    }
}

impl KernelDebugInfo for VmlinuxSearch
{
    fn report(
        &self,
        session: &mut ReportSession<'_>,
        paths: &[PathBuf],
        auto: bool,
        vmcoreinfo: Option<&VmcoreInfo>,
    ) -> Result<()>
    {
        let bias = vmcoreinfo.map_or(0, |info| info.kaslr_offset);
        for path in paths {
            session.report_elf(path, None, ModuleLoad::Biased { bias })?;
        }
        if !auto {
            return Ok(());
        }

        let Some(info) = vmcoreinfo else {
            session.report_error("kernel", "could not find vmlinux: kernel release is unknown");
            return Ok(());
        };
        match self.candidates(&info.osrelease).into_iter().find(|path| path.exists()) {
            Some(path) => {
                info!(path = %path.display(), "found vmlinux");
                session.report_elf(&path, Some("kernel"), ModuleLoad::Biased { bias })
            }
            None => {
                debug!(release = %info.osrelease, "no vmlinux in search path");
                session.report_error("kernel", "could not find vmlinux");
                Ok(())
            }
        }
    }
}
