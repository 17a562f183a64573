//! # Debug-Info Index
//!
//! Holds the ELF modules of a target and answers symbol, object and type
//! lookups from them.
//!
//! Modules are added through a [`ReportSession`]: begin, report files and
//! failures, then [`ReportSession::finish`]. Dropping a session without finishing
//! it discards everything it reported.
//!
//! ## Missing debug info
//!
//! Finishing a session that could not open a file, or that loaded a module
//! without DWARF, returns [`StrataError::MissingDebugInfo`]. Modules that did
//! load stay indexed; the error only describes what is missing.

pub mod discovery;
mod dwarf;
pub mod module;

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use gimli::{Dwarf, EndianArcSlice, RunTimeEndian};
use tracing::{debug, info, warn};

pub use self::discovery::{KernelDebugInfo, MappedFile, VmlinuxSearch};
pub use self::module::{DebugModule, ModuleLoad};
use crate::error::{Result, StrataError};
use crate::finder::{ObjectFinder, TypeFinder};
use crate::object::{FindObjectFlags, Object, Symbol};
use crate::platform::Platform;
use crate::types::{Type, TypeKind};

type OwnedReader = EndianArcSlice<RunTimeEndian>;
type OwnedDwarf = Dwarf<OwnedReader>;

/// How many modules a missing debug info message names before summarizing.
const MAX_MISSING_NAMED: usize = 5;

/// Where modules come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPolicy
{
    /// Linux kernel (vmcore, kdump or `/proc/kcore`)
    Kernel,
    /// Running userspace process
    LiveProcess,
    /// Userspace core dump
    CoreDump,
}

/// Loaded modules of one program
#[derive(Debug)]
pub struct DebugInfoIndex
{
    policy: DiscoveryPolicy,
    modules: RwLock<Vec<Arc<DebugModule>>>,
}

impl DebugInfoIndex
{
    /// Create an empty index.
    pub fn new(policy: DiscoveryPolicy) -> Self
    {
        DebugInfoIndex {
            policy,
            modules: RwLock::new(Vec::new()),
        }
    }

    /// Discovery policy the index was created with.
    pub fn policy(&self) -> DiscoveryPolicy
    {
        self.policy
    }

    /// Start reporting modules.
    pub fn begin_report(&self) -> ReportSession<'_>
    {
        ReportSession {
            index: self,
            pending: Vec::new(),
            missing: Vec::new(),
            active: true,
        }
    }

    /// Loaded modules, in report order.
    pub fn modules(&self) -> Vec<Arc<DebugModule>>
    {
        self.modules.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Module whose address range contains `address`.
    pub fn module_containing(&self, address: u64) -> Option<Arc<DebugModule>>
    {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|module| module.contains(address))
            .cloned()
    }

    /// Symbol containing `address`.
    ///
    /// ## Errors
    ///
    /// `SymbolNotFound` if no module or no symbol contains the address.
    pub fn find_symbol(&self, address: u64) -> Result<Symbol>
    {
        self.module_containing(address)
            .and_then(|module| module.symbol_at(address))
            .ok_or(StrataError::SymbolNotFound { address })
    }

    /// Platform of the first module with DWARF.
    pub fn first_platform(&self) -> Option<Platform>
    {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|module| module.has_debug_info())
            .map(|module| module.platform())
    }

    fn matching_modules(&self, filename: Option<&str>) -> Vec<Arc<DebugModule>>
    {
        self.modules()
            .into_iter()
            .filter(|module| filename.is_none_or(|filename| module_matches(module, filename)))
            .collect()
    }
}

fn module_matches(module: &DebugModule, filename: &str) -> bool
{
    module.name() == filename || module.path().ends_with(Path::new(filename))
}

/// An open batch of module reports
///
/// Nothing reaches the index until [`finish`](Self::finish).
pub struct ReportSession<'a>
{
    index: &'a DebugInfoIndex,
    pending: Vec<Arc<DebugModule>>,
    missing: Vec<(String, String)>,
    active: bool,
}

impl ReportSession<'_>
{
    /// Load the ELF file at `path`.
    ///
    /// Open and parse failures are recorded against the file and do not fail
    /// the session.
    ///
    /// ## Errors
    ///
    /// `OutOfMemory` only; everything else is recorded.
    pub fn report_elf(&mut self, path: &Path, name: Option<&str>, load: ModuleLoad) -> Result<()>
    {
        match DebugModule::open(path, name, load) {
            Ok(module) => {
                debug!(module = %module.name(), symbols = ?module.address_range(), "loaded module");
                self.report_module(Arc::new(module));
                Ok(())
            }
            Err(StrataError::OutOfMemory) => Err(StrataError::OutOfMemory),
            Err(err) => {
                let name = name.map_or_else(|| path.display().to_string(), str::to_string);
                debug!(module = %name, error = %err, "could not load module");
                self.report_error(&name, &err.to_string());
                Ok(())
            }
        }
    }

    /// Add an already loaded module.
    pub fn report_module(&mut self, module: Arc<DebugModule>)
    {
        self.pending.push(module);
    }

    /// Record that debug info for `name` could not be loaded.
    pub fn report_error(&mut self, name: &str, message: &str)
    {
        self.missing.push((name.to_string(), message.to_string()));
    }

    /// Number of modules reported so far.
    pub fn pending(&self) -> usize
    {
        self.pending.len()
    }

    /// Commit the reported modules.
    ///
    /// With `finalize`, the index is re-sorted by load address and every
    /// module after the first for the same file and range is dropped.
    ///
    /// ## Errors
    ///
    /// `MissingDebugInfo` if any report failed or a module has no DWARF. The
    /// modules are committed regardless.
    pub fn finish(mut self, finalize: bool) -> Result<()>
    {
        self.active = false;
        let pending = std::mem::take(&mut self.pending);
        let mut missing = std::mem::take(&mut self.missing);
        for module in &pending {
            if !module.has_debug_info() {
                missing.push((module.name().to_string(), "no debugging sections".to_string()));
            }
        }

        {
            let mut modules = self.index.modules.write().unwrap_or_else(PoisonError::into_inner);
            modules.extend(pending);
            if finalize {
                modules.sort_by_key(|module| module.address_range().map_or(u64::MAX, |(start, _)| start));
                let mut seen = HashSet::new();
                modules.retain(|module| seen.insert((module.path().to_path_buf(), module.address_range())));
            }
            info!(modules = modules.len(), missing = missing.len(), "debug info report finished");
        }

        if missing.is_empty() {
            return Ok(());
        }
        Err(StrataError::MissingDebugInfo(missing_message(&missing)))
    }
}

impl Drop for ReportSession<'_>
{
    fn drop(&mut self)
    {
        if self.active && !self.pending.is_empty() {
            warn!(discarded = self.pending.len(), "debug info report aborted");
        }
    }
}

fn missing_message(missing: &[(String, String)]) -> String
{
    let mut message = String::from("missing debugging information for:");
    for (name, reason) in missing.iter().take(MAX_MISSING_NAMED) {
        let _ = write!(message, "\n{name} ({reason})");
    }
    let rest = missing.len().saturating_sub(MAX_MISSING_NAMED);
    if rest > 0 {
        let _ = write!(message, "\n... {rest} more");
    }
    message
}

/// Type lookups from the DWARF of indexed modules
#[derive(Debug)]
pub struct DwarfTypeFinder(pub Arc<DebugInfoIndex>);

impl TypeFinder for DwarfTypeFinder
{
    fn find_type(&self, kind: Option<TypeKind>, name: &str, filename: Option<&str>) -> Result<Option<Arc<Type>>>
    {
        for module in self.0.matching_modules(filename) {
            if let Some(ty) = module.find_type(kind, name)? {
                return Ok(Some(ty));
            }
        }
        Ok(None)
    }
}

/// Function and variable lookups from the symbol tables of indexed modules
#[derive(Debug)]
pub struct SymbolObjectFinder(pub Arc<DebugInfoIndex>);

impl ObjectFinder for SymbolObjectFinder
{
    fn find_object(&self, name: &str, filename: Option<&str>, flags: FindObjectFlags, out: &mut Object)
    -> Result<bool>
    {
        for module in self.0.matching_modules(filename) {
            if let Some((symbol, kind)) = module.symbol_named(name) {
                if !kind.matches(flags) {
                    continue;
                }
                out.set_reference(kind, symbol.name, symbol.address, Some(symbol.size).filter(|&size| size != 0));
                return Ok(true);
            }
        }
        Ok(false)
    }
}
