//! # Program
//!
//! [`Program`] ties a target's memory to the debug info describing it.
//!
//! ## Lifecycle
//!
//! 1. Create an empty program, optionally with a known [`Platform`]
//! 2. Populate its memory exactly once: [`Program::set_core_dump`],
//!    [`Program::set_kernel`], [`Program::set_pid`] or custom segments through
//!    [`Program::add_memory_segment`]
//! 3. Load debug info any number of times ([`Program::load_debug_info`])
//! 4. Read memory and look up symbols, objects and types
//!
//! The `from_*` constructors do steps 1 to 3 in one go and ignore missing debug
//! info, so a program without any still reads memory.
//!
//! ## Platform
//!
//! The platform is set at most once. An explicit platform wins; otherwise the
//! target's ELF header decides; otherwise the first module carrying DWARF does.
//!
//! ## Threading
//!
//! Setup takes `&mut self`; a program is driven from one thread at a time.

use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, info};

use crate::config::ProgramConfig;
use crate::debuginfo::discovery::{parse_file_note, parse_proc_maps, MappedFile};
use crate::debuginfo::{DebugInfoIndex, DiscoveryPolicy, DwarfTypeFinder, ModuleLoad, SymbolObjectFinder};
use crate::error::{Result, StrataError};
use crate::finder::{ObjectFinder, ObjectIndex, TypeFinder, TypeIndex};
use crate::memory::{AddressSpace, Backing, MemoryRead, MemoryReader};
use crate::object::{FindObjectFlags, Object, ProgramId, Symbol};
use crate::platform::Platform;
use crate::target::{self, Acquired, FileNote, TargetSource};
use crate::types::{find_member, underlying, ElementInfo, MemberInfo, Type, TypeKind};
use crate::vmcoreinfo::VmcoreInfo;

/// Name the debug-info index registers its finders under.
pub const DEBUG_INFO_FINDER: &str = "debuginfo";

bitflags! {
    /// What kind of target a program is attached to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProgramFlags: u32
    {
        /// The target is a Linux kernel
        const IS_LINUX_KERNEL = 1 << 0;
        /// The target is running
        const IS_LIVE = 1 << 1;
    }
}

/// A program being debugged
#[derive(Debug)]
pub struct Program
{
    id: ProgramId,
    config: ProgramConfig,
    platform: Option<Platform>,
    flags: ProgramFlags,
    source: Option<TargetSource>,
    memory: MemoryReader,
    vmcoreinfo: Option<VmcoreInfo>,
    file_note: Option<FileNote>,
    pid: Option<u32>,
    types: TypeIndex,
    objects: ObjectIndex,
    debug_info: Option<Arc<DebugInfoIndex>>,
}

impl Default for Program
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl Program
{
    /// Create an empty program with the default configuration.
    pub fn new() -> Self
    {
        Self::with_config(ProgramConfig::default())
    }

    /// Create an empty program with an explicit configuration.
    pub fn with_config(config: ProgramConfig) -> Self
    {
        Program {
            id: ProgramId::next(),
            config,
            platform: None,
            flags: ProgramFlags::empty(),
            source: None,
            memory: MemoryReader::new(),
            vmcoreinfo: None,
            file_note: None,
            pid: None,
            types: TypeIndex::new(),
            objects: ObjectIndex::new(),
            debug_info: None,
        }
    }

    /// Create an empty program whose platform is already known.
    pub fn with_platform(platform: Platform) -> Self
    {
        let mut program = Self::new();
        program.platform = Some(platform);
        program
    }

    /// Open a core dump or vmcore and load whatever debug info can be found.
    ///
    /// ## Errors
    ///
    /// Everything [`set_core_dump`](Self::set_core_dump) and
    /// [`load_debug_info`](Self::load_debug_info) return, except missing debug
    /// info.
    pub fn from_core_dump(path: impl AsRef<Path>) -> Result<Self>
    {
        let mut program = Self::new();
        program.init_core_dump(path)?;
        Ok(program)
    }

    /// Attach to the running kernel and load whatever debug info can be found.
    ///
    /// ## Errors
    ///
    /// See [`from_core_dump`](Self::from_core_dump).
    pub fn from_kernel() -> Result<Self>
    {
        let mut program = Self::new();
        program.init_kernel()?;
        Ok(program)
    }

    /// Attach to a running process and load whatever debug info can be found.
    ///
    /// ## Errors
    ///
    /// See [`from_core_dump`](Self::from_core_dump).
    pub fn from_pid(pid: u32) -> Result<Self>
    {
        let mut program = Self::new();
        program.init_pid(pid)?;
        Ok(program)
    }

    /// Process-unique identifier of this program.
    pub fn id(&self) -> ProgramId
    {
        self.id
    }

    /// Target classification.
    pub fn flags(&self) -> ProgramFlags
    {
        self.flags
    }

    /// Platform, if known yet.
    pub fn platform(&self) -> Option<Platform>
    {
        self.platform
    }

    /// Kernel metadata of a kernel target.
    pub fn vmcoreinfo(&self) -> Option<&VmcoreInfo>
    {
        self.vmcoreinfo.as_ref()
    }

    /// Process id of a live process target.
    pub fn pid(&self) -> Option<u32>
    {
        self.pid
    }

    /// Where memory comes from, once a target is set.
    pub fn source(&self) -> Option<&TargetSource>
    {
        self.source.as_ref()
    }

    /// Address space of the target.
    pub fn memory(&self) -> &MemoryReader
    {
        &self.memory
    }

    /// Configuration the program was created with.
    pub fn config(&self) -> &ProgramConfig
    {
        &self.config
    }

    /// Type finders.
    pub fn types(&self) -> &TypeIndex
    {
        &self.types
    }

    /// Object finders.
    pub fn objects(&self) -> &ObjectIndex
    {
        &self.objects
    }

    /// Debug-info index, if one has been created.
    pub fn debug_info(&self) -> Option<&Arc<DebugInfoIndex>>
    {
        self.debug_info.as_ref()
    }

    /// Map `size` bytes at `start` to a custom reader.
    ///
    /// Segments added later take precedence where they overlap.
    pub fn add_memory_segment(&mut self, start: u64, size: u64, reader: Arc<dyn MemoryRead>, physical: bool)
    {
        self.memory
            .add_segment(AddressSpace::from_physical(physical), start, size, Backing::Callback(reader));
    }

    /// Register a type finder in front of the existing ones.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if `name` is taken.
    pub fn add_type_finder(&self, name: &str, finder: Arc<dyn TypeFinder>) -> Result<()>
    {
        self.types.add(name, finder)
    }

    /// Register an object finder in front of the existing ones.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if `name` is taken.
    pub fn add_object_finder(&self, name: &str, finder: Arc<dyn ObjectFinder>) -> Result<()>
    {
        self.objects.add(name, finder)
    }

    fn ensure_unpopulated(&self) -> Result<()>
    {
        if self.source.is_some() || !self.memory.is_empty() {
            return Err(StrataError::InvalidArgument("program memory was already initialized".into()));
        }
        Ok(())
    }

    fn install(&mut self, acquired: Acquired)
    {
        debug!(source = ?acquired.source, flags = ?acquired.flags, segments = acquired.memory.segments().len(), "installing target");
        self.source = Some(acquired.source);
        self.memory = acquired.memory;
        self.flags = acquired.flags;
        self.vmcoreinfo = acquired.vmcoreinfo;
        self.file_note = acquired.file_note;
        self.pid = acquired.pid;
        if self.platform.is_none() {
            self.platform = acquired.platform;
        }
    }

    /// Use a core dump, kdump vmcore or kernel snapshot as the target.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument` if memory was already initialized
    /// - `Os` if the file cannot be opened or read
    /// - `Format` if it is not a core file or its notes are malformed
    ///
    /// The program is unchanged on error.
    pub fn set_core_dump(&mut self, path: impl AsRef<Path>) -> Result<()>
    {
        self.ensure_unpopulated()?;
        let path = path.as_ref();
        let acquired = target::acquire_core_dump(path, &self.config)?;
        self.install(acquired);
        info!(path = %path.display(), flags = ?self.flags, "opened core dump");
        Ok(())
    }

    /// Use the running kernel as the target.
    ///
    /// ## Errors
    ///
    /// See [`set_core_dump`](Self::set_core_dump).
    pub fn set_kernel(&mut self) -> Result<()>
    {
        self.ensure_unpopulated()?;
        let acquired = target::acquire_kernel(&self.config)?;
        self.install(acquired);
        info!(flags = ?self.flags, "attached to running kernel");
        Ok(())
    }

    /// Use a running process as the target.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument` if memory was already initialized
    /// - `Os` if the process memory file cannot be opened
    pub fn set_pid(&mut self, pid: u32) -> Result<()>
    {
        self.ensure_unpopulated()?;
        let acquired = target::acquire_process(pid, &self.config)?;
        self.install(acquired);
        info!(pid, "attached to process");
        Ok(())
    }

    /// [`set_core_dump`](Self::set_core_dump), then load debug info.
    ///
    /// ## Errors
    ///
    /// Everything except missing debug info.
    pub fn init_core_dump(&mut self, path: impl AsRef<Path>) -> Result<()>
    {
        self.set_core_dump(path)?;
        self.bootstrap_debug_info()
    }

    /// [`set_kernel`](Self::set_kernel), then load debug info.
    ///
    /// ## Errors
    ///
    /// Everything except missing debug info.
    pub fn init_kernel(&mut self) -> Result<()>
    {
        self.set_kernel()?;
        self.bootstrap_debug_info()
    }

    /// [`set_pid`](Self::set_pid), then load debug info.
    ///
    /// ## Errors
    ///
    /// Everything except missing debug info.
    pub fn init_pid(&mut self, pid: u32) -> Result<()>
    {
        self.set_pid(pid)?;
        self.bootstrap_debug_info()
    }

    fn bootstrap_debug_info(&mut self) -> Result<()>
    {
        match self.load_debug_info(&[], true) {
            Err(StrataError::MissingDebugInfo(message)) => {
                info!(%message, "continuing without some debug info");
                Ok(())
            }
            result => result,
        }
    }

    fn discovery_policy(&self) -> DiscoveryPolicy
    {
        if self.flags.contains(ProgramFlags::IS_LINUX_KERNEL) {
            DiscoveryPolicy::Kernel
        } else if self.flags.contains(ProgramFlags::IS_LIVE) {
            DiscoveryPolicy::LiveProcess
        } else {
            DiscoveryPolicy::CoreDump
        }
    }

    /// Debug-info index of this program, created on first use.
    ///
    /// Creating the index registers it as both a type finder and an object
    /// finder named [`DEBUG_INFO_FINDER`].
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if that name is already taken by another finder; no
    /// registration is left behind.
    pub fn debug_info_index(&mut self) -> Result<Arc<DebugInfoIndex>>
    {
        if let Some(index) = &self.debug_info {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(DebugInfoIndex::new(self.discovery_policy()));
        let types = self
            .types
            .register(DEBUG_INFO_FINDER, Arc::new(DwarfTypeFinder(Arc::clone(&index))))?;
        let objects = self
            .objects
            .register(DEBUG_INFO_FINDER, Arc::new(SymbolObjectFinder(Arc::clone(&index))))?;
        types.keep();
        objects.keep();
        debug!(policy = ?index.policy(), "created debug info index");
        self.debug_info = Some(Arc::clone(&index));
        Ok(index)
    }

    /// Load debug info from `paths` and, with `auto`, from whatever the target
    /// says it has loaded.
    ///
    /// Files that fail to open are reported in the resulting error rather than
    /// stopping the others from loading.
    ///
    /// ## Errors
    ///
    /// - `MissingDebugInfo` if some file could not be loaded or carries no
    ///   DWARF; the rest are indexed
    /// - `InvalidArgument` if the index cannot be registered
    /// - `Os` if module discovery fails
    pub fn load_debug_info(&mut self, paths: &[PathBuf], auto: bool) -> Result<()>
    {
        if paths.is_empty() && !auto {
            return Ok(());
        }
        let index = self.debug_info_index()?;
        let result = self.report_debug_info(&index, paths, auto);
        if matches!(result, Ok(()) | Err(StrataError::MissingDebugInfo(_))) && self.platform.is_none() {
            self.platform = index.first_platform();
            if let Some(platform) = self.platform {
                debug!(%platform, "platform taken from debug info");
            }
        }
        result
    }

    fn report_debug_info(&self, index: &DebugInfoIndex, paths: &[PathBuf], auto: bool) -> Result<()>
    {
        let mut session = index.begin_report();
        let policy = index.policy();
        if policy == DiscoveryPolicy::Kernel {
            self.config
                .kernel_debug_info
                .report(&mut session, paths, auto, self.vmcoreinfo.as_ref())?;
            return session.finish(false);
        }

        for path in paths {
            session.report_elf(path, None, ModuleLoad::Unloaded)?;
        }
        if auto {
            for file in self.mapped_files(policy)? {
                let load = ModuleLoad::Mapped {
                    start: file.start,
                    end: file.end,
                };
                session.report_elf(&file.path, None, load)?;
            }
        }
        session.finish(auto)
    }

    fn mapped_files(&self, policy: DiscoveryPolicy) -> Result<Vec<MappedFile>>
    {
        match (policy, self.pid, &self.file_note) {
            (DiscoveryPolicy::LiveProcess, Some(pid), _) => {
                let path = self.config.proc_root.join(pid.to_string()).join("maps");
                let contents = fs::read_to_string(&path).map_err(|err| StrataError::os("open", &path, err))?;
                Ok(parse_proc_maps(&contents))
            }
            (DiscoveryPolicy::CoreDump, _, Some(note)) => parse_file_note(note),
            _ => Ok(Vec::new()),
        }
    }

    /// Read `buf.len()` bytes at `address`.
    ///
    /// ## Errors
    ///
    /// `Fault` if any byte is unmapped or unreadable; `buf` is unchanged then.
    pub fn read_memory(&self, buf: &mut [u8], address: u64, physical: bool) -> Result<()>
    {
        self.memory.read(buf, address, physical)
    }

    /// Read a NUL-terminated string of at most `max_length` bytes including
    /// the terminator.
    ///
    /// A string that does not terminate in time is cut at `max_length - 1`
    /// bytes.
    ///
    /// ## Errors
    ///
    /// `Fault` if any byte up to the terminator cannot be read.
    pub fn read_string(&self, address: u64, physical: bool, max_length: usize) -> Result<CString>
    {
        let mut bytes = Vec::new();
        let mut address = address;
        while bytes.len() + 1 < max_length {
            let mut byte = [0u8; 1];
            self.memory.read(&mut byte, address, physical)?;
            if byte[0] == 0 {
                break;
            }
            bytes.try_reserve(1)?;
            bytes.push(byte[0]);
            address = address.wrapping_add(1);
        }
        CString::new(bytes).map_err(|err| StrataError::Format(err.to_string()))
    }

    /// Look up a type by its C spelling, e.g. `struct task_struct` or `int`.
    ///
    /// ## Errors
    ///
    /// `Lookup` if no finder knows the type.
    pub fn find_type(&self, name: &str, filename: Option<&str>) -> Result<Arc<Type>>
    {
        let (kind, name) = TypeKind::parse_name(name);
        self.types.find(kind, name, filename)
    }

    /// Look up a function, variable or constant.
    ///
    /// ## Errors
    ///
    /// `Lookup` if no finder knows the object.
    pub fn find_object(&self, name: &str, filename: Option<&str>, flags: FindObjectFlags) -> Result<Object>
    {
        let mut out = Object::new(self.id);
        self.objects.find(name, filename, flags, &mut out)?;
        Ok(out)
    }

    /// Look up an object into an existing [`Object`].
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if `out` belongs to another program, `Lookup` on a
    /// miss.
    pub fn find_object_into(
        &self,
        out: &mut Object,
        name: &str,
        filename: Option<&str>,
        flags: FindObjectFlags,
    ) -> Result<()>
    {
        if out.program() != self.id {
            return Err(StrataError::InvalidArgument("object is from wrong program".into()));
        }
        self.objects.find(name, filename, flags, out)
    }

    /// Symbol containing `address`.
    ///
    /// ## Errors
    ///
    /// `SymbolNotFound` if no loaded module has one.
    pub fn find_symbol(&self, address: u64) -> Result<Symbol>
    {
        match &self.debug_info {
            Some(index) => index.find_symbol(address),
            None => Err(StrataError::SymbolNotFound { address }),
        }
    }

    /// Element type of a pointer or array, looking through typedefs.
    ///
    /// ## Errors
    ///
    /// `Type` for other kinds or an incomplete element type.
    pub fn element_info(&self, ty: &Arc<Type>) -> Result<ElementInfo>
    {
        let ty = underlying(Arc::clone(ty), &self.types)?;
        if !matches!(ty.kind, TypeKind::Pointer | TypeKind::Array) {
            return Err(StrataError::Type(format!("{ty} is not a pointer or array")));
        }
        let element = ty.target(&self.types)?;
        let bit_size = element.bit_size(&self.types)?;
        Ok(ElementInfo { ty: element, bit_size })
    }

    /// Type and offset of member `name`, searching anonymous members too.
    ///
    /// ## Errors
    ///
    /// `Type` if `ty` is not a struct, union or class; `Lookup` if it has no
    /// such member.
    pub fn member_info(&self, ty: &Arc<Type>, name: &str) -> Result<MemberInfo>
    {
        let ty = underlying(Arc::clone(ty), &self.types)?;
        if !ty.kind.has_members() {
            return Err(StrataError::Type(format!("{ty} does not have members")));
        }
        find_member(&ty, name, &self.types)?
            .ok_or_else(|| StrataError::Lookup(format!("{ty} has no member '{name}'")))
    }
}
