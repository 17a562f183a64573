//! # Objects and Symbols
//!
//! An [`Object`] is a named entity found by name lookup: a function, a variable
//! or a constant. Objects remember which program produced them, so one cannot
//! be filled in by a lookup on a different program.
//!
//! A [`Symbol`] is an ELF symbol-table entry relocated into the target's
//! address space.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use rustc_demangle::try_demangle;

use crate::types::Type;

/// Process-unique identity of a [`Program`](crate::Program)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(u64);

impl ProgramId
{
    pub(crate) fn next() -> Self
    {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ProgramId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

bitflags! {
    /// Which kinds of object a name lookup may return.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FindObjectFlags: u32
    {
        /// Enumerators and other constants
        const CONSTANT = 1 << 0;
        /// Functions
        const FUNCTION = 1 << 1;
        /// Variables
        const VARIABLE = 1 << 2;
        /// Anything
        const ANY = Self::CONSTANT.bits() | Self::FUNCTION.bits() | Self::VARIABLE.bits();
    }
}

/// What an object is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind
{
    /// Nothing has been found yet
    Absent,
    /// Function at an address
    Function,
    /// Variable at an address
    Variable,
    /// Constant value
    Constant,
}

impl ObjectKind
{
    /// Whether `flags` admit this kind.
    pub fn matches(self, flags: FindObjectFlags) -> bool
    {
        match self {
            ObjectKind::Absent => false,
            ObjectKind::Function => flags.contains(FindObjectFlags::FUNCTION),
            ObjectKind::Variable => flags.contains(FindObjectFlags::VARIABLE),
            ObjectKind::Constant => flags.contains(FindObjectFlags::CONSTANT),
        }
    }
}

/// A named entity of one program
#[derive(Debug, Clone)]
pub struct Object
{
    program: ProgramId,
    kind: ObjectKind,
    name: Option<String>,
    address: Option<u64>,
    size: Option<u64>,
    value: Option<i64>,
    ty: Option<Arc<Type>>,
}

impl Object
{
    /// An absent object bound to `program`.
    pub fn new(program: ProgramId) -> Self
    {
        Object {
            program,
            kind: ObjectKind::Absent,
            name: None,
            address: None,
            size: None,
            value: None,
            ty: None,
        }
    }

    /// Program this object belongs to.
    pub fn program(&self) -> ProgramId
    {
        self.program
    }

    /// Kind.
    pub fn kind(&self) -> ObjectKind
    {
        self.kind
    }

    /// Name, once found.
    pub fn name(&self) -> Option<&str>
    {
        self.name.as_deref()
    }

    /// Address of a function or variable.
    pub fn address(&self) -> Option<u64>
    {
        self.address
    }

    /// Size in bytes, if known.
    pub fn size(&self) -> Option<u64>
    {
        self.size
    }

    /// Value of a constant.
    pub fn value(&self) -> Option<i64>
    {
        self.value
    }

    /// Type, if known.
    pub fn ty(&self) -> Option<&Arc<Type>>
    {
        self.ty.as_ref()
    }

    /// Turn this into a function or variable at `address`.
    pub fn set_reference(&mut self, kind: ObjectKind, name: impl Into<String>, address: u64, size: Option<u64>)
    {
        self.kind = kind;
        self.name = Some(name.into());
        self.address = Some(address);
        self.size = size;
        self.value = None;
        self.ty = None;
    }

    /// Turn this into a constant.
    pub fn set_constant(&mut self, name: impl Into<String>, value: i64, ty: Option<Arc<Type>>)
    {
        self.kind = ObjectKind::Constant;
        self.name = Some(name.into());
        self.address = None;
        self.size = ty.as_ref().and_then(|ty| ty.size);
        self.value = Some(value);
        self.ty = ty;
    }

    /// Attach a type.
    pub fn set_type(&mut self, ty: Arc<Type>)
    {
        self.ty = Some(ty);
    }
}

/// ELF symbol in the target's address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol
{
    /// Raw (possibly mangled) name
    pub name: String,
    /// Start address
    pub address: u64,
    /// Size in bytes, zero when the symbol table does not say
    pub size: u64,
}

impl Symbol
{
    /// Whether `address` falls inside this symbol.
    pub fn contains(&self, address: u64) -> bool
    {
        address >= self.address && address - self.address < self.size.max(1)
    }

    /// Demangled name, or the raw name for symbols that are not Rust-mangled.
    pub fn demangled(&self) -> String
    {
        try_demangle(&self.name).map_or_else(|_| self.name.clone(), |d| format!("{d:#}"))
    }
}

impl fmt::Display for Symbol
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{} (0x{:x}+0x{:x})", self.demangled(), self.address, self.size)
    }
}
