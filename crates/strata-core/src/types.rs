//! # Types
//!
//! A small structural model of C-like types: enough to answer "what is the
//! element type of this pointer" and "where is this member", nothing more.
//! Values are not represented.
//!
//! Types reference each other through [`LazyType`]. A reference is either
//! already resolved or names a type to be looked up through the program's
//! [`TypeIndex`](crate::finder::TypeIndex) when it is first needed.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, StrataError};
use crate::finder::TypeIndex;

/// Kind of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind
{
    /// `void`
    Void,
    /// Integer
    Int,
    /// Boolean
    Bool,
    /// Floating point
    Float,
    /// `struct`
    Struct,
    /// `union`
    Union,
    /// `class`
    Class,
    /// `enum`
    Enum,
    /// `typedef`
    Typedef,
    /// Pointer
    Pointer,
    /// Array
    Array,
    /// Function
    Function,
}

impl TypeKind
{
    /// C keyword naming types of this kind, for tagged kinds.
    pub const fn keyword(self) -> Option<&'static str>
    {
        match self {
            TypeKind::Struct => Some("struct"),
            TypeKind::Union => Some("union"),
            TypeKind::Class => Some("class"),
            TypeKind::Enum => Some("enum"),
            _ => None,
        }
    }

    /// Whether types of this kind have members.
    pub const fn has_members(self) -> bool
    {
        matches!(self, TypeKind::Struct | TypeKind::Union | TypeKind::Class)
    }

    /// Split a type name into its tag keyword (if any) and the bare name.
    ///
    /// `"struct task_struct"` → `(Some(Struct), "task_struct")`, `"int"` →
    /// `(None, "int")`.
    pub fn parse_name(name: &str) -> (Option<TypeKind>, &str)
    {
        let name = name.trim();
        for kind in [TypeKind::Struct, TypeKind::Union, TypeKind::Class, TypeKind::Enum] {
            if let Some(keyword) = kind.keyword() {
                if let Some(rest) = name.strip_prefix(keyword) {
                    if rest.starts_with(char::is_whitespace) {
                        return (Some(kind), rest.trim_start());
                    }
                }
            }
        }
        (None, name)
    }
}

/// Reference from one type to another
#[derive(Debug, Clone)]
pub enum LazyType
{
    /// Already available
    Resolved(Arc<Type>),
    /// Looked up by name on first use
    Named
    {
        /// Tag kind, `None` for untagged names
        kind: Option<TypeKind>,
        /// Bare name
        name: String,
    },
}

impl LazyType
{
    /// Resolve the reference through `types`.
    ///
    /// ## Errors
    ///
    /// `Lookup` if a named reference cannot be found.
    pub fn resolve(&self, types: &TypeIndex) -> Result<Arc<Type>>
    {
        match self {
            LazyType::Resolved(ty) => Ok(Arc::clone(ty)),
            LazyType::Named { kind, name } => types.find(*kind, name, None),
        }
    }
}

impl From<Arc<Type>> for LazyType
{
    fn from(ty: Arc<Type>) -> Self
    {
        LazyType::Resolved(ty)
    }
}

/// Member of a struct, union or class
#[derive(Debug, Clone)]
pub struct Member
{
    /// Name, `None` for anonymous members
    pub name: Option<String>,
    /// Offset from the start of the containing type, in bits
    pub bit_offset: u64,
    /// Width of a bit field, zero otherwise
    pub bit_field_size: u64,
    /// Type of the member
    pub ty: LazyType,
}

/// A type
#[derive(Debug, Clone)]
pub struct Type
{
    /// Kind
    pub kind: TypeKind,
    /// Name, `None` for anonymous types
    pub name: Option<String>,
    /// Size in bytes, `None` if incomplete
    pub size: Option<u64>,
    /// Members of struct, union and class types
    pub members: Vec<Member>,
    /// Target of pointer and typedef types, element type of arrays
    pub target: Option<LazyType>,
    /// Number of elements of array types, `None` if incomplete
    pub length: Option<u64>,
}

impl Type
{
    fn new(kind: TypeKind, name: Option<String>) -> Self
    {
        Type {
            kind,
            name,
            size: None,
            members: Vec::new(),
            target: None,
            length: None,
        }
    }

    /// `void`.
    pub fn void() -> Self
    {
        Self::new(TypeKind::Void, Some("void".into()))
    }

    /// Base type (integer, boolean or floating point).
    pub fn base(kind: TypeKind, name: impl Into<String>, size: u64) -> Self
    {
        Type {
            size: Some(size),
            ..Self::new(kind, Some(name.into()))
        }
    }

    /// Struct, union or class with the given members.
    pub fn compound(kind: TypeKind, name: Option<String>, size: u64, members: Vec<Member>) -> Self
    {
        Type {
            size: Some(size),
            members,
            ..Self::new(kind, name)
        }
    }

    /// Tagged type with no definition.
    pub fn incomplete(kind: TypeKind, name: impl Into<String>) -> Self
    {
        Self::new(kind, Some(name.into()))
    }

    /// Enumeration with an integer size.
    pub fn enumeration(name: Option<String>, size: Option<u64>) -> Self
    {
        Type {
            size,
            ..Self::new(TypeKind::Enum, name)
        }
    }

    /// Typedef of `target`.
    pub fn typedef(name: impl Into<String>, target: impl Into<LazyType>) -> Self
    {
        Type {
            target: Some(target.into()),
            ..Self::new(TypeKind::Typedef, Some(name.into()))
        }
    }

    /// Pointer of `size` bytes to `target`.
    pub fn pointer(target: impl Into<LazyType>, size: u64) -> Self
    {
        Type {
            size: Some(size),
            target: Some(target.into()),
            ..Self::new(TypeKind::Pointer, None)
        }
    }

    /// Array of `length` elements, or incomplete with `None`.
    pub fn array(element: impl Into<LazyType>, length: Option<u64>) -> Self
    {
        Type {
            length,
            target: Some(element.into()),
            ..Self::new(TypeKind::Array, None)
        }
    }

    /// Function type.
    pub fn function(name: Option<String>) -> Self
    {
        Self::new(TypeKind::Function, name)
    }

    /// Whether the size of this type is known.
    pub fn is_complete(&self) -> bool
    {
        match self.kind {
            TypeKind::Void | TypeKind::Function => false,
            TypeKind::Array => self.length.is_some(),
            _ => self.size.is_some(),
        }
    }

    /// Size in bits, resolving typedefs and array elements.
    ///
    /// ## Errors
    ///
    /// `Type` if the type is incomplete.
    pub fn bit_size(&self, types: &TypeIndex) -> Result<u64>
    {
        match self.kind {
            TypeKind::Typedef => self.target(types)?.bit_size(types),
            TypeKind::Array => {
                let length = self.length.ok_or_else(|| self.incomplete_error())?;
                let element = self.target(types)?;
                Ok(length.saturating_mul(element.bit_size(types)?))
            }
            _ => self
                .size
                .map(|size| size.saturating_mul(8))
                .filter(|_| self.is_complete())
                .ok_or_else(|| self.incomplete_error()),
        }
    }

    fn incomplete_error(&self) -> StrataError
    {
        StrataError::Type(format!("cannot get size of incomplete {self} type"))
    }

    /// Resolved target of a pointer, typedef or array.
    ///
    /// ## Errors
    ///
    /// `Type` if this type has no target, `Lookup` if it cannot be resolved.
    pub fn target(&self, types: &TypeIndex) -> Result<Arc<Type>>
    {
        self.target
            .as_ref()
            .ok_or_else(|| StrataError::Type(format!("{self} type does not have a referenced type")))?
            .resolve(types)
    }
}

/// Strip typedefs from `ty`.
///
/// ## Errors
///
/// `Lookup` if a typedef target cannot be resolved.
pub fn underlying(ty: Arc<Type>, types: &TypeIndex) -> Result<Arc<Type>>
{
    let mut ty = ty;
    while ty.kind == TypeKind::Typedef {
        ty = ty.target(types)?;
    }
    Ok(ty)
}

impl fmt::Display for Type
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match (self.kind, &self.name) {
            (TypeKind::Pointer, _) => f.write_str("pointer"),
            (TypeKind::Array, _) => f.write_str("array"),
            (kind, Some(name)) => match kind.keyword() {
                Some(keyword) => write!(f, "{keyword} {name}"),
                None => f.write_str(name),
            },
            (kind, None) => match kind.keyword() {
                Some(keyword) => write!(f, "anonymous {keyword}"),
                None => write!(f, "{kind:?}"),
            },
        }
    }
}

/// Result of [`Program::member_info`](crate::Program::member_info)
#[derive(Debug, Clone)]
pub struct MemberInfo
{
    /// Type of the member
    pub ty: Arc<Type>,
    /// Offset from the start of the outer type, in bits
    pub bit_offset: u64,
    /// Bit field width, zero otherwise
    pub bit_field_size: u64,
}

/// Result of [`Program::element_info`](crate::Program::element_info)
#[derive(Debug, Clone)]
pub struct ElementInfo
{
    /// Element type
    pub ty: Arc<Type>,
    /// Size of one element in bits
    pub bit_size: u64,
}

/// Find `name` in `ty`, descending into anonymous members.
pub(crate) fn find_member(ty: &Type, name: &str, types: &TypeIndex) -> Result<Option<MemberInfo>>
{
    for member in &ty.members {
        match &member.name {
            Some(member_name) if member_name == name => {
                return Ok(Some(MemberInfo {
                    ty: member.ty.resolve(types)?,
                    bit_offset: member.bit_offset,
                    bit_field_size: member.bit_field_size,
                }));
            }
            Some(_) => {}
            None => {
                let inner = underlying(member.ty.resolve(types)?, types)?;
                if inner.kind.has_members() {
                    if let Some(mut found) = find_member(&inner, name, types)? {
                        found.bit_offset += member.bit_offset;
                        return Ok(Some(found));
                    }
                }
            }
        }
    }
    Ok(None)
}
