//! DWARF type lookup by name.
//!
//! Only named base types, structs, unions, classes, enums and typedefs are
//! indexed. Member and typedef targets that are themselves named become
//! [`LazyType::Named`] references; anonymous ones (pointers, arrays, unnamed
//! structs) are built in place.

use std::sync::Arc;

use gimli::{
    constants, AttributeValue, DebugTypeSignature, DebuggingInformationEntry, Reader, Unit, UnitOffset,
    UnitSectionOffset, UnitType,
};

use super::{OwnedDwarf, OwnedReader};
use crate::error::{Result, StrataError};
use crate::types::{LazyType, Member, Type, TypeKind};

const MAX_TYPE_REF_DEPTH: usize = 32;

type Entry<'abbrev, 'unit> = DebuggingInformationEntry<'abbrev, 'unit, OwnedReader>;

fn map_dwarf_error(context: &str, err: gimli::Error) -> StrataError
{
    StrataError::Format(format!("{context}: {err}"))
}

fn tag_kind(tag: constants::DwTag) -> Option<TypeKind>
{
    match tag {
        constants::DW_TAG_structure_type => Some(TypeKind::Struct),
        constants::DW_TAG_union_type => Some(TypeKind::Union),
        constants::DW_TAG_class_type => Some(TypeKind::Class),
        constants::DW_TAG_enumeration_type => Some(TypeKind::Enum),
        _ => None,
    }
}

pub(crate) struct TypeExtractor<'a>
{
    dwarf: &'a OwnedDwarf,
    units: &'a [Unit<OwnedReader>],
    pointer_size: u64,
}

impl<'a> TypeExtractor<'a>
{
    pub(crate) fn new(dwarf: &'a OwnedDwarf, units: &'a [Unit<OwnedReader>], pointer_size: u64) -> Self
    {
        Self {
            dwarf,
            units,
            pointer_size,
        }
    }

    /// Find a definition of `name`. Falls back to a declaration when no unit
    /// defines the type.
    pub(crate) fn find(&self, kind: Option<TypeKind>, name: &str) -> Result<Option<Type>>
    {
        let mut declared = false;
        for unit in self.units {
            let mut cursor = unit.entries();
            while let Some((_delta, entry)) = cursor.next_dfs().map_err(|err| map_dwarf_error("traversing DIE tree", err))? {
                let matches_kind = match kind {
                    Some(kind) => tag_kind(entry.tag()) == Some(kind),
                    None => matches!(entry.tag(), constants::DW_TAG_base_type | constants::DW_TAG_typedef),
                };
                if !matches_kind {
                    continue;
                }
                if self.entry_name(unit, entry)?.as_deref() != Some(name) {
                    continue;
                }
                if Self::is_declaration(entry)? {
                    declared = true;
                    continue;
                }
                let entry = entry.clone();
                return self.build_type(unit, &entry, 0).map(Some);
            }
        }
        Ok(match kind {
            Some(kind) if declared => Some(Type::incomplete(kind, name)),
            _ => None,
        })
    }

    fn build_type(&self, unit: &Unit<OwnedReader>, entry: &Entry<'_, '_>, depth: usize) -> Result<Type>
    {
        let name = self.entry_name(unit, entry)?;
        let size = Self::udata(entry, constants::DW_AT_byte_size)?;
        match entry.tag() {
            constants::DW_TAG_base_type => {
                let kind = match entry
                    .attr_value(constants::DW_AT_encoding)
                    .map_err(|err| map_dwarf_error("reading DW_AT_encoding", err))?
                {
                    Some(AttributeValue::Encoding(constants::DW_ATE_boolean)) => TypeKind::Bool,
                    Some(AttributeValue::Encoding(
                        constants::DW_ATE_float | constants::DW_ATE_complex_float | constants::DW_ATE_decimal_float,
                    )) => TypeKind::Float,
                    _ => TypeKind::Int,
                };
                Ok(Type::base(kind, name.unwrap_or_default(), size.unwrap_or(0)))
            }
            constants::DW_TAG_typedef => {
                let target = self.type_ref(unit, entry, depth)?;
                Ok(Type::typedef(name.unwrap_or_default(), target))
            }
            constants::DW_TAG_enumeration_type => Ok(Type::enumeration(name, size)),
            tag => {
                let Some(kind) = tag_kind(tag) else {
                    return Ok(Type::void());
                };
                if Self::is_declaration(entry)? {
                    return Ok(Type::incomplete(kind, name.unwrap_or_default()));
                }
                let members = self.collect_members(unit, entry.offset(), depth)?;
                Ok(Type::compound(kind, name, size.unwrap_or(0), members))
            }
        }
    }

    fn collect_members(&self, unit: &Unit<OwnedReader>, offset: UnitOffset<usize>, depth: usize) -> Result<Vec<Member>>
    {
        let mut members = Vec::new();
        let mut tree = unit
            .entries_tree(Some(offset))
            .map_err(|err| map_dwarf_error("building member tree", err))?;
        let root = tree.root().map_err(|err| map_dwarf_error("navigating member root", err))?;
        let mut children = root.children();
        while let Some(child) = children
            .next()
            .map_err(|err| map_dwarf_error("iterating members", err))?
        {
            let entry = child.entry().clone();
            if entry.tag() != constants::DW_TAG_member {
                continue;
            }
            members.push(Member {
                name: self.entry_name(unit, &entry)?,
                bit_offset: Self::member_bit_offset(&entry)?,
                bit_field_size: Self::udata(&entry, constants::DW_AT_bit_size)?.unwrap_or(0),
                ty: self.type_ref(unit, &entry, depth)?,
            });
        }
        Ok(members)
    }

    fn member_bit_offset(entry: &Entry<'_, '_>) -> Result<u64>
    {
        if let Some(bits) = Self::udata(entry, constants::DW_AT_data_bit_offset)? {
            return Ok(bits);
        }
        Ok(Self::udata(entry, constants::DW_AT_data_member_location)?.map_or(0, |bytes| bytes * 8))
    }

    /// The `DW_AT_type` of `entry` as a lazy reference; `void` if absent.
    fn type_ref(&self, unit: &Unit<OwnedReader>, entry: &Entry<'_, '_>, depth: usize) -> Result<LazyType>
    {
        match entry
            .attr_value(constants::DW_AT_type)
            .map_err(|err| map_dwarf_error("reading DW_AT_type", err))?
        {
            Some(value) => self.resolve_ref(unit, value, depth + 1),
            None => Ok(LazyType::Resolved(Arc::new(Type::void()))),
        }
    }

    fn resolve_ref(&self, unit: &Unit<OwnedReader>, value: AttributeValue<OwnedReader>, depth: usize) -> Result<LazyType>
    {
        let void = || LazyType::Resolved(Arc::new(Type::void()));
        if depth >= MAX_TYPE_REF_DEPTH {
            return Ok(void());
        }
        match value {
            AttributeValue::UnitRef(offset) => self.lazy_at_offset(unit, offset, depth),
            AttributeValue::DebugInfoRef(offset) => {
                let target = UnitSectionOffset::from(offset);
                match self.find_unit_for_offset(target) {
                    Some((target_unit, unit_offset)) => self.lazy_at_offset(target_unit, unit_offset, depth),
                    None => Ok(void()),
                }
            }
            AttributeValue::DebugTypesRef(signature) => match self.find_unit_for_signature(signature) {
                Some((target_unit, unit_offset)) => self.lazy_at_offset(target_unit, unit_offset, depth),
                None => Ok(void()),
            },
            _ => Ok(void()),
        }
    }

    fn lazy_at_offset(&self, unit: &Unit<OwnedReader>, offset: UnitOffset<usize>, depth: usize) -> Result<LazyType>
    {
        let die = unit
            .entry(offset)
            .map_err(|err| map_dwarf_error("resolving type reference", err))?;
        let name = self.entry_name(unit, &die)?;
        match die.tag() {
            constants::DW_TAG_base_type | constants::DW_TAG_typedef if name.is_some() => Ok(LazyType::Named {
                kind: None,
                name: name.unwrap_or_default(),
            }),
            tag if tag_kind(tag).is_some() && name.is_some() => Ok(LazyType::Named {
                kind: tag_kind(tag),
                name: name.unwrap_or_default(),
            }),
            constants::DW_TAG_pointer_type
            | constants::DW_TAG_reference_type
            | constants::DW_TAG_rvalue_reference_type => {
                let target = self.type_ref(unit, &die, depth)?;
                let size = Self::udata(&die, constants::DW_AT_byte_size)?.unwrap_or(self.pointer_size);
                Ok(LazyType::Resolved(Arc::new(Type::pointer(target, size))))
            }
            constants::DW_TAG_array_type => self.build_array(unit, &die, depth),
            constants::DW_TAG_const_type
            | constants::DW_TAG_volatile_type
            | constants::DW_TAG_restrict_type
            | constants::DW_TAG_atomic_type => self.type_ref(unit, &die, depth),
            constants::DW_TAG_subroutine_type => Ok(LazyType::Resolved(Arc::new(Type::function(None)))),
            _ => Ok(LazyType::Resolved(Arc::new(self.build_type(unit, &die, depth)?))),
        }
    }

    /// Multi-dimensional arrays become arrays of arrays, outermost first.
    fn build_array(&self, unit: &Unit<OwnedReader>, entry: &Entry<'_, '_>, depth: usize) -> Result<LazyType>
    {
        let mut lengths = Vec::new();
        let mut tree = unit
            .entries_tree(Some(entry.offset()))
            .map_err(|err| map_dwarf_error("building array tree", err))?;
        let root = tree.root().map_err(|err| map_dwarf_error("navigating array root", err))?;
        let mut children = root.children();
        while let Some(child) = children
            .next()
            .map_err(|err| map_dwarf_error("iterating subranges", err))?
        {
            let sub = child.entry();
            if sub.tag() != constants::DW_TAG_subrange_type {
                continue;
            }
            let length = match Self::udata(sub, constants::DW_AT_count)? {
                Some(count) => Some(count),
                None => Self::udata(sub, constants::DW_AT_upper_bound)?.map(|upper| upper + 1),
            };
            lengths.push(length);
        }
        if lengths.is_empty() {
            lengths.push(None);
        }

        let mut ty = self.type_ref(unit, entry, depth)?;
        for length in lengths.into_iter().rev() {
            ty = LazyType::Resolved(Arc::new(Type::array(ty, length)));
        }
        Ok(ty)
    }

    fn is_declaration(entry: &Entry<'_, '_>) -> Result<bool>
    {
        Ok(matches!(
            entry
                .attr_value(constants::DW_AT_declaration)
                .map_err(|err| map_dwarf_error("reading DW_AT_declaration", err))?,
            Some(AttributeValue::Flag(true))
        ))
    }

    fn udata(entry: &Entry<'_, '_>, name: constants::DwAt) -> Result<Option<u64>>
    {
        Ok(entry
            .attr(name)
            .map_err(|err| map_dwarf_error("reading attribute", err))?
            .and_then(|attr| attr.udata_value()))
    }

    fn entry_name(&self, unit: &Unit<OwnedReader>, entry: &Entry<'_, '_>) -> Result<Option<String>>
    {
        let Some(attr) = entry
            .attr(constants::DW_AT_name)
            .map_err(|err| map_dwarf_error("reading DW_AT_name", err))?
        else {
            return Ok(None);
        };
        let reader = self
            .dwarf
            .attr_string(unit, attr.value())
            .map_err(|err| map_dwarf_error("resolving DWARF string", err))?;
        let owned = match reader.to_string() {
            Ok(cow) => cow.into_owned(),
            Err(_) => reader
                .to_string_lossy()
                .map_err(|err| map_dwarf_error("decoding DWARF string", err))?
                .into_owned(),
        };
        Ok(Some(owned))
    }

    fn find_unit_for_signature(&self, signature: DebugTypeSignature) -> Option<(&'a Unit<OwnedReader>, UnitOffset<usize>)>
    {
        self.units.iter().find_map(|unit| match unit.header.type_() {
            UnitType::Type {
                type_signature,
                type_offset,
            }
            | UnitType::SplitType {
                type_signature,
                type_offset,
            } if type_signature == signature => Some((unit, type_offset)),
            _ => None,
        })
    }

    fn find_unit_for_offset(&self, target: UnitSectionOffset<usize>) -> Option<(&'a Unit<OwnedReader>, UnitOffset<usize>)>
    {
        self.units
            .iter()
            .find_map(|unit| target.to_unit_offset(unit).map(|offset| (unit, offset)))
    }
}
