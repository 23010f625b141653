//! Coded indices.
//!
//! A coded index references a row in one of several tables using a single column: the low bits
//! hold a tag selecting the table, the remaining bits the row id. Its width is 2 bytes unless
//! one of the candidate tables has too many rows to fit the remaining bits.
//!
//! # Reference
//! - [ECMA-335 II.24.2.6](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use strum::{EnumCount, EnumIter};

use super::{TableIndex, Token};
use crate::Result;

/// The coded index kinds defined by ECMA-335 and the Portable PDB format.
#[derive(Debug, Hash, Eq, PartialEq, Clone, Copy, EnumIter, EnumCount)]
#[allow(missing_docs)]
pub enum CodedIndex {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
    HasCustomDebugInformation,
}

const HAS_CUSTOM_ATTRIBUTE: [Option<TableIndex>; 22] = [
    Some(TableIndex::MethodDef),
    Some(TableIndex::Field),
    Some(TableIndex::TypeRef),
    Some(TableIndex::TypeDef),
    Some(TableIndex::Param),
    Some(TableIndex::InterfaceImpl),
    Some(TableIndex::MemberRef),
    Some(TableIndex::Module),
    Some(TableIndex::DeclSecurity),
    Some(TableIndex::Property),
    Some(TableIndex::Event),
    Some(TableIndex::StandAloneSig),
    Some(TableIndex::ModuleRef),
    Some(TableIndex::TypeSpec),
    Some(TableIndex::Assembly),
    Some(TableIndex::AssemblyRef),
    Some(TableIndex::File),
    Some(TableIndex::ExportedType),
    Some(TableIndex::ManifestResource),
    Some(TableIndex::GenericParam),
    Some(TableIndex::GenericParamConstraint),
    Some(TableIndex::MethodSpec),
];

const HAS_CUSTOM_DEBUG_INFORMATION: [Option<TableIndex>; 27] = [
    Some(TableIndex::MethodDef),
    Some(TableIndex::Field),
    Some(TableIndex::TypeRef),
    Some(TableIndex::TypeDef),
    Some(TableIndex::Param),
    Some(TableIndex::InterfaceImpl),
    Some(TableIndex::MemberRef),
    Some(TableIndex::Module),
    Some(TableIndex::DeclSecurity),
    Some(TableIndex::Property),
    Some(TableIndex::Event),
    Some(TableIndex::StandAloneSig),
    Some(TableIndex::ModuleRef),
    Some(TableIndex::TypeSpec),
    Some(TableIndex::Assembly),
    Some(TableIndex::AssemblyRef),
    Some(TableIndex::File),
    Some(TableIndex::ExportedType),
    Some(TableIndex::ManifestResource),
    Some(TableIndex::GenericParam),
    Some(TableIndex::GenericParamConstraint),
    Some(TableIndex::MethodSpec),
    Some(TableIndex::Document),
    Some(TableIndex::LocalScope),
    Some(TableIndex::LocalVariable),
    Some(TableIndex::LocalConstant),
    Some(TableIndex::ImportScope),
];

impl CodedIndex {
    /// The candidate tables, by tag. `None` marks tags that are reserved.
    #[must_use]
    pub fn tables(self) -> &'static [Option<TableIndex>] {
        use TableIndex as T;

        match self {
            CodedIndex::TypeDefOrRef => &[Some(T::TypeDef), Some(T::TypeRef), Some(T::TypeSpec)],
            CodedIndex::HasConstant => &[Some(T::Field), Some(T::Param), Some(T::Property)],
            CodedIndex::HasCustomAttribute => &HAS_CUSTOM_ATTRIBUTE,
            CodedIndex::HasFieldMarshal => &[Some(T::Field), Some(T::Param)],
            CodedIndex::HasDeclSecurity => &[Some(T::TypeDef), Some(T::MethodDef), Some(T::Assembly)],
            CodedIndex::MemberRefParent => &[
                Some(T::TypeDef),
                Some(T::TypeRef),
                Some(T::ModuleRef),
                Some(T::MethodDef),
                Some(T::TypeSpec),
            ],
            CodedIndex::HasSemantics => &[Some(T::Event), Some(T::Property)],
            CodedIndex::MethodDefOrRef => &[Some(T::MethodDef), Some(T::MemberRef)],
            CodedIndex::MemberForwarded => &[Some(T::Field), Some(T::MethodDef)],
            CodedIndex::Implementation => &[Some(T::File), Some(T::AssemblyRef), Some(T::ExportedType)],
            CodedIndex::CustomAttributeType => {
                &[None, None, Some(T::MethodDef), Some(T::MemberRef), None]
            }
            CodedIndex::ResolutionScope => &[
                Some(T::Module),
                Some(T::ModuleRef),
                Some(T::AssemblyRef),
                Some(T::TypeRef),
            ],
            CodedIndex::TypeOrMethodDef => &[Some(T::TypeDef), Some(T::MethodDef)],
            CodedIndex::HasCustomDebugInformation => &HAS_CUSTOM_DEBUG_INFORMATION,
        }
    }

    /// Number of low bits used for the tag.
    #[must_use]
    pub fn tag_bits(self) -> u32 {
        let count = self.tables().len();
        usize::BITS - (count - 1).leading_zeros()
    }

    /// Width of the column in bytes, given a row count lookup.
    pub fn size(self, row_count: impl Fn(TableIndex) -> u32) -> u32 {
        let max_rows = self
            .tables()
            .iter()
            .flatten()
            .map(|&table| row_count(table))
            .max()
            .unwrap_or(0);

        if u64::from(max_rows) < (1u64 << (16 - self.tag_bits())) {
            2
        } else {
            4
        }
    }

    /// Decodes a raw column value into a token.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for a tag that does not select a table.
    pub fn decode(self, value: u32) -> Result<Token> {
        let bits = self.tag_bits();
        let tag = (value & ((1 << bits) - 1)) as usize;
        let rid = value >> bits;

        match self.tables().get(tag).copied().flatten() {
            Some(table) => Ok(Token::from_parts(table, rid)),
            None => Err(malformed_error!(
                "Invalid tag {} for coded index {:?}",
                tag,
                self
            )),
        }
    }

    /// Encodes a token into a raw column value. The null token encodes as 0.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidArgument`] if the token's table is not a candidate.
    pub fn encode(self, token: Token) -> Result<u32> {
        if token.value() == 0 {
            return Ok(0);
        }

        let table = token.table_index();
        let tag = self
            .tables()
            .iter()
            .position(|&candidate| candidate.is_some() && candidate == table)
            .ok_or_else(|| {
                crate::Error::InvalidArgument(format!(
                    "Token {token} cannot be encoded as {self:?}"
                ))
            })?;

        #[allow(clippy::cast_possible_truncation)]
        Ok((token.rid() << self.tag_bits()) | tag as u32)
    }
}
