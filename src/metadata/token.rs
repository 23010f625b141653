//! Metadata tokens.
//!
//! A token is a 4-byte reference into the metadata of a module: the top byte selects a table
//! (see [`TableIndex`]), the low 3 bytes hold a 1-based row id. A row id of 0 denotes a null
//! reference. Tokens for the user string heap use table byte `0x70` and carry a heap offset in
//! place of a row id.
//!
//! ```rust
//! use peweave::metadata::{TableIndex, Token};
//!
//! let token = Token::from_parts(TableIndex::MethodDef, 1);
//! assert_eq!(token.value(), 0x0600_0001);
//! assert_eq!(token.table_index(), Some(TableIndex::MethodDef));
//! assert_eq!(token.to_string(), "0x06000001");
//! ```

use std::fmt;

use strum::{Display, EnumCount, EnumIter, FromRepr};

/// Table selector byte of a token. Values below `0x40` are metadata table indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, EnumCount, FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TableIndex {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldPtr = 0x03,
    Field = 0x04,
    MethodPtr = 0x05,
    MethodDef = 0x06,
    ParamPtr = 0x07,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0A,
    Constant = 0x0B,
    CustomAttribute = 0x0C,
    FieldMarshal = 0x0D,
    DeclSecurity = 0x0E,
    ClassLayout = 0x0F,
    FieldLayout = 0x10,
    StandAloneSig = 0x11,
    EventMap = 0x12,
    EventPtr = 0x13,
    Event = 0x14,
    PropertyMap = 0x15,
    PropertyPtr = 0x16,
    Property = 0x17,
    MethodSemantics = 0x18,
    MethodImpl = 0x19,
    ModuleRef = 0x1A,
    TypeSpec = 0x1B,
    ImplMap = 0x1C,
    FieldRva = 0x1D,
    EncLog = 0x1E,
    EncMap = 0x1F,
    Assembly = 0x20,
    AssemblyProcessor = 0x21,
    AssemblyOs = 0x22,
    AssemblyRef = 0x23,
    AssemblyRefProcessor = 0x24,
    AssemblyRefOs = 0x25,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    NestedClass = 0x29,
    GenericParam = 0x2A,
    MethodSpec = 0x2B,
    GenericParamConstraint = 0x2C,
    Document = 0x30,
    MethodDebugInformation = 0x31,
    LocalScope = 0x32,
    LocalVariable = 0x33,
    LocalConstant = 0x34,
    ImportScope = 0x35,
    StateMachineMethod = 0x36,
    CustomDebugInformation = 0x37,
    /// Not a table: tokens with this selector reference the `#US` heap.
    String = 0x70,
}

/// A 4-byte metadata token.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Token(pub u32);

impl Token {
    /// The null token.
    pub const NULL: Token = Token(0);

    /// Wraps a raw token value.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Token(value)
    }

    /// Builds a token from a table selector and a row id (or heap offset).
    #[must_use]
    pub const fn from_parts(table: TableIndex, rid: u32) -> Self {
        Token(((table as u32) << 24) | (rid & 0x00FF_FFFF))
    }

    /// The raw value.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// The table selector byte.
    #[must_use]
    pub const fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The table selector, if it names a known table or heap.
    #[must_use]
    pub fn table_index(&self) -> Option<TableIndex> {
        TableIndex::from_repr(self.table())
    }

    /// The 1-based row id (or user string heap offset).
    #[must_use]
    pub const fn rid(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Whether the token is a null reference (row id 0), regardless of its table.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.rid() == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.table_index() {
            Some(table) => write!(f, "Token(0x{:08x}, {}, rid: {})", self.0, table, self.rid()),
            None => write!(f, "Token(0x{:08x}, table: 0x{:02x}, rid: {})", self.0, self.table(), self.rid()),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
