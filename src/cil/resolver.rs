//! Operand resolution between raw encodings and [`CilOperand`](super::CilOperand) values.
//!
//! Decoding goes through an [`OperandResolver`], which turns tokens and indices into the
//! references of the method's context. Encoding goes through an [`OperandBuilder`], which
//! does the inverse and allocates user string tokens.

use std::sync::Arc;

use widestring::{U16Str, U16String};

use super::{ArgumentRef, LocalRef};
use crate::{
    metadata::{
        heaps::UserStringsHeapBuilder, tablestream::columns, Metadata, TableIndex, Token,
    },
    io::BinaryStreamReader,
    Error, Result,
};

const CALLING_CONVENTION_GENERIC: u8 = 0x10;
const CALLING_CONVENTION_HAS_THIS: u8 = 0x20;
const LOCAL_SIG: u8 = 0x07;

/// Resolves raw operands while a method body is decoded.
///
/// Returning `None` keeps the raw value: an unresolved local becomes [`LocalRef::Index`], an
/// unresolved argument [`ArgumentRef::Index`], and an unresolved token stays a token.
pub trait OperandResolver: Send + Sync {
    /// Resolves the token of a member, type or signature operand.
    ///
    /// # Errors
    /// Returns an error if the metadata backing the lookup is malformed.
    fn resolve_member(&self, token: Token) -> Result<Option<Token>>;

    /// Resolves the token of an `ldstr` operand to its literal.
    ///
    /// # Errors
    /// Returns an error if the metadata backing the lookup is malformed.
    fn resolve_string(&self, token: Token) -> Result<Option<U16String>>;

    /// Resolves a local variable index.
    fn resolve_local(&self, index: u16) -> Option<LocalRef>;

    /// Resolves a raw argument index, which includes the implicit `this`.
    fn resolve_argument(&self, index: u16) -> Option<ArgumentRef>;
}

/// Local and parameter counts of a method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodSignatureInfo {
    /// The method has an implicit `this` argument.
    pub has_this: bool,
    /// Number of declared parameters, not counting `this`.
    pub parameter_count: u16,
    /// Number of locals, `None` if the body has no local variable signature.
    pub locals_count: Option<u16>,
}

impl MethodSignatureInfo {
    /// Resolves a local index against the locals signature.
    #[must_use]
    pub fn resolve_local(&self, index: u16) -> Option<LocalRef> {
        match self.locals_count {
            None => None,
            Some(count) if index >= count => None,
            Some(_) => Some(LocalRef::Variable(index)),
        }
    }

    /// Resolves a raw argument index, mapping index 0 to `this` for instance methods.
    #[must_use]
    pub fn resolve_argument(&self, index: u16) -> Option<ArgumentRef> {
        if self.has_this {
            if index == 0 {
                return Some(ArgumentRef::This);
            }
            let parameter = index - 1;
            (parameter < self.parameter_count).then_some(ArgumentRef::Parameter(parameter))
        } else {
            (index < self.parameter_count).then_some(ArgumentRef::Parameter(index))
        }
    }
}

/// Resolves nothing but locals and arguments, from explicit counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureOperandResolver {
    /// Counts used for index resolution.
    pub signature: MethodSignatureInfo,
}

impl SignatureOperandResolver {
    /// Creates a resolver for a method with the given counts.
    #[must_use]
    pub fn new(signature: MethodSignatureInfo) -> Self {
        SignatureOperandResolver { signature }
    }
}

impl OperandResolver for SignatureOperandResolver {
    fn resolve_member(&self, _token: Token) -> Result<Option<Token>> {
        Ok(None)
    }

    fn resolve_string(&self, _token: Token) -> Result<Option<U16String>> {
        Ok(None)
    }

    fn resolve_local(&self, index: u16) -> Option<LocalRef> {
        self.signature.resolve_local(index)
    }

    fn resolve_argument(&self, index: u16) -> Option<ArgumentRef> {
        self.signature.resolve_argument(index)
    }
}

/// Resolves operands of a method defined in a metadata directory.
///
/// Member tokens resolve when they name an existing row, string tokens through `#US`. A string
/// token past the end of `#US` stays a token.
/// Local and parameter counts come from the method's signatures.
#[derive(Debug, Clone)]
pub struct MetadataOperandResolver {
    metadata: Arc<Metadata>,
    signature: MethodSignatureInfo,
}

impl MetadataOperandResolver {
    /// Creates a resolver for the `MethodDef` row `method` whose body declares
    /// `local_var_sig_token`.
    ///
    /// # Errors
    /// Returns an error if the method row or one of the signatures is malformed.
    pub fn new(metadata: Arc<Metadata>, method: Token, local_var_sig_token: Token) -> Result<Self> {
        let signature = method_signature(&metadata, method, local_var_sig_token)?;
        tracing::trace!(
            method = %method,
            has_this = signature.has_this,
            parameters = signature.parameter_count,
            locals = ?signature.locals_count,
            "resolved method signature"
        );
        Ok(MetadataOperandResolver {
            metadata,
            signature,
        })
    }

    /// Creates a resolver with explicit counts.
    #[must_use]
    pub fn with_signature(metadata: Arc<Metadata>, signature: MethodSignatureInfo) -> Self {
        MetadataOperandResolver {
            metadata,
            signature,
        }
    }

    /// Counts used for index resolution.
    #[must_use]
    pub fn signature(&self) -> MethodSignatureInfo {
        self.signature
    }
}

impl OperandResolver for MetadataOperandResolver {
    fn resolve_member(&self, token: Token) -> Result<Option<Token>> {
        let (Some(table), Some(tables)) = (token.table_index(), self.metadata.tables()?) else {
            return Ok(None);
        };
        let exists = token.rid() != 0 && token.rid() <= tables.row_count(table);
        Ok(exists.then_some(token))
    }

    fn resolve_string(&self, token: Token) -> Result<Option<U16String>> {
        if token.table_index() != Some(TableIndex::String) {
            return Ok(None);
        }
        let Some(heap) = self.metadata.user_strings()? else {
            return Ok(None);
        };
        match heap.get(token.rid()) {
            Ok(value) => Ok(Some(value)),
            Err(Error::IndexOutOfRange { .. }) => {
                tracing::debug!(token = %token, "string token is outside of the #US heap");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    fn resolve_local(&self, index: u16) -> Option<LocalRef> {
        self.signature.resolve_local(index)
    }

    fn resolve_argument(&self, index: u16) -> Option<ArgumentRef> {
        self.signature.resolve_argument(index)
    }
}

fn method_signature(
    metadata: &Metadata,
    method: Token,
    local_var_sig_token: Token,
) -> Result<MethodSignatureInfo> {
    let tables = metadata
        .tables()?
        .ok_or_else(|| malformed_error!("Metadata has no tables stream"))?;
    let blobs = metadata.blobs()?;
    let blob = |index: u32| -> Result<BinaryStreamReader> {
        blobs
            .ok_or_else(|| malformed_error!("Metadata has no blob stream"))?
            .reader(index)
    };

    let mut info = MethodSignatureInfo::default();

    if method.table_index() == Some(TableIndex::MethodDef) && !method.is_null() {
        let index = tables.read_column(
            TableIndex::MethodDef,
            method.rid(),
            columns::METHOD_DEF_SIGNATURE,
        )?;
        let mut reader = blob(index)?;
        let convention = reader.read_u8()?;
        if convention & CALLING_CONVENTION_GENERIC != 0 {
            reader.read_compressed_u32()?;
        }
        info.has_this = convention & CALLING_CONVENTION_HAS_THIS != 0;
        info.parameter_count = u16::try_from(reader.read_compressed_u32()?)
            .map_err(|_| malformed_error!("Method {} declares too many parameters", method))?;
    }

    if local_var_sig_token.table_index() == Some(TableIndex::StandAloneSig)
        && !local_var_sig_token.is_null()
    {
        let index = tables.read_column(
            TableIndex::StandAloneSig,
            local_var_sig_token.rid(),
            columns::STANDALONE_SIG_SIGNATURE,
        )?;
        let mut reader = blob(index)?;
        let kind = reader.read_u8()?;
        if kind != LOCAL_SIG {
            return Err(malformed_error!(
                "Signature {} is not a local variable signature (0x{:02X})",
                local_var_sig_token,
                kind
            ));
        }
        info.locals_count = Some(
            u16::try_from(reader.read_compressed_u32()?).map_err(|_| {
                malformed_error!("Signature {} declares too many locals", local_var_sig_token)
            })?,
        );
    }

    Ok(info)
}

/// Encodes operand references while a method body is assembled.
pub trait OperandBuilder {
    /// The token written for a member, type or signature operand.
    ///
    /// # Errors
    /// Implementations return an error if the member cannot be imported.
    fn member_token(&mut self, token: Token) -> Result<Token>;

    /// The token written for an `ldstr` literal.
    ///
    /// # Errors
    /// Implementations return an error if the literal cannot be added to the string heap.
    fn string_token(&mut self, value: &U16Str) -> Result<Token>;

    /// The index written for a local variable.
    ///
    /// # Errors
    /// Implementations return an error if the variable is not declared.
    fn variable_index(&mut self, local: LocalRef) -> Result<u16>;

    /// The index written for an argument, including the implicit `this`.
    ///
    /// # Errors
    /// Implementations return an error if the argument is not declared.
    fn argument_index(&mut self, argument: ArgumentRef) -> Result<u16>;
}

/// Writes tokens unchanged and allocates literals in a new `#US` heap.
#[derive(Debug, Clone, Default)]
pub struct DefaultOperandBuilder {
    /// The method has an implicit `this` argument.
    pub has_this: bool,
    /// Heap receiving `ldstr` literals.
    pub user_strings: UserStringsHeapBuilder,
}

impl DefaultOperandBuilder {
    /// Creates a builder for a method with or without `this`.
    #[must_use]
    pub fn new(has_this: bool) -> Self {
        DefaultOperandBuilder {
            has_this,
            user_strings: UserStringsHeapBuilder::new(),
        }
    }
}

impl OperandBuilder for DefaultOperandBuilder {
    fn member_token(&mut self, token: Token) -> Result<Token> {
        Ok(token)
    }

    fn string_token(&mut self, value: &U16Str) -> Result<Token> {
        let index = self.user_strings.add(value)?;
        Ok(Token::from_parts(TableIndex::String, index))
    }

    fn variable_index(&mut self, local: LocalRef) -> Result<u16> {
        Ok(local.index())
    }

    fn argument_index(&mut self, argument: ArgumentRef) -> Result<u16> {
        if argument == ArgumentRef::This && !self.has_this {
            return Err(Error::InvalidArgument(
                "Static method has no `this` argument".to_string(),
            ));
        }
        Ok(argument.index(self.has_this))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::CilOperand;
    use crate::metadata::{
        heaps::BlobHeapBuilder, tablestream::TablesStreamBuilder, MetadataBuilder,
    };

    #[test]
    fn argument_resolution() {
        let instance = MethodSignatureInfo {
            has_this: true,
            parameter_count: 2,
            locals_count: None,
        };
        assert_eq!(instance.resolve_argument(0), Some(ArgumentRef::This));
        assert_eq!(instance.resolve_argument(1), Some(ArgumentRef::Parameter(0)));
        assert_eq!(instance.resolve_argument(2), Some(ArgumentRef::Parameter(1)));
        assert_eq!(instance.resolve_argument(3), None);

        let stat = MethodSignatureInfo {
            has_this: false,
            ..instance
        };
        assert_eq!(stat.resolve_argument(0), Some(ArgumentRef::Parameter(0)));
        assert_eq!(stat.resolve_argument(2), None);
    }

    #[test]
    fn local_resolution() {
        let mut info = MethodSignatureInfo::default();
        assert_eq!(info.resolve_local(0), None);

        info.locals_count = Some(2);
        assert_eq!(info.resolve_local(1), Some(LocalRef::Variable(1)));
        assert_eq!(info.resolve_local(2), None);
    }

    #[test]
    fn metadata_signatures() {
        let mut blobs = BlobHeapBuilder::new();
        // HASTHIS, 2 parameters, void, int32, string
        let method_sig = blobs.add(&[0x20, 0x02, 0x01, 0x08, 0x0E]).unwrap();
        // LOCAL_SIG, 3 locals
        let locals_sig = blobs.add(&[0x07, 0x03, 0x08, 0x08, 0x0E]).unwrap();

        let mut tables = TablesStreamBuilder::new();
        let method = tables
            .add_row(TableIndex::MethodDef, vec![0, 0, 0, 0, method_sig, 1])
            .unwrap();
        let locals = tables
            .add_row(TableIndex::StandAloneSig, vec![locals_sig])
            .unwrap();

        let data = MetadataBuilder::new()
            .with_stream("#~", tables.build().unwrap())
            .with_stream("#Blob", blobs.build().unwrap())
            .build()
            .unwrap();
        let metadata = Arc::new(Metadata::from_bytes(data).unwrap());

        let resolver = MetadataOperandResolver::new(metadata, method, locals).unwrap();
        assert_eq!(
            resolver.signature(),
            MethodSignatureInfo {
                has_this: true,
                parameter_count: 2,
                locals_count: Some(3),
            }
        );
        assert_eq!(resolver.resolve_member(method).unwrap(), Some(method));
        assert_eq!(
            resolver
                .resolve_member(Token::from_parts(TableIndex::MethodDef, 2))
                .unwrap(),
            None
        );
        assert_eq!(
            resolver
                .resolve_string(Token::from_parts(TableIndex::String, 1))
                .unwrap(),
            None
        );
    }

    fn user_strings_only(heap: Vec<u8>) -> MetadataOperandResolver {
        let data = MetadataBuilder::new().with_stream("#US", heap).build().unwrap();
        MetadataOperandResolver::with_signature(
            Arc::new(Metadata::from_bytes(data).unwrap()),
            MethodSignatureInfo::default(),
        )
    }

    #[test]
    fn metadata_user_strings() {
        // A lone high surrogate at index 1.
        let resolver = user_strings_only(vec![0x00, 0x03, 0x00, 0xD8, 0x01, 0x00, 0x00, 0x00]);

        let literal = resolver
            .resolve_string(Token::from_parts(TableIndex::String, 1))
            .unwrap()
            .unwrap();
        assert_eq!(literal.as_slice(), &[0xD800]);

        let mut builder = DefaultOperandBuilder::default();
        assert_eq!(builder.string_token(&literal).unwrap(), Token::new(0x7000_0001));
        let heap = builder.user_strings.build().unwrap();
        assert_eq!(&heap[..5], &[0x00, 0x03, 0x00, 0xD8, 0x01]);
    }

    #[test]
    fn string_token_past_heap() {
        let resolver = user_strings_only(vec![0x00, 0x03, 0x41, 0x00]);
        let token = Token::new(0x7000_0100);
        assert_eq!(resolver.resolve_string(token).unwrap(), None);

        // nop; ldstr 0x70000100; ret
        let code = [0x00, 0x72, 0x00, 0x01, 0x00, 0x70, 0x2A];
        let instructions = crate::cil::disassemble(&code, &resolver, false).unwrap();
        let operands: Vec<_> = instructions.iter().map(|i| i.operand().clone()).collect();
        assert_eq!(operands[1], CilOperand::Token(token));

        let rewritten =
            crate::cil::rewrite_code(&code, &resolver, &mut DefaultOperandBuilder::default())
                .unwrap();
        assert_eq!(rewritten, code);
    }

    #[test]
    fn default_builder() {
        let mut builder = DefaultOperandBuilder::new(false);
        let hello = U16String::from_str("Hello");
        let first = builder.string_token(&hello).unwrap();
        assert_eq!(first, Token::new(0x7000_0001));
        assert_eq!(builder.string_token(&hello).unwrap(), first);
        assert!(builder.argument_index(ArgumentRef::This).is_err());
        assert_eq!(builder.argument_index(ArgumentRef::Parameter(2)).unwrap(), 2);
    }
}
