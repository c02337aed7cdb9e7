use crate::convert::FromHandle;
use crate::error::Result;
use crate::handle::{Handle, ValueType};
use crate::ident::RawId;
use crate::protect::protect;
use crate::runtime::{Runtime, Session};
use crate::value::{check_type, handle_wrapper};

// ============================================================================
// RString
// ============================================================================

/// A managed string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RString(Handle);

handle_wrapper!(RString);

impl FromHandle for RString {
    fn from_handle(handle: Handle) -> Result<Self> {
        check_type(handle, "String", |ty| ty == ValueType::String)?;
        Ok(RString(handle))
    }
}

impl RString {
    /// Copy `text` into a new mutable string.
    pub fn new(text: &str) -> Result<RString> {
        let session = Session::current()?;
        Ok(RString(session.runtime().str_new(text)))
    }

    /// Frozen, deduplicated string for `text`.
    pub fn interned(text: &str) -> Result<RString> {
        let session = Session::current()?;
        Ok(RString(session.runtime().str_intern(text)))
    }

    /// Copy the contents out.
    pub fn contents(self) -> Result<String> {
        let session = Session::current()?;
        Ok(session.runtime().str_read(self.0))
    }

    /// Length in bytes.
    pub fn len(self) -> Result<usize> {
        Ok(self.contents()?.len())
    }

    /// Whether the string is empty.
    pub fn is_empty(self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

// ============================================================================
// Symbol
// ============================================================================

/// A managed symbol.
///
/// Symbols created at run time may be collected, so the identifier a symbol
/// names is resolved per call and never cached.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Symbol(Handle);

handle_wrapper!(Symbol);

impl FromHandle for Symbol {
    fn from_handle(handle: Handle) -> Result<Self> {
        check_type(handle, "Symbol", |ty| ty == ValueType::Symbol)?;
        Ok(Symbol(handle))
    }
}

impl Symbol {
    /// Symbol for `name`.
    pub fn new(name: &str) -> Result<Symbol> {
        let session = Session::current()?;
        let rt = session.runtime();
        Ok(Self::from_raw_id(rt, rt.intern(name)))
    }

    pub(crate) fn from_raw_id(rt: &dyn Runtime, id: RawId) -> Symbol {
        Symbol(rt.id_to_symbol(id))
    }

    /// Symbol name.
    pub fn name(self) -> Result<String> {
        let id = protect(|rt| rt.id_from_symbol(self.0))?;
        let session = Session::current()?;
        Ok(session.runtime().id_name(id))
    }
}
