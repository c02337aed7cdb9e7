//! Identifiers for method, constant and variable lookup
//!
//! Two flavours exist. An [`Id`] is static: interned for the lifetime of the
//! runtime and safe to store anywhere. A dynamic identifier, derived from a
//! [`Symbol`] that may be collected, is only ever resolved inside the call
//! that uses it through [`IntoId`] and never retained.

use std::fmt;

use crate::error::Result;
use crate::protect::protect;
use crate::runtime::{with_runtime, Runtime};
use crate::value::Symbol;

/// Raw identifier as understood by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RawId(usize);

impl RawId {
    /// Wrap a runtime identifier.
    pub const fn new(raw: usize) -> Self {
        RawId(raw)
    }

    /// The runtime's identifier value.
    pub const fn get(self) -> usize {
        self.0
    }
}

/// A static identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(RawId);

impl Id {
    /// Intern `name` in the attached runtime.
    pub fn new(name: &str) -> Result<Id> {
        with_runtime(|rt| Id(rt.intern(name)))
    }

    /// The raw identifier.
    pub fn raw(self) -> RawId {
        self.0
    }

    /// Identifier name.
    pub fn name(self) -> Result<String> {
        with_runtime(|rt| rt.id_name(self.0))
    }

    /// Symbol naming this identifier.
    pub fn to_symbol(self) -> Result<Symbol> {
        with_runtime(|rt| Symbol::from_raw_id(rt, self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Ok(name) => write!(f, "Id({name})"),
            Err(_) => write!(f, "Id(#{})", self.0.get()),
        }
    }
}

/// Anything that names a method, constant or variable for one call.
pub trait IntoId {
    /// Resolve to a raw identifier valid for the current call.
    fn into_raw_id(self, rt: &dyn Runtime) -> Result<RawId>;
}

impl IntoId for Id {
    fn into_raw_id(self, _rt: &dyn Runtime) -> Result<RawId> {
        Ok(self.0)
    }
}

impl IntoId for RawId {
    fn into_raw_id(self, _rt: &dyn Runtime) -> Result<RawId> {
        Ok(self)
    }
}

impl IntoId for &str {
    fn into_raw_id(self, rt: &dyn Runtime) -> Result<RawId> {
        Ok(rt.intern(self))
    }
}

impl IntoId for &String {
    fn into_raw_id(self, rt: &dyn Runtime) -> Result<RawId> {
        Ok(rt.intern(self))
    }
}

impl IntoId for Symbol {
    fn into_raw_id(self, _rt: &dyn Runtime) -> Result<RawId> {
        let handle = self.as_handle();
        protect(|rt| rt.id_from_symbol(handle))
    }
}
