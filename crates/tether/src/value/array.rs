use crate::convert::{FromHandle, IntoHandle};
use crate::error::Result;
use crate::handle::{Handle, ReprValue, ValueType};
use crate::protect::protect;
use crate::runtime::Session;
use crate::value::{check_type, handle_wrapper};

/// A managed array.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Array(Handle);

handle_wrapper!(Array);

impl FromHandle for Array {
    fn from_handle(handle: Handle) -> Result<Self> {
        check_type(handle, "Array", |ty| ty == ValueType::Array)?;
        Ok(Array(handle))
    }
}

impl Array {
    /// New empty array.
    pub fn new() -> Result<Array> {
        Self::from_slice::<Handle>(&[])
    }

    /// New array holding `elements`.
    pub fn from_slice<T: ReprValue>(elements: &[T]) -> Result<Array> {
        let handles: Vec<Handle> = elements.iter().map(|e| e.handle()).collect();
        let session = Session::current()?;
        Ok(Array(session.runtime().ary_new(&handles)))
    }

    /// Number of elements.
    pub fn len(self) -> Result<usize> {
        let session = Session::current()?;
        Ok(session.runtime().ary_len(self.0))
    }

    /// Whether the array is empty.
    pub fn is_empty(self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Element at `index`, converted; out of bounds reads `nil`.
    pub fn get<T: FromHandle>(self, index: usize) -> Result<T> {
        let entry = protect(|rt| rt.ary_entry(self.0, index))?;
        T::from_handle(entry)
    }

    /// Append an element.
    pub fn push<T: IntoHandle>(self, value: T) -> Result<()> {
        let value = value.into_handle()?;
        protect(|rt| rt.ary_push(self.0, value))
    }

    /// Remove and convert the last element; an empty array yields `nil`.
    pub fn pop<T: FromHandle>(self) -> Result<T> {
        let last = protect(|rt| rt.ary_pop(self.0))?;
        T::from_handle(last)
    }

    /// Convert every element.
    pub fn to_vec<T: FromHandle>(self) -> Result<Vec<T>> {
        let len = self.len()?;
        (0..len).map(|index| self.get(index)).collect()
    }
}
