//! Argument parsing for native methods
//!
//! A method declares its parameters as a tuple of specs:
//!
//! ```ignore
//! use tether::args::{arg, arg_opt, arg_splat, block_opt, receiver};
//!
//! let specs = (receiver::<i64>(), arg::<i64>("n"), arg_opt::<String>("label"), arg_splat::<i64>(), block_opt());
//! ```
//!
//! Parsing walks the specs strictly left to right over a cursor on the call's
//! argument vector and yields a tuple with one typed entry per spec. The first
//! failing spec aborts the parse.

use std::marker::PhantomData;

use crate::convert::FromHandle;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::protect::protect;
use crate::value::Proc;

// ============================================================================
// Call arguments
// ============================================================================

/// Cursor over one call's receiver and positional arguments.
pub struct CallArgs<'a> {
    receiver: Handle,
    given: usize,
    rest: &'a [Handle],
}

impl<'a> CallArgs<'a> {
    /// Cursor at the first argument.
    pub fn new(receiver: Handle, args: &'a [Handle]) -> Self {
        CallArgs {
            receiver,
            given: args.len(),
            rest: args,
        }
    }

    /// The call's receiver.
    pub fn receiver(&self) -> Handle {
        self.receiver
    }

    /// Arguments not consumed yet.
    pub fn remaining(&self) -> &'a [Handle] {
        self.rest
    }

    /// Number of positional arguments in the call.
    pub fn given(&self) -> usize {
        self.given
    }

    fn take_front(&mut self) -> Option<Handle> {
        let (first, rest) = self.rest.split_first()?;
        self.rest = rest;
        Some(*first)
    }

    fn drain(&mut self) -> &'a [Handle] {
        std::mem::take(&mut self.rest)
    }
}

// ============================================================================
// Specs
// ============================================================================

/// Role of a spec within a parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecKind {
    /// The receiver
    Receiver,
    /// Mandatory positional
    Required,
    /// Optional positional
    Optional,
    /// All remaining positionals
    Splat,
    /// The call's block
    Block,
}

/// One parameter of a native method.
pub trait ArgSpec {
    /// Typed result of parsing this parameter.
    type Output;

    /// Role of this parameter.
    const KIND: SpecKind;

    /// Consume the parameter from `args`.
    fn parse(&self, args: &mut CallArgs<'_>) -> Result<Self::Output>;
}

/// The receiver, converted to `T`.
pub struct Receiver<T>(PhantomData<fn() -> T>);

/// A mandatory positional argument.
pub struct Required<T> {
    name: &'static str,
    _ty: PhantomData<fn() -> T>,
}

/// An optional positional argument.
pub struct Optional<T> {
    name: &'static str,
    _ty: PhantomData<fn() -> T>,
}

/// Every remaining positional argument.
pub struct Splat<T>(PhantomData<fn() -> T>);

/// The call's block, which must be present.
pub struct Block;

/// The call's block, if any.
pub struct OptionalBlock;

/// Spec for the receiver.
pub fn receiver<T: FromHandle>() -> Receiver<T> {
    Receiver(PhantomData)
}

/// Spec for a mandatory argument called `name`.
pub fn arg<T: FromHandle>(name: &'static str) -> Required<T> {
    Required {
        name,
        _ty: PhantomData,
    }
}

/// Spec for an optional argument called `name`.
pub fn arg_opt<T: FromHandle>(name: &'static str) -> Optional<T> {
    Optional {
        name,
        _ty: PhantomData,
    }
}

/// Spec for the remaining arguments.
pub fn arg_splat<T: FromHandle>() -> Splat<T> {
    Splat(PhantomData)
}

/// Spec for a mandatory block.
pub fn block() -> Block {
    Block
}

/// Spec for an optional block.
pub fn block_opt() -> OptionalBlock {
    OptionalBlock
}

impl<T> Required<T> {
    /// Parameter name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Optional<T> {
    /// Parameter name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: FromHandle> ArgSpec for Receiver<T> {
    type Output = T;
    const KIND: SpecKind = SpecKind::Receiver;

    fn parse(&self, args: &mut CallArgs<'_>) -> Result<T> {
        T::from_handle(args.receiver())
    }
}

impl<T: FromHandle> ArgSpec for Required<T> {
    type Output = T;
    const KIND: SpecKind = SpecKind::Required;

    fn parse(&self, args: &mut CallArgs<'_>) -> Result<T> {
        match args.take_front() {
            Some(handle) => T::from_handle(handle),
            None if self.name.is_empty() => {
                Err(Error::Argument("Missing required argument".to_string()))
            }
            None => Err(Error::Argument(format!(
                "Missing required argument ({})",
                self.name
            ))),
        }
    }
}

impl<T: FromHandle> ArgSpec for Optional<T> {
    type Output = Option<T>;
    const KIND: SpecKind = SpecKind::Optional;

    fn parse(&self, args: &mut CallArgs<'_>) -> Result<Option<T>> {
        args.take_front().map(T::from_handle).transpose()
    }
}

impl<T: FromHandle> ArgSpec for Splat<T> {
    type Output = Vec<T>;
    const KIND: SpecKind = SpecKind::Splat;

    fn parse(&self, args: &mut CallArgs<'_>) -> Result<Vec<T>> {
        args.drain().iter().map(|handle| T::from_handle(*handle)).collect()
    }
}

impl ArgSpec for Block {
    type Output = Proc;
    const KIND: SpecKind = SpecKind::Block;

    fn parse(&self, _args: &mut CallArgs<'_>) -> Result<Proc> {
        let proc = protect(|rt| rt.block_proc())?;
        Proc::from_handle(proc)
    }
}

impl ArgSpec for OptionalBlock {
    type Output = Option<Proc>;
    const KIND: SpecKind = SpecKind::Block;

    fn parse(&self, _args: &mut CallArgs<'_>) -> Result<Option<Proc>> {
        let proc = protect(|rt| rt.block_given().then(|| rt.block_proc()))?;
        proc.map(Proc::from_handle).transpose()
    }
}

// ============================================================================
// Parameter lists
// ============================================================================

/// An ordered tuple of [`ArgSpec`]s.
pub trait ArgList {
    /// Tuple of every spec's output, in order.
    type Output;

    /// Roles of the specs, in order.
    fn kinds(&self) -> Vec<SpecKind>;

    /// Parse the whole list, left to right.
    fn parse(&self, args: &mut CallArgs<'_>) -> Result<Self::Output>;

    /// Check the list is well formed.
    ///
    /// A splat must come after every positional spec, and at most one block
    /// spec is allowed.
    fn validate(&self) -> Result<()> {
        let kinds = self.kinds();
        let positional = |kind: &&SpecKind| {
            matches!(kind, SpecKind::Required | SpecKind::Optional | SpecKind::Splat)
        };
        let positionals: Vec<&SpecKind> = kinds.iter().filter(positional).collect();
        if let Some(index) = positionals.iter().position(|k| **k == SpecKind::Splat) {
            if index + 1 != positionals.len() {
                return Err(Error::Definition(
                    "a splat parameter must be the last positional parameter".to_string(),
                ));
            }
        }
        if kinds.iter().filter(|k| **k == SpecKind::Block).count() > 1 {
            return Err(Error::Definition(
                "at most one block parameter is allowed".to_string(),
            ));
        }
        Ok(())
    }

    /// Fail if positional arguments are left over after [`parse`](ArgList::parse).
    fn finish(&self, args: &CallArgs<'_>) -> Result<()> {
        if args.remaining().is_empty() {
            return Ok(());
        }
        let kinds = self.kinds();
        let required = kinds.iter().filter(|k| **k == SpecKind::Required).count();
        let optional = kinds.iter().filter(|k| **k == SpecKind::Optional).count();
        let expected = if optional == 0 {
            required.to_string()
        } else {
            format!("{required}..{}", required + optional)
        };
        Err(Error::Argument(format!(
            "wrong number of arguments (given {}, expected {expected})",
            args.given()
        )))
    }
}

impl ArgList for () {
    type Output = ();

    fn kinds(&self) -> Vec<SpecKind> {
        Vec::new()
    }

    fn parse(&self, _args: &mut CallArgs<'_>) -> Result<()> {
        Ok(())
    }
}

macro_rules! arg_list_tuple {
    ($($spec:ident => $out:ident => $index:tt),+) => {
        impl<$($spec: ArgSpec),+> ArgList for ($($spec,)+) {
            type Output = ($($spec::Output,)+);

            fn kinds(&self) -> Vec<SpecKind> {
                vec![$($spec::KIND),+]
            }

            fn parse(&self, args: &mut CallArgs<'_>) -> Result<Self::Output> {
                // One statement per spec keeps evaluation in declaration order.
                $(let $out = self.$index.parse(args)?;)+
                Ok(($($out,)+))
            }
        }
    };
}

arg_list_tuple!(A => a => 0);
arg_list_tuple!(A => a => 0, B => b => 1);
arg_list_tuple!(A => a => 0, B => b => 1, C => c => 2);
arg_list_tuple!(A => a => 0, B => b => 1, C => c => 2, D => d => 3);
arg_list_tuple!(A => a => 0, B => b => 1, C => c => 2, D => d => 3, E => e => 4);
arg_list_tuple!(A => a => 0, B => b => 1, C => c => 2, D => d => 3, E => e => 4, F => f => 5);
arg_list_tuple!(A => a => 0, B => b => 1, C => c => 2, D => d => 3, E => e => 4, F => f => 5, G => g => 6);
arg_list_tuple!(A => a => 0, B => b => 1, C => c => 2, D => d => 3, E => e => 4, F => f => 5, G => g => 6, H => h => 7);
