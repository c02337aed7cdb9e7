//! Method dispatch and non-local transfers
//!
//! Every transfer, raise included, is a Rust unwind carrying a
//! [`Jump`] payload. The pending exception travels in `errinfo` and a
//! pending `throw` in `thrown`; [`Sandbox::protect_body`] is the only place
//! that stops the unwind.
//!
//! Native entries never unwind: the bridge arms a [`Transfer`] and returns
//! `UNDEF`, and [`Sandbox::invoke`] replays the armed transfer from here.

use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};

use tether::{Handle, Jump, RawId, Tag, Transfer};

use crate::heap::{Kind, Method};
use crate::{Caught, Sandbox};

/// One method or block activation. Receiver, arguments and block are roots.
pub(crate) struct Frame {
    pub receiver: Handle,
    pub args: Vec<Handle>,
    pub block: Option<Handle>,
}

struct FrameGuard<'a>(&'a Sandbox);

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.0.frames.borrow_mut().pop();
    }
}

struct CatchGuard<'a>(&'a Sandbox);

impl Drop for CatchGuard<'_> {
    fn drop(&mut self) {
        self.0.catch_tags.borrow_mut().pop();
    }
}

impl Sandbox {
    // ========================================================================
    // Lookup
    // ========================================================================

    /// Method `id` in `class` or its ancestors.
    pub(crate) fn find_method(&self, class: Handle, id: RawId) -> Option<Method> {
        let heap = self.heap.borrow();
        let mut current = Some(class);
        while let Some(class) = current {
            let module = heap.get(class)?.module()?;
            if let Some(method) = module.methods.get(&id) {
                return Some(*method);
            }
            current = module.superclass;
        }
        None
    }

    fn own_method(&self, module: Handle, id: RawId) -> Option<Method> {
        self.with_module(module, |m| m.methods.get(&id).copied())
            .flatten()
    }

    /// Method `id` as seen by `receiver`.
    ///
    /// Class objects also see the singleton methods of their superclasses.
    pub(crate) fn method_for(&self, receiver: Handle, id: RawId) -> Option<Method> {
        if self.is_class(receiver) {
            let mut current = Some(receiver);
            while let Some(class) = current {
                if let Some(method) = self
                    .own_singleton(class)
                    .and_then(|singleton| self.own_method(singleton, id))
                {
                    return Some(method);
                }
                current = self.superclass_of(class);
            }
        }
        self.find_method(self.dispatch_class(receiver), id)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Send `id` to `receiver`. Transfers on failure.
    pub(crate) fn call_method(
        &self,
        receiver: Handle,
        id: RawId,
        args: &[Handle],
        block: Option<Handle>,
    ) -> Handle {
        match self.method_for(receiver, id) {
            Some(method) => self.invoke(receiver, method, args, block),
            None => {
                let message = format!(
                    "undefined method '{}' for an instance of {}",
                    self.name_of(id),
                    self.class_name(receiver)
                );
                self.raise_new(self.classes.no_method_error, &message)
            }
        }
    }

    fn invoke(&self, receiver: Handle, method: Method, args: &[Handle], block: Option<Handle>) -> Handle {
        self.frames.borrow_mut().push(Frame {
            receiver,
            args: args.to_vec(),
            block,
        });
        let _frame = FrameGuard(self);
        match method {
            Method::Builtin(body) => body(self, receiver, args, block),
            Method::Native(entry) => {
                let argc = match c_int::try_from(args.len()) {
                    Ok(argc) => argc,
                    Err(_) => self.argument_error("too many arguments"),
                };
                // SAFETY: `args` outlives the call and holds `argc` handles.
                let result = unsafe { entry(argc, args.as_ptr(), receiver) };
                if let Some(transfer) = self.armed.take() {
                    log::trace!("replaying {transfer:?}");
                    self.replay(transfer);
                }
                if result.is_undef() {
                    log::warn!("native method returned UNDEF without arming a transfer");
                    return Handle::NIL;
                }
                result
            }
        }
    }

    /// Send `name` to `receiver`. Transfers on failure.
    pub fn call(&self, receiver: Handle, name: &str, args: &[Handle]) -> Handle {
        let id = self.id(name);
        self.call_method(receiver, id, args, None)
    }

    /// Send `name` to `receiver` with a block. Transfers on failure.
    pub fn call_with_block(&self, receiver: Handle, name: &str, args: &[Handle], block: Handle) -> Handle {
        let id = self.id(name);
        self.call_method(receiver, id, args, Some(block))
    }

    /// Call a proc or lambda in a fresh block frame.
    pub(crate) fn call_proc(&self, proc: Handle, args: &[Handle]) -> Handle {
        let body = self
            .with_object(proc, |object| match &object.kind {
                Kind::Proc(data) => Some(data.body.clone()),
                _ => None,
            })
            .flatten();
        let Some(body) = body else {
            let message = format!("wrong argument type {} (expected Proc)", self.class_name(proc));
            self.type_error(&message)
        };
        self.frames.borrow_mut().push(Frame {
            receiver: proc,
            args: args.to_vec(),
            block: None,
        });
        let _frame = FrameGuard(self);
        body(self, args)
    }

    pub(crate) fn current_block(&self) -> Option<Handle> {
        self.frames.borrow().last().and_then(|frame| frame.block)
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Raise `exception`.
    pub fn raise(&self, exception: Handle) -> ! {
        log::trace!("raise {exception:?}");
        self.errinfo.set(exception);
        panic::resume_unwind(Box::new(Jump::new(Tag::RAISE)))
    }

    /// Raise a new exception of `class` with `message`.
    pub fn raise_new(&self, class: Handle, message: &str) -> ! {
        let exception = self.exception_new(class, message);
        self.raise(exception)
    }

    /// New exception of `class` with `message`, not raised.
    pub fn exception_new(&self, class: Handle, message: &str) -> Handle {
        let exception = self.alloc(class, Kind::Plain);
        let message = self.string(message);
        self.with_object_mut(exception, |object| object.set_ivar(self.ids.message, message));
        exception
    }

    pub(crate) fn type_error(&self, message: &str) -> ! {
        self.raise_new(self.classes.type_error, message)
    }

    pub(crate) fn argument_error(&self, message: &str) -> ! {
        self.raise_new(self.classes.argument_error, message)
    }

    /// Raise `ArgumentError` unless `min <= args.len() <= max`.
    pub(crate) fn check_arity(&self, args: &[Handle], min: usize, max: Option<usize>) {
        let given = args.len();
        if given >= min && max.map_or(true, |max| given <= max) {
            return;
        }
        let expected = match max {
            Some(max) if max == min => min.to_string(),
            Some(max) => format!("{min}..{max}"),
            None => format!("{min}+"),
        };
        self.argument_error(&format!(
            "wrong number of arguments (given {given}, expected {expected})"
        ))
    }

    pub(crate) fn jump(&self, tag: Tag) -> ! {
        log::trace!("jump {tag:?}");
        panic::resume_unwind(Box::new(Jump::new(tag)))
    }

    pub(crate) fn replay(&self, transfer: Transfer) -> ! {
        match transfer {
            Transfer::Raise(exception) => self.raise(exception),
            Transfer::Jump(tag) => self.jump(tag),
        }
    }

    /// Run `body`, stopping any transfer it performs. Foreign panics pass.
    pub(crate) fn protect_body(&self, body: &mut dyn FnMut()) -> Tag {
        let depth = self.frames.borrow().len();
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(()) => Tag::NONE,
            Err(payload) => match payload.downcast::<Jump>() {
                Ok(jump) => {
                    debug_assert_eq!(self.frames.borrow().len(), depth);
                    jump.tag()
                }
                Err(payload) => panic::resume_unwind(payload),
            },
        }
    }

    /// Run `f`, returning any transfer it performs as an error.
    pub fn capture<R>(&self, f: impl FnOnce() -> R) -> Result<R, Caught> {
        let mut f = Some(f);
        let mut result = None;
        let tag = self.protect_body(&mut || {
            if let Some(f) = f.take() {
                result = Some(f());
            }
        });
        match tag {
            Tag::NONE => result.ok_or(Caught::Jumped(Tag::FATAL)),
            Tag::RAISE => Err(Caught::Raised(self.errinfo.replace(Handle::NIL))),
            other => Err(Caught::Jumped(other)),
        }
    }

    /// Run `body` under a catch for `tag`; a matching throw returns its value.
    pub fn catch(&self, tag: Handle, body: impl FnOnce() -> Handle) -> Handle {
        self.catch_tags.borrow_mut().push(tag);
        let _guard = CatchGuard(self);
        let mut body = Some(body);
        let mut result = Handle::NIL;
        let outcome = self.protect_body(&mut || {
            if let Some(body) = body.take() {
                result = body();
            }
        });
        match outcome {
            Tag::NONE => result,
            Tag::THROW => match self.thrown.get() {
                Some((thrown, value)) if thrown == tag => {
                    self.thrown.set(None);
                    value
                }
                _ => self.jump(Tag::THROW),
            },
            Tag::RAISE => {
                let exception = self.errinfo.replace(Handle::NIL);
                self.raise(exception)
            }
            other => self.jump(other),
        }
    }

    /// Throw `value` to the innermost catch for `tag`.
    ///
    /// Raises `UncaughtThrowError` when no catch for `tag` is active.
    pub fn throw(&self, tag: Handle, value: Handle) -> ! {
        if !self.catch_tags.borrow().contains(&tag) {
            let message = format!("uncaught throw {}", self.inspect_string(tag));
            self.raise_new(self.classes.uncaught_throw_error, &message)
        }
        self.thrown.set(Some((tag, value)));
        self.jump(Tag::THROW)
    }
}
