//! Native methods end to end: definition, argument parsing, dispatch through
//! generated entries, and every way a call can fail.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tether::args::{arg, arg_opt, arg_splat, block, block_opt, receiver};
use tether::{
    into_handle, Attachment, Builtin, Class, Error, FromHandle, Handle, Module, Proc, Result, Value,
};
use tether_sandbox::{Caught, Sandbox};

fn boot() -> (Rc<Sandbox>, Attachment) {
    let sandbox = Sandbox::new();
    let attached = sandbox.attach().unwrap();
    (sandbox, attached)
}

/// The class name and message of the exception `f` raised.
fn raised(sandbox: &Sandbox, f: impl FnOnce() -> Handle) -> (String, String) {
    match sandbox.capture(f) {
        Err(Caught::Raised(exception)) => (
            sandbox.class_name(exception),
            sandbox.exception_message(exception),
        ),
        other => panic!("expected a raise, got {other:?}"),
    }
}

// ============================================================================
// Dispatch
// ============================================================================

#[test]
fn test_add_end_to_end() {
    let (sandbox, _attached) = boot();
    let integer = Class::builtin(Builtin::Integer).unwrap();
    integer
        .define_method("add", (receiver::<i64>(), arg::<i64>("n")), |(this, n)| this + n)
        .unwrap();

    let five = sandbox.int(5);
    assert_eq!(sandbox.call(five, "add", &[sandbox.int(3)]), sandbox.int(8));

    let (class, message) = raised(&sandbox, || sandbox.call(five, "add", &[]));
    assert_eq!(class, "ArgumentError");
    assert_eq!(message, "Missing required argument (n)");

    let (class, message) = raised(&sandbox, || {
        sandbox.call(five, "add", &[sandbox.int(1), sandbox.int(2)])
    });
    assert_eq!(class, "ArgumentError");
    assert_eq!(message, "wrong number of arguments (given 2, expected 1)");

    let (class, _) = raised(&sandbox, || sandbox.call(five, "add", &[sandbox.string("3")]));
    assert_eq!(class, "TypeError");
}

#[test]
fn test_overflowing_result_is_a_bignum() {
    let (sandbox, _attached) = boot();
    let integer = Class::builtin(Builtin::Integer).unwrap();
    integer
        .define_method("quadruple", (receiver::<u64>(),), |(this,)| this * 4)
        .unwrap();

    let result = sandbox.call(sandbox.int(1 << 60), "quadruple", &[]);
    assert_eq!(sandbox.class_name(result), "Integer");
    assert_eq!(u64::from_handle(result).unwrap(), 1 << 62);
    assert_eq!(sandbox.inspect_string(result), (1_u64 << 62).to_string());
}

#[test]
fn test_singleton_and_module_methods() {
    let (sandbox, _attached) = boot();
    let object = Module::object().unwrap();
    let tools = object.define_module("Tools").unwrap();
    tools
        .as_value()
        .define_singleton_method("double", (arg::<i64>("n"),), |(n,)| n * 2)
        .unwrap();

    let handle = sandbox.class_named("Tools");
    assert_eq!(handle, tools.as_handle());
    assert_eq!(sandbox.call(handle, "double", &[sandbox.int(21)]), sandbox.int(42));
    assert_eq!(tools.name().unwrap(), "Tools");

    let nested = tools.define_class("Hammer", Class::builtin(Builtin::Object).unwrap()).unwrap();
    assert_eq!(nested.name().unwrap(), "Tools::Hammer");
    assert_eq!(tools.const_get::<Class>("Hammer").unwrap(), nested);
}

#[test]
fn test_definition_errors() {
    let (sandbox, _attached) = boot();
    let object = Module::object().unwrap();

    let err = object
        .define_method("bad", (arg_splat::<Value>(), arg::<Value>("x")), |_| ())
        .unwrap_err();
    assert!(matches!(err, Error::Definition(_)));
    assert!(err.to_string().starts_with("Object#bad:"), "{err}");

    let err = object.define_method("blocks", (block(), block_opt()), |_| ()).unwrap_err();
    assert!(matches!(err, Error::Definition(_)));

    let base = object.define_class("Base", Class::builtin(Builtin::Object).unwrap()).unwrap();
    let err = object
        .define_class("Base", Class::builtin(Builtin::StandardError).unwrap())
        .unwrap_err();
    let exception = err.exception().unwrap();
    assert_eq!(sandbox.class_name(exception), "TypeError");
    assert_eq!(sandbox.exception_message(exception), "superclass mismatch for class Base");
    assert_eq!(
        object.define_class("Base", Class::builtin(Builtin::Object).unwrap()).unwrap(),
        base
    );
}

// ============================================================================
// Argument parsing
// ============================================================================

#[test]
fn test_required_optional_splat() {
    let (sandbox, _attached) = boot();
    Module::object()
        .unwrap()
        .define_method(
            "describe",
            (receiver::<Value>(), arg::<i64>("a"), arg_opt::<i64>("b"), arg_splat::<i64>()),
            |(_, a, b, rest)| format!("{a}|{b:?}|{rest:?}"),
        )
        .unwrap();

    let call = |args: &[Handle]| sandbox.read_string(sandbox.call(Handle::NIL, "describe", args));
    assert_eq!(call(&[sandbox.int(1)]), "1|None|[]");
    assert_eq!(call(&[sandbox.int(1), sandbox.int(2)]), "1|Some(2)|[]");
    assert_eq!(
        call(&[sandbox.int(1), sandbox.int(2), sandbox.int(3), sandbox.int(4)]),
        "1|Some(2)|[3, 4]"
    );

    let (class, message) = raised(&sandbox, || sandbox.call(Handle::NIL, "describe", &[]));
    assert_eq!(class, "ArgumentError");
    assert_eq!(message, "Missing required argument (a)");
}

thread_local! {
    static CONVERTED: RefCell<Vec<Option<i64>>> = const { RefCell::new(Vec::new()) };
}

/// An integer argument that records the order it was converted in.
struct Recorded(i64);

impl FromHandle for Recorded {
    fn from_handle(handle: Handle) -> Result<Self> {
        let value = i64::from_handle(handle);
        CONVERTED.with(|log| log.borrow_mut().push(value.as_ref().ok().copied()));
        value.map(Recorded)
    }
}

#[test]
fn test_arguments_convert_left_to_right() {
    let (sandbox, _attached) = boot();
    Module::object()
        .unwrap()
        .define_method(
            "sum3",
            (arg::<Recorded>("a"), arg::<Recorded>("b"), arg::<Recorded>("c")),
            |(a, b, c)| a.0 + b.0 + c.0,
        )
        .unwrap();

    let args = [sandbox.int(1), sandbox.int(2), sandbox.int(3)];
    assert_eq!(sandbox.call(Handle::NIL, "sum3", &args), sandbox.int(6));
    assert_eq!(CONVERTED.with(|log| log.take()), vec![Some(1), Some(2), Some(3)]);

    let args = [sandbox.int(1), sandbox.string("two"), sandbox.int(3)];
    let (class, _) = raised(&sandbox, || sandbox.call(Handle::NIL, "sum3", &args));
    assert_eq!(class, "TypeError");
    assert_eq!(CONVERTED.with(|log| log.take()), vec![Some(1), None]);
}

#[test]
fn test_blocks() {
    let (sandbox, _attached) = boot();
    let object = Module::object().unwrap();
    object
        .define_method("twice", (block(),), |(body,): (Proc,)| -> Result<i64> {
            let first: i64 = body.call((1_i64,))?;
            let second: i64 = body.call((first,))?;
            Ok(second)
        })
        .unwrap();
    object
        .define_method("maybe", (block_opt(),), |(body,): (Option<Proc>,)| body.is_some())
        .unwrap();

    let add_ten = sandbox.proc_new(|sb, args| sb.call(args[0], "+", &[sb.int(10)]));
    assert_eq!(
        sandbox.call_with_block(Handle::NIL, "twice", &[], add_ten),
        sandbox.int(21)
    );
    assert_eq!(sandbox.call_with_block(Handle::NIL, "maybe", &[], add_ten), Handle::TRUE);
    assert_eq!(sandbox.call(Handle::NIL, "maybe", &[]), Handle::FALSE);

    let (class, message) = raised(&sandbox, || sandbox.call(Handle::NIL, "twice", &[]));
    assert_eq!(class, "ArgumentError");
    assert_eq!(message, "tried to create Proc object without a block");
}

// ============================================================================
// Transfers
// ============================================================================

fn define_relay() {
    Module::object()
        .unwrap()
        .define_method("relay", (receiver::<Value>(), block()), |(_, body)| {
            body.call::<Value>(())
        })
        .unwrap();
}

#[test]
fn test_raise_keeps_identity() {
    let (sandbox, _attached) = boot();
    define_relay();

    let runtime_error = sandbox.class_named("RuntimeError");
    let original = sandbox.exception_new(runtime_error, "original");
    let body = sandbox.proc_new(move |sb, _| sb.raise(original));

    match sandbox.capture(|| sandbox.call_with_block(Handle::NIL, "relay", &[], body)) {
        Err(Caught::Raised(exception)) => assert_eq!(exception, original),
        other => panic!("expected the original exception, got {other:?}"),
    }
}

#[test]
fn test_throw_through_native_frame() {
    let (sandbox, _attached) = boot();
    define_relay();

    let tag = sandbox.symbol("escape");
    let body = sandbox.proc_new(move |sb, _| sb.throw(tag, sb.int(42)));
    let value = sandbox.catch(tag, || sandbox.call_with_block(Handle::NIL, "relay", &[], body));
    assert_eq!(value, sandbox.int(42));

    // Nothing is left armed after the transfer was replayed.
    assert_eq!(sandbox.call(sandbox.int(1), "+", &[sandbox.int(1)]), sandbox.int(2));
}

#[test]
fn test_nested_native_calls_unwind_cleanly() {
    let (sandbox, _attached) = boot();
    Class::builtin(Builtin::Integer)
        .unwrap()
        .define_method("descend", (receiver::<i64>(),), |(depth,)| -> Result<i64> {
            if depth == 0 {
                return Err(Error::Argument("bottom reached".to_string()));
            }
            let below = Value::from_handle(into_handle(depth - 1)?);
            Ok(below.send::<i64>("descend", ())? + 1)
        })
        .unwrap();

    let (class, message) = raised(&sandbox, || sandbox.call(sandbox.int(3), "descend", &[]));
    assert_eq!(class, "ArgumentError");
    assert_eq!(message, "bottom reached");

    // The sandbox is still usable afterwards.
    assert_eq!(sandbox.call(sandbox.int(2), "+", &[sandbox.int(2)]), sandbox.int(4));
}

#[test]
fn test_nested_native_calls_return_innermost_result() {
    let (sandbox, _attached) = boot();
    Class::builtin(Builtin::Integer)
        .unwrap()
        .define_method("descend", (receiver::<i64>(),), |(depth,)| -> Result<i64> {
            if depth == 0 {
                return Ok(1000);
            }
            let below = Value::from_handle(into_handle(depth - 1)?);
            below.send::<i64>("descend", ())
        })
        .unwrap();

    assert_eq!(sandbox.call(sandbox.int(3), "descend", &[]), sandbox.int(1000));
}

#[derive(Debug)]
struct Overheated;

impl fmt::Display for Overheated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("core temperature exceeded")
    }
}

impl std::error::Error for Overheated {}

#[test]
fn test_native_failures_become_runtime_errors() {
    let (sandbox, _attached) = boot();
    let object = Module::object().unwrap();
    object
        .define_method("explode", (), |()| -> Value { panic!("boom") })
        .unwrap();
    object
        .define_method("overheat", (), |()| -> Result<Value> { Err(Error::native(Overheated)) })
        .unwrap();
    object
        .define_method("mystery", (), |()| -> Value { std::panic::panic_any(7_u32) })
        .unwrap();

    let (class, message) = raised(&sandbox, || sandbox.call(Handle::NIL, "explode", &[]));
    assert_eq!(class, "RuntimeError");
    assert_eq!(message, "panic: boom");

    let (class, message) = raised(&sandbox, || sandbox.call(Handle::NIL, "overheat", &[]));
    assert_eq!(class, "RuntimeError");
    assert!(message.ends_with("Overheated: core temperature exceeded"), "{message}");

    let (class, message) = raised(&sandbox, || sandbox.call(Handle::NIL, "mystery", &[]));
    assert_eq!(class, "RuntimeError");
    assert_eq!(message, "unknown: ");
}

#[test]
fn test_error_kinds_pick_exception_class() {
    let (sandbox, _attached) = boot();
    let object = Module::object().unwrap();
    object
        .define_method("limit", (), |()| -> Result<Value> {
            Err(Error::Range("over the limit".to_string()))
        })
        .unwrap();
    object
        .define_method("locked", (), |()| -> Result<Value> {
            Err(Error::Frozen("locked down".to_string()))
        })
        .unwrap();

    let (class, message) = raised(&sandbox, || sandbox.call(Handle::NIL, "limit", &[]));
    assert_eq!(class, "RangeError");
    assert_eq!(message, "over the limit");

    let (class, message) = raised(&sandbox, || sandbox.call(Handle::NIL, "locked", &[]));
    assert_eq!(class, "FrozenError");
    assert_eq!(message, "locked down");
}

#[test]
fn test_error_new_builds_exception() {
    let (sandbox, _attached) = boot();
    let index_error = Class::new(Class::builtin(Builtin::StandardError).unwrap()).unwrap();
    Module::object().unwrap().const_set("IndexError", index_error).unwrap();
    Module::object()
        .unwrap()
        .define_method("lookup", (arg::<i64>("index"),), move |(index,)| -> Result<Value> {
            Err(Error::new(index_error, &format!("index {index} outside of array")))
        })
        .unwrap();

    let (class, message) =
        raised(&sandbox, || sandbox.call(Handle::NIL, "lookup", &[sandbox.int(9)]));
    assert_eq!(class, "IndexError");
    assert_eq!(message, "index 9 outside of array");
}

#[test]
fn test_entries_are_generated_per_registration() {
    let (_sandbox, _attached) = boot();
    let before = tether::trampoline::emitted();
    let object = Module::object().unwrap();
    object.define_method("one", (), |()| 1_i64).unwrap();
    object.define_method("two", (), |()| 2_i64).unwrap();
    assert!(tether::trampoline::emitted() >= before + 2);
}
