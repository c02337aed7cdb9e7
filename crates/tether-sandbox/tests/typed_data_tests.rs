//! Native payloads bound to managed classes
//!
//! Tests cover:
//! - Constructors, mutating and shared methods
//! - Access before initialization and on frozen objects
//! - Copying through `dup`
//! - Binding rules for types and subclasses

use std::rc::Rc;

use tether::args::{arg, arg_opt, block, receiver};
use tether::{
    Attachment, Builtin, Class, DataType, Error, FromHandle, Handle, Module, Obj, Proc, ReprValue,
    TypedData, Value,
};
use tether_sandbox::{Caught, Sandbox};

fn boot() -> (Rc<Sandbox>, Attachment) {
    let sandbox = Sandbox::new();
    let attached = sandbox.attach().unwrap();
    (sandbox, attached)
}

#[derive(Debug, Clone, Default)]
struct Counter {
    count: i64,
    step: i64,
}

impl TypedData for Counter {}

fn define_counter() -> tether::TypedClass<Counter> {
    let object = Module::object().unwrap();
    object
        .define_data_class::<Counter>("Counter", Class::builtin(Builtin::Object).unwrap())
        .unwrap()
        .define_constructor((arg::<i64>("start"), arg_opt::<i64>("step")), |(start, step)| {
            Ok(Counter {
                count: start,
                step: step.unwrap_or(1),
            })
        })
        .unwrap()
        .define_method("increment", (), |counter, ()| {
            counter.count += counter.step;
            counter.count
        })
        .unwrap()
        .define_method_const("count", (), |counter, ()| counter.count)
        .unwrap()
        .define_copy_constructor()
        .unwrap()
}

fn raised_message(sandbox: &Sandbox, result: Result<Handle, Caught>) -> (String, String) {
    match result {
        Err(Caught::Raised(exception)) => (
            sandbox.class_name(exception),
            sandbox.exception_message(exception),
        ),
        other => panic!("expected a raise, got {other:?}"),
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_construct_and_mutate() {
    let (sandbox, _attached) = boot();
    let class = define_counter();

    let counter = class.new_instance((10_i64, 5_i64)).unwrap();
    assert_eq!(counter.send::<i64>("increment", ()).unwrap(), 15);
    assert_eq!(counter.send::<i64>("increment", ()).unwrap(), 20);
    assert_eq!(counter.send::<i64>("count", ()).unwrap(), 20);
    assert_eq!(sandbox.class_name(counter.as_handle()), "Counter");

    let payload = Obj::<Counter>::from_handle(counter.as_handle()).unwrap();
    assert_eq!(payload.step, 5);
}

#[test]
fn test_constructor_arguments_are_parsed() {
    let (sandbox, _attached) = boot();
    define_counter();
    let class = sandbox.class_named("Counter");

    let counter = sandbox.call(class, "new", &[sandbox.int(3)]);
    assert_eq!(sandbox.call(counter, "increment", &[]), sandbox.int(4));

    let (class_name, message) =
        raised_message(&sandbox, sandbox.capture(|| sandbox.call(class, "new", &[])));
    assert_eq!(class_name, "ArgumentError");
    assert_eq!(message, "Missing required argument (start)");
}

#[test]
fn test_uninitialized_access() {
    let (sandbox, _attached) = boot();
    let class = define_counter();

    let shell = class.allocate().unwrap();
    let err = shell.send::<i64>("count", ()).unwrap_err();
    let exception = err.exception().unwrap();
    assert_eq!(sandbox.class_name(exception), "RuntimeError");
    assert!(
        sandbox
            .exception_message(exception)
            .ends_with("Counter object is not yet initialized"),
        "{}",
        sandbox.exception_message(exception)
    );

    DataType::<Counter>::initialize(shell, Counter { count: 7, step: 1 }).unwrap();
    assert_eq!(shell.send::<i64>("count", ()).unwrap(), 7);

    let err = DataType::<Counter>::initialize(shell, Counter::default()).unwrap_err();
    assert!(err.to_string().ends_with("Counter object is already initialized"), "{err}");
}

#[test]
fn test_frozen_object_refuses_mutation() {
    let (sandbox, _attached) = boot();
    let class = define_counter();

    let counter = class.new_instance((1_i64,)).unwrap();
    counter.freeze().unwrap();

    let err = counter.send::<i64>("increment", ()).unwrap_err();
    let exception = err.exception().unwrap();
    assert_eq!(sandbox.class_name(exception), "FrozenError");
    assert_eq!(sandbox.exception_message(exception), "can't modify frozen Counter");

    assert_eq!(counter.send::<i64>("count", ()).unwrap(), 1);
}

#[test]
fn test_dup_copies_payload() {
    let (_sandbox, _attached) = boot();
    let class = define_counter();

    let original = class.new_instance((1_i64,)).unwrap();
    let copy: Value = original.send("dup", ()).unwrap();
    assert_ne!(copy, original);

    copy.send::<i64>("increment", ()).unwrap();
    copy.send::<i64>("increment", ()).unwrap();
    assert_eq!(copy.send::<i64>("count", ()).unwrap(), 3);
    assert_eq!(original.send::<i64>("count", ()).unwrap(), 1);
}

#[test]
fn test_wrap_and_typed_arguments() {
    let (sandbox, _attached) = boot();
    define_counter();
    Module::object()
        .unwrap()
        .define_method(
            "total",
            (receiver::<Value>(), arg::<Obj<Counter>>("a"), arg::<Obj<Counter>>("b")),
            |(_, a, b)| a.count + b.count,
        )
        .unwrap();

    let a = DataType::wrap(Counter { count: 2, step: 1 }).unwrap();
    let b = DataType::wrap(Counter { count: 40, step: 1 }).unwrap();
    let total = sandbox.call(Handle::NIL, "total", &[a.as_handle(), b.as_handle()]);
    assert_eq!(total, sandbox.int(42));

    let (class_name, message) = raised_message(
        &sandbox,
        sandbox.capture(|| {
            sandbox.call(Handle::NIL, "total", &[a.as_handle(), sandbox.int(1)])
        }),
    );
    assert_eq!(class_name, "TypeError");
    assert!(message.contains("Integer"), "{message}");
}

// ============================================================================
// Reentrant access
// ============================================================================

#[derive(Debug, Default)]
struct Bag {
    items: Vec<i64>,
}

impl TypedData for Bag {}

fn define_bag() -> tether::TypedClass<Bag> {
    Module::object()
        .unwrap()
        .define_data_class::<Bag>("Bag", Class::builtin(Builtin::Object).unwrap())
        .unwrap()
        .define_constructor((), |()| Ok(Bag::default()))
        .unwrap()
        .define_method("push_each", (block(),), |bag, (body,): (Proc,)| -> tether::Result<usize> {
            for item in [1_i64, 2] {
                let value: i64 = body.call((item,))?;
                bag.items.push(value);
            }
            Ok(bag.items.len())
        })
        .unwrap()
        .define_method_const("size", (), |bag, ()| bag.items.len())
        .unwrap()
        .define_method_const("with_size", (block(),), |_bag, (body,): (Proc,)| -> tether::Result<i64> {
            body.call(())
        })
        .unwrap()
}

#[test]
fn test_exclusive_access_is_not_reentrant() {
    let (sandbox, _attached) = boot();
    let bag = define_bag().new_instance(()).unwrap().as_handle();

    let reads_same_bag = sandbox.proc_new(move |sb, _| sb.call(bag, "size", &[]));
    let (class_name, message) = raised_message(
        &sandbox,
        sandbox.capture(|| sandbox.call_with_block(bag, "push_each", &[], reads_same_bag)),
    );
    assert_eq!(class_name, "RuntimeError");
    assert!(message.ends_with("Bag is already mutably borrowed"), "{message}");

    // The failed call released its borrow.
    assert_eq!(sandbox.call(bag, "size", &[]), sandbox.int(0));
}

#[test]
fn test_shared_access_is_reentrant() {
    let (sandbox, _attached) = boot();
    let class = define_bag();
    let bag = class.new_instance(()).unwrap().as_handle();

    let doubles = sandbox.proc_new(|sb, args| sb.call(args[0], "*", &[sb.int(2)]));
    assert_eq!(sandbox.call_with_block(bag, "push_each", &[], doubles), sandbox.int(2));

    let reads_same_bag = sandbox.proc_new(move |sb, _| sb.call(bag, "size", &[]));
    assert_eq!(sandbox.call_with_block(bag, "with_size", &[], reads_same_bag), sandbox.int(2));

    let other = class.new_instance(()).unwrap().as_handle();
    let fills_other = sandbox.proc_new(move |sb, args| {
        sb.call_with_block(other, "push_each", &[], sb.proc_new(|_, args| args[0]));
        args[0]
    });
    assert_eq!(sandbox.call_with_block(bag, "push_each", &[], fills_other), sandbox.int(4));
    assert_eq!(sandbox.call(other, "size", &[]), sandbox.int(4));
}

// ============================================================================
// Binding rules
// ============================================================================

#[derive(Debug, Default)]
struct Gauge;

impl TypedData for Gauge {}

#[test]
fn test_type_binds_once() {
    let (_sandbox, _attached) = boot();
    define_counter();
    assert!(DataType::<Counter>::is_bound());

    let other = Class::new(Class::builtin(Builtin::Object).unwrap()).unwrap();
    let err = DataType::<Counter>::bind(other).unwrap_err();
    assert!(matches!(err, Error::Definition(_)));
    assert!(err.to_string().contains("is already bound to a managed class"), "{err}");
}

#[test]
fn test_subclass_binding_rules() {
    let (_sandbox, _attached) = boot();
    let counter = define_counter();
    let object = Module::object().unwrap();

    let err = object
        .define_data_class::<Gauge>("Dial", counter.class())
        .unwrap_err();
    assert!(matches!(err, Error::Definition(_)));
    assert_eq!(err.to_string(), "superclass has mismatching static type");
    assert!(!DataType::<Gauge>::is_bound());

    let stepper = object
        .define_data_class::<Counter>("Stepper", counter.class())
        .unwrap();
    let instance = stepper.new_instance((5_i64, 2_i64)).unwrap();
    assert_eq!(instance.send::<i64>("increment", ()).unwrap(), 7);
    assert!(instance.is_kind_of(counter.class()).unwrap());
}

#[test]
fn test_unbound_type_is_reported() {
    let (_sandbox, _attached) = boot();
    let err = DataType::<Gauge>::wrap(Gauge).unwrap_err();
    assert!(matches!(err, Error::Definition(_)));
    assert!(err.to_string().contains("is not yet bound"), "{err}");
}

#[test]
fn test_failed_bind_keeps_no_root() {
    let (sandbox, _attached) = boot();
    let module = Module::new().unwrap().as_handle();
    // SAFETY: deliberately mistyped; binding must reject it.
    let not_a_class = unsafe { <Class as ReprValue>::from_handle_unchecked(module) };

    let err = DataType::<Gauge>::bind(not_a_class).unwrap_err();
    let exception = err.exception().unwrap();
    assert_eq!(sandbox.class_name(exception), "TypeError");
    assert!(!DataType::<Gauge>::is_bound());

    sandbox.gc_start();
    assert!(!sandbox.is_live(module));
}
