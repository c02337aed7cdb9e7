//! Conversion registry against a live sandbox
//!
//! Tests cover:
//! - Integer round trips at the edges of every native width
//! - Narrowing errors in both directions
//! - Coercions performed by the runtime (floats, `to_int`)
//! - Strings, options, vectors and fixed-length tuples

use std::rc::Rc;

use tether::{from_handle, into_handle, Attachment, Error, Handle, RString, Symbol, Value};
use tether_sandbox::Sandbox;

fn boot() -> (Rc<Sandbox>, Attachment) {
    let sandbox = Sandbox::new();
    let attached = sandbox.attach().unwrap();
    (sandbox, attached)
}

fn round_trip<T>(value: T) -> T
where
    T: tether::IntoHandle + tether::FromHandle,
{
    let handle = into_handle(value).unwrap();
    from_handle(handle).unwrap()
}

#[test]
fn test_integer_extremes_round_trip() {
    let (_sandbox, _attached) = boot();

    assert_eq!(round_trip(i64::MAX), i64::MAX);
    assert_eq!(round_trip(i64::MIN), i64::MIN);
    assert_eq!(round_trip(u64::MAX), u64::MAX);
    assert_eq!(round_trip(i8::MIN), i8::MIN);
    assert_eq!(round_trip(u8::MAX), u8::MAX);
    assert_eq!(round_trip(i32::MIN), i32::MIN);
    assert_eq!(round_trip(usize::MAX), usize::MAX);
    assert_eq!(round_trip(0_u16), 0);
}

#[test]
fn test_narrowing_reports_direction() {
    let (_sandbox, _attached) = boot();

    let big = into_handle(300_i64).unwrap();
    let err = from_handle::<i8>(big).unwrap_err();
    assert!(matches!(err, Error::Range(_)));
    assert_eq!(err.to_string(), "integer 300 too big to convert to 'i8'");

    let negative = into_handle(-1_i64).unwrap();
    let err = from_handle::<u32>(negative).unwrap_err();
    assert_eq!(err.to_string(), "integer -1 too small to convert to 'u32'");

    let huge = into_handle(u64::MAX).unwrap();
    let err = from_handle::<i64>(huge).unwrap_err();
    assert_eq!(
        err.to_string(),
        "integer 18446744073709551615 too big to convert to 'i64'"
    );
}

#[test]
fn test_runtime_coercions() {
    let (sandbox, _attached) = boot();

    assert_eq!(from_handle::<i64>(sandbox.float(3.7)).unwrap(), 3);
    assert_eq!(from_handle::<i64>(sandbox.float(-3.7)).unwrap(), -3);
    assert_eq!(from_handle::<f64>(sandbox.int(4)).unwrap(), 4.0);
    assert_eq!(round_trip(1.5_f64), 1.5);
    assert_eq!(round_trip(0.25_f32), 0.25);

    let err = from_handle::<i64>(sandbox.float(f64::NAN)).unwrap_err();
    let exception = err.exception().unwrap();
    assert_eq!(sandbox.class_name(exception), "FloatDomainError");

    let err = from_handle::<i64>(sandbox.string("12")).unwrap_err();
    let exception = err.exception().unwrap();
    assert_eq!(sandbox.class_name(exception), "TypeError");
    assert_eq!(
        sandbox.exception_message(exception),
        "no implicit conversion of String into Integer"
    );

    let err = from_handle::<i64>(Handle::NIL).unwrap_err();
    let exception = err.exception().unwrap();
    assert_eq!(
        sandbox.exception_message(exception),
        "no implicit conversion from nil to integer"
    );
}

#[test]
fn test_strings_and_symbols() {
    let (sandbox, _attached) = boot();

    assert_eq!(round_trip("héllo".to_string()), "héllo");

    let err = from_handle::<String>(sandbox.int(1)).unwrap_err();
    assert!(matches!(err, Error::Type(_)));
    assert_eq!(err.to_string(), "Expected a String but got a Integer");

    let interned = RString::interned("constant").unwrap();
    assert_eq!(interned, RString::interned("constant").unwrap());
    assert!(interned.as_value().is_frozen().unwrap());

    let symbol = Symbol::new("add").unwrap();
    assert_eq!(symbol.name().unwrap(), "add");
    assert_eq!(symbol.as_handle(), sandbox.symbol("add"));
}

#[test]
fn test_composites() {
    let (sandbox, _attached) = boot();

    assert_eq!(round_trip(vec![1_i64, 2, 3]), vec![1, 2, 3]);
    assert_eq!(round_trip(Some(7_i32)), Some(7));
    assert_eq!(round_trip(None::<String>), None);
    assert_eq!(
        round_trip((5_i64, "five".to_string())),
        (5, "five".to_string())
    );

    let pair = sandbox.array(&[sandbox.int(1), sandbox.int(2), sandbox.int(3)]);
    let err = from_handle::<(i64, i64)>(pair).unwrap_err();
    assert!(matches!(err, Error::Argument(_)));
    assert_eq!(err.to_string(), "Array of length 2 is expected");

    let mixed = sandbox.array(&[sandbox.int(1), sandbox.string("two")]);
    assert!(from_handle::<Vec<i64>>(mixed).is_err());
}

#[test]
fn test_value_helpers() {
    let (sandbox, _attached) = boot();

    let value = Value::from_handle(sandbox.array(&[sandbox.int(1), sandbox.string("x")]));
    assert_eq!(value.inspect().unwrap(), "[1, \"x\"]");
    assert_eq!(format!("{value:#}"), "[1, \"x\"]");
    assert!(value.respond_to("push").unwrap());
    assert_eq!(value.send::<i64>("length", ()).unwrap(), 2);

    value.ivar_set("@tag", 9_i64).unwrap();
    assert!(value.ivar_defined("@tag").unwrap());
    assert_eq!(value.ivar_get::<i64>("@tag").unwrap(), 9);

    value.freeze().unwrap();
    let err = value.check_frozen().unwrap_err();
    let exception = err.exception().unwrap();
    assert_eq!(sandbox.class_name(exception), "FrozenError");
}
