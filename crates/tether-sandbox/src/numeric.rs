//! Integers and floats
//!
//! Integers within 62 bits are fixnums; wider ones up to `i128` live on the
//! heap as frozen bignums. Floats are always heap objects.

use tether::Handle;

use crate::heap::{decode, fixnum, Imm, Kind, FIXNUM_MAX, FIXNUM_MIN};
use crate::Sandbox;

/// A numeric operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Number {
    Int(i128),
    Float(f64),
}

impl Sandbox {
    pub(crate) fn make_integer(&self, value: i128) -> Handle {
        if (FIXNUM_MIN..=FIXNUM_MAX).contains(&value) {
            // In range, so the cast is lossless.
            return fixnum(value as i64);
        }
        let handle = self.alloc(self.classes.integer, Kind::Bignum(value));
        self.with_object_mut(handle, |object| object.frozen = true);
        handle
    }

    pub(crate) fn make_float(&self, value: f64) -> Handle {
        let handle = self.alloc(self.classes.float, Kind::Float(value));
        self.with_object_mut(handle, |object| object.frozen = true);
        handle
    }

    /// The value of an Integer or Float, without coercion.
    pub(crate) fn number(&self, value: Handle) -> Option<Number> {
        match decode(value) {
            Imm::Fixnum(n) => Some(Number::Int(i128::from(n))),
            Imm::Heap(_) => self
                .with_object(value, |object| match object.kind {
                    Kind::Bignum(n) => Some(Number::Int(n)),
                    Kind::Float(f) => Some(Number::Float(f)),
                    _ => None,
                })
                .flatten(),
            _ => None,
        }
    }

    pub(crate) fn number_handle(&self, number: Number) -> Handle {
        match number {
            Number::Int(n) => self.make_integer(n),
            Number::Float(f) => self.make_float(f),
        }
    }

    /// Implicit integer conversion: Integer, truncated Float, or `to_int`.
    pub(crate) fn coerce_integer(&self, value: Handle) -> i128 {
        match self.number(value) {
            Some(Number::Int(n)) => return n,
            Some(Number::Float(f)) => return self.float_to_integer(f),
            None => {}
        }
        if matches!(decode(value), Imm::Nil) {
            self.type_error("no implicit conversion from nil to integer")
        }
        if self.method_for(value, self.ids.to_int).is_some() {
            let converted = self.call_method(value, self.ids.to_int, &[], None);
            if let Some(Number::Int(n)) = self.number(converted) {
                return n;
            }
            let message = format!(
                "can't convert {} to Integer ({}#to_int gives {})",
                self.class_name(value),
                self.class_name(value),
                self.class_name(converted)
            );
            self.type_error(&message)
        }
        let message = format!("no implicit conversion of {} into Integer", self.describe(value));
        self.type_error(&message)
    }

    fn float_to_integer(&self, value: f64) -> i128 {
        if value.is_nan() || value.is_infinite() {
            let message = if value.is_nan() {
                "NaN".to_string()
            } else if value > 0.0 {
                "Infinity".to_string()
            } else {
                "-Infinity".to_string()
            };
            self.raise_new(self.classes.float_domain_error, &message)
        }
        let truncated = value.trunc();
        if truncated < i128::MIN as f64 || truncated >= i128::MAX as f64 {
            let message = format!("float {value} out of range of integer");
            self.raise_new(self.classes.range_error, &message)
        }
        truncated as i128
    }

    /// Implicit float conversion: Float, Integer, or `to_f`.
    pub(crate) fn coerce_float(&self, value: Handle) -> f64 {
        match self.number(value) {
            Some(Number::Float(f)) => return f,
            Some(Number::Int(n)) => return n as f64,
            None => {}
        }
        match decode(value) {
            Imm::Nil => self.type_error("can't convert nil into Float"),
            Imm::True | Imm::False => {
                let message = format!("can't convert {} into Float", self.describe(value));
                self.type_error(&message)
            }
            _ => {}
        }
        if self.string_contents(value).is_some() {
            self.type_error("no implicit conversion to float from string")
        }
        if self.method_for(value, self.ids.to_f).is_some() {
            let converted = self.call_method(value, self.ids.to_f, &[], None);
            if let Some(Number::Float(f)) = self.number(converted) {
                return f;
            }
        }
        let message = format!("can't convert {} into Float", self.class_name(value));
        self.type_error(&message)
    }

    /// Operand for arithmetic on `receiver`; `TypeError` for non-numbers.
    pub(crate) fn operand(&self, receiver: Handle, other: Handle) -> Number {
        match self.number(other) {
            Some(number) => number,
            None => {
                let message = format!(
                    "{} can't be coerced into {}",
                    self.describe(other),
                    self.class_name(receiver)
                );
                self.type_error(&message)
            }
        }
    }

    /// Checked integer arithmetic, promoting to float when either side is one.
    pub(crate) fn arithmetic(
        &self,
        lhs: Number,
        rhs: Number,
        int_op: fn(i128, i128) -> Option<i128>,
        float_op: fn(f64, f64) -> f64,
    ) -> Number {
        match (lhs, rhs) {
            (Number::Int(a), Number::Int(b)) => match int_op(a, b) {
                Some(result) => Number::Int(result),
                None => self.raise_new(self.classes.range_error, "integer overflow"),
            },
            (a, b) => Number::Float(float_op(a.as_f64(), b.as_f64())),
        }
    }

    pub(crate) fn format_number(&self, number: Number) -> String {
        match number {
            Number::Int(n) => n.to_string(),
            Number::Float(f) if f.is_nan() => "NaN".to_string(),
            Number::Float(f) if f.is_infinite() => {
                if f > 0.0 {
                    "Infinity".to_string()
                } else {
                    "-Infinity".to_string()
                }
            }
            Number::Float(f) => format!("{f:?}"),
        }
    }
}

impl Number {
    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Float(f) => f,
        }
    }

    pub(crate) fn compare(self, other: Number) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}
