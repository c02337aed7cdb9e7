//! Built-in methods

use std::cmp::Ordering;

use tether::{Handle, Runtime};

use crate::classes::Classes;
use crate::heap::{BuiltinFn, Heap, Kind, Method, ModuleData, Object};
use crate::numeric::Number;
use crate::symbols::SymbolTable;
use crate::Sandbox;

struct Installer<'a> {
    heap: &'a mut Heap,
    symbols: &'a mut SymbolTable,
}

impl Installer<'_> {
    fn define(&mut self, module: Handle, name: &str, body: BuiltinFn) {
        let id = self.symbols.intern(name);
        if let Some(module) = self.heap.get_mut(module).and_then(Object::module_mut) {
            module.methods.insert(id, Method::Builtin(body));
        }
    }

    /// Singleton class of a built-in object, before the sandbox exists.
    fn singleton(&mut self, object: Handle, class_class: Handle) -> Handle {
        let current = self.heap.get(object).map_or(class_class, |o| o.class);
        let mut data = ModuleData::new(None, true, Some(current));
        data.attached = Some(object);
        let singleton = self
            .heap
            .alloc(Object::new(class_class, Kind::Module(Box::new(data))));
        if let Some(target) = self.heap.get_mut(object) {
            target.class = singleton;
        }
        singleton
    }
}

/// Install every built-in method.
pub(crate) fn install(heap: &mut Heap, symbols: &mut SymbolTable, classes: &Classes) {
    let mut installer = Installer { heap, symbols };

    // Kernel
    let object = classes.object;
    installer.define(object, "initialize", |_, _, _, _| Handle::NIL);
    installer.define(object, "initialize_copy", |_, receiver, _, _| receiver);
    installer.define(object, "class", |sb, receiver, _, _| sb.real_class(receiver));
    installer.define(object, "singleton_class", |sb, receiver, _, _| sb.singleton_class(receiver));
    installer.define(object, "frozen?", |sb, receiver, _, _| Handle::from_bool(sb.frozen(receiver)));
    installer.define(object, "freeze", |sb, receiver, _, _| sb.freeze(receiver));
    installer.define(object, "nil?", |_, _, _, _| Handle::FALSE);
    installer.define(object, "==", object_eq);
    installer.define(object, "equal?", object_eq);
    installer.define(object, "!=", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let equal = sb.call_method(receiver, sb.ids.eq, args, None);
        Handle::from_bool(!equal.is_truthy())
    });
    installer.define(object, "!", |_, receiver, _, _| Handle::from_bool(!receiver.is_truthy()));
    installer.define(object, "inspect", |sb, receiver, _, _| sb.string(&sb.default_inspect(receiver)));
    installer.define(object, "to_s", |sb, receiver, _, _| sb.string(&sb.default_inspect(receiver)));
    installer.define(object, "dup", |sb, receiver, _, _| sb.duplicate(receiver, false));
    installer.define(object, "clone", |sb, receiver, _, _| sb.duplicate(receiver, true));
    installer.define(object, "respond_to?", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let id = sb.id_from_symbol(args[0]);
        Handle::from_bool(sb.respond_to(receiver, id))
    });
    installer.define(object, "is_a?", kind_of);
    installer.define(object, "kind_of?", kind_of);
    installer.define(object, "instance_of?", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        Handle::from_bool(sb.is_instance_of(receiver, args[0]))
    });
    installer.define(object, "instance_variable_get", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let id = sb.id_from_symbol(args[0]);
        sb.ivar_get(receiver, id)
    });
    installer.define(object, "instance_variable_set", |sb, receiver, args, _| {
        sb.check_arity(args, 2, Some(2));
        let id = sb.id_from_symbol(args[0]);
        sb.ivar_set(receiver, id, args[1]);
        args[1]
    });
    installer.define(object, "instance_variable_defined?", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let id = sb.id_from_symbol(args[0]);
        Handle::from_bool(sb.ivar_defined(receiver, id))
    });
    installer.define(object, "send", |sb, receiver, args, block| {
        sb.check_arity(args, 1, None);
        let id = sb.id_from_symbol(args[0]);
        sb.call_method(receiver, id, &args[1..], block)
    });
    installer.define(object, "object_id", |sb, receiver, _, _| sb.int((receiver.to_bits() >> 1) as i64));
    installer.define(object, "raise", kernel_raise);
    installer.define(object, "catch", |sb, _, args, block| {
        sb.check_arity(args, 0, Some(1));
        let tag = match args.first() {
            Some(tag) => *tag,
            None => sb.alloc(sb.classes.object, Kind::Plain),
        };
        let Some(block) = block else {
            sb.raise_new(sb.classes.local_jump_error, "no block given")
        };
        sb.catch(tag, || sb.call_proc(block, &[tag]))
    });
    installer.define(object, "throw", |sb, _, args, _| {
        sb.check_arity(args, 1, Some(2));
        sb.throw(args[0], args.get(1).copied().unwrap_or(Handle::NIL))
    });
    installer.define(object, "block_given?", |sb, _, _, _| {
        // The caller's frame sits below this builtin's own.
        let frames = sb.frames.borrow();
        let caller = frames.len().checked_sub(2).and_then(|index| frames.get(index));
        Handle::from_bool(caller.is_some_and(|frame| frame.block.is_some()))
    });

    // Module and Class
    let module = classes.module;
    installer.define(module, "name", |sb, receiver, _, _| {
        match sb.with_module(receiver, |m| m.name.clone()).flatten() {
            Some(name) => sb.string(&name),
            None => Handle::NIL,
        }
    });
    installer.define(module, "to_s", |sb, receiver, _, _| sb.string(&sb.module_name(receiver)));
    installer.define(module, "inspect", |sb, receiver, _, _| sb.string(&sb.module_name(receiver)));
    installer.define(module, "===", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        Handle::from_bool(sb.kind_of(args[0], receiver))
    });
    installer.define(module, "<=", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        sb.require_module(args[0]);
        Handle::from_bool(sb.inherits(receiver, args[0]))
    });
    installer.define(module, "ancestors", |sb, receiver, _, _| {
        let mut ancestors = Vec::new();
        let mut current = Some(receiver);
        while let Some(class) = current {
            ancestors.push(class);
            current = sb.superclass_of(class);
        }
        sb.array(&ancestors)
    });
    installer.define(module, "const_get", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let id = sb.id_from_symbol(args[0]);
        sb.const_get(receiver, id)
    });
    installer.define(module, "const_set", |sb, receiver, args, _| {
        sb.check_arity(args, 2, Some(2));
        let id = sb.id_from_symbol(args[0]);
        sb.const_set(receiver, id, args[1]);
        args[1]
    });
    installer.define(module, "const_defined?", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let id = sb.id_from_symbol(args[0]);
        Handle::from_bool(sb.const_defined(receiver, id))
    });
    installer.define(module, "method_defined?", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let id = sb.id_from_symbol(args[0]);
        Handle::from_bool(sb.find_method(receiver, id).is_some())
    });

    let class = classes.class;
    installer.define(class, "new", |sb, receiver, args, block| sb.new_object(receiver, args, block));
    installer.define(class, "allocate", |sb, receiver, _, _| sb.allocate(receiver));
    installer.define(class, "superclass", |sb, receiver, _, _| sb.superclass(receiver));

    // nil, true, false
    installer.define(classes.nil_class, "nil?", |_, _, _, _| Handle::TRUE);
    installer.define(classes.nil_class, "to_s", |sb, _, _, _| sb.string(""));
    installer.define(classes.nil_class, "inspect", |sb, _, _, _| sb.string("nil"));
    installer.define(classes.nil_class, "to_a", |sb, _, _, _| sb.array(&[]));
    installer.define(classes.true_class, "to_s", |sb, _, _, _| sb.string("true"));
    installer.define(classes.true_class, "inspect", |sb, _, _, _| sb.string("true"));
    installer.define(classes.false_class, "to_s", |sb, _, _, _| sb.string("false"));
    installer.define(classes.false_class, "inspect", |sb, _, _, _| sb.string("false"));

    // Numbers
    for numeric in [classes.integer, classes.float] {
        installer.define(numeric, "+", |sb, receiver, args, _| {
            binary(sb, receiver, args, i128::checked_add, |a, b| a + b)
        });
        installer.define(numeric, "-", |sb, receiver, args, _| {
            binary(sb, receiver, args, i128::checked_sub, |a, b| a - b)
        });
        installer.define(numeric, "*", |sb, receiver, args, _| {
            binary(sb, receiver, args, i128::checked_mul, |a, b| a * b)
        });
        installer.define(numeric, "==", |sb, receiver, args, _| {
            sb.check_arity(args, 1, Some(1));
            let equal = match (sb.number(receiver), sb.number(args[0])) {
                (Some(a), Some(b)) => a.compare(b) == Some(Ordering::Equal),
                _ => false,
            };
            Handle::from_bool(equal)
        });
        installer.define(numeric, "<", |sb, receiver, args, _| compare(sb, receiver, args, Ordering::is_lt));
        installer.define(numeric, ">", |sb, receiver, args, _| compare(sb, receiver, args, Ordering::is_gt));
        installer.define(numeric, "<=", |sb, receiver, args, _| compare(sb, receiver, args, Ordering::is_le));
        installer.define(numeric, ">=", |sb, receiver, args, _| compare(sb, receiver, args, Ordering::is_ge));
        installer.define(numeric, "to_i", |sb, receiver, _, _| sb.make_integer(sb.coerce_integer(receiver)));
        installer.define(numeric, "to_int", |sb, receiver, _, _| sb.make_integer(sb.coerce_integer(receiver)));
        installer.define(numeric, "to_f", |sb, receiver, _, _| sb.make_float(sb.coerce_float(receiver)));
        installer.define(numeric, "to_s", number_to_s);
        installer.define(numeric, "inspect", number_to_s);
        installer.define(numeric, "zero?", |sb, receiver, _, _| {
            Handle::from_bool(sb.number(receiver).is_some_and(|n| n.as_f64() == 0.0))
        });
    }
    installer.define(classes.integer, "/", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let lhs = sb.operand(receiver, receiver);
        let rhs = sb.operand(receiver, args[0]);
        if rhs == Number::Int(0) {
            sb.raise_new(sb.classes.range_error, "divided by 0")
        }
        let result = sb.arithmetic(lhs, rhs, floor_div, |a, b| a / b);
        sb.number_handle(result)
    });

    // String and Symbol
    let string = classes.string;
    installer.define(string, "initialize", |sb, receiver, args, _| {
        sb.check_arity(args, 0, Some(1));
        if let Some(source) = args.first() {
            let text = sb.expect_string(*source);
            sb.with_object_mut(receiver, |object| object.kind = Kind::Str(text));
        }
        Handle::NIL
    });
    installer.define(string, "initialize_copy", |_, receiver, _, _| receiver);
    installer.define(string, "to_s", |_, receiver, _, _| receiver);
    installer.define(string, "to_str", |_, receiver, _, _| receiver);
    installer.define(string, "inspect", |sb, receiver, _, _| {
        let text = sb.expect_string(receiver);
        sb.string(&format!("{text:?}"))
    });
    installer.define(string, "==", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let equal = sb.string_contents(args[0]) == sb.string_contents(receiver);
        Handle::from_bool(equal)
    });
    installer.define(string, "length", string_length);
    installer.define(string, "size", string_length);
    installer.define(string, "empty?", |sb, receiver, _, _| {
        Handle::from_bool(sb.expect_string(receiver).is_empty())
    });
    installer.define(string, "+", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let text = sb.expect_string(receiver) + &sb.expect_string(args[0]);
        sb.string(&text)
    });
    installer.define(string, "<<", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        sb.ensure_mutable(receiver);
        let suffix = sb.expect_string(args[0]);
        sb.with_object_mut(receiver, |object| {
            if let Kind::Str(text) = &mut object.kind {
                text.push_str(&suffix);
            }
        });
        receiver
    });
    installer.define(string, "to_sym", |sb, receiver, _, _| {
        let text = sb.expect_string(receiver);
        sb.symbol(&text)
    });

    let symbol = classes.symbol;
    installer.define(symbol, "to_s", |sb, receiver, _, _| {
        let id = sb.id_from_symbol(receiver);
        sb.string(&sb.name_of(id))
    });
    installer.define(symbol, "to_sym", |_, receiver, _, _| receiver);
    installer.define(symbol, "inspect", |sb, receiver, _, _| {
        let id = sb.id_from_symbol(receiver);
        sb.string(&format!(":{}", sb.name_of(id)))
    });

    // Array
    let array = classes.array;
    installer.define(array, "initialize_copy", |_, receiver, _, _| receiver);
    installer.define(array, "length", array_length);
    installer.define(array, "size", array_length);
    installer.define(array, "empty?", |sb, receiver, _, _| Handle::from_bool(sb.ary_len(receiver) == 0));
    installer.define(array, "[]", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let len = sb.ary_len(receiver) as i128;
        let index = sb.coerce_integer(args[0]);
        let index = if index < 0 { index + len } else { index };
        if (0..len).contains(&index) {
            sb.ary_entry(receiver, index as usize)
        } else {
            Handle::NIL
        }
    });
    installer.define(array, "first", |sb, receiver, _, _| sb.ary_entry(receiver, 0));
    installer.define(array, "last", |sb, receiver, _, _| {
        match sb.ary_len(receiver).checked_sub(1) {
            Some(index) => sb.ary_entry(receiver, index),
            None => Handle::NIL,
        }
    });
    installer.define(array, "push", |sb, receiver, args, _| {
        for value in args {
            sb.ary_push(receiver, *value);
        }
        receiver
    });
    installer.define(array, "<<", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        sb.ary_push(receiver, args[0]);
        receiver
    });
    installer.define(array, "pop", |sb, receiver, _, _| sb.ary_pop(receiver));
    installer.define(array, "==", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let (Some(lhs), Some(rhs)) = (sb.array_items(receiver), sb.array_items(args[0])) else {
            return Handle::FALSE;
        };
        let equal = lhs.len() == rhs.len()
            && lhs
                .iter()
                .zip(&rhs)
                .all(|(a, b)| sb.call_method(*a, sb.ids.eq, &[*b], None).is_truthy());
        Handle::from_bool(equal)
    });
    installer.define(array, "inspect", array_inspect);
    installer.define(array, "to_s", array_inspect);
    installer.define(array, "each", |sb, receiver, _, block| {
        let block = require_block(sb, block);
        let mut index = 0;
        while index < sb.ary_len(receiver) {
            let item = sb.ary_entry(receiver, index);
            sb.call_proc(block, &[item]);
            index += 1;
        }
        receiver
    });
    installer.define(array, "map", |sb, receiver, _, block| {
        let block = require_block(sb, block);
        let mapped = sb.array(&[]);
        let mut index = 0;
        while index < sb.ary_len(receiver) {
            let item = sb.ary_entry(receiver, index);
            let value = sb.call_proc(block, &[item]);
            sb.ary_push(mapped, value);
            index += 1;
        }
        mapped
    });

    // Proc
    let proc = classes.proc;
    installer.define(proc, "call", |sb, receiver, args, _| sb.call_proc(receiver, args));
    installer.define(proc, "lambda?", |sb, receiver, _, _| Handle::from_bool(sb.proc_is_lambda(receiver)));

    // Exception
    let exception = classes.exception;
    installer.define(exception, "initialize", |sb, receiver, args, _| {
        sb.check_arity(args, 0, Some(1));
        let message = args.first().copied().unwrap_or(Handle::NIL);
        sb.with_object_mut(receiver, |object| object.set_ivar(sb.ids.message, message));
        Handle::NIL
    });
    installer.define(exception, "message", |sb, receiver, _, _| {
        let to_s = sb.ids.to_s;
        sb.call_method(receiver, to_s, &[], None)
    });
    installer.define(exception, "to_s", |sb, receiver, _, _| {
        let message = sb.ivar_get(receiver, sb.ids.message);
        if message.is_nil() {
            sb.string(&sb.class_name(receiver))
        } else {
            message
        }
    });
    installer.define(exception, "inspect", |sb, receiver, _, _| {
        let class = sb.class_name(receiver);
        let message = sb.exception_message(receiver);
        if message.is_empty() || message == class {
            sb.string(&class)
        } else {
            sb.string(&format!("#<{class}: {message}>"))
        }
    });
    installer.define(exception, "==", |sb, receiver, args, _| {
        sb.check_arity(args, 1, Some(1));
        let other = args[0];
        let equal = receiver == other
            || (sb.real_class(receiver) == sb.real_class(other)
                && sb.exception_message(receiver) == sb.exception_message(other));
        Handle::from_bool(equal)
    });

    // GC
    let gc = installer.singleton(classes.gc, classes.class);
    installer.define(gc, "start", |sb, _, _, _| {
        sb.gc_start();
        Handle::NIL
    });
    installer.define(gc, "compact", |sb, _, _, _| {
        sb.gc_compact();
        Handle::NIL
    });
    installer.define(gc, "count", |sb, _, _, _| sb.int(sb.stats().collections as i64));
}

fn object_eq(sb: &Sandbox, receiver: Handle, args: &[Handle], _: Option<Handle>) -> Handle {
    sb.check_arity(args, 1, Some(1));
    Handle::from_bool(receiver == args[0])
}

fn kind_of(sb: &Sandbox, receiver: Handle, args: &[Handle], _: Option<Handle>) -> Handle {
    sb.check_arity(args, 1, Some(1));
    Handle::from_bool(sb.is_kind_of(receiver, args[0]))
}

fn kernel_raise(sb: &Sandbox, _: Handle, args: &[Handle], _: Option<Handle>) -> Handle {
    sb.check_arity(args, 0, Some(2));
    let Some(first) = args.first().copied() else {
        sb.raise_new(sb.classes.runtime_error, "unhandled exception")
    };
    if let Some(message) = sb.string_contents(first) {
        sb.raise_new(sb.classes.runtime_error, &message)
    }
    if sb.is_class(first) {
        let exception = sb.new_object(first, &args[1..], None);
        sb.raise(exception)
    }
    if sb.kind_of(first, sb.classes.exception) {
        sb.raise(first)
    }
    sb.type_error("exception class/object expected")
}

fn require_block(sb: &Sandbox, block: Option<Handle>) -> Handle {
    match block {
        Some(block) => block,
        None => sb.raise_new(sb.classes.local_jump_error, "no block given (yield)"),
    }
}

fn binary(
    sb: &Sandbox,
    receiver: Handle,
    args: &[Handle],
    int_op: fn(i128, i128) -> Option<i128>,
    float_op: fn(f64, f64) -> f64,
) -> Handle {
    sb.check_arity(args, 1, Some(1));
    let lhs = sb.operand(receiver, receiver);
    let rhs = sb.operand(receiver, args[0]);
    let result = sb.arithmetic(lhs, rhs, int_op, float_op);
    sb.number_handle(result)
}

fn compare(sb: &Sandbox, receiver: Handle, args: &[Handle], test: fn(Ordering) -> bool) -> Handle {
    sb.check_arity(args, 1, Some(1));
    let lhs = sb.operand(receiver, receiver);
    let rhs = sb.operand(receiver, args[0]);
    match lhs.compare(rhs) {
        Some(ordering) => Handle::from_bool(test(ordering)),
        None => {
            let message = format!(
                "comparison of {} with {} failed",
                sb.class_name(receiver),
                sb.inspect_string(args[0])
            );
            sb.argument_error(&message)
        }
    }
}

fn floor_div(a: i128, b: i128) -> Option<i128> {
    let quotient = a.checked_div(b)?;
    if a % b != 0 && (a < 0) != (b < 0) {
        Some(quotient - 1)
    } else {
        Some(quotient)
    }
}

fn number_to_s(sb: &Sandbox, receiver: Handle, _: &[Handle], _: Option<Handle>) -> Handle {
    let number = sb.operand(receiver, receiver);
    sb.string(&sb.format_number(number))
}

fn string_length(sb: &Sandbox, receiver: Handle, _: &[Handle], _: Option<Handle>) -> Handle {
    let length = sb.expect_string(receiver).chars().count();
    sb.int(length as i64)
}

fn array_length(sb: &Sandbox, receiver: Handle, _: &[Handle], _: Option<Handle>) -> Handle {
    sb.int(sb.ary_len(receiver) as i64)
}

fn array_inspect(sb: &Sandbox, receiver: Handle, _: &[Handle], _: Option<Handle>) -> Handle {
    let items = sb.array_items(receiver).unwrap_or_default();
    let parts: Vec<String> = items.iter().map(|item| sb.inspect_string(*item)).collect();
    sb.string(&format!("[{}]", parts.join(", ")))
}

impl Sandbox {
    pub(crate) fn array_items(&self, array: Handle) -> Option<Vec<Handle>> {
        self.with_object(array, |object| match &object.kind {
            Kind::Array(items) => Some(items.clone()),
            _ => None,
        })
        .flatten()
    }
}
