use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::filter::LevelFilter;

use crate::runtime::list::List;
use crate::runtime::memory::{Address, Memory};
use crate::runtime::object::Object;
use crate::runtime::value::{Conversion, Opaque, Value, ValueKind};
use crate::vm::bitcode::{Access, Instruction, Label, Opcode, Operand, Program, RawAddress, Variable};
use crate::vm::linkage::NativeModule;
use crate::vm::{Engine, Fault, Register};
use crate::ErrorKind;

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

fn address(raw: i64) -> Address {
    Address::new(raw).expect("valid address")
}

#[track_caller]
fn assert_number(value: &Value, expected: f64) {
    match value {
        Value::Number(number) => assert!(
            (number - expected).abs() < f64::EPSILON
                || (number.is_infinite() && number == &expected),
            "expected {expected}, got {number}"
        ),
        other => panic!("expected number {expected}, got {other:?}"),
    }
}

#[track_caller]
fn assert_variable(engine: &mut Engine, name: &str, expected: f64) {
    let value = engine
        .public_variable(name)
        .unwrap_or_else(|| panic!("{name} not found"));
    assert_number(&value, expected);
}

#[test]
fn integer_to_bool() {
    for value in [i32::MIN, -5, -1, 0, 1, 42, i32::MAX] {
        assert_eq!(Value::Integer(value).to_bool().unwrap(), value > 0);
    }
}

#[test]
fn text_conversions() {
    assert_eq!(Value::from("3.5").to_double().unwrap(), 3.5);
    assert_eq!(Value::from(" 42 ").to_double().unwrap(), 42.);
    assert_eq!(Value::from("-1e3").to_double().unwrap(), -1000.);
    assert_eq!(Value::from("abc").to_double().unwrap(), 0.);
    assert_eq!(Value::from("").to_double().unwrap(), 0.);
    assert_eq!(Value::from("7.9").to_integer().unwrap(), 7);
    for word in ["inf", "-Infinity", "NaN", "1,000"] {
        assert_eq!(Value::from(word).to_double().unwrap(), 0., "{word}");
        assert!(!Value::from(word).is_number(), "{word}");
    }

    for truthy in ["TRUE", "Yes", "2", "0.5"] {
        assert!(Value::from(truthy).to_bool().unwrap(), "{truthy}");
    }
    for falsy in ["no", "0", "-1", "abc", ""] {
        assert!(!Value::from(falsy).to_bool().unwrap(), "{falsy}");
    }

    assert!(Value::from("12").is_number());
    assert!(!Value::from("twelve").is_number());
    assert_eq!(Value::from("héllo").size().unwrap(), 5);
}

#[test]
fn numeric_text_forms() {
    assert_eq!(Value::Number(5.).to_text().unwrap(), "5");
    assert_eq!(Value::Number(0.25).to_text().unwrap(), "0.25");
    assert_eq!(Value::Integer(-3).to_text().unwrap(), "-3");
    assert_eq!(Value::Number(f64::INFINITY).to_text().unwrap(), "Infinity");
}

#[test]
fn unsupported_conversions() {
    let Err(Fault::TypeMismatch { conversion, actual }) = Value::from(List::new()).to_double()
    else {
        unreachable!("lists are not numeric")
    };
    assert_eq!(conversion, Conversion::Double);
    assert_eq!(actual, ValueKind::List);

    let err = Value::None.to_text().unwrap_err();
    assert_eq!(err.kind(), "type_mismatch");
}

#[test]
fn emptiness() {
    assert!(Value::None.is_empty());
    assert!(Value::from("").is_empty());
    assert!(Value::from(Opaque::empty()).is_empty());
    assert!(!Value::Integer(0).is_empty());
    assert!(!Value::from(List::new()).is_empty());

    let opaque = Opaque::new(String::from("handle"));
    assert!(!opaque.is_empty());
    assert_eq!(opaque.downcast_ref::<String>().unwrap(), "handle");
    assert!(opaque.downcast_ref::<u32>().is_none());
}

#[test]
fn value_equality() {
    assert!(Value::from("a").equals(&Value::from("a")));
    assert!(Value::Integer(2).equals(&Value::Number(2.)));
    assert!(!Value::from("2").equals(&Value::Number(2.)));
    let list = List::new();
    assert!(!Value::from(list.clone()).equals(&Value::from(list)));
}

#[test]
fn memory_auto_extends() {
    let mut memory = Memory::new();
    assert_eq!(memory.len(), 1);

    assert!(matches!(memory.read(address(5)), Value::None));
    assert_eq!(memory.len(), 6);

    memory.write(address(8), 3.);
    assert_eq!(memory.len(), 9);
    assert!(matches!(memory.read(address(7)), Value::None));
    assert_number(&memory.read(address(8)), 3.);

    for _ in 0..3 {
        let previous_length = memory.len();
        assert_eq!(memory.alloc(Value::None).get(), previous_length);
    }
}

#[test]
fn null_addresses() {
    assert!(Address::new(0).is_none());
    assert!(Address::new(-4).is_none());
    assert_eq!(Address::new(3).map(Address::get), Some(3));
}

#[test]
fn list_auto_extends() {
    let mut memory = Memory::new();
    let list = List::new();
    let element = memory.alloc("x");
    list.set_slot(5, Some(element));

    assert_eq!(list.len(), 6);
    for index in 0..5 {
        assert_eq!(list.slot(index), None);
    }
    assert_eq!(list.slot(5), Some(element));

    // Clearing a slot past the end does not grow the list.
    list.set_slot(9, None);
    assert_eq!(list.len(), 6);
    list.set_slot(5, None);
    assert_eq!(list.slot(5), None);
    assert_eq!(list.len(), 6);
}

#[test]
fn list_text_operations() {
    let mut memory = Memory::new();
    let list = List::allocate(["a", "b", "c"], &mut memory);
    list.set_slot(4, Some(memory.alloc(1.5)));

    assert_eq!(list.join(&mut memory).unwrap(), "abc1.5");
    assert_eq!(list.index_of("c", &mut memory), Some(2));
    assert_eq!(list.index_of("1.5", &mut memory), Some(4));
    assert_eq!(list.index_of("z", &mut memory), None);

    list.push(Some(memory.alloc(List::new())));
    assert!(matches!(
        list.join(&mut memory),
        Err(Fault::TypeMismatch {
            actual: ValueKind::List,
            ..
        })
    ));
}

#[test]
fn create_object_allocates_three_cells() {
    let mut memory = Memory::new();
    let before = memory.len();
    let object = memory.create_object();
    assert_eq!(memory.len(), before + 3);
    assert_eq!(object.get(), before + 2);

    let object = memory.read(object).as_object().unwrap();
    assert_eq!(object.keys_address().get(), before);
    assert_eq!(object.values_address().get(), before + 1);
    assert_eq!(object.len(&mut memory).unwrap(), 0);
}

#[test]
fn object_lookup() {
    let mut memory = Memory::new();
    let object = memory.create_object();
    let object: Object = memory.read(object).as_object().unwrap();

    object.insert("a", 1., &mut memory).unwrap();
    object.insert("b", 2., &mut memory).unwrap();
    object.insert("a", 3., &mut memory).unwrap();
    assert_eq!(object.len(&mut memory).unwrap(), 3);

    assert_number(&object.get("a", &mut memory).unwrap(), 1.);
    assert_number(&object.get("b", &mut memory).unwrap(), 2.);

    let err = object.get("c", &mut memory).unwrap_err();
    assert!(matches!(&err, Fault::KeyNotFound(key) if key == "c"));
    assert_eq!(err.kind(), "lookup");
    assert!(!object.contains_key("c", &mut memory).unwrap());

    object.set("a", 10., &mut memory).unwrap();
    assert_number(&object.get("a", &mut memory).unwrap(), 10.);
    assert!(matches!(
        object.set("missing", 1., &mut memory),
        Err(Fault::KeyNotFound(_))
    ));
}

#[test]
fn instruction_rendering() {
    let call = Instruction::new(
        Opcode::Call,
        [Operand::from(RawAddress(0)), Operand::from("print")],
    );
    assert_eq!(call.to_string(), r#"call [0], "print""#);
    let jump = Instruction::new(
        Opcode::JumpIfTrue,
        [Operand::from(Register(1)), Operand::from(Label(4))],
    );
    assert_eq!(jump.to_string(), "jmpt #1, @4");
}

#[test]
fn hello_world() {
    initialize_tracing();
    let mut program = Program::new();
    program.import_native_module("console");
    let main = program.define_function(0, Access::Public, "main");
    let args = program.define_variable(1, Access::Private, "args");
    let text = program.define_constant(2, "Hello World");
    let print = program.define_constant(3, "print");
    program.label(main);
    program.new_list(args);
    program.load_address(Register(1), text);
    program.set_list_slot(args, 0, Register(1));
    program.load_address(Register(0), args);
    program.call(RawAddress(0), print);
    program.ret(0);

    let printed = Arc::new(Mutex::new(Vec::new()));
    let mut engine = Engine::new(program);
    engine.register_native_module(
        "console",
        NativeModule::new().with_fn("print", {
            let printed = printed.clone();
            move |args| {
                let line = args
                    .params()
                    .iter()
                    .map(Value::to_text)
                    .collect::<Result<Vec<_>, _>>()?;
                printed.lock().push(line);
                Ok(Value::None)
            }
        }),
    );

    assert_number(&engine.run().unwrap(), 0.);
    assert_eq!(&*printed.lock(), &[vec![String::from("Hello World")]]);
}

fn branch(condition: f64) -> (Value, Vec<usize>) {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let target = Label(1);
    program.label(main);
    program.mov(Register(1), condition);
    program.jump_if(Register(1), target);
    program.ret(10);
    program.label(target);
    program.ret(20);

    let offsets = Arc::new(Mutex::new(Vec::new()));
    let mut engine = Engine::new(program);
    engine.on_step({
        let offsets = offsets.clone();
        move |step| offsets.lock().push(step.offset)
    });
    let result = engine.run().unwrap();
    let offsets = offsets.lock().clone();
    (result, offsets)
}

#[test]
fn jump_if_true() {
    initialize_tracing();
    let (result, offsets) = branch(0.);
    assert_number(&result, 10.);
    assert_eq!(offsets, [0, 1, 2, 3]);

    let (result, offsets) = branch(1.);
    assert_number(&result, 20.);
    assert_eq!(offsets, [0, 1, 2, 4, 5]);
}

#[test]
fn unknown_function_faults_at_call() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let counter = program.define_variable(1, Access::Public, "counter");
    let result = program.define_variable(2, Access::Public, "result");
    program.label(main);
    program.mov(counter, 1);
    program.call(result, "missing");
    program.ret(counter);

    let steps = Arc::new(AtomicUsize::new(0));
    let mut engine = Engine::new(program);
    engine.on_step({
        let steps = steps.clone();
        move |_| {
            steps.fetch_add(1, Ordering::Relaxed);
        }
    });
    let err = engine.run().unwrap_err();
    assert_eq!(err.kind(), "lookup");
    assert!(matches!(err.fault(), Fault::UnknownFunction(name) if name == "missing"));
    assert_eq!(err.location().unwrap().offset, 2);
    assert_eq!(steps.load(Ordering::Relaxed), 3);
    assert_variable(&mut engine, "counter", 1.);
    assert!(matches!(engine.public_variable("result"), Some(Value::None)));
}

#[test]
fn unreached_calls_to_unknown_functions_are_allowed() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let plugin = Label(1);
    program.label(main);
    program.mov(Register(1), 0);
    program.jump_if(Register(1), plugin);
    program.ret(42);
    program.label(plugin);
    program.call(Register(2), "optional_plugin");
    program.ret(Register(2));

    let mut engine = Engine::new(program);
    assert_number(&engine.run().unwrap(), 42.);
}

#[test]
fn rewritten_constant_names_resolve_at_call() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let name = program.define_constant(1, "old_name");
    let result = program.define_variable(2, Access::Public, "result");
    program.label(main);
    program.mov(name, "present");
    program.call(result, name);
    program.ret(result);

    let mut engine = Engine::new(program);
    engine.register_native_function("present", |_| Ok(Value::Integer(3)));
    assert!(matches!(engine.run().unwrap(), Value::Integer(3)));
}

#[test]
fn unknown_computed_function_faults_at_call() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let name = program.define_variable(1, Access::Public, "name");
    program.label(main);
    program.mov(name, "miss");
    program.set_source_line(Some(3));
    program.call(Register(1), name);
    program.ret(0);

    let mut engine = Engine::new(program);
    let err = engine.run().unwrap_err();
    assert_eq!(err.kind(), "lookup");
    let location = err.location().unwrap();
    assert_eq!(location.offset, 2);
    assert_eq!(location.line, Some(3));
    assert_eq!(location.instruction, "call #1, $1");
    assert_eq!(
        engine.public_variable("name").unwrap().to_text().unwrap(),
        "miss"
    );
}

#[test]
fn label_calls() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let seven = program.define_function(1, Access::Private, "seven");
    let result = program.define_variable(1, Access::Public, "result");
    program.label(main);
    program.call(result, seven);
    program.add(result, 1);
    program.ret(result);
    program.label(seven);
    program.ret(7);

    let mut engine = Engine::new(program);
    assert_number(&engine.run().unwrap(), 8.);
    // Private functions cannot be used as entry points by name.
    let err = engine.execute("seven", None, true).unwrap_err();
    assert_eq!(err.kind(), "missing_entry_point");
    // But they can be by index.
    assert_number(&engine.execute(seven, None, true).unwrap(), 7.);
}

#[test]
fn falling_off_the_end_returns_zero() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    program.label(main);
    program.mov(Register(3), 4);

    let mut engine = Engine::new(program);
    assert_number(&engine.run().unwrap(), 0.);
    assert_eq!(engine.registers()[Register(3)], 4);
}

#[test]
fn missing_entry_point() {
    let mut engine = Engine::new(Program::new());
    let err = engine.run().unwrap_err();
    assert_eq!(err.kind(), "missing_entry_point");
    assert!(err.location().is_none());
}

#[test]
fn stack_overflow() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let recurse = Label(1);
    program.label(main);
    program.call(Register(1), recurse);
    program.ret(Register(1));
    program.label(recurse);
    program.call(Register(1), recurse);
    program.ret(0);

    let mut engine = Engine::new(program);
    engine.set_max_depth(16);
    let err = engine.run().unwrap_err();
    assert_eq!(err.kind(), "call");
    assert!(matches!(err.root_fault(), Fault::StackOverflow));
}

#[test]
fn label_call_faults_are_not_wrapped() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let helper = program.define_function(1, Access::Private, "helper");
    let list = program.define_variable(1, Access::Public, "list");
    program.label(main);
    program.new_list(list);
    program.call(Register(1), helper);
    program.ret(Register(1));
    program.label(helper);
    program.set_source_line(Some(9));
    program.add(list, 1);
    program.ret(0);

    let mut engine = Engine::new(program);
    let err = engine.run().unwrap_err();
    assert_eq!(err.kind(), "type_mismatch");
    let location = err.location().unwrap();
    assert_eq!(location.offset, 5);
    assert_eq!(location.line, Some(9));
}

#[test]
fn arithmetic() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let sum = program.define_variable(1, Access::Public, "sum");
    let overflow = program.define_variable(2, Access::Public, "overflow");
    let quotient = program.define_variable(3, Access::Public, "quotient");
    let infinite = program.define_variable(4, Access::Public, "infinite");
    let text = program.define_variable(5, Access::Public, "text");
    program.label(main);
    program.call(sum, "seven");
    program.add(sum, sum);
    program.call(overflow, "max");
    program.add(overflow, sum);
    program.call(quotient, "seven");
    program.update(Opcode::Div, quotient, 2);
    program.mov(infinite, 1);
    program.update(Opcode::Div, infinite, 0);
    program.mov(text, "2.5");
    program.update(Opcode::Mul, text, 4);
    program.ret(sum);

    let mut engine = Engine::new(program);
    engine.register_native_function("seven", |_| Ok(Value::Integer(7)));
    engine.register_native_function("max", |_| Ok(Value::Integer(i32::MAX)));
    assert!(matches!(engine.run().unwrap(), Value::Integer(14)));
    assert_variable(&mut engine, "overflow", f64::from(i32::MAX) + 14.);
    assert_variable(&mut engine, "quotient", 3.5);
    assert_variable(&mut engine, "infinite", f64::INFINITY);
    assert_variable(&mut engine, "text", 10.);
}

#[test]
fn truncation_and_fractions() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let whole = program.define_variable(1, Access::Public, "whole");
    let negative = program.define_variable(2, Access::Public, "negative");
    let positive = program.define_variable(3, Access::Public, "positive");
    program.label(main);
    program.truncate(whole, -2.5);
    program.fraction(negative, -2.5);
    program.fraction(positive, 3.75);

    let mut engine = Engine::new(program);
    engine.run().unwrap();
    assert_variable(&mut engine, "whole", -2.);
    assert_variable(&mut engine, "negative", 0.5);
    assert_variable(&mut engine, "positive", 0.75);
}

#[test]
fn logic_and_comparisons() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let names = ["and", "or", "xor", "not_zero", "not_three", "gt", "lt", "lt_reverse"];
    let vars = names
        .iter()
        .enumerate()
        .map(|(index, name)| program.define_variable(index + 1, Access::Public, *name))
        .collect::<Vec<_>>();
    program.label(main);
    program.mov(vars[0], 6);
    program.update(Opcode::And, vars[0], 3);
    program.mov(vars[1], 6);
    program.update(Opcode::Or, vars[1], 1);
    program.mov(vars[2], 6);
    program.update(Opcode::Xor, vars[2], 2);
    program.mov(vars[3], 0);
    program.not(vars[3]);
    program.mov(vars[4], 3);
    program.not(vars[4]);
    program.compare(Opcode::GreaterThan, vars[5], 2, 1);
    program.compare(Opcode::LessThan, vars[6], 2, 1);
    program.compare(Opcode::LessThan, vars[7], 1, 2);

    let mut engine = Engine::new(program);
    engine.run().unwrap();
    for (name, expected) in names.into_iter().zip([2., 7., 4., 1., 0., 1., 0., 1.]) {
        assert_variable(&mut engine, name, expected);
    }
}

#[test]
fn equality() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let a = program.define_variable(1, Access::Public, "a");
    let b = program.define_variable(2, Access::Public, "b");
    let first = program.define_variable(3, Access::Public, "first");
    let second = program.define_variable(4, Access::Public, "second");
    let texts = program.define_variable(5, Access::Public, "texts");
    let lists = program.define_variable(6, Access::Public, "lists");
    let same = program.define_variable(7, Access::Public, "same");
    let nulls = program.define_variable(8, Access::Public, "nulls");
    let literals = program.define_variable(9, Access::Public, "literals");
    let mixed = program.define_variable(10, Access::Public, "mixed");
    let numeric = program.define_variable(11, Access::Public, "numeric");
    program.label(main);
    program.mov(a, "hello");
    program.mov(b, "hello");
    program.compare(Opcode::Equal, texts, a, b);
    program.new_list(first);
    program.new_list(second);
    program.compare(Opcode::Equal, lists, first, second);
    program.compare(Opcode::Equal, same, first, first);
    program.compare(Opcode::Equal, nulls, RawAddress(0), RawAddress(-3));
    program.compare(Opcode::Equal, literals, 5, "5");
    program.compare(Opcode::Equal, mixed, a, "hello");
    program.mov(Register(2), 5);
    program.compare(Opcode::Equal, numeric, Register(2), "5");

    let mut engine = Engine::new(program);
    engine.run().unwrap();
    for (name, expected) in [
        ("texts", 1.),
        ("lists", 0.),
        ("same", 1.),
        ("nulls", 1.),
        ("literals", 0.),
        ("mixed", 1.),
        ("numeric", 1.),
    ] {
        assert_variable(&mut engine, name, expected);
    }
}

#[test]
fn containers() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let list = program.define_variable(1, Access::Public, "list");
    let joined = program.define_variable(2, Access::Public, "joined");
    let found = program.define_variable(3, Access::Public, "found");
    let missing = program.define_variable(4, Access::Public, "missing");
    let count = program.define_variable(5, Access::Public, "count");
    let slot = program.define_variable(6, Access::Public, "slot");
    let object = program.define_variable(7, Access::Public, "object");
    let keys = program.define_variable(8, Access::Public, "keys");
    let key_count = program.define_variable(9, Access::Public, "key_count");
    let characters = program.define_variable(10, Access::Public, "characters");
    let values = program.define_variable(11, Access::Public, "values");
    let letters = ["a", "b", "c"];
    for (index, letter) in letters.iter().enumerate() {
        program.define_constant(20 + index, *letter);
    }
    program.label(main);
    program.new_list(list);
    for (index, variable) in (20..23).enumerate() {
        program.load_address(Register(1), Variable(variable));
        program.set_list_slot(list, i32::try_from(index).unwrap(), Register(1));
    }
    program.join(joined, list);
    program.index_of(found, list, "c");
    program.index_of(missing, list, "z");
    program.count(count, list);
    program.list_slot_address(Register(2), list, 1);
    program.make_pointer(slot, Register(2));
    program.new_object(object);
    program.keys_address(Register(3), object);
    program.make_pointer(keys, Register(3));
    program.count(key_count, keys);
    program.values_address(Register(4), object);
    program.make_pointer(values, Register(4));
    program.count(characters, "héllo");

    let mut engine = Engine::new(program);
    engine.run().unwrap();
    assert_eq!(
        engine.public_variable("joined").unwrap().to_text().unwrap(),
        "abc"
    );
    assert_variable(&mut engine, "found", 2.);
    assert_variable(&mut engine, "missing", -1.);
    assert_variable(&mut engine, "count", 3.);
    assert_eq!(
        engine.public_variable("slot").unwrap().to_text().unwrap(),
        "b"
    );
    assert!(engine.public_variable("keys").unwrap().is_list());
    assert_variable(&mut engine, "key_count", 0.);
    assert!(engine.public_variable("values").unwrap().is_list());
    assert_variable(&mut engine, "characters", 5.);
}

#[test]
fn pointers() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let x = program.define_variable(1, Access::Public, "x");
    let alias = program.define_variable(2, Access::Public, "alias");
    let null = program.define_variable(3, Access::Public, "null");
    let fresh = program.define_variable(4, Access::Public, "fresh");
    let anonymous = Variable(9);
    program.label(main);
    program.mov(x, 5);
    program.load_address(Register(1), x);
    program.make_pointer(alias, Register(1));
    program.mov(alias, 9);
    program.make_pointer(null, 0);
    program.mov(null, 1);
    program.make_pointer(fresh, ());
    program.mov(fresh, 2);
    program.make_pointer(anonymous, Register(1));
    program.add(anonymous, 1);
    program.mov(RawAddress(0), 4);
    program.ret(null);

    let mut engine = Engine::new(program);
    assert!(matches!(engine.run().unwrap(), Value::None));
    assert_variable(&mut engine, "x", 10.);
    assert_variable(&mut engine, "alias", 10.);
    assert_variable(&mut engine, "fresh", 2.);
    assert!(matches!(engine.public_variable("null"), Some(Value::None)));
    assert!(!engine.set_public_variable("null", 1.));
    let anonymous = engine.variables().get(9).unwrap();
    assert_eq!(anonymous.name, "");
    assert_eq!(anonymous.access, Access::Private);
}

#[test]
fn public_variables() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    let answer = program.define_variable(1, Access::Public, "answer");
    program.define_variable(2, Access::Private, "secret");
    program.label(main);
    program.mov(answer, 42);

    let mut engine = Engine::new(program);
    assert!(!engine.set_public_variable("answer", 1.));
    engine.run().unwrap();
    assert_variable(&mut engine, "answer", 42.);
    assert!(engine.set_public_variable("answer", "changed"));
    assert_eq!(
        engine.public_variable("answer").unwrap().to_text().unwrap(),
        "changed"
    );
    assert!(engine.public_variable("secret").is_none());
    assert!(!engine.set_public_variable("secret", 1.));
}

#[test]
fn native_arguments() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    program.label(main);
    program.call(Register(1), "inspect");
    program.ret(Register(1));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut engine = Engine::new(program);
    engine.register_native_function("inspect", {
        let seen = seen.clone();
        move |args| {
            let mut seen = seen.lock();
            for param in args.params() {
                seen.push(param.to_text()?);
            }
            let third = args.memory().alloc(3.);
            assert_eq!(third.get() + 1, args.memory().len());
            Ok(Value::Integer(i32::try_from(args.len())?))
        }
    });
    let result = engine
        .execute("main", Some(vec![Value::from(2.), Value::from("x")]), true)
        .unwrap();
    assert_number(&result, 2.);
    assert_eq!(&*seen.lock(), &["2", "x"]);
}

#[test]
fn native_failures_are_wrapped() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    program.label(main);
    program.set_source_line(Some(12));
    program.call(Register(1), "fail");

    let mut engine = Engine::new(program);
    engine.register_native_function("fail", |_| Err(anyhow::anyhow!("boom")));
    let err = engine.run().unwrap_err();
    assert_eq!(err.kind(), "call");
    assert!(matches!(err.fault(), Fault::NativeCall { function, .. } if function == "fail"));
    assert_eq!(
        std::error::Error::source(&err).unwrap().to_string(),
        "boom"
    );
    assert_eq!(
        err.to_string(),
        r#"`fail` failed: boom (line 12, offset 1: call #1, "fail")"#
    );
}

#[test]
fn host_functions_take_precedence() {
    let mut program = Program::new();
    program.import_native_module("console");
    let main = program.define_function(0, Access::Public, "main");
    program.label(main);
    program.call(Register(1), "print");
    program.ret(Register(1));

    let mut engine = Engine::new(program);
    engine.register_native_module(
        "console",
        NativeModule::new()
            .with_fn("print", |_| Ok(Value::Number(1.)))
            .with_fn("print", |_| Ok(Value::Number(3.))),
    );
    assert_number(&engine.run().unwrap(), 1.);

    engine.register_native_function("print", |_| Ok(Value::Number(2.)));
    assert_number(&engine.run().unwrap(), 2.);
}

#[test]
fn unregistered_native_module() {
    let mut program = Program::new();
    program.import_native_module("graphics");
    let main = program.define_function(0, Access::Public, "main");
    program.label(main);

    let mut engine = Engine::new(program);
    let err = engine.run().unwrap_err();
    assert_eq!(err.kind(), "link");
    assert_eq!(err.to_string(), "native module `graphics` is not registered");
}

#[test]
fn unbound_variable() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    program.label(main);
    program.mov(Variable(4), 1);

    let err = Engine::new(program).run().unwrap_err();
    assert!(matches!(err.fault(), Fault::UnboundVariable(4)));
    assert_eq!(err.kind(), "lookup");
}

#[test]
fn counting_numbers_is_a_type_mismatch() {
    let mut program = Program::new();
    let main = program.define_function(0, Access::Public, "main");
    program.label(main);
    program.count(Register(1), 4);

    let err = Engine::new(program).run().unwrap_err();
    assert_eq!(err.kind(), "type_mismatch");
}
