use std::path::{Path, PathBuf};

use cellvm::runtime::value::Value;
use cellvm::vm::bitcode::{Access, Program, Variable};
use cellvm::vm::{Engine, Fault, Register};
use cellvm::ErrorKind;
use tracing_subscriber::filter::LevelFilter;

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

struct LibraryDir(PathBuf);

impl LibraryDir {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("cellvm-{name}-{}", std::process::id()));
        std::fs::remove_dir_all(&path).ok();
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    fn write(&self, name: &str, contents: &str) {
        std::fs::write(self.0.join(format!("{name}.cvm")), contents).unwrap();
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for LibraryDir {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.0).ok();
    }
}

/// A library exporting `add`, which sums the first two call arguments.
///
/// The library also declares a public `x` to verify that callers never see
/// a library's variables.
fn math_library() -> Program {
    let mut library = Program::new();
    let add = library.define_function(0, Access::Public, "add");
    let args = Variable(1);
    let a = Variable(2);
    let b = Variable(3);
    let sum = library.define_variable(4, Access::Public, "x");
    library.label(add);
    library.make_pointer(args, Register(0));
    library.list_slot_address(Register(1), args, 0);
    library.make_pointer(a, Register(1));
    library.list_slot_address(Register(1), args, 1);
    library.make_pointer(b, Register(1));
    library.mov(sum, a);
    library.add(sum, b);
    library.ret(sum);
    library
}

fn constant_library(value: f64) -> Program {
    let mut library = Program::new();
    let get = library.define_function(0, Access::Public, "get");
    library.label(get);
    library.ret(value);
    library
}

/// `main` calls `add(2, 3)` from the `math` library.
fn calls_add() -> Program {
    let mut program = Program::new();
    program.import_library("math");
    let main = program.define_function(0, Access::Public, "main");
    let x = program.define_variable(1, Access::Public, "x");
    let args = program.define_variable(2, Access::Private, "args");
    let result = program.define_variable(3, Access::Public, "result");
    let two = program.define_constant(10, 2);
    let three = program.define_constant(11, 3);
    program.label(main);
    program.mov(x, 100);
    program.new_list(args);
    program.load_address(Register(1), two);
    program.set_list_slot(args, 0, Register(1));
    program.load_address(Register(1), three);
    program.set_list_slot(args, 1, Register(1));
    program.load_address(Register(0), args);
    program.call(result, "add");
    program.ret(result);
    program
}

#[test]
fn library_call() {
    initialize_tracing();
    let dir = LibraryDir::new("library-call");
    dir.write("math", &math_library().to_rsn());

    let mut engine = Engine::new(calls_add()).with_search_path(dir.path());
    let Value::Number(result) = engine.run().unwrap() else {
        unreachable!("add returns a number")
    };
    assert_eq!(result, 5.);
    let Some(Value::Number(x)) = engine.public_variable("x") else {
        unreachable!("x is a number")
    };
    assert_eq!(x, 100.);
    assert_eq!(engine.runtime().libraries().len(), 1);
}

#[test]
fn libraries_load_once() {
    let dir = LibraryDir::new("load-once");
    dir.write("math", &math_library().to_rsn());

    let mut program = calls_add();
    program.import_library("math");
    let mut engine = Engine::new(program).with_search_path(dir.path());
    engine.run().unwrap();
    assert_eq!(engine.runtime().libraries().len(), 1);

    // Relinking without clearing reuses the loaded library.
    engine.execute("main", None, false).unwrap();
    assert_eq!(engine.runtime().libraries().len(), 1);
}

#[test]
fn first_search_path_wins() {
    let first = LibraryDir::new("search-first");
    let second = LibraryDir::new("search-second");
    first.write("constant", &constant_library(1.).to_rsn());
    second.write("constant", &constant_library(2.).to_rsn());

    let mut program = Program::new();
    program.import_library("constant");
    let main = program.define_function(0, Access::Public, "main");
    program.label(main);
    program.call(Register(1), "get");
    program.ret(Register(1));

    let mut engine = Engine::new(program)
        .with_search_path(first.path())
        .with_search_path(second.path());
    let Value::Number(result) = engine.run().unwrap() else {
        unreachable!("get returns a number")
    };
    assert_eq!(result, 1.);

    engine.search_paths_mut().reverse();
    let Value::Number(result) = engine.run().unwrap() else {
        unreachable!("get returns a number")
    };
    assert_eq!(result, 2.);
}

#[test]
fn missing_library() {
    let dir = LibraryDir::new("missing");
    let mut engine = Engine::new(calls_add()).with_search_path(dir.path());
    let err = engine.run().unwrap_err();
    assert_eq!(err.kind(), "link");
    assert_eq!(err.to_string(), "library `math` was not found");
}

#[test]
fn invalid_library() {
    let dir = LibraryDir::new("invalid");
    dir.write("math", "Program { instructions: [");
    let mut engine = Engine::new(calls_add()).with_search_path(dir.path());
    let err = engine.run().unwrap_err();
    assert_eq!(err.kind(), "link");
    assert!(matches!(err.fault(), Fault::InvalidLibrary { path, .. } if path.ends_with("math.cvm")));
}

#[test]
fn library_faults_are_wrapped() {
    let dir = LibraryDir::new("library-fault");
    let mut library = Program::new();
    let add = library.define_function(0, Access::Public, "add");
    library.label(add);
    library.set_source_line(Some(2));
    library.call(Register(1), "missing");
    dir.write("math", &library.to_rsn());

    let mut engine = Engine::new(calls_add()).with_search_path(dir.path());
    let err = engine.run().unwrap_err();
    assert_eq!(err.kind(), "call");
    let Fault::Call(inner) = err.fault() else {
        unreachable!("library faults are wrapped")
    };
    assert_eq!(inner.kind(), "lookup");
    assert_eq!(inner.location().unwrap().line, Some(2));
    assert!(matches!(err.root_fault(), Fault::UnknownFunction(name) if name == "missing"));
}

#[test]
fn unused_library_functions_may_call_unknown_hosts() {
    let dir = LibraryDir::new("unused-host");
    let mut library = math_library();
    let log = library.define_function(5, Access::Public, "log");
    library.label(log);
    library.call(Register(1), "host_log");
    library.ret(Register(1));
    dir.write("math", &library.to_rsn());

    let mut engine = Engine::new(calls_add()).with_search_path(dir.path());
    let Value::Number(result) = engine.run().unwrap() else {
        unreachable!("add returns a number")
    };
    assert_eq!(result, 5.);
}
