//! Native functions, loaded libraries and the registry that links names to
//! them.

use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;

use crate::runtime::memory::Memory;
use crate::runtime::value::Value;
use crate::vm::bitcode::{Access, Program, LIBRARY_EXTENSION};
use crate::vm::Fault;

/// The ID of a native function registered with an
/// [`Engine`](crate::vm::Engine).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NativeFunctionId(pub usize);

/// A function exported by a loaded library.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FunctionRef {
    /// The index of the library in the runtime's library table.
    pub library: usize,
    /// The label index of the function within the library.
    pub function: usize,
}

/// The arguments passed to a [`NativeFunction`].
pub struct NativeArgs<'a> {
    memory: &'a mut Memory,
    params: Vec<Value>,
}

impl<'a> NativeArgs<'a> {
    /// Returns arguments for a native function invocation.
    pub fn new(memory: &'a mut Memory, params: Vec<Value>) -> Self {
        Self { memory, params }
    }

    /// Returns the resolved argument values in order.
    #[must_use]
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Returns the argument at `index`, or [`Value::None`] if fewer arguments
    /// were passed.
    #[must_use]
    pub fn get(&self, index: usize) -> &Value {
        static NONE: Value = Value::None;
        self.params.get(index).unwrap_or(&NONE)
    }

    /// Returns the number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Returns true if no arguments were passed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Returns the memory store of the running program.
    pub fn memory(&mut self) -> &mut Memory {
        self.memory
    }
}

type NativeFn = dyn Fn(&mut NativeArgs<'_>) -> anyhow::Result<Value> + Send + Sync;

/// A host callback invokable from scripts.
#[derive(Clone)]
pub struct NativeFunction(Arc<NativeFn>);

impl NativeFunction {
    /// Returns a new native function.
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(&mut NativeArgs<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(function))
    }

    /// Invokes this function.
    pub fn invoke(&self, args: &mut NativeArgs<'_>) -> anyhow::Result<Value> {
        (self.0)(args)
    }
}

impl Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NativeFunction")
            .field(&Arc::as_ptr(&self.0))
            .finish()
    }
}

/// A named set of native functions a program can import.
#[derive(Default, Clone, Debug)]
pub struct NativeModule {
    functions: Vec<(String, NativeFunction)>,
}

impl NativeModule {
    /// Returns an empty module.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `function` as `name` and returns self.
    #[must_use]
    pub fn with_fn<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut NativeArgs<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(name, NativeFunction::new(function));
        self
    }

    /// Adds `function` as `name`.
    pub fn insert(&mut self, name: impl Into<String>, function: NativeFunction) {
        self.functions.push((name.into(), function));
    }

    /// Iterates the functions of this module in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NativeFunction)> {
        self.functions
            .iter()
            .map(|(name, function)| (name.as_str(), function))
    }
}

/// The host callbacks known to a runtime.
///
/// Ids are never reused, so a [`NativeFunctionId`] stays valid for the life
/// of the runtime.
#[derive(Default, Clone, Debug)]
pub struct NativeFunctions(Vec<NativeFunction>);

impl NativeFunctions {
    /// Adds `function`, returning its id.
    pub fn push(&mut self, function: NativeFunction) -> NativeFunctionId {
        let id = NativeFunctionId(self.0.len());
        self.0.push(function);
        id
    }

    /// Returns the function with `id`.
    #[must_use]
    pub fn get(&self, id: NativeFunctionId) -> Option<&NativeFunction> {
        self.0.get(id.0)
    }
}

/// What a registered function name resolves to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Linked {
    /// A host callback.
    Native(NativeFunctionId),
    /// A function exported by a loaded library.
    Library(FunctionRef),
}

/// Maps function names to their implementations.
///
/// The first registration of a name wins; later registrations of the same
/// name are ignored.
#[derive(Default, Clone, Debug)]
pub struct FunctionRegistry(AHashMap<String, Linked>);

impl FunctionRegistry {
    /// Registers `name` unless it is already registered. Returns true if the
    /// name was added.
    pub fn register(&mut self, name: &str, linked: Linked) -> bool {
        if self.0.contains_key(name) {
            false
        } else {
            self.0.insert(name.to_string(), linked);
            true
        }
    }

    /// Returns what `name` resolves to.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Linked> {
        self.0.get(name).copied()
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Returns the number of registered names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no names are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Removes every registration.
    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// A library program loaded from disk.
#[derive(Clone, Debug)]
pub struct Library {
    path: PathBuf,
    program: Arc<Program>,
}

impl Library {
    /// Returns the path the library was loaded from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the library's program.
    #[must_use]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Iterates the functions this library exports by name.
    pub fn exports(&self, library: usize) -> impl Iterator<Item = (&str, FunctionRef)> + '_ {
        self.program
            .functions()
            .iter()
            .filter(|function| function.access == Access::Public)
            .map(move |function| {
                (
                    function.name.as_str(),
                    FunctionRef {
                        library,
                        function: function.index,
                    },
                )
            })
    }
}

/// The libraries loaded by a runtime. Each path is loaded at most once.
#[derive(Default, Clone, Debug)]
pub struct Libraries(Vec<Library>);

impl Libraries {
    /// Returns the index of the library loaded from `path`.
    #[must_use]
    pub fn find(&self, path: &Path) -> Option<usize> {
        self.0.iter().position(|library| library.path == path)
    }

    /// Returns the index of the library at `path`, loading it if needed.
    pub fn load(&mut self, path: &Path) -> Result<usize, Fault> {
        if let Some(index) = self.find(path) {
            return Ok(index);
        }
        let invalid = |reason: String| Fault::InvalidLibrary {
            path: path.to_path_buf(),
            reason,
        };
        let source = std::fs::read_to_string(path).map_err(|err| invalid(err.to_string()))?;
        let program = Program::from_rsn(&source).map_err(|err| invalid(err.0))?;
        info!(path = %path.display(), "loaded library");
        Ok(self.insert(path.to_path_buf(), program))
    }

    /// Adds an already decoded library, returning its index.
    pub fn insert(&mut self, path: PathBuf, program: Program) -> usize {
        if let Some(index) = self.find(&path) {
            return index;
        }
        self.0.push(Library {
            path,
            program: Arc::new(program),
        });
        self.0.len() - 1
    }

    /// Returns the library at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Library> {
        self.0.get(index)
    }

    /// Iterates the loaded libraries with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Library)> {
        self.0.iter().enumerate()
    }

    /// Returns the number of loaded libraries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no libraries are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Unloads every library.
    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// Returns the first file named `{name}.cvm` within `search_paths`.
#[must_use]
pub fn locate_library(search_paths: &[PathBuf], name: &str) -> Option<PathBuf> {
    let file_name = format!("{name}.{LIBRARY_EXTENSION}");
    search_paths
        .iter()
        .map(|directory| directory.join(&file_name))
        .find(|path| path.is_file())
}
