//! Virtual machine types for executing cellvm programs.
//!
//! An [`Engine`] owns a [`Program`] and the shared [`Runtime`] state it runs
//! against. Executing a program happens in two phases:
//!
//! 1. Linking resolves the program's imports into the runtime's function
//!    registry, binds constants and declared variables to fresh memory cells,
//!    and records the code offset of every label.
//! 2. Running fetches, decodes and executes instructions starting at the
//!    entry label until a [`Opcode::Return`] is reached.
//!
//! Calls to functions exported by libraries run the library's program in a
//! nested interpreter. The nested interpreter shares the caller's
//! [`Runtime`] but gets its own [`Scope`], so callers and callees never see
//! each other's variables.

use std::error::Error;
use std::fmt::{self, Display};
use std::ops::{Index, IndexMut};
use std::path::PathBuf;
use std::sync::Arc;

use kempt::Map;
use serde::{Deserialize, Serialize};

use self::bitcode::{
    Access, Import, ImportKind, Instruction, Label, Opcode, Operand, Program, Variable,
};
use self::linkage::{
    locate_library, FunctionRef, FunctionRegistry, Libraries, Linked, NativeArgs, NativeFunction,
    NativeFunctionId, NativeFunctions, NativeModule,
};
use self::tables::{LabelEntry, Labels, Scope, VariableEntry, Variables};
use crate::runtime::list::List;
use crate::runtime::memory::{Address, Memory};
use crate::runtime::value::{Conversion, Value, ValueKind};
use crate::ErrorKind;

pub mod bitcode;
pub mod linkage;
pub mod tables;

/// The default maximum call depth of an [`Engine`].
pub const DEFAULT_MAX_DEPTH: usize = 1024;

/// The entry point of an [`Engine::execute`] call.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Entry {
    /// The public function with this name.
    Name(String),
    /// The label with this index.
    Index(usize),
}

impl_from!(Entry, String, Name);
impl_from!(Entry, &'_ str, Name);
impl_from!(Entry, usize, Index);

impl From<Label> for Entry {
    fn from(label: Label) -> Self {
        Self::Index(label.0)
    }
}

impl Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Name(name) => f.write_str(name),
            Entry::Index(index) => write!(f, "@{index}"),
        }
    }
}

/// A virtual machine register.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Register(pub u8);

/// The integer registers of a [`Runtime`].
///
/// Register 0 holds the address of the current call's argument list.
#[derive(Clone, Debug)]
pub struct Registers([i64; 256]);

impl Default for Registers {
    fn default() -> Self {
        Self([0; 256])
    }
}

impl Registers {
    /// Resets every register to zero.
    pub fn clear(&mut self) {
        self.0.fill(0);
    }
}

impl Index<Register> for Registers {
    type Output = i64;

    fn index(&self, index: Register) -> &Self::Output {
        &self.0[usize::from(index.0)]
    }
}

impl IndexMut<Register> for Registers {
    fn index_mut(&mut self, index: Register) -> &mut Self::Output {
        &mut self.0[usize::from(index.0)]
    }
}

/// An instruction about to be executed, as seen by an
/// [`Engine::on_step`] observer.
#[derive(Clone, Copy, Debug)]
pub struct StepEvent<'a> {
    /// The call depth. The entry function runs at depth 0.
    pub depth: usize,
    /// The offset of the instruction within its program.
    pub offset: usize,
    /// The instruction.
    pub instruction: &'a Instruction,
}

type StepObserver = dyn FnMut(&StepEvent<'_>) + Send;

/// The state shared by every interpreter spawned from one [`Engine`].
pub struct Runtime {
    memory: Memory,
    registers: Registers,
    functions: FunctionRegistry,
    libraries: Libraries,
    natives: NativeFunctions,
    host_functions: Vec<(String, NativeFunctionId)>,
    native_modules: Map<String, Vec<(String, NativeFunctionId)>>,
    search_paths: Vec<PathBuf>,
    max_depth: usize,
    observer: Option<Box<StepObserver>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            memory: Memory::new(),
            registers: Registers::default(),
            functions: FunctionRegistry::default(),
            libraries: Libraries::default(),
            natives: NativeFunctions::default(),
            host_functions: Vec::new(),
            native_modules: Map::new(),
            search_paths: Vec::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            observer: None,
        }
    }
}

impl Runtime {
    /// Returns the memory store.
    #[must_use]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Returns the registers.
    #[must_use]
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Returns the function registry.
    #[must_use]
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Returns the loaded libraries.
    #[must_use]
    pub fn libraries(&self) -> &Libraries {
        &self.libraries
    }

    fn link_imports(&mut self, program: &Program) -> Result<(), Fault> {
        for (name, id) in &self.host_functions {
            self.functions.register(name, Linked::Native(*id));
        }

        for import in program
            .imports()
            .iter()
            .filter(|import| import.kind == ImportKind::NativeModule)
        {
            let Some(module) = self.native_modules.get(&import.name) else {
                return Err(Fault::UnresolvedImport(import.clone()));
            };
            debug!(module = %import.name, "linking native module");
            for (name, id) in module {
                self.functions.register(name, Linked::Native(*id));
            }
        }

        for import in program
            .imports()
            .iter()
            .filter(|import| import.kind == ImportKind::Library)
        {
            let path = locate_library(&self.search_paths, &import.name)
                .ok_or_else(|| Fault::UnresolvedImport(import.clone()))?;
            debug!(library = %import.name, path = %path.display(), "linking library");
            self.libraries.load(&path)?;
        }

        for (index, library) in self.libraries.iter() {
            for (name, function) in library.exports(index) {
                self.functions.register(name, Linked::Library(function));
            }
        }

        Ok(())
    }
}

/// A virtual machine bound to a [`Program`].
pub struct Engine {
    program: Arc<Program>,
    runtime: Runtime,
    scope: Scope,
}

impl Engine {
    /// Returns an engine that executes `program`.
    #[must_use]
    pub fn new(program: impl Into<Arc<Program>>) -> Self {
        Self {
            program: program.into(),
            runtime: Runtime::default(),
            scope: Scope::default(),
        }
    }

    /// Adds `path` to the directories searched for imported libraries and
    /// returns self.
    #[must_use]
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime.search_paths.push(path.into());
        self
    }

    /// Returns the directories searched for imported libraries, in order.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.runtime.search_paths
    }

    /// Returns the directories searched for imported libraries for
    /// modification.
    pub fn search_paths_mut(&mut self) -> &mut Vec<PathBuf> {
        &mut self.runtime.search_paths
    }

    /// Returns the maximum call depth.
    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.runtime.max_depth
    }

    /// Sets the maximum call depth. Calls beyond this depth fault with
    /// [`Fault::StackOverflow`].
    pub fn set_max_depth(&mut self, depth: usize) {
        self.runtime.max_depth = depth;
    }

    /// Invokes `observer` before every executed instruction, including
    /// instructions of nested library calls.
    pub fn on_step<F>(&mut self, observer: F)
    where
        F: FnMut(&StepEvent<'_>) + Send + 'static,
    {
        self.runtime.observer = Some(Box::new(observer));
    }

    /// Registers `function` under `name`.
    ///
    /// Functions registered this way are linked before any import, so they
    /// take precedence over imported functions with the same name.
    pub fn register_native_function<F>(&mut self, name: impl Into<String>, function: F) -> NativeFunctionId
    where
        F: Fn(&mut NativeArgs<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let id = self.runtime.natives.push(NativeFunction::new(function));
        self.runtime.host_functions.push((name.into(), id));
        id
    }

    /// Registers `module` under `name`, making it available to programs that
    /// import the native module `name`.
    pub fn register_native_module(&mut self, name: impl Into<String>, module: NativeModule) {
        let functions = module
            .iter()
            .map(|(name, function)| {
                (
                    name.to_string(),
                    self.runtime.natives.push(function.clone()),
                )
            })
            .collect();
        self.runtime.native_modules.insert(name.into(), functions);
    }

    /// Links and executes the program starting at `entry`.
    ///
    /// When `args` is provided, the values are stored in a new list whose
    /// address is placed in register 0. When `clear` is true, the registers,
    /// loaded libraries and function registry are reset before linking.
    pub fn execute(
        &mut self,
        entry: impl Into<Entry>,
        args: Option<Vec<Value>>,
        clear: bool,
    ) -> Result<Value, ExecutionError> {
        let program = Arc::clone(&self.program);
        Interpreter {
            program: &program,
            runtime: &mut self.runtime,
            scope: &mut self.scope,
            depth: 0,
        }
        .execute(&entry.into(), args, clear)
    }

    /// Executes the public function `main` with no arguments on a freshly
    /// reset runtime.
    pub fn run(&mut self) -> Result<Value, ExecutionError> {
        self.execute("main", Some(Vec::new()), true)
    }

    /// Returns the value of the public variable `name`.
    pub fn public_variable(&mut self, name: &str) -> Option<Value> {
        let index = self.scope.variables.resolve_public(name)?;
        let address = self.scope.variables.get(index)?.address;
        Some(address.map_or(Value::None, |address| self.runtime.memory.read(address)))
    }

    /// Stores `value` in the public variable `name`. Returns false if no
    /// public variable has that name or it is bound to the null address.
    pub fn set_public_variable(&mut self, name: &str, value: impl Into<Value>) -> bool {
        let address = self
            .scope
            .variables
            .resolve_public(name)
            .and_then(|index| self.scope.variables.get(index))
            .and_then(|variable| variable.address);
        if let Some(address) = address {
            self.runtime.memory.write(address, value);
            true
        } else {
            false
        }
    }

    /// Returns the program this engine executes.
    #[must_use]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Returns the shared runtime state.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Returns the memory store.
    #[must_use]
    pub fn memory(&self) -> &Memory {
        &self.runtime.memory
    }

    /// Returns the registers.
    #[must_use]
    pub fn registers(&self) -> &Registers {
        &self.runtime.registers
    }

    /// Returns the variables of the last execution.
    #[must_use]
    pub fn variables(&self) -> &Variables {
        &self.scope.variables
    }

    /// Returns the labels of the last execution.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.scope.labels
    }
}

enum Flow {
    Next,
    Jump(usize),
    Call(usize),
    Return(Value),
}

struct Interpreter<'a> {
    program: &'a Program,
    runtime: &'a mut Runtime,
    scope: &'a mut Scope,
    depth: usize,
}

impl Interpreter<'_> {
    fn execute(
        &mut self,
        entry: &Entry,
        args: Option<Vec<Value>>,
        clear: bool,
    ) -> Result<Value, ExecutionError> {
        self.link(args, clear)?;
        let offset = self.entry_offset(entry)?;
        self.run(offset)
    }

    fn link(&mut self, args: Option<Vec<Value>>, clear: bool) -> Result<(), ExecutionError> {
        debug!(depth = self.depth, clear, "linking");
        self.scope.clear();
        if clear {
            self.runtime.registers.clear();
            self.runtime.libraries.clear();
            self.runtime.functions.clear();
        }

        self.runtime.link_imports(self.program)?;
        self.declare()?;

        if let Some(args) = args {
            let list = List::allocate(args, &mut self.runtime.memory);
            let address = self.runtime.memory.alloc(list);
            self.runtime.registers[Register(0)] = address.to_raw();
        }

        Ok(())
    }

    fn declare(&mut self) -> Result<(), ExecutionError> {
        for constant in self.program.constants() {
            let address = self.runtime.memory.alloc(constant.value.to_value());
            self.scope
                .variables
                .set(constant.index, VariableEntry::anonymous(Some(address)));
        }

        for definition in self.program.variables() {
            let address = self.runtime.memory.alloc(Value::None);
            self.scope.variables.set(
                definition.index,
                VariableEntry {
                    name: definition.name.clone(),
                    access: definition.access,
                    address: Some(address),
                },
            );
        }

        for function in self.program.functions() {
            self.scope.labels.set(
                function.index,
                LabelEntry {
                    name: function.name.clone(),
                    access: function.access,
                    offset: None,
                },
            );
        }

        for (offset, instruction) in self.program.instructions().iter().enumerate() {
            if instruction.opcode != Opcode::Label {
                continue;
            }
            let Operand::Label(label) = instruction.operand(0) else {
                return Err(ExecutionError::new(
                    Fault::UnsupportedOperand(instruction.operand(0).clone()),
                    offset,
                    instruction,
                ));
            };
            if let Some(entry) = self.scope.labels.get_mut(label.0) {
                entry.offset = Some(offset);
            } else {
                self.scope.labels.set(
                    label.0,
                    LabelEntry {
                        name: String::new(),
                        access: Access::Private,
                        offset: Some(offset),
                    },
                );
            }
        }

        Ok(())
    }

    fn entry_offset(&self, entry: &Entry) -> Result<usize, Fault> {
        let index = match entry {
            Entry::Name(name) => self.scope.labels.resolve_public(name),
            Entry::Index(index) => Some(*index),
        };
        index
            .and_then(|index| self.scope.labels.get(index))
            .and_then(|label| label.offset)
            .ok_or_else(|| Fault::MissingEntryPoint(entry.clone()))
    }

    fn run(&mut self, mut offset: usize) -> Result<Value, ExecutionError> {
        let program = self.program;
        while let Some(instruction) = program.instructions().get(offset) {
            trace!(depth = self.depth, offset, %instruction, "step");
            if let Some(observer) = &mut self.runtime.observer {
                observer(&StepEvent {
                    depth: self.depth,
                    offset,
                    instruction,
                });
            }

            match self.step(instruction) {
                Ok(Flow::Next) => offset += 1,
                Ok(Flow::Jump(target)) => offset = target,
                Ok(Flow::Call(target)) => {
                    // Faults inside a label call surface from the faulting
                    // instruction itself.
                    let value = self.call_label(target)?;
                    self.store(instruction.operand(0), value)
                        .map_err(|fault| ExecutionError::new(fault, offset, instruction))?;
                    offset += 1;
                }
                Ok(Flow::Return(value)) => return Ok(value),
                Err(fault) => return Err(ExecutionError::new(fault, offset, instruction)),
            }
        }

        Ok(Value::Number(0.))
    }

    fn step(&mut self, instruction: &Instruction) -> Result<Flow, Fault> {
        let dst = instruction.operand(0);
        let lhs = instruction.operand(1);
        let rhs = instruction.operand(2);
        match instruction.opcode {
            Opcode::Nop | Opcode::Label => {}
            Opcode::Move => {
                let value = self.load(lhs)?;
                self.store(dst, value)?;
            }
            Opcode::MakePointer => self.op_make_pointer(dst, lhs)?,
            Opcode::LoadAddress => {
                let Operand::Variable(variable) = lhs else {
                    return Err(Fault::UnsupportedOperand(lhs.clone()));
                };
                let address = self.variable_address(*variable)?;
                self.store(dst, address_value(address))?;
            }
            Opcode::Truncate => {
                let value = self.load(lhs)?.to_double()?;
                self.store(dst, value.trunc())?;
            }
            Opcode::Fraction => {
                let value = self.load(lhs)?.to_double()?;
                self.store(dst, value - value.floor())?;
            }
            Opcode::NewList => self.store(dst, List::new())?,
            Opcode::SetListSlot => self.op_set_list_slot(dst, lhs, rhs)?,
            Opcode::GetListSlotAddress => self.op_list_slot_address(dst, lhs, rhs)?,
            Opcode::IndexOf => {
                let list = self.load(lhs)?.as_list()?.clone();
                let text = self.load(rhs)?.to_text()?;
                #[allow(clippy::cast_precision_loss)]
                let index = list
                    .index_of(&text, &mut self.runtime.memory)
                    .map_or(-1., |index| index as f64);
                self.store(dst, index)?;
            }
            Opcode::Join => {
                let list = self.load(lhs)?.as_list()?.clone();
                let joined = list.join(&mut self.runtime.memory)?;
                self.store(dst, joined)?;
            }
            Opcode::Count => self.op_count(dst, lhs)?,
            Opcode::NewObject => {
                let address = self.runtime.memory.create_object();
                let object = self.runtime.memory.read(address);
                self.store(dst, object)?;
            }
            Opcode::GetKeysAddress => {
                let object = self.load(lhs)?.as_object()?;
                self.store(dst, object.keys_address().to_value())?;
            }
            Opcode::GetValuesAddress => {
                let object = self.load(lhs)?.as_object()?;
                self.store(dst, object.values_address().to_value())?;
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                let current = self.load(dst)?;
                let operand = self.load(lhs)?;
                self.store(dst, arithmetic(instruction.opcode, &current, &operand)?)?;
            }
            Opcode::Not => {
                let value = self.load(dst)?.to_integer()?;
                self.store(dst, value <= 0)?;
            }
            Opcode::And | Opcode::Or | Opcode::Xor => {
                let current = self.load(dst)?.to_integer()?;
                let operand = self.load(lhs)?.to_integer()?;
                let result = match instruction.opcode {
                    Opcode::And => current & operand,
                    Opcode::Or => current | operand,
                    _ => current ^ operand,
                };
                self.store(dst, f64::from(result))?;
            }
            Opcode::Equal => {
                let equal = self.equal(lhs, rhs)?;
                self.store(dst, equal)?;
            }
            Opcode::GreaterThan | Opcode::LessThan => {
                let a = self.load(lhs)?.to_double()?;
                let b = self.load(rhs)?.to_double()?;
                let result = if instruction.opcode == Opcode::GreaterThan {
                    a > b
                } else {
                    a < b
                };
                self.store(dst, result)?;
            }
            Opcode::Jump => return Ok(Flow::Jump(self.label_offset(dst)?)),
            Opcode::JumpIfTrue => {
                if self.load(dst)?.to_double()? > 0. {
                    return Ok(Flow::Jump(self.label_offset(lhs)?));
                }
            }
            Opcode::Call if matches!(lhs, Operand::Label(_)) => {
                let target = self.label_offset(lhs)?;
                self.check_depth()?;
                return Ok(Flow::Call(target));
            }
            Opcode::Call => {
                let result = self.op_call(lhs)?;
                self.store(dst, result)?;
            }
            Opcode::Return => return Ok(Flow::Return(self.load(dst)?)),
        }

        Ok(Flow::Next)
    }

    fn load(&mut self, operand: &Operand) -> Result<Value, Fault> {
        let address = match operand {
            Operand::None => return Ok(Value::None),
            Operand::Literal(literal) => return Ok(literal.to_value()),
            #[allow(clippy::cast_precision_loss)]
            Operand::Register(register) => {
                return Ok(Value::Number(self.runtime.registers[*register] as f64))
            }
            Operand::Variable(variable) => self.variable_address(*variable)?,
            Operand::RawAddress(raw) => Address::new(raw.0),
            Operand::Label(_) => return Err(Fault::UnsupportedOperand(operand.clone())),
        };
        Ok(address.map_or(Value::None, |address| self.runtime.memory.read(address)))
    }

    fn store(&mut self, operand: &Operand, value: impl Into<Value>) -> Result<(), Fault> {
        let value = value.into();
        let address = match operand {
            Operand::Register(register) => {
                self.runtime.registers[*register] = value.to_long()?;
                return Ok(());
            }
            Operand::Variable(variable) => self.variable_address(*variable)?,
            Operand::RawAddress(raw) => Address::new(raw.0),
            Operand::None | Operand::Literal(_) | Operand::Label(_) => {
                return Err(Fault::UnsupportedOperand(operand.clone()))
            }
        };
        // Writes through a null address are dropped.
        if let Some(address) = address {
            self.runtime.memory.write(address, value);
        }
        Ok(())
    }

    fn variable_address(&self, variable: Variable) -> Result<Option<Address>, Fault> {
        self.scope
            .variables
            .get(variable.0)
            .map(|entry| entry.address)
            .ok_or(Fault::UnboundVariable(variable.0))
    }

    fn operand_address(&self, operand: &Operand) -> Result<Option<Address>, Fault> {
        match operand {
            Operand::None => Ok(None),
            Operand::Variable(variable) => self.variable_address(*variable),
            Operand::RawAddress(raw) => Ok(Address::new(raw.0)),
            Operand::Literal(_) | Operand::Register(_) | Operand::Label(_) => {
                Err(Fault::UnsupportedOperand(operand.clone()))
            }
        }
    }

    fn label_offset(&self, operand: &Operand) -> Result<usize, Fault> {
        let Operand::Label(label) = operand else {
            return Err(Fault::UnsupportedOperand(operand.clone()));
        };
        self.scope
            .labels
            .get(label.0)
            .and_then(|entry| entry.offset)
            .ok_or(Fault::UnboundLabel(label.0))
    }

    fn list_index(&mut self, operand: &Operand) -> Result<usize, Fault> {
        let index = self.load(operand)?.to_integer()?;
        usize::try_from(index).map_err(|_| Fault::InvalidListIndex(index))
    }

    fn op_make_pointer(&mut self, dst: &Operand, src: &Operand) -> Result<(), Fault> {
        let Operand::Variable(variable) = dst else {
            return Err(Fault::UnsupportedOperand(dst.clone()));
        };
        let address = if matches!(src, Operand::None) {
            Some(self.runtime.memory.alloc(Value::None))
        } else {
            Address::new(self.load(src)?.to_long()?)
        };
        if let Some(entry) = self.scope.variables.get_mut(variable.0) {
            entry.address = address;
        } else {
            self.scope
                .variables
                .set(variable.0, VariableEntry::anonymous(address));
        }
        Ok(())
    }

    fn op_set_list_slot(
        &mut self,
        list: &Operand,
        index: &Operand,
        address: &Operand,
    ) -> Result<(), Fault> {
        let list = self.load(list)?.as_list()?.clone();
        let index = self.list_index(index)?;
        let address = Address::new(self.load(address)?.to_long()?);
        list.set_slot(index, address);
        Ok(())
    }

    fn op_list_slot_address(
        &mut self,
        dst: &Operand,
        list: &Operand,
        index: &Operand,
    ) -> Result<(), Fault> {
        let address = if matches!(index, Operand::None) {
            self.operand_address(list)?
        } else {
            let list = self.load(list)?.as_list()?.clone();
            let index = self.list_index(index)?;
            list.slot(index)
        };
        self.store(dst, address_value(address))
    }

    fn op_count(&mut self, dst: &Operand, src: &Operand) -> Result<(), Fault> {
        let count = match self.load(src)? {
            Value::Object(object) => object.len(&mut self.runtime.memory)?,
            value @ (Value::List(_) | Value::Text(_)) => value.size()?,
            other => {
                return Err(Fault::TypeMismatch {
                    conversion: Conversion::Size,
                    actual: other.kind(),
                })
            }
        };
        #[allow(clippy::cast_precision_loss)]
        let count = count as f64;
        self.store(dst, count)
    }

    #[allow(clippy::float_cmp)]
    fn equal(&mut self, lhs: &Operand, rhs: &Operand) -> Result<bool, Fault> {
        if let (Operand::Literal(a), Operand::Literal(b)) = (lhs, rhs) {
            return Ok(a == b);
        }

        if matches!(lhs, Operand::Literal(_) | Operand::Register(_))
            || matches!(rhs, Operand::Literal(_) | Operand::Register(_))
        {
            let a = self.load(lhs)?;
            let b = self.load(rhs)?;
            return if a.is_number() && b.is_number() {
                Ok(a.to_double()? == b.to_double()?)
            } else {
                Ok(matches!((a.to_text(), b.to_text()), (Ok(a), Ok(b)) if a == b))
            };
        }

        match (self.operand_address(lhs)?, self.operand_address(rhs)?) {
            (None, None) => Ok(true),
            (None, Some(_)) | (Some(_), None) => Ok(false),
            (Some(a), Some(b)) if a == b => Ok(true),
            (Some(a), Some(b)) => {
                let a = self.runtime.memory.read(a);
                let b = self.runtime.memory.read(b);
                Ok(a.equals(&b))
            }
        }
    }

    fn call_label(&mut self, offset: usize) -> Result<Value, ExecutionError> {
        self.depth += 1;
        let result = self.run(offset);
        self.depth -= 1;
        result
    }

    fn op_call(&mut self, callee: &Operand) -> Result<Value, Fault> {
        match self.load(callee)? {
            Value::Text(name) => match self.runtime.functions.get(&name) {
                Some(Linked::Native(id)) => self.call_native(&name, id),
                Some(Linked::Library(function)) => self.call_library(function),
                None => Err(Fault::UnknownFunction(name)),
            },
            Value::NativeFunction(id) => self.call_native(&format!("native#{}", id.0), id),
            Value::Function(function) => self.call_library(function),
            other => Err(Fault::TypeMismatch {
                conversion: Conversion::Function,
                actual: other.kind(),
            }),
        }
    }

    fn check_depth(&self) -> Result<(), Fault> {
        if self.depth + 1 >= self.runtime.max_depth {
            Err(Fault::StackOverflow)
        } else {
            Ok(())
        }
    }

    fn call_arguments(&mut self) -> Result<Vec<Value>, Fault> {
        let Some(address) = Address::new(self.runtime.registers[Register(0)]) else {
            return Ok(Vec::new());
        };
        let list = self.runtime.memory.list(address)?;
        Ok(list.values(&mut self.runtime.memory))
    }

    fn call_native(&mut self, name: &str, id: NativeFunctionId) -> Result<Value, Fault> {
        let function = self
            .runtime
            .natives
            .get(id)
            .cloned()
            .ok_or(Fault::UnknownNativeFunction(id))?;
        let params = self.call_arguments()?;
        trace!(function = name, params = params.len(), "calling native function");
        let mut args = NativeArgs::new(&mut self.runtime.memory, params);
        function
            .invoke(&mut args)
            .map_err(|error| Fault::NativeCall {
                function: name.to_string(),
                error: Arc::new(error),
            })
    }

    fn call_library(&mut self, function: FunctionRef) -> Result<Value, Fault> {
        let program = self
            .runtime
            .libraries
            .get(function.library)
            .map(|library| Arc::clone(library.program()))
            .ok_or(Fault::UnknownLibrary(function.library))?;
        self.check_depth()?;

        let mut scope = Scope::default();
        let mut nested = Interpreter {
            program: &program,
            runtime: &mut *self.runtime,
            scope: &mut scope,
            depth: self.depth + 1,
        };
        nested
            .execute(&Entry::Index(function.function), None, false)
            .map_err(|err| Fault::Call(Box::new(err)))
    }
}

fn address_value(address: Option<Address>) -> Value {
    address.map_or(Value::Number(0.), Address::to_value)
}

fn arithmetic(opcode: Opcode, lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        let result = match opcode {
            Opcode::Add => a.checked_add(*b),
            Opcode::Sub => a.checked_sub(*b),
            Opcode::Mul => a.checked_mul(*b),
            _ => None,
        };
        if let Some(result) = result {
            return Ok(Value::Integer(result));
        }
    }

    let a = lhs.to_double()?;
    let b = rhs.to_double()?;
    Ok(Value::Number(match opcode {
        Opcode::Add => a + b,
        Opcode::Sub => a - b,
        Opcode::Mul => a * b,
        _ => a / b,
    }))
}

/// A virtual machine error.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Fault {
    /// An imported native module was not registered, or an imported library
    /// was not found in any search path.
    UnresolvedImport(Import),
    /// A library file could not be read or decoded.
    InvalidLibrary {
        /// The path of the library.
        path: PathBuf,
        /// Why the library could not be loaded.
        reason: String,
    },
    /// The entry point of an execution could not be found.
    MissingEntryPoint(Entry),
    /// A value could not be converted as required.
    TypeMismatch {
        /// The requested conversion.
        conversion: Conversion,
        /// The kind of the value.
        actual: ValueKind,
    },
    /// An operand kind is not supported by the instruction.
    UnsupportedOperand(Operand),
    /// An instruction referenced a variable index that is not bound.
    UnboundVariable(usize),
    /// An instruction referenced a label that is not declared or never
    /// marked.
    UnboundLabel(usize),
    /// A called function name is not registered.
    UnknownFunction(String),
    /// A native function id is not registered.
    UnknownNativeFunction(NativeFunctionId),
    /// A function referred to a library that is not loaded.
    UnknownLibrary(usize),
    /// An object has no entry for the key.
    KeyNotFound(String),
    /// A list index was negative.
    InvalidListIndex(i32),
    /// A native function returned an error.
    NativeCall {
        /// The name of the function.
        function: String,
        /// The error returned.
        error: Arc<anyhow::Error>,
    },
    /// A called function faulted.
    Call(Box<ExecutionError>),
    /// The maximum call depth was exceeded.
    StackOverflow,
}

impl ErrorKind for Fault {
    fn kind(&self) -> &'static str {
        match self {
            Fault::UnresolvedImport(_) | Fault::InvalidLibrary { .. } => "link",
            Fault::MissingEntryPoint(_) => "missing_entry_point",
            Fault::TypeMismatch { .. } | Fault::UnsupportedOperand(_) => "type_mismatch",
            Fault::UnboundVariable(_)
            | Fault::UnboundLabel(_)
            | Fault::UnknownFunction(_)
            | Fault::UnknownNativeFunction(_)
            | Fault::UnknownLibrary(_)
            | Fault::KeyNotFound(_)
            | Fault::InvalidListIndex(_) => "lookup",
            Fault::NativeCall { .. } | Fault::Call(_) | Fault::StackOverflow => "call",
        }
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::UnresolvedImport(import) => match import.kind {
                ImportKind::NativeModule => {
                    write!(f, "native module `{}` is not registered", import.name)
                }
                ImportKind::Library => write!(f, "library `{}` was not found", import.name),
            },
            Fault::InvalidLibrary { path, reason } => {
                write!(f, "library {} could not be loaded: {reason}", path.display())
            }
            Fault::MissingEntryPoint(entry) => write!(f, "entry point `{entry}` not found"),
            Fault::TypeMismatch { conversion, actual } => {
                write!(f, "{actual} does not support conversion to {conversion}")
            }
            Fault::UnsupportedOperand(operand) => write!(f, "unsupported operand `{operand}`"),
            Fault::UnboundVariable(index) => write!(f, "variable ${index} is not bound"),
            Fault::UnboundLabel(index) => write!(f, "label @{index} is not bound"),
            Fault::UnknownFunction(name) => write!(f, "function `{name}` is not registered"),
            Fault::UnknownNativeFunction(id) => {
                write!(f, "native function #{} is not registered", id.0)
            }
            Fault::UnknownLibrary(index) => write!(f, "library #{index} is not loaded"),
            Fault::KeyNotFound(key) => write!(f, "key `{key}` not found"),
            Fault::InvalidListIndex(index) => write!(f, "invalid list index {index}"),
            Fault::NativeCall { function, error } => write!(f, "`{function}` failed: {error}"),
            Fault::Call(err) => write!(f, "call failed: {err}"),
            Fault::StackOverflow => f.write_str("maximum call depth exceeded"),
        }
    }
}

impl Error for Fault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Fault::Call(inner) => Some(&**inner),
            Fault::NativeCall { error, .. } => Some(AsRef::<dyn Error>::as_ref(&**error)),
            _ => None,
        }
    }
}

/// Where in a program an [`ExecutionError`] occurred.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Location {
    /// The offset of the faulting instruction.
    pub offset: usize,
    /// The source line of the faulting instruction, if known.
    pub line: Option<usize>,
    /// The faulting instruction, rendered as assembly.
    pub instruction: String,
}

impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(line) = self.line {
            write!(f, "line {line}, ")?;
        }
        write!(f, "offset {}: {}", self.offset, self.instruction)
    }
}

/// An error that arises from executing a program.
#[derive(Debug, Clone)]
pub struct ExecutionError {
    fault: Fault,
    location: Option<Location>,
}

impl ExecutionError {
    /// Returns an error for `fault` raised by `instruction` at `offset`.
    #[must_use]
    pub fn new(fault: Fault, offset: usize, instruction: &Instruction) -> Self {
        Self {
            fault,
            location: Some(Location {
                offset,
                line: instruction.line,
                instruction: instruction.to_string(),
            }),
        }
    }

    /// Returns the fault that caused this error.
    #[must_use]
    pub const fn fault(&self) -> &Fault {
        &self.fault
    }

    /// Returns where the fault occurred, if it was raised by an instruction.
    #[must_use]
    pub const fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    /// Returns the innermost fault, looking through failed calls.
    #[must_use]
    pub fn root_fault(&self) -> &Fault {
        match &self.fault {
            Fault::Call(inner) => inner.root_fault(),
            other => other,
        }
    }
}

impl From<Fault> for ExecutionError {
    fn from(fault: Fault) -> Self {
        Self {
            fault,
            location: None,
        }
    }
}

impl ErrorKind for ExecutionError {
    fn kind(&self) -> &'static str {
        self.fault.kind()
    }
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} ({location})", self.fault),
            None => Display::fmt(&self.fault, f),
        }
    }
}

impl Error for ExecutionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.fault.source()
    }
}
