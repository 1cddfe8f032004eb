//! The program artifact executed by the virtual machine.
//!
//! A [`Program`] is produced by an external compiler, or assembled directly
//! with the builder methods on [`Program`]. Library programs are stored on
//! disk in [`rsn`] form, see [`Program::from_rsn`].

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use super::Register;
use crate::runtime::value::Value;

/// The file extension of compiled library programs.
pub const LIBRARY_EXTENSION: &str = "cvm";

/// The visibility of a declared variable or function.
#[derive(Default, Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Access {
    /// Only visible within its own program.
    #[default]
    Private,
    /// Visible to hosts and to programs importing this one.
    Public,
}

/// A constant value embedded in a program.
#[derive(Default, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    /// No value.
    #[default]
    None,
    /// A number.
    Number(f64),
    /// A string of text.
    Text(String),
}

impl_from!(Literal, f64, Number);
impl_from!(Literal, i32, Number);
impl_from!(Literal, String, Text);
impl_from!(Literal, &'_ str, Text);

impl From<()> for Literal {
    fn from((): ()) -> Self {
        Self::None
    }
}

impl Literal {
    /// Returns this literal as a runtime value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Literal::None => Value::None,
            Literal::Number(value) => Value::Number(*value),
            Literal::Text(text) => Value::Text(text.clone()),
        }
    }
}

impl Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::None => f.write_str("none"),
            Literal::Number(value) => Display::fmt(value, f),
            Literal::Text(text) => write!(f, "{text:?}"),
        }
    }
}

/// An index into a program's label table.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(pub usize);

/// An index into a program's variable table.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variable(pub usize);

/// A raw memory address. Zero and negative addresses are null.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawAddress(pub i64);

/// An instruction argument.
#[derive(Default, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// No argument.
    #[default]
    None,
    /// A constant.
    Literal(Literal),
    /// A label.
    Label(Label),
    /// A register.
    Register(Register),
    /// The memory cell a variable is bound to.
    Variable(Variable),
    /// A memory cell by address.
    RawAddress(RawAddress),
}

impl From<()> for Operand {
    fn from((): ()) -> Self {
        Self::None
    }
}

impl_from!(Operand, Literal, Literal);
impl_from!(Operand, f64, Literal);
impl_from!(Operand, i32, Literal);
impl_from!(Operand, &'_ str, Literal);
impl_from!(Operand, String, Literal);
impl_from!(Operand, Label, Label);
impl_from!(Operand, Register, Register);
impl_from!(Operand, Variable, Variable);
impl_from!(Operand, RawAddress, RawAddress);

impl Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => f.write_str("_"),
            Operand::Literal(literal) => Display::fmt(literal, f),
            Operand::Label(label) => write!(f, "@{}", label.0),
            Operand::Register(register) => write!(f, "#{}", register.0),
            Operand::Variable(variable) => write!(f, "${}", variable.0),
            Operand::RawAddress(address) => write!(f, "[{}]", address.0),
        }
    }
}

/// The operation an [`Instruction`] performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Does nothing.
    Nop,
    /// `dst = src`
    Move,
    /// Binds variable `dst` to the address held by `src`, or to a new cell.
    MakePointer,
    /// `dst = address of variable src`
    LoadAddress,
    /// `dst = integer part of src`
    Truncate,
    /// `dst = src - floor(src)`
    Fraction,
    /// `dst = []`
    NewList,
    /// `list[index] = address`
    SetListSlot,
    /// `dst = address of list`, or of `list[index]`.
    GetListSlotAddress,
    /// `dst = position of text in list`, or -1.
    IndexOf,
    /// `dst = concatenation of list's elements`
    Join,
    /// `dst = number of elements or characters in src`
    Count,
    /// `dst = {}`
    NewObject,
    /// `dst = address of object's key list`
    GetKeysAddress,
    /// `dst = address of object's value list`
    GetValuesAddress,
    /// `dst += src`
    Add,
    /// `dst -= src`
    Sub,
    /// `dst *= src`
    Mul,
    /// `dst /= src`
    Div,
    /// `dst = dst <= 0`
    Not,
    /// `dst &= src`
    And,
    /// `dst |= src`
    Or,
    /// `dst ^= src`
    Xor,
    /// `dst = a == b`
    Equal,
    /// `dst = a > b`
    GreaterThan,
    /// `dst = a < b`
    LessThan,
    /// Marks the position of a label.
    Label,
    /// Continues execution at a label.
    Jump,
    /// Continues execution at a label if the condition is greater than zero.
    JumpIfTrue,
    /// `dst = callee()`
    Call,
    /// Returns a value to the caller.
    Return,
}

impl Opcode {
    /// Returns the assembly mnemonic of this opcode.
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Move => "mov",
            Opcode::MakePointer => "ptr",
            Opcode::LoadAddress => "lea",
            Opcode::Truncate => "trunc",
            Opcode::Fraction => "frac",
            Opcode::NewList => "list",
            Opcode::SetListSlot => "setl",
            Opcode::GetListSlotAddress => "leal",
            Opcode::IndexOf => "idx",
            Opcode::Join => "join",
            Opcode::Count => "cnt",
            Opcode::NewObject => "obj",
            Opcode::GetKeysAddress => "leak",
            Opcode::GetValuesAddress => "leav",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Not => "not",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Equal => "eq",
            Opcode::GreaterThan => "gt",
            Opcode::LessThan => "lt",
            Opcode::Label => "label",
            Opcode::Jump => "jmp",
            Opcode::JumpIfTrue => "jmpt",
            Opcode::Call => "call",
            Opcode::Return => "ret",
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A single operation with up to three operands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// The operation to perform.
    pub opcode: Opcode,
    /// The operation's arguments. Missing operands are [`Operand::None`].
    #[serde(default)]
    pub operands: Vec<Operand>,
    /// The line in the source this instruction was compiled from.
    #[serde(default)]
    pub line: Option<usize>,
}

impl Instruction {
    /// Returns a new instruction.
    #[must_use]
    pub fn new(opcode: Opcode, operands: impl IntoIterator<Item = Operand>) -> Self {
        let mut operands = operands.into_iter().collect::<Vec<_>>();
        while operands.last() == Some(&Operand::None) {
            operands.pop();
        }
        Self {
            opcode,
            operands,
            line: None,
        }
    }

    /// Returns the operand at `index`, or [`Operand::None`] if the
    /// instruction has fewer operands.
    #[must_use]
    pub fn operand(&self, index: usize) -> &Operand {
        const NONE: &Operand = &Operand::None;
        self.operands.get(index).unwrap_or(NONE)
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode.mnemonic())?;
        for (index, operand) in self.operands.iter().enumerate() {
            let separator = if index == 0 { " " } else { ", " };
            write!(f, "{separator}{operand}")?;
        }
        Ok(())
    }
}

/// The kind of an [`Import`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ImportKind {
    /// A set of native functions registered by the host.
    NativeModule,
    /// A compiled library program.
    Library,
}

/// A module or library a program depends on.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Import {
    /// What is being imported.
    pub kind: ImportKind,
    /// The name of the module or library.
    pub name: String,
}

/// A constant bound to a variable index when a program is linked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    /// The variable index the constant is bound to.
    pub index: usize,
    /// The constant's value.
    pub value: Literal,
}

/// A declared variable.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    /// The variable's index.
    pub index: usize,
    /// The variable's name.
    pub name: String,
    /// Who can see the variable.
    pub access: Access,
}

/// A declared function, which is a named label.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// The label index of the function's entry point.
    pub index: usize,
    /// The function's name.
    pub name: String,
    /// Who can call the function by name.
    pub access: Access,
}

/// An executable program.
#[derive(Default, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Program {
    imports: Vec<Import>,
    constants: Vec<Constant>,
    variables: Vec<VariableDefinition>,
    functions: Vec<FunctionDefinition>,
    instructions: Vec<Instruction>,
    #[serde(skip)]
    line: Option<usize>,
}

impl Program {
    /// Returns an empty program.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a program from its [`rsn`] form.
    pub fn from_rsn(source: &str) -> Result<Self, InvalidProgram> {
        rsn::parser::Config::default()
            .deserialize::<Self>(source)
            .map_err(|err| InvalidProgram(err.to_string()))
    }

    /// Encodes this program in its [`rsn`] form.
    #[must_use]
    pub fn to_rsn(&self) -> String {
        rsn::to_string_pretty(self)
    }

    /// Returns the imports of this program.
    #[must_use]
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    /// Returns the constants of this program.
    #[must_use]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    /// Returns the declared variables of this program.
    #[must_use]
    pub fn variables(&self) -> &[VariableDefinition] {
        &self.variables
    }

    /// Returns the declared functions of this program.
    #[must_use]
    pub fn functions(&self) -> &[FunctionDefinition] {
        &self.functions
    }

    /// Returns the instructions of this program.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Imports the host-registered native module `name`.
    pub fn import_native_module(&mut self, name: impl Into<String>) {
        self.imports.push(Import {
            kind: ImportKind::NativeModule,
            name: name.into(),
        });
    }

    /// Imports the library `name`.
    pub fn import_library(&mut self, name: impl Into<String>) {
        self.imports.push(Import {
            kind: ImportKind::Library,
            name: name.into(),
        });
    }

    /// Binds a constant to variable `index`.
    pub fn define_constant(&mut self, index: usize, value: impl Into<Literal>) -> Variable {
        self.constants.push(Constant {
            index,
            value: value.into(),
        });
        Variable(index)
    }

    /// Declares variable `index`.
    pub fn define_variable(
        &mut self,
        index: usize,
        access: Access,
        name: impl Into<String>,
    ) -> Variable {
        self.variables.push(VariableDefinition {
            index,
            name: name.into(),
            access,
        });
        Variable(index)
    }

    /// Declares a function whose entry point is label `index`.
    ///
    /// The entry point must be marked with [`label`](Self::label).
    pub fn define_function(&mut self, index: usize, access: Access, name: impl Into<String>) -> Label {
        self.functions.push(FunctionDefinition {
            index,
            name: name.into(),
            access,
        });
        Label(index)
    }

    /// Sets the source line recorded for instructions pushed after this call.
    pub fn set_source_line(&mut self, line: Option<usize>) {
        self.line = line;
    }

    /// Pushes an instruction.
    pub fn push(&mut self, mut instruction: Instruction) {
        if instruction.line.is_none() {
            instruction.line = self.line;
        }
        self.instructions.push(instruction);
    }

    fn op<const N: usize>(&mut self, opcode: Opcode, operands: [Operand; N]) {
        self.push(Instruction::new(opcode, operands));
    }

    /// Pushes [`Opcode::Move`].
    pub fn mov(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.op(Opcode::Move, [dst.into(), src.into()]);
    }

    /// Pushes [`Opcode::MakePointer`]. Passing `()` as `src` binds `dst` to a
    /// new cell.
    pub fn make_pointer(&mut self, dst: Variable, src: impl Into<Operand>) {
        self.op(Opcode::MakePointer, [dst.into(), src.into()]);
    }

    /// Pushes [`Opcode::LoadAddress`].
    pub fn load_address(&mut self, dst: impl Into<Operand>, src: Variable) {
        self.op(Opcode::LoadAddress, [dst.into(), src.into()]);
    }

    /// Pushes [`Opcode::Truncate`].
    pub fn truncate(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.op(Opcode::Truncate, [dst.into(), src.into()]);
    }

    /// Pushes [`Opcode::Fraction`].
    pub fn fraction(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.op(Opcode::Fraction, [dst.into(), src.into()]);
    }

    /// Pushes [`Opcode::NewList`].
    pub fn new_list(&mut self, dst: impl Into<Operand>) {
        self.op(Opcode::NewList, [dst.into()]);
    }

    /// Pushes [`Opcode::SetListSlot`].
    pub fn set_list_slot(
        &mut self,
        list: impl Into<Operand>,
        index: impl Into<Operand>,
        address: impl Into<Operand>,
    ) {
        self.op(
            Opcode::SetListSlot,
            [list.into(), index.into(), address.into()],
        );
    }

    /// Pushes [`Opcode::GetListSlotAddress`]. Passing `()` as `index` loads
    /// the address of the list itself.
    pub fn list_slot_address(
        &mut self,
        dst: impl Into<Operand>,
        list: impl Into<Operand>,
        index: impl Into<Operand>,
    ) {
        self.op(
            Opcode::GetListSlotAddress,
            [dst.into(), list.into(), index.into()],
        );
    }

    /// Pushes [`Opcode::IndexOf`].
    pub fn index_of(
        &mut self,
        dst: impl Into<Operand>,
        list: impl Into<Operand>,
        text: impl Into<Operand>,
    ) {
        self.op(Opcode::IndexOf, [dst.into(), list.into(), text.into()]);
    }

    /// Pushes [`Opcode::Join`].
    pub fn join(&mut self, dst: impl Into<Operand>, list: impl Into<Operand>) {
        self.op(Opcode::Join, [dst.into(), list.into()]);
    }

    /// Pushes [`Opcode::Count`].
    pub fn count(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.op(Opcode::Count, [dst.into(), src.into()]);
    }

    /// Pushes [`Opcode::NewObject`].
    pub fn new_object(&mut self, dst: impl Into<Operand>) {
        self.op(Opcode::NewObject, [dst.into()]);
    }

    /// Pushes [`Opcode::GetKeysAddress`].
    pub fn keys_address(&mut self, dst: impl Into<Operand>, object: impl Into<Operand>) {
        self.op(Opcode::GetKeysAddress, [dst.into(), object.into()]);
    }

    /// Pushes [`Opcode::GetValuesAddress`].
    pub fn values_address(&mut self, dst: impl Into<Operand>, object: impl Into<Operand>) {
        self.op(Opcode::GetValuesAddress, [dst.into(), object.into()]);
    }

    /// Pushes an arithmetic or bitwise instruction that updates `dst` in
    /// place.
    pub fn update(&mut self, opcode: Opcode, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.op(opcode, [dst.into(), src.into()]);
    }

    /// Pushes [`Opcode::Add`].
    pub fn add(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) {
        self.update(Opcode::Add, dst, src);
    }

    /// Pushes [`Opcode::Not`].
    pub fn not(&mut self, dst: impl Into<Operand>) {
        self.op(Opcode::Not, [dst.into()]);
    }

    /// Pushes a comparison instruction storing `1` or `0` in `dst`.
    pub fn compare(
        &mut self,
        opcode: Opcode,
        dst: impl Into<Operand>,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) {
        self.op(opcode, [dst.into(), lhs.into(), rhs.into()]);
    }

    /// Marks the current position as `label`.
    pub fn label(&mut self, label: Label) {
        self.op(Opcode::Label, [label.into()]);
    }

    /// Pushes [`Opcode::Jump`].
    pub fn jump(&mut self, target: Label) {
        self.op(Opcode::Jump, [target.into()]);
    }

    /// Pushes [`Opcode::JumpIfTrue`].
    pub fn jump_if(&mut self, condition: impl Into<Operand>, target: Label) {
        self.op(Opcode::JumpIfTrue, [condition.into(), target.into()]);
    }

    /// Pushes [`Opcode::Call`]. `callee` is either a [`Label`] in this
    /// program or an operand resolving to a function name.
    pub fn call(&mut self, dst: impl Into<Operand>, callee: impl Into<Operand>) {
        self.op(Opcode::Call, [dst.into(), callee.into()]);
    }

    /// Pushes [`Opcode::Return`].
    pub fn ret(&mut self, value: impl Into<Operand>) {
        self.op(Opcode::Return, [value.into()]);
    }
}

/// A program could not be decoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidProgram(pub String);

impl Display for InvalidProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid program: {}", self.0)
    }
}

impl std::error::Error for InvalidProgram {}
