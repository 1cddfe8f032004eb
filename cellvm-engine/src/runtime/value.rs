//! The tagged [`Value`] type and its conversion contract.

use std::any::Any;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use crate::runtime::list::List;
use crate::runtime::object::Object;
use crate::vm::linkage::{FunctionRef, NativeFunctionId};
use crate::vm::Fault;

/// A single runtime datum.
///
/// Values are cheap to clone: containers share their backing storage, and
/// objects only refer to their key and value lists by address.
#[derive(Default, Clone, Debug)]
pub enum Value {
    /// An empty value.
    #[default]
    None,
    /// A 32-bit signed integer.
    Integer(i32),
    /// A 64-bit floating point number.
    Number(f64),
    /// A string of text.
    Text(String),
    /// An ordered list of element addresses.
    List(List),
    /// A set of key/value pairs stored as two parallel lists.
    Object(Object),
    /// A function exported by a loaded library.
    Function(FunctionRef),
    /// A host callback.
    NativeFunction(NativeFunctionId),
    /// A value owned by the host.
    Opaque(Opaque),
}

impl Value {
    /// Returns the kind of this value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Value::None => ValueKind::None,
            Value::Integer(_) => ValueKind::Integer,
            Value::Number(_) => ValueKind::Number,
            Value::Text(_) => ValueKind::Text,
            Value::List(_) => ValueKind::List,
            Value::Object(_) => ValueKind::Object,
            Value::Function(_) => ValueKind::Function,
            Value::NativeFunction(_) => ValueKind::NativeFunction,
            Value::Opaque(_) => ValueKind::Opaque,
        }
    }

    /// Returns true if this value is considered empty.
    ///
    /// `None`, empty text and opaque values without a payload are empty.
    /// Every other value is not.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Value::None => true,
            Value::Text(text) => text.is_empty(),
            Value::Opaque(opaque) => opaque.is_empty(),
            Value::Integer(_)
            | Value::Number(_)
            | Value::List(_)
            | Value::Object(_)
            | Value::Function(_)
            | Value::NativeFunction(_) => false,
        }
    }

    /// Returns true if this value is numeric, or is text that parses as a
    /// number.
    #[must_use]
    pub fn is_number(&self) -> bool {
        match self {
            Value::Integer(_) | Value::Number(_) => true,
            Value::Text(text) => parse_number(text).is_some(),
            _ => false,
        }
    }

    /// Returns true if this value is a [`Value::List`].
    #[must_use]
    pub const fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }

    /// Returns true if this value is a [`Value::Object`].
    #[must_use]
    pub const fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Returns true if this value is a [`Value::Function`].
    #[must_use]
    pub const fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    /// Returns true if this value is a [`Value::NativeFunction`].
    #[must_use]
    pub const fn is_native_function(&self) -> bool {
        matches!(self, Value::NativeFunction(_))
    }

    /// Returns true if this value is a [`Value::Opaque`].
    #[must_use]
    pub const fn is_opaque(&self) -> bool {
        matches!(self, Value::Opaque(_))
    }

    /// Converts this value to a boolean.
    ///
    /// Numbers are true when greater than zero. Text is true when it is
    /// `true` or `yes` in any case, or when it parses as a number greater
    /// than zero.
    pub fn to_bool(&self) -> Result<bool, Fault> {
        match self {
            Value::Integer(value) => Ok(*value > 0),
            Value::Number(value) => Ok(*value > 0.),
            Value::Text(text) => {
                let text = text.trim();
                Ok(text.eq_ignore_ascii_case("true")
                    || text.eq_ignore_ascii_case("yes")
                    || parse_number(text).map_or(false, |value| value > 0.))
            }
            _ => Err(self.mismatch(Conversion::Bool)),
        }
    }

    /// Converts this value to a 32-bit integer, truncating fractions.
    pub fn to_integer(&self) -> Result<i32, Fault> {
        match self {
            Value::Integer(value) => Ok(*value),
            #[allow(clippy::cast_possible_truncation)]
            Value::Number(value) => Ok(*value as i32),
            #[allow(clippy::cast_possible_truncation)]
            Value::Text(text) => Ok(parse_number(text).unwrap_or_default() as i32),
            _ => Err(self.mismatch(Conversion::Integer)),
        }
    }

    /// Converts this value to a 64-bit integer, truncating fractions.
    pub fn to_long(&self) -> Result<i64, Fault> {
        match self {
            Value::Integer(value) => Ok(i64::from(*value)),
            #[allow(clippy::cast_possible_truncation)]
            Value::Number(value) => Ok(*value as i64),
            #[allow(clippy::cast_possible_truncation)]
            Value::Text(text) => Ok(parse_number(text).unwrap_or_default() as i64),
            _ => Err(self.mismatch(Conversion::Long)),
        }
    }

    /// Converts this value to a 32-bit float.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_float(&self) -> Result<f32, Fault> {
        self.to_double()
            .map(|value| value as f32)
            .map_err(|_| self.mismatch(Conversion::Float))
    }

    /// Converts this value to a 64-bit float.
    ///
    /// Text that does not parse as a number converts to `0`.
    pub fn to_double(&self) -> Result<f64, Fault> {
        match self {
            Value::Integer(value) => Ok(f64::from(*value)),
            Value::Number(value) => Ok(*value),
            Value::Text(text) => Ok(parse_number(text).unwrap_or_default()),
            _ => Err(self.mismatch(Conversion::Double)),
        }
    }

    /// Converts this value to its text form.
    pub fn to_text(&self) -> Result<String, Fault> {
        match self {
            Value::Integer(value) => Ok(value.to_string()),
            Value::Number(value) => Ok(format_number(*value)),
            Value::Text(text) => Ok(text.clone()),
            _ => Err(self.mismatch(Conversion::Text)),
        }
    }

    /// Returns the size of this value.
    ///
    /// Integers are 4 bytes and numbers are 8. Text reports its character
    /// count and lists their element count.
    pub fn size(&self) -> Result<usize, Fault> {
        match self {
            Value::None => Ok(0),
            Value::Integer(_) => Ok(4),
            Value::Number(_) => Ok(8),
            Value::Text(text) => Ok(text.chars().count()),
            Value::List(list) => Ok(list.len()),
            _ => Err(self.mismatch(Conversion::Size)),
        }
    }

    /// Returns the contained list.
    pub fn as_list(&self) -> Result<&List, Fault> {
        match self {
            Value::List(list) => Ok(list),
            _ => Err(self.mismatch(Conversion::List)),
        }
    }

    /// Returns the contained object.
    pub fn as_object(&self) -> Result<Object, Fault> {
        match self {
            Value::Object(object) => Ok(*object),
            _ => Err(self.mismatch(Conversion::Object)),
        }
    }

    /// Compares two values without considering where they are stored.
    ///
    /// Text compares by content and numeric kinds compare after promotion to
    /// `f64`. Every other pairing is unequal, including a list compared with
    /// itself: containers are only ever equal by address.
    #[must_use]
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Integer(_) | Value::Number(_), Value::Integer(_) | Value::Number(_)) => {
                self.to_double().ok() == other.to_double().ok()
            }
            _ => false,
        }
    }

    fn mismatch(&self, conversion: Conversion) -> Fault {
        Fault::TypeMismatch {
            conversion,
            actual: self.kind(),
        }
    }
}

impl_from!(Value, i32, Integer);
impl_from!(Value, f64, Number);
impl_from!(Value, String, Text);
impl_from!(Value, &'_ str, Text);
impl_from!(Value, List, List);
impl_from!(Value, Object, Object);
impl_from!(Value, FunctionRef, Function);
impl_from!(Value, NativeFunctionId, NativeFunction);
impl_from!(Value, Opaque, Opaque);

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::None
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Number(if value { 1. } else { 0. })
    }
}

/// The kind of a [`Value`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ValueKind {
    /// [`Value::None`]
    None,
    /// [`Value::Integer`]
    Integer,
    /// [`Value::Number`]
    Number,
    /// [`Value::Text`]
    Text,
    /// [`Value::List`]
    List,
    /// [`Value::Object`]
    Object,
    /// [`Value::Function`]
    Function,
    /// [`Value::NativeFunction`]
    NativeFunction,
    /// [`Value::Opaque`]
    Opaque,
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::None => "none",
            ValueKind::Integer => "integer",
            ValueKind::Number => "number",
            ValueKind::Text => "text",
            ValueKind::List => "list",
            ValueKind::Object => "object",
            ValueKind::Function => "function",
            ValueKind::NativeFunction => "native function",
            ValueKind::Opaque => "opaque",
        })
    }
}

/// A conversion requested from a [`Value`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Conversion {
    /// [`Value::to_bool`]
    Bool,
    /// [`Value::to_integer`]
    Integer,
    /// [`Value::to_long`]
    Long,
    /// [`Value::to_float`]
    Float,
    /// [`Value::to_double`]
    Double,
    /// [`Value::to_text`]
    Text,
    /// [`Value::size`]
    Size,
    /// [`Value::as_list`]
    List,
    /// [`Value::as_object`]
    Object,
    /// Invoking the value as a function.
    Function,
}

impl Display for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Conversion::Bool => "bool",
            Conversion::Integer => "integer",
            Conversion::Long => "long",
            Conversion::Float => "float",
            Conversion::Double => "double",
            Conversion::Text => "text",
            Conversion::Size => "size",
            Conversion::List => "list",
            Conversion::Object => "object",
            Conversion::Function => "function",
        })
    }
}

/// A host-owned payload carried through scripts untouched.
///
/// Scripts can only move opaque values around. Hosts recover the payload
/// with [`Opaque::downcast_ref`].
#[derive(Clone, Default)]
pub struct Opaque(Option<Arc<dyn Any + Send + Sync>>);

impl Opaque {
    /// Returns a new opaque value holding `payload`.
    pub fn new<T>(payload: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self(Some(Arc::new(payload)))
    }

    /// Returns an opaque value without a payload.
    #[must_use]
    pub const fn empty() -> Self {
        Self(None)
    }

    /// Returns true if this value has no payload.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Returns the payload if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: Any,
    {
        self.0.as_deref()?.downcast_ref()
    }
}

impl Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Opaque(empty)")
        } else {
            f.write_str("Opaque(..)")
        }
    }
}

/// Parses decimal or exponent notation. Word forms such as `inf` or `NaN`
/// are not numbers.
fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty()
        || !text
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'))
    {
        return None;
    }
    text.parse().ok()
}

fn format_number(value: f64) -> String {
    if value.is_infinite() {
        if value.is_sign_positive() {
            String::from("Infinity")
        } else {
            String::from("-Infinity")
        }
    } else {
        value.to_string()
    }
}
