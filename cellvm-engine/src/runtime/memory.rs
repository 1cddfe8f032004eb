//! The address-indexed store every script value lives in.

use std::fmt::{self, Display};
use std::num::NonZeroUsize;

use crate::runtime::list::List;
use crate::runtime::object::Object;
use crate::runtime::value::Value;
use crate::vm::Fault;

/// The address of a cell in a [`Memory`] store.
///
/// Address `0` is the null address and can never be constructed. Places that
/// may hold a null address use `Option<Address>`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(NonZeroUsize);

impl Address {
    /// Interprets a raw script integer as an address.
    ///
    /// Returns `None` for `0` and negative values.
    #[must_use]
    pub fn new(raw: i64) -> Option<Self> {
        usize::try_from(raw)
            .ok()
            .and_then(NonZeroUsize::new)
            .map(Self)
    }

    /// Returns the index of this address.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0.get()
    }

    /// Returns this address as the number scripts observe.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_value(self) -> Value {
        Value::Number(self.get() as f64)
    }

    /// Returns this address as a raw register value.
    #[must_use]
    pub fn to_raw(self) -> i64 {
        i64::try_from(self.get()).unwrap_or(i64::MAX)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A monotonically growing store of [`Value`]s.
///
/// Cells are never freed or reused. Reading or writing past the end extends
/// the store with [`Value::None`], so every address handed out remains valid
/// for as long as the store exists.
#[derive(Debug, Clone)]
pub struct Memory {
    cells: Vec<Value>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    /// Returns a new store containing only the reserved null cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: vec![Value::None],
        }
    }

    /// Returns the number of cells in this store, including the null cell.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns true if only the null cell exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.len() <= 1
    }

    /// Stores `value` in a new cell and returns its address.
    ///
    /// The returned address is always the length of the store before the
    /// allocation.
    pub fn alloc(&mut self, value: impl Into<Value>) -> Address {
        // The null cell is always present, so the next index is never 0.
        let address = Address(NonZeroUsize::MIN.saturating_add(self.cells.len() - 1));
        self.cells.push(value.into());
        address
    }

    /// Returns a copy of the value at `address`.
    ///
    /// Reading past the end grows the store up to `address`, so an address
    /// near `usize::MAX` allocates that many cells. Hosts passing raw
    /// addresses from untrusted input must bound them first.
    pub fn read(&mut self, address: Address) -> Value {
        self.ensure(address);
        self.cells[address.get()].clone()
    }

    /// Stores `value` at `address`, growing the store like [`read`](Self::read).
    pub fn write(&mut self, address: Address, value: impl Into<Value>) {
        self.ensure(address);
        self.cells[address.get()] = value.into();
    }

    /// Allocates a new, empty list and returns its address.
    pub fn create_list(&mut self) -> Address {
        self.alloc(List::default())
    }

    /// Allocates a new, empty object and returns its address.
    ///
    /// The key list and the value list are allocated first, followed by the
    /// object itself.
    pub fn create_object(&mut self) -> Address {
        let keys = self.create_list();
        let values = self.create_list();
        self.alloc(Object::new(keys, values))
    }

    /// Returns the list stored at `address`.
    pub fn list(&mut self, address: Address) -> Result<List, Fault> {
        self.read(address).as_list().cloned()
    }

    fn ensure(&mut self, address: Address) {
        if self.cells.len() <= address.get() {
            self.cells.resize_with(address.get() + 1, Value::default);
        }
    }
}
