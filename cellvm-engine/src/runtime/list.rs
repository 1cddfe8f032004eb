//! Types used for lists.

use std::fmt::{self, Debug};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::runtime::memory::{Address, Memory};
use crate::runtime::value::Value;
use crate::vm::Fault;

/// An ordered list of [`Memory`] addresses.
///
/// Elements are stored by address; reading an element dereferences its slot
/// through the memory store. A slot may hold the null address, which reads
/// as [`Value::None`].
///
/// Cloning a list produces another handle to the same slots.
#[derive(Clone, Default)]
pub struct List(Arc<Mutex<Vec<Option<Address>>>>);

impl List {
    /// Returns an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of slots in this list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Returns true if this list has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Pushes `address` to the end of the list.
    pub fn push(&self, address: Option<Address>) {
        self.0.lock().push(address);
    }

    /// Returns the address stored in the slot at `index`.
    ///
    /// Returns `None` if the slot is null or out of bounds.
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<Address> {
        self.0.lock().get(index).copied().flatten()
    }

    /// Stores `address` in the slot at `index`.
    ///
    /// Storing an address past the end extends the list with null slots.
    /// Storing the null address clears the slot, and is ignored for slots
    /// that do not exist.
    pub fn set_slot(&self, index: usize, address: Option<Address>) {
        let mut slots = self.0.lock();
        if address.is_some() && slots.len() <= index {
            slots.resize(index + 1, None);
        }
        if let Some(slot) = slots.get_mut(index) {
            *slot = address;
        }
    }

    /// Returns a snapshot of this list's slots.
    #[must_use]
    pub fn slots(&self) -> Vec<Option<Address>> {
        self.0.lock().clone()
    }

    /// Returns the value of the element at `index`.
    pub fn get(&self, index: usize, memory: &mut Memory) -> Value {
        self.slot(index)
            .map_or(Value::None, |address| memory.read(address))
    }

    /// Returns the values of every element in order.
    pub fn values(&self, memory: &mut Memory) -> Vec<Value> {
        self.slots()
            .into_iter()
            .map(|slot| slot.map_or(Value::None, |address| memory.read(address)))
            .collect()
    }

    /// Returns the index of the first element whose text form is `text`.
    ///
    /// Elements without a text form are skipped.
    pub fn index_of(&self, text: &str, memory: &mut Memory) -> Option<usize> {
        self.values(memory)
            .iter()
            .position(|value| value.to_text().map_or(false, |value| value == text))
    }

    /// Concatenates the text form of every element in order.
    ///
    /// Null slots are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Fault::TypeMismatch`] if an element has no text form.
    pub fn join(&self, memory: &mut Memory) -> Result<String, Fault> {
        let mut joined = String::new();
        for address in self.slots().into_iter().flatten() {
            joined.push_str(&memory.read(address).to_text()?);
        }
        Ok(joined)
    }

    /// Allocates each value in `memory` and returns a list of their
    /// addresses.
    pub fn allocate<I>(values: I, memory: &mut Memory) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        values
            .into_iter()
            .map(|value| Some(memory.alloc(value)))
            .collect()
    }
}

impl Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.lock().iter()).finish()
    }
}

impl From<Vec<Option<Address>>> for List {
    fn from(slots: Vec<Option<Address>>) -> Self {
        Self(Arc::new(Mutex::new(slots)))
    }
}

impl FromIterator<Option<Address>> for List {
    fn from_iter<T: IntoIterator<Item = Option<Address>>>(iter: T) -> Self {
        Self::from(Vec::from_iter(iter))
    }
}
