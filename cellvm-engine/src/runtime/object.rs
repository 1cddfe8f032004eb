//! Objects stored as parallel key and value lists.

use crate::runtime::list::List;
use crate::runtime::memory::{Address, Memory};
use crate::runtime::value::Value;
use crate::vm::Fault;

/// A set of key/value pairs backed by two lists in [`Memory`].
///
/// `keys[i]` names `values[i]`. Keys are compared by their text form, and
/// lookups return the first matching entry. Nothing prevents the same key
/// from being inserted twice.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Object {
    keys: Address,
    values: Address,
}

impl Object {
    /// Returns an object whose key list is stored at `keys` and whose value
    /// list is stored at `values`.
    #[must_use]
    pub const fn new(keys: Address, values: Address) -> Self {
        Self { keys, values }
    }

    /// Returns the address of the key list.
    #[must_use]
    pub const fn keys_address(&self) -> Address {
        self.keys
    }

    /// Returns the address of the value list.
    #[must_use]
    pub const fn values_address(&self) -> Address {
        self.values
    }

    /// Returns the number of entries in this object.
    pub fn len(&self, memory: &mut Memory) -> Result<usize, Fault> {
        Ok(memory.list(self.keys)?.len())
    }

    /// Returns the value stored for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Fault::KeyNotFound`] if no entry has the key.
    pub fn get(&self, key: &str, memory: &mut Memory) -> Result<Value, Fault> {
        let (index, values) = self.find(key, memory)?;
        Ok(values.get(index, memory))
    }

    /// Returns true if an entry has `key`.
    pub fn contains_key(&self, key: &str, memory: &mut Memory) -> Result<bool, Fault> {
        match self.find(key, memory) {
            Ok(_) => Ok(true),
            Err(Fault::KeyNotFound(_)) => Ok(false),
            Err(other) => Err(other),
        }
    }

    /// Replaces the value of the first entry with `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Fault::KeyNotFound`] if no entry has the key. Use
    /// [`insert`](Self::insert) to add new entries.
    pub fn set(&self, key: &str, value: impl Into<Value>, memory: &mut Memory) -> Result<(), Fault> {
        let (index, values) = self.find(key, memory)?;
        let value = value.into();
        match values.slot(index) {
            Some(address) => memory.write(address, value),
            None => values.set_slot(index, Some(memory.alloc(value))),
        }
        Ok(())
    }

    /// Appends a new entry without checking for an existing key.
    pub fn insert(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
        memory: &mut Memory,
    ) -> Result<(), Fault> {
        let keys = memory.list(self.keys)?;
        let values = memory.list(self.values)?;
        let index = keys.len();
        keys.set_slot(index, Some(memory.alloc(key.into())));
        values.set_slot(index, Some(memory.alloc(value)));
        Ok(())
    }

    fn find(&self, key: &str, memory: &mut Memory) -> Result<(usize, List), Fault> {
        let keys = memory.list(self.keys)?;
        let values = memory.list(self.values)?;
        keys.index_of(key, memory)
            .map(|index| (index, values))
            .ok_or_else(|| Fault::KeyNotFound(key.to_string()))
    }
}
