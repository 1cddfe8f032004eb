//! Index-addressed variable and label tables.

use crate::runtime::memory::Address;
use crate::vm::bitcode::Access;

/// A named entry in a [`Table`].
pub trait Symbol {
    /// Returns the name of this entry.
    fn name(&self) -> &str;
    /// Returns the visibility of this entry.
    fn access(&self) -> Access;
}

/// A variable binding to a memory cell.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VariableEntry {
    /// The variable's name. Anonymous variables have an empty name.
    pub name: String,
    /// The visibility of this variable.
    pub access: Access,
    /// The cell this variable is bound to, or `None` for a null binding.
    pub address: Option<Address>,
}

impl VariableEntry {
    /// Returns an anonymous, private variable bound to `address`.
    #[must_use]
    pub const fn anonymous(address: Option<Address>) -> Self {
        Self {
            name: String::new(),
            access: Access::Private,
            address,
        }
    }
}

impl Symbol for VariableEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn access(&self) -> Access {
        self.access
    }
}

/// A label binding to a code offset.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LabelEntry {
    /// The label's name. Jump targets have an empty name.
    pub name: String,
    /// The visibility of this label.
    pub access: Access,
    /// The offset of the label's marker, once it has been found.
    pub offset: Option<usize>,
}

impl Symbol for LabelEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn access(&self) -> Access {
        self.access
    }
}

/// An auto-extending table of optional entries.
///
/// Unset indices read as `None`. Setting an index past the end grows the
/// table with unset entries.
#[derive(Clone, Debug)]
pub struct Table<T>(Vec<Option<T>>);

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> Table<T> {
    /// Returns the entry at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.0.get(index).and_then(Option::as_ref)
    }

    /// Returns the entry at `index` for modification.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.0.get_mut(index).and_then(Option::as_mut)
    }

    /// Stores `entry` at `index`, returning the previous entry.
    pub fn set(&mut self, index: usize, entry: T) -> Option<T> {
        if self.0.len() <= index {
            self.0.resize_with(index + 1, || None);
        }
        self.0[index].replace(entry)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Returns the number of indices, set or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no index has ever been set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the set entries with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.as_ref().map(|entry| (index, entry)))
    }
}

impl<T> Table<T>
where
    T: Symbol,
{
    /// Returns the index of the first public entry named `name`.
    #[must_use]
    pub fn resolve_public(&self, name: &str) -> Option<usize> {
        self.iter()
            .find(|(_, entry)| entry.access() == Access::Public && entry.name() == name)
            .map(|(index, _)| index)
    }
}

/// The variables of a running program.
pub type Variables = Table<VariableEntry>;

/// The labels of a running program.
pub type Labels = Table<LabelEntry>;

/// The tables owned by one interpreter.
///
/// Nested interpreters for library calls get their own scope, so a callee
/// can never observe or modify its caller's bindings.
#[derive(Default, Clone, Debug)]
pub struct Scope {
    /// The variable table.
    pub variables: Variables,
    /// The label table.
    pub labels: Labels,
}

impl Scope {
    /// Removes every variable and label.
    pub fn clear(&mut self) {
        self.variables.clear();
        self.labels.clear();
    }
}
