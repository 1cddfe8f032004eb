//! A register and address based virtual machine for loosely-typed scripts.
//!
//! Programs are linear instruction streams produced by an external compiler.
//! They are linked against host-registered native functions and separately
//! compiled libraries, then executed against a monotonically growing
//! [`Memory`](runtime::memory::Memory) store of tagged
//! [`Value`](runtime::value::Value)s.

macro_rules! impl_from {
    ($on:ty, $from:ty, $variant:ident) => {
        impl From<$from> for $on {
            fn from(value: $from) -> Self {
                Self::$variant(value.into())
            }
        }
    };
}

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

pub mod runtime;
pub mod vm;

#[cfg(test)]
mod tests;

/// Summarizes an error's kind.
pub trait ErrorKind {
    /// Returns the summary of the error being raised.
    fn kind(&self) -> &'static str;
}
