//! Types that are used within the cellvm runtime.
//!
//! [`Value`](value::Value) is the tagged datum every instruction operates on.
//! Values live in the [`Memory`](memory::Memory) store, and containers refer
//! to other cells by [`Address`](memory::Address).

pub mod list;
pub mod memory;
pub mod object;
pub mod value;
