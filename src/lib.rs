//! A register and address based virtual machine for loosely-typed scripts.
#![cfg_attr(all(docsrs, not(doctest)), feature(doc_auto_cfg))]

pub use cellvm_engine::*;
