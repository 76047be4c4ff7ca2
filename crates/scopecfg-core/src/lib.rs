//! Core types and trait definitions for the scopecfg configuration engine.
//!
//! This crate is deliberately free of database and runtime dependencies.
//! It defines the key registry and value record model, write-time type
//! validation, the storage trait, and the precedence resolver.

pub mod clock;
pub mod error;
pub mod key;
pub mod record;
pub mod resolve;
pub mod scope;
pub mod store;
pub mod value;

pub use error::{Error, ImportProblem, ItemProblem, Result};
