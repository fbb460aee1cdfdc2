//! Data structures.

pub mod settings;
