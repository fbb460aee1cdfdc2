//! Utility modules for filesystem and external tool access.

pub mod command;
pub mod defaults;
pub mod fs;
pub mod git;
pub mod hosting;
pub mod installer;
pub mod keygen;
