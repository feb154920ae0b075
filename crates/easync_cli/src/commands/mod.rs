//! CLI command implementations.

pub mod delete;
pub mod devices;
pub mod inspect;
pub mod reset;
pub mod wipe;
