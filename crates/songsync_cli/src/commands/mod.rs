//! CLI command implementations.

pub mod apply;
pub mod diff;
pub mod inspect;
pub mod reset;
