//! Value types shared by the whole workspace: the [`Footprint`] grid
//! geometry, the process-wide [`env`] option stack, the channels schema and
//! the typed error kinds.
//!
//! Everything in this crate is plain data: no I/O, no threads. The heavy
//! machinery lives in `rasterloom_engine`; the user entry points live in the
//! `rasterloom` facade crate.

pub mod env;
pub mod errors;
pub mod types;

pub use errors::Error;
pub use types::*;
