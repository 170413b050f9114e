//! Runner executing batch units against registered mappers.

pub mod config;
pub mod erased;
#[allow(clippy::module_inception)]
pub mod runner;

pub use config::RunnerConfig;
pub use erased::{ErasedMapper, UnitError};
pub use runner::{Runner, RunnerBuilder};
