//! # mbridge Kernel
//!
//! The root of a process run. [`Application`] resolves the home directory and
//! settings, builds every component with its collaborators and drives them
//! through the [`KernelComponent`] lifecycle: initialize and start in
//! construction order, stop in reverse.
//!
//! - [`bootstrap`]: [`Application`], [`ApplicationOptions`] and [`ExitReason`].
//! - [`component`]: the [`KernelComponent`] trait.
//! - [`constants`]: names, paths, ports and timing defaults.
//! - [`error`]: the aggregated [`Error`] and the [`Result`] alias.
pub mod bootstrap;
pub mod component;
pub mod constants;
pub mod error;

pub use bootstrap::{Application, ApplicationOptions, ExitReason};
pub use component::KernelComponent;
pub use error::{Error, Result};

#[cfg(test)]
mod tests;
