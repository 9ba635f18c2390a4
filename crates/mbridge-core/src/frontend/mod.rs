//! # mbridge Frontend
//!
//! Presentation layers observe the core only through the bus: they listen
//! for lifecycle events on the frontend channel and re-query whatever state
//! they display. [`ConsoleFrontend`] renders those changes to the log.
pub mod console;

use std::fmt::Debug;

use async_trait::async_trait;

use crate::kernel::error::Result;

pub use console::ConsoleFrontend;

/// A presentation layer started and stopped by the orchestrator
#[async_trait]
pub trait Frontend: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<()>;

    /// Must be safe to call more than once
    async fn stop(&self) -> Result<()>;
}

#[cfg(test)]
mod tests;
