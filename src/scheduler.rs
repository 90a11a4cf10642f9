//! Scheduling hooks.
//!
//! The store does not run its own periodic loop; it registers task
//! generators with an external [`Scheduler`]. Each tick the scheduler asks a
//! generator for its next task and runs it. Generators yield one unit of
//! work at a time (one repo to collect, one digest group to dedupe) so a
//! cancelled scheduler leaves the store valid between tasks.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Priority hint for submitted generators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

/// One unit of background work.
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self) -> Result<()>;

    /// Short label for logs.
    fn name(&self) -> &str;
}

/// Produces tasks one at a time.
///
/// `next_task` returns `None` when the current sweep is exhausted; the
/// generator then resets so the scheduler's next interval starts a fresh
/// sweep.
#[async_trait]
pub trait TaskGenerator: Send + Sync {
    async fn next_task(&mut self) -> Result<Option<Box<dyn Task>>>;
}

/// The interface an external scheduler exposes to the store.
pub trait Scheduler: Send + Sync {
    fn submit_generator(
        &self,
        generator: Box<dyn TaskGenerator>,
        interval: Duration,
        priority: TaskPriority,
    );
}
