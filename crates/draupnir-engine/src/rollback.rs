//! Ordered compensation for multi-step operations

use draupnir_common::Result;
use futures::future::BoxFuture;
use tracing::{debug, error};

type Compensation<'a> = (&'static str, BoxFuture<'a, Result<()>>);

/// Undo log for an operation that acquires resources one step at a time.
///
/// Each step that succeeds registers how to undo itself. On failure the log is
/// unwound newest-first. Unwinding stops at the first compensation that fails,
/// since later ones may depend on it having happened.
#[derive(Default)]
pub struct Rollback<'a> {
    steps: Vec<Compensation<'a>>,
}

impl<'a> Rollback<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push(&mut self, step: &'static str, undo: BoxFuture<'a, Result<()>>) {
        self.steps.push((step, undo));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The operation succeeded; nothing gets undone.
    pub fn commit(self) {
        debug!(steps = self.steps.len(), "committed");
    }

    /// Run compensations in reverse order of registration.
    pub async fn unwind(mut self) -> Result<()> {
        while let Some((step, undo)) = self.steps.pop() {
            if let Err(e) = undo.await {
                error!(step, error = %e, remaining = self.steps.len(), "compensation failed");
                return Err(e);
            }
            debug!(step, "compensated");
        }
        Ok(())
    }
}
