//! Sequencing of operation steps.
//!
//! Every public operation is a fixed list of named steps run one after the
//! other. Each step sees the results of the steps before it (as ordinary
//! typed locals in the calling operation) and the first failure aborts the
//! rest of the operation.

use crate::errors::Result;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Instant;
use tracing::{debug, Instrument};

/// Per-operation context handed to every step.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub op: &'static str,
    /// Compute everything, persist nothing.
    pub dry_run: bool,
    /// Return rendered files to the caller.
    pub file_contents: bool,
    /// Timestamp written into generated file headers.
    pub generated_at: DateTime<Utc>,
    /// Suffix used for temporary files written by this operation.
    pub token: String,
}

impl OpContext {
    pub fn new(op: &'static str) -> Self {
        Self {
            op,
            dry_run: false,
            file_contents: false,
            generated_at: Utc::now(),
            token: crate::core::generate_version(),
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn file_contents(mut self, file_contents: bool) -> Self {
        self.file_contents = file_contents;
        self
    }
}

/// Runs named steps in order, tracing each one.
#[derive(Debug)]
pub struct Pipeline {
    op: &'static str,
    completed: Vec<&'static str>,
}

impl Pipeline {
    pub fn new(ctx: &OpContext) -> Self {
        Self {
            op: ctx.op,
            completed: Vec::new(),
        }
    }

    /// Awaits one asynchronous step.
    pub async fn step<T, F>(&mut self, name: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let span = tracing::debug_span!("step", op = self.op, step = name);
        let result = fut.instrument(span).await;
        self.finish(name, start, result)
    }

    /// Runs one synchronous step.
    pub fn sync_step<T>(&mut self, name: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let start = Instant::now();
        let result = tracing::debug_span!("step", op = self.op, step = name).in_scope(f);
        self.finish(name, start, result)
    }

    /// Names of the steps that completed successfully, in order.
    pub fn completed(&self) -> &[&'static str] {
        &self.completed
    }

    fn finish<T>(&mut self, name: &'static str, start: Instant, result: Result<T>) -> Result<T> {
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => {
                debug!(op = self.op, step = name, elapsed_ms, "Step complete");
                self.completed.push(name);
            }
            Err(e) => {
                debug!(op = self.op, step = name, elapsed_ms, error = %e, "Step failed, aborting");
            }
        }
        result
    }
}
