//! Best-effort fan-out over independent targets
//!
//! Runs one upsert per target, in order, without stopping at the first
//! failure. Every target is attempted; the caller gets a report of what was
//! written and a single aggregate error if anything failed. An operation may
//! instead return [`Upsert::Abort`] to stop the whole fan-out immediately,
//! for failures that make the remaining targets pointless.

use std::future::Future;

use tracing::warn;

use crate::error::TargetFailure;
use crate::Error;

/// What an upsert did to a single target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The object did not exist and was created
    Created,
    /// The object existed and was changed
    Updated,
    /// The object already matched; nothing was written
    Unchanged,
}

/// Result of one per-target operation
#[derive(Debug)]
pub enum Upsert {
    /// The target converged
    Done(UpsertOutcome),
    /// The target failed; continue with the rest
    Failed(Error),
    /// Stop the fan-out and return this error as-is
    Abort(Error),
}

/// Per-target outcomes of a completed fan-out
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanOutReport {
    /// `(target, outcome)` for every target that converged
    pub outcomes: Vec<(String, UpsertOutcome)>,
}

impl FanOutReport {
    /// Number of targets that required a write
    pub fn writes(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o != UpsertOutcome::Unchanged)
            .count()
    }
}

/// Upsert every target, collecting failures
///
/// Returns `Err(Error::FanOut)` listing each failed target after all targets
/// were attempted, or the abort error if an operation aborted.
pub async fn upsert_all<'a, T, F, Fut>(
    targets: &'a [T],
    mut op: F,
) -> Result<FanOutReport, Error>
where
    T: AsRef<str>,
    F: FnMut(&'a str) -> Fut,
    Fut: Future<Output = Upsert>,
{
    let mut report = FanOutReport::default();
    let mut failures = Vec::new();

    for target in targets {
        let target = target.as_ref();
        match op(target).await {
            Upsert::Done(outcome) => report.outcomes.push((target.to_string(), outcome)),
            Upsert::Failed(e) => {
                warn!(target, error = %e, "upsert failed, continuing with remaining targets");
                failures.push(TargetFailure {
                    target: target.to_string(),
                    message: e.to_string(),
                });
            }
            Upsert::Abort(e) => return Err(e),
        }
    }

    if failures.is_empty() {
        Ok(report)
    } else {
        Err(Error::FanOut {
            failures,
            total: targets.len(),
        })
    }
}
