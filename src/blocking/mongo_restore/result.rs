use crate::error::RestoreError;
use std::fmt;

/// Outcome of restoring one or many intents.
#[derive(Debug, Default)]
pub struct RestoreResult {
    /// documents written.
    pub successes: u64,
    /// documents rejected by the destination.
    pub failures: u64,
    /// fatal error, if any.
    pub err: Option<RestoreError>,
}

impl RestoreResult {
    /// create a result which only carries a fatal error.
    pub fn from_err(err: RestoreError) -> RestoreResult {
        RestoreResult {
            err: Some(err),
            ..Default::default()
        }
    }

    /// Add `other` into this result.
    ///
    /// Counts are added.  A later error replaces an earlier one, but an error which only says
    /// the run was terminated never hides the error which caused the termination.
    pub fn combine(&mut self, other: RestoreResult) {
        self.successes += other.successes;
        self.failures += other.failures;
        if let Some(err) = other.err {
            let keep_current = matches!(&self.err, Some(current) if err.is_terminated() && !current.is_terminated());
            if !keep_current {
                self.err = Some(err);
            }
        }
    }

    /// true if there is no fatal error.
    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }
}

impl fmt::Display for RestoreResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let document = |n: u64| if n == 1 { "document" } else { "documents" };
        write!(
            f,
            "{} {} restored successfully. {} {} failed to restore.",
            self.successes,
            document(self.successes),
            self.failures,
            document(self.failures)
        )
    }
}
