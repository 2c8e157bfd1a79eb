//! Admission control over the usage ledger.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::ledger::UsageLedger;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The governed call may proceed now.
    Admitted,
    /// Over budget. Retry after `wait` (rounded up to whole seconds).
    Rejected { wait: Duration },
}

/// Decides whether a governed call may proceed right now.
///
/// Admission never consumes budget: the ledger is written only after the
/// guarded call actually executes, so an admitted call that fails before
/// contacting the tool costs nothing.
///
/// The configured limit should sit below the upstream provider's hard cap.
/// The headroom absorbs calls made outside this process (the default config
/// uses 950 against an upstream cap of 1000).
pub struct AdmissionController {
    ledger: Arc<UsageLedger>,
    limit: u64,
}

impl AdmissionController {
    pub fn new(ledger: Arc<UsageLedger>, limit: u64) -> Self {
        Self { ledger, limit }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Check the trailing window against the configured limit.
    pub async fn try_admit(&self) -> Result<Admission> {
        let window = self.ledger.window();
        let count = self.ledger.count_in_window(window).await?;
        if count < self.limit {
            return Ok(Admission::Admitted);
        }

        let wait = self.ledger.time_until_slot_free().await?;
        // Round up to whole seconds; a zero wait would invite a hot retry loop.
        let secs = (wait.as_secs_f64().ceil() as u64).max(1);
        tracing::debug!(count, limit = self.limit, wait_s = secs, "admission rejected");
        Ok(Admission::Rejected {
            wait: Duration::from_secs(secs),
        })
    }
}
