//! Scheduled maintenance jobs

use repurpose_credits::{CreditEngine, CreditResult, ResetSweep};
use tracing::{error, info, warn};

/// Plans refreshed per query
const RESET_BATCH_SIZE: i64 = 500;
/// Upper bound on batches per run so one slow run cannot overlap the next
const MAX_RESET_BATCHES: usize = 100;

/// Deactivate codes whose expiry has passed
pub async fn expire_codes(engine: &CreditEngine) {
    match engine.codes.sweep_expired().await {
        Ok(expired) => info!(deactivated = expired.len(), "Expired code sweep complete"),
        Err(e) => error!(error = %e, "Expired code sweep failed"),
    }
}

/// Apply overdue monthly resets batch by batch until none are left
pub async fn refresh_credits(engine: &CreditEngine) {
    match drain_resets(engine).await {
        Ok(total) => info!(
            examined = total.examined,
            reset = total.reset,
            failed = total.failed,
            "Credit refresh complete"
        ),
        Err(e) => error!(error = %e, "Credit refresh failed"),
    }
}

async fn drain_resets(engine: &CreditEngine) -> CreditResult<ResetSweep> {
    let mut total = ResetSweep::default();
    for _ in 0..MAX_RESET_BATCHES {
        let sweep = engine.ledger.reset_all_due(RESET_BATCH_SIZE).await?;
        total.examined += sweep.examined;
        total.reset += sweep.reset;
        total.failed += sweep.failed;

        // Failed rows stay due; stop rather than spin on them
        if sweep.examined < RESET_BATCH_SIZE as usize || sweep.reset == 0 {
            return Ok(total);
        }
    }
    warn!(batches = MAX_RESET_BATCHES, "Credit refresh stopped with resets still due");
    Ok(total)
}

/// Run every reconciliation check and log what it finds
pub async fn check_invariants(engine: &CreditEngine) {
    let summary = match engine.invariant_checker().run_all_checks().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Invariant check failed to run");
            return;
        }
    };

    if summary.healthy {
        info!(checks = summary.checks_run, "Invariant check passed");
        return;
    }

    for violation in &summary.violations {
        error!(
            invariant = violation.invariant.as_str(),
            severity = %violation.severity,
            subjects = ?violation.subjects,
            description = %violation.description,
            "Invariant violation"
        );
    }
    warn!(
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Invariant check found violations"
    );
}
