//! Scheduled billing maintenance jobs.
//!
//! Each job logs its own failures and returns; a failed run is retried by
//! the next tick.

use finplan_billing::{InvariantChecker, ViolationSeverity, WebhookEventStore};
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Upper bound on dead letters listed per report
const DEAD_LETTER_REPORT_LIMIT: i64 = 50;

/// Run every invariant check and log the violations found
pub async fn run_invariant_checks(checker: &InvariantChecker) {
    let summary = match checker.run_all_checks().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Failed to run billing invariant checks");
            return;
        }
    };

    if summary.healthy {
        info!(checks_run = summary.checks_run, "Billing invariants hold");
        return;
    }

    for violation in &summary.violations {
        let context = serde_json::to_string(&violation.context).unwrap_or_default();
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                users = violation.user_ids.len(),
                context = %context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                users = violation.user_ids.len(),
                context = %context,
                "{}",
                violation.description
            ),
        }
    }

    error!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant violations detected"
    );
}

/// Log dead-lettered webhook deliveries awaiting manual review.
/// Returns how many were listed.
pub async fn report_dead_letters(store: &dyn WebhookEventStore) -> usize {
    let records = match store.list_dead_letters(DEAD_LETTER_REPORT_LIMIT).await {
        Ok(records) => records,
        Err(e) => {
            error!(error = %e, "Failed to list dead-lettered webhooks");
            return 0;
        }
    };

    let now = OffsetDateTime::now_utc();
    for record in &records {
        warn!(
            stripe_event_id = %record.stripe_event_id,
            event_type = %record.event_type,
            attempts = record.attempts,
            age_hours = (now - record.created_at).whole_hours(),
            last_error = record.last_error.as_deref().unwrap_or(""),
            "Webhook event is dead-lettered"
        );
    }

    if !records.is_empty() {
        warn!(count = records.len(), "Dead-lettered webhooks need review");
    }

    records.len()
}

/// Log deliveries left in `processing` past the reclaim window. They are
/// picked up again only if Stripe redelivers them. Returns how many were
/// listed.
pub async fn report_stuck_deliveries(store: &dyn WebhookEventStore) -> usize {
    let records = match store.list_stuck_processing(DEAD_LETTER_REPORT_LIMIT).await {
        Ok(records) => records,
        Err(e) => {
            error!(error = %e, "Failed to list stuck webhook deliveries");
            return 0;
        }
    };

    let now = OffsetDateTime::now_utc();
    for record in &records {
        error!(
            stripe_event_id = %record.stripe_event_id,
            event_type = %record.event_type,
            attempts = record.attempts,
            idle_minutes = record
                .last_attempt_at
                .map(|at| (now - at).whole_minutes())
                .unwrap_or_default(),
            "Webhook event stuck in processing"
        );
    }

    records.len()
}

/// Delete finished webhook records older than the retention window.
/// Dead letters are kept. Returns the number of rows removed.
pub async fn purge_webhook_events(store: &dyn WebhookEventStore, retention_days: i32) -> u64 {
    match store.purge_webhook_events(retention_days).await {
        Ok(deleted) => {
            if deleted > 0 {
                info!(
                    deleted = deleted,
                    retention_days = retention_days,
                    "Cleaned up old webhook records"
                );
            }
            deleted
        }
        Err(e) => {
            error!(error = %e, "Failed to clean up old webhook records");
            0
        }
    }
}
