//! Default back-office task profiles.

use super::NewTask;

fn profile(code: &str, name: &str, cron_expression: &str, description: &str) -> NewTask {
    NewTask {
        code: code.to_string(),
        name: name.to_string(),
        description: Some(description.to_string()),
        cron_expression: cron_expression.to_string(),
        timezone: "Asia/Jakarta".to_string(),
        workflow_id: None,
        webhook_url: None,
        is_active: false,
    }
}

/// Return the default out-of-box tasks. They start disabled until an
/// operator binds a workflow webhook.
pub fn defaults() -> Vec<NewTask> {
    vec![
        profile(
            "nightly-billing",
            "Nightly billing run",
            "0 2 * * *", // 2am daily
            "Issue invoices for job orders closed during the day",
        ),
        profile(
            "invoice-aging-report",
            "Invoice aging report",
            "0 6 * * 1-5", // 6am weekdays
            "Rebuild receivable aging buckets",
        ),
        profile(
            "customs-fee-sync",
            "Customs fee sync",
            "*/30 * * * *", // every 30 minutes
            "Pull customs duty and fee updates",
        ),
        profile(
            "hse-document-expiry",
            "HSE document expiry check",
            "0 7 * * *", // 7am daily
            "Flag safety documents expiring within 30 days",
        ),
        profile(
            "notification-digest",
            "Weekly notification digest",
            "0 8 * * 1", // 8am Monday
            "Send the weekly operator digest",
        ),
    ]
}
