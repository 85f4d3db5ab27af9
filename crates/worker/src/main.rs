//! EduBill Background Worker
//!
//! Handles scheduled jobs including:
//! - Billing sweep: renewals, trial conversions, non-renewing cancels (daily)
//! - Retry sweep for PAST_DUE subscriptions (hourly)
//! - Grace sweep: suspension and expiry (hourly)
//! - Stale PENDING payment alerts (every 15 minutes)
//! - Failed webhook replay (every minute) and audit log cleanup (daily)
//! - Billing invariant checks (daily)

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use edubill_billing::{
    BillingResult, BillingService, InvariantChecker, ReplayReport, SweepReport,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_WEBHOOK_RETENTION_DAYS: i64 = 90;

/// Cron expression from `var`, falling back to `default`
fn cron(var: &str, default: &str) -> String {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Log a sweep result; errors are logged and swallowed so the job keeps its schedule
fn log_sweep(name: &str, result: BillingResult<SweepReport>) {
    match result {
        Ok(report) => info!(
            sweep = name,
            examined = report.examined,
            charged = report.charged,
            failed = report.failed,
            processing = report.processing,
            canceled = report.canceled,
            suspended = report.suspended,
            expired = report.expired,
            pending = report.pending,
            alerted = report.alerted,
            errors = report.errors,
            "Sweep complete"
        ),
        Err(e) => error!(sweep = name, error = %e, "Sweep failed"),
    }
}

fn log_replay(result: BillingResult<ReplayReport>) {
    match result {
        Ok(report) if report.examined == 0 => {}
        Ok(report) => info!(
            examined = report.examined,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Webhook replay complete"
        ),
        Err(e) => error!(error = %e, "Webhook replay failed"),
    }
}

/// Register an async job that runs `task` against the billing service
async fn add_billing_job<F, Fut>(
    scheduler: &JobScheduler,
    schedule: &str,
    description: &str,
    billing: Arc<BillingService>,
    task: F,
) -> anyhow::Result<()>
where
    F: Fn(Arc<BillingService>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task = Arc::new(task);
    scheduler
        .add(Job::new_async(schedule, move |_uuid, _l| {
            let billing = billing.clone();
            let task = task.clone();
            Box::pin(async move { task(billing).await })
        })?)
        .await?;
    info!(schedule = schedule, "Scheduled: {}", description);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    init_tracing();
    info!("Starting EduBill Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = edubill_shared::create_pool(&database_url).await?;

    if std::env::var("RUN_MIGRATIONS").is_ok_and(|v| v == "true" || v == "1") {
        edubill_shared::run_migrations(&pool).await?;
    }

    let billing = match BillingService::from_env(pool.clone()).await {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without a gateway nothing can be charged; stay up so the deployment is visible
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let webhook_retention_days = std::env::var("WEBHOOK_RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(DEFAULT_WEBHOOK_RETENTION_DAYS);
    let checker = Arc::new(InvariantChecker::new(
        pool.clone(),
        billing.ctx.config.stale_pending_after(),
    ));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing sweep (renewals and trial conversions)
    add_billing_job(
        &scheduler,
        &cron("BILLING_SWEEP_CRON", "0 5 0 * * *"),
        "Billing sweep",
        billing.clone(),
        |billing| async move {
            info!("Running billing sweep");
            log_sweep("billing", billing.scheduler.run_billing_sweep().await);
        },
    )
    .await?;

    // Job 2: Retry failed charges inside the grace window
    add_billing_job(
        &scheduler,
        &cron("RETRY_SWEEP_CRON", "0 15 * * * *"),
        "Retry sweep",
        billing.clone(),
        |billing| async move {
            log_sweep("retry", billing.scheduler.run_retry_sweep().await);
        },
    )
    .await?;

    // Job 3: Suspend or expire subscriptions whose grace ended
    add_billing_job(
        &scheduler,
        &cron("GRACE_SWEEP_CRON", "0 30 * * * *"),
        "Grace sweep",
        billing.clone(),
        |billing| async move {
            log_sweep("grace", billing.scheduler.run_grace_sweep().await);
        },
    )
    .await?;

    // Job 4: Alert on payments stuck in PENDING
    add_billing_job(
        &scheduler,
        &cron("STALE_PAYMENT_CRON", "0 */15 * * * *"),
        "Stale pending payment sweep",
        billing.clone(),
        |billing| async move {
            log_sweep("stale_payments", billing.scheduler.run_stale_payment_sweep().await);
        },
    )
    .await?;

    // Job 5: Replay failed webhooks
    add_billing_job(
        &scheduler,
        &cron("WEBHOOK_REPLAY_CRON", "0 * * * * *"),
        "Webhook replay",
        billing.clone(),
        |billing| async move {
            log_replay(billing.webhooks.replay_failed().await);
        },
    )
    .await?;

    // Job 6: Drop old webhook audit records (daily at 3:00 AM UTC)
    add_billing_job(
        &scheduler,
        "0 0 3 * * *",
        "Webhook audit cleanup",
        billing.clone(),
        move |billing| async move {
            match billing
                .webhooks
                .cleanup(time::Duration::days(webhook_retention_days))
                .await
            {
                Ok(deleted) => info!(deleted = deleted, "Webhook audit cleanup complete"),
                Err(e) => error!(error = %e, "Webhook audit cleanup failed"),
            }
        },
    )
    .await?;

    // Job 7: Invariant checks (daily at 4:00 AM UTC)
    add_billing_job(
        &scheduler,
        "0 0 4 * * *",
        "Billing invariant checks",
        billing.clone(),
        move |billing| {
            let checker = checker.clone();
            async move {
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "Billing invariants hold");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                campus_ids = ?violation.campus_ids,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                        billing
                            .ctx
                            .notifier
                            .alert_admins(
                                "Billing invariant violations",
                                format!(
                                    "{} of {} checks failed with {} violations",
                                    summary.checks_failed,
                                    summary.checks_run,
                                    summary.violations.len()
                                ),
                                None,
                                None,
                            )
                            .await;
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            }
        },
    )
    .await?;

    // Job 8: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("EduBill Worker started successfully with {} scheduled jobs", 8);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
