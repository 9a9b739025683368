//! Retention & housekeeping job coordination.
//!
//! The coordinator decides, for each (job type, target key, calendar day),
//! whether a purge attempt may run, and executes it exactly-once-at-a-time
//! under contention. Exclusivity comes from a `FOR UPDATE` lock on the
//! daily snapshot row — never from an in-process flag, since triggers can
//! originate from independent processes. The lock is held only for the
//! decision transaction; the purge itself runs lock-free in batches and
//! reports progress to the run ledger as each sub-target finishes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::HousekeepingConfig;
use crate::db::{
    DailyRow, DailySnapshotUpsert, DailyStatusUpdate, Database, DbError, JobType, NewRun,
    NewRunItem, RunFinal, RunHistoryRow, RunId, RunProgress, RunRow, RunStatus, RunSummaryRow,
    TriggerType,
};
use crate::registry::{EventRegistry, RegistryError};
use crate::scheduler::next_cron_run;

/// Reserved target key for the audit job types.
pub const EVENT_KEY_AUDIT: &str = "__audit__";
/// Reserved target key selecting the retention fan-out/rollup views.
pub const EVENT_KEY_ALL: &str = "ALL";

/// Server-side page cap for the listing endpoints.
const MAX_PAGE_LIMIT: i64 = 200;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum HousekeepingError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<sqlx::Error> for HousekeepingError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(DbError::Sqlx(err))
    }
}

pub type Result<T> = std::result::Result<T, HousekeepingError>;

// ============================================================================
// Outcome & Preview Shapes
// ============================================================================

/// One sub-target's deletion counts, as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct RunItemOutcome {
    pub event_key: String,
    pub deleted_success: i64,
    pub deleted_failure: i64,
    pub deleted_total: i64,
}

/// The result of a run request: a finished/in-flight attempt, or a
/// synthetic SKIPPED outcome referencing the attempt that holds the day.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub id: String,
    pub job_type: String,
    pub event_key: String,
    pub trigger_type: String,
    pub run_date: NaiveDate,
    pub attempt: i32,
    pub status: String,
    pub cutoff_date: NaiveDate,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub deleted_success: i64,
    pub deleted_failure: i64,
    pub deleted_total: i64,
    pub error_message: Option<String>,
    pub items: Vec<RunItemOutcome>,
}

/// Run-history entry: one attempt plus its item rollup.
#[derive(Debug, Clone, Serialize)]
pub struct RunHistoryEntry {
    pub run: RunOutcome,
    pub event_count: i64,
    pub event_keys: Option<String>,
}

/// Per-sub-target eligibility numbers inside a preview.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewEvent {
    pub event_key: String,
    pub eligible_success: i64,
    pub eligible_failure: i64,
    pub eligible_total: i64,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// What a run would delete today, plus when the scheduler will next fire.
#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub cutoff_date: NaiveDate,
    pub retention_days: i32,
    pub snapshot_at: Option<DateTime<Utc>>,
    pub eligible_success: i64,
    pub eligible_failure: i64,
    pub eligible_total: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub events: Vec<PreviewEvent>,
}

// ============================================================================
// Internal State
// ============================================================================

/// In-memory copy of a freshly refreshed daily snapshot.
#[derive(Debug, Clone)]
struct Snapshot {
    event_key: String,
    run_date: NaiveDate,
    retention_days: i32,
    cutoff_date: NaiveDate,
    snapshot_at: DateTime<Utc>,
    eligible_success: i64,
    eligible_failure: i64,
    eligible_total: i64,
    events: Vec<PreviewEvent>,
}

/// Outcome of the locked decision step.
enum Decision {
    Skip(DailyRow),
    Start {
        run_id: RunId,
        attempt: i32,
        started_at: DateTime<Utc>,
    },
}

/// Deletion counts accumulated while an attempt executes. Kept outside the
/// purge calls so a mid-flight failure still reports what it deleted.
#[derive(Debug, Default)]
struct RunTotals {
    deleted_success: i64,
    deleted_failure: i64,
    items: Vec<RunItemOutcome>,
}

// ============================================================================
// Service
// ============================================================================

/// The job coordinator and query surface over the housekeeping store.
#[derive(Clone)]
pub struct HousekeepingService {
    db: Database,
    registry: Arc<EventRegistry>,
    config: HousekeepingConfig,
}

impl HousekeepingService {
    pub fn new(db: Database, registry: Arc<EventRegistry>, config: HousekeepingConfig) -> Self {
        Self { db, registry, config }
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    // ========================================================================
    // Run Triggers
    // ========================================================================

    /// Run retention for one event key.
    pub async fn run_retention(
        &self,
        event_key: &str,
        trigger: TriggerType,
        date_override: Option<NaiveDate>,
    ) -> Result<RunOutcome> {
        self.run_housekeeping(JobType::Retention, event_key, trigger, date_override).await
    }

    /// Run retention for every registered event. A failing event is recorded
    /// on its own ledger and the sweep continues with the next one.
    pub async fn run_retention_all(
        &self,
        trigger: TriggerType,
        date_override: Option<NaiveDate>,
    ) -> Result<Vec<RunOutcome>> {
        let mut outcomes = Vec::with_capacity(self.registry.len());
        for definition in self.registry.all() {
            match self
                .run_housekeeping(JobType::Retention, &definition.key, trigger, date_override)
                .await
            {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    warn!(
                        event_key = %definition.key,
                        error = %err,
                        "retention sweep failed for event; continuing"
                    );
                    if let Some(outcome) = self
                        .status(JobType::Retention, Some(&definition.key), date_override)
                        .await?
                    {
                        outcomes.push(outcome);
                    }
                }
            }
        }
        Ok(outcomes)
    }

    /// Run one of the audit purges.
    pub async fn run_audit(
        &self,
        job_type: JobType,
        trigger: TriggerType,
        date_override: Option<NaiveDate>,
    ) -> Result<RunOutcome> {
        self.run_housekeeping(job_type, EVENT_KEY_AUDIT, trigger, date_override).await
    }

    /// Manual-trigger entry point; retention without a key fans out.
    pub async fn run_now(
        &self,
        job_type: JobType,
        event_key: Option<&str>,
        date_override: Option<NaiveDate>,
    ) -> Result<Vec<RunOutcome>> {
        match job_type {
            JobType::Retention if is_all_events(event_key) => {
                self.run_retention_all(TriggerType::Manual, date_override).await
            }
            JobType::Retention => {
                let key = event_key.unwrap_or_default();
                Ok(vec![self.run_retention(key, TriggerType::Manual, date_override).await?])
            }
            _ => Ok(vec![self.run_audit(job_type, TriggerType::Manual, date_override).await?]),
        }
    }

    /// Decide and (if allowed) execute one attempt for a key and date.
    pub async fn run_housekeeping(
        &self,
        job_type: JobType,
        event_key: &str,
        trigger: TriggerType,
        date_override: Option<NaiveDate>,
    ) -> Result<RunOutcome> {
        let run_date = date_override.unwrap_or_else(today);
        let snapshot = self.refresh_snapshot(job_type, event_key, run_date).await?;

        let (run_id, attempt, started_at) =
            match self.begin_run(job_type, trigger, &snapshot).await? {
                Decision::Skip(daily) => {
                    return self.skipped_outcome(job_type, &daily, &snapshot).await;
                }
                Decision::Start { run_id, attempt, started_at } => (run_id, attempt, started_at),
            };

        let cutoff = midnight_utc(snapshot.cutoff_date);
        let mut totals = RunTotals::default();
        let result = self
            .execute_job(job_type, event_key, run_id, cutoff, snapshot.cutoff_date, &mut totals)
            .await;

        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds();
        let deleted_total = totals.deleted_success + totals.deleted_failure;

        match result {
            Ok(()) => {
                self.db
                    .finalize_run(&RunFinal {
                        id: run_id,
                        status: RunStatus::Completed,
                        completed_at,
                        duration_ms,
                        deleted_success: totals.deleted_success,
                        deleted_failure: totals.deleted_failure,
                        deleted_total,
                        error_message: None,
                    })
                    .await?;
                self.db
                    .update_daily_status(
                        self.db.pool(),
                        &DailyStatusUpdate {
                            job_type,
                            event_key: snapshot.event_key.clone(),
                            run_date,
                            last_status: RunStatus::Completed,
                            last_run_id: Some(run_id),
                            last_attempt: attempt,
                            last_started_at: Some(started_at),
                            last_completed_at: Some(completed_at),
                            last_error: None,
                        },
                    )
                    .await?;
                self.refresh_snapshot_safely(job_type, event_key, run_date).await;
                info!(
                    job_type = %job_type,
                    event_key,
                    run_id = %run_id,
                    attempt,
                    deleted_total,
                    duration_ms,
                    "housekeeping run completed"
                );
                Ok(RunOutcome {
                    id: run_id.to_string(),
                    job_type: job_type.as_str().to_string(),
                    event_key: snapshot.event_key.clone(),
                    trigger_type: trigger.as_str().to_string(),
                    run_date,
                    attempt,
                    status: RunStatus::Completed.as_str().to_string(),
                    cutoff_date: snapshot.cutoff_date,
                    started_at: Some(started_at),
                    completed_at: Some(completed_at),
                    duration_ms: Some(duration_ms),
                    deleted_success: totals.deleted_success,
                    deleted_failure: totals.deleted_failure,
                    deleted_total,
                    error_message: None,
                    items: totals.items,
                })
            }
            Err(err) => {
                // Record the failure so the next decision may retry; the
                // original error is re-raised regardless of how the
                // bookkeeping writes fare.
                let message = err.to_string();
                if let Err(update_err) = self
                    .db
                    .finalize_run(&RunFinal {
                        id: run_id,
                        status: RunStatus::Failed,
                        completed_at,
                        duration_ms,
                        deleted_success: totals.deleted_success,
                        deleted_failure: totals.deleted_failure,
                        deleted_total,
                        error_message: Some(message.clone()),
                    })
                    .await
                {
                    warn!(run_id = %run_id, error = %update_err, "failed to record run failure");
                }
                if let Err(update_err) = self
                    .db
                    .update_daily_status(
                        self.db.pool(),
                        &DailyStatusUpdate {
                            job_type,
                            event_key: snapshot.event_key.clone(),
                            run_date,
                            last_status: RunStatus::Failed,
                            last_run_id: Some(run_id),
                            last_attempt: attempt,
                            last_started_at: Some(started_at),
                            last_completed_at: Some(completed_at),
                            last_error: Some(message.clone()),
                        },
                    )
                    .await
                {
                    warn!(run_id = %run_id, error = %update_err, "failed to record daily failure");
                }
                self.refresh_snapshot_safely(job_type, event_key, run_date).await;
                warn!(
                    job_type = %job_type,
                    event_key,
                    run_id = %run_id,
                    attempt,
                    error = %message,
                    "housekeeping run failed"
                );
                Err(err)
            }
        }
    }

    // ========================================================================
    // Decision
    // ========================================================================

    /// The mutual-exclusion point: lock the daily row, decide, claim, commit.
    ///
    /// The commit releases the lock immediately, so it is held only for the
    /// decision — never for the potentially minutes-long purge that follows.
    /// The cost is that a crash mid-run leaves the snapshot RUNNING until an
    /// operator confirms the process is dead and retries.
    async fn begin_run(
        &self,
        job_type: JobType,
        trigger: TriggerType,
        snapshot: &Snapshot,
    ) -> Result<Decision> {
        let mut tx = self.db.pool().begin().await?;

        let locked = self
            .db
            .lock_daily(&mut tx, job_type, &snapshot.event_key, snapshot.run_date)
            .await?;
        let daily = match locked {
            Some(row) => row,
            // The refresh that preceded us normally guarantees the row; if a
            // concurrent audit purge removed it, fall back to a fresh view.
            None => match self.db.load_daily(job_type, &snapshot.event_key, snapshot.run_date).await? {
                Some(row) => row,
                None => synthetic_daily(job_type, snapshot),
            },
        };

        if daily.last_status == RunStatus::Running.as_str() {
            tx.commit().await?;
            return Ok(Decision::Skip(daily));
        }

        let has_eligible = daily.eligible_total > 0;
        let allow_run = daily.last_status == RunStatus::Failed.as_str() || has_eligible;
        if !allow_run {
            tx.commit().await?;
            return Ok(Decision::Skip(daily));
        }

        let attempt = daily.last_attempt.max(0) + 1;
        let run_id = RunId::new();
        let started_at = Utc::now();

        self.db
            .insert_run(
                &mut tx,
                &NewRun {
                    id: run_id,
                    job_type,
                    event_key: snapshot.event_key.clone(),
                    trigger_type: trigger,
                    run_date: snapshot.run_date,
                    attempt,
                    cutoff_date: snapshot.cutoff_date,
                    started_at,
                },
            )
            .await?;
        self.db
            .update_daily_status(
                &mut *tx,
                &DailyStatusUpdate {
                    job_type,
                    event_key: snapshot.event_key.clone(),
                    run_date: snapshot.run_date,
                    last_status: RunStatus::Running,
                    last_run_id: Some(run_id),
                    last_attempt: attempt,
                    last_started_at: Some(started_at),
                    last_completed_at: None,
                    last_error: None,
                },
            )
            .await?;

        tx.commit().await?;
        Ok(Decision::Start { run_id, attempt, started_at })
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Dispatch to the job type's sub-target purge strategy.
    ///
    /// Each sub-target's item is recorded even when the purge fails partway,
    /// so a failed attempt's items reflect exactly what it deleted; the
    /// retry finishes the remainder because the cutoff predicate is
    /// re-evaluated per batch.
    async fn execute_job(
        &self,
        job_type: JobType,
        event_key: &str,
        run_id: RunId,
        cutoff: DateTime<Utc>,
        cutoff_date: NaiveDate,
        totals: &mut RunTotals,
    ) -> Result<()> {
        match job_type {
            JobType::Retention => {
                let definition = self.registry.get_required(event_key)?;
                let mut success = 0;
                let mut failure = 0;
                let purge_result =
                    match self.purge_table(&definition.success_table, cutoff, &mut success).await {
                        Ok(()) => self.purge_table(&definition.failure_table, cutoff, &mut failure).await,
                        Err(err) => Err(err),
                    };
                totals.deleted_success += success;
                totals.deleted_failure += failure;
                self.record_item(run_id, &definition.key, success, failure, totals).await?;
                purge_result?;
            }
            JobType::ReplayAudit => {
                let mut jobs = 0;
                let mut items = 0;
                let purge_result = self.purge_replay_audit(cutoff_date, &mut jobs, &mut items).await;
                totals.deleted_success += jobs;
                totals.deleted_failure += items;
                self.record_item(run_id, "replay_jobs", jobs, 0, totals).await?;
                self.record_item(run_id, "replay_items", items, 0, totals).await?;
                purge_result?;
            }
            JobType::HousekeepingAudit => {
                let mut runs = 0;
                let mut items = 0;
                let mut daily = 0;
                let purge_result =
                    match self.purge_run_ledger(cutoff_date, &mut runs, &mut items).await {
                        Ok(()) => self.purge_daily_rows(cutoff_date, &mut daily).await,
                        Err(err) => Err(err),
                    };
                // Run totals track the ledger tables; the daily-row count is
                // visible on its item only.
                totals.deleted_success += runs;
                totals.deleted_failure += items;
                self.record_item(run_id, "housekeeping_runs", runs, 0, totals).await?;
                self.record_item(run_id, "housekeeping_run_items", items, 0, totals).await?;
                self.record_item(run_id, "housekeeping_daily", daily, 0, totals).await?;
                purge_result?;
            }
        }
        Ok(())
    }

    /// Append the sub-target's item and push accumulated counts onto the
    /// RUNNING run so concurrent status reads see live progress.
    async fn record_item(
        &self,
        run_id: RunId,
        label: &str,
        success: i64,
        failure: i64,
        totals: &mut RunTotals,
    ) -> Result<()> {
        let total = success + failure;
        self.db
            .insert_run_item(&NewRunItem {
                run_id,
                event_key: label.to_string(),
                deleted_success: success,
                deleted_failure: failure,
                deleted_total: total,
                created_at: Utc::now(),
            })
            .await?;
        self.db
            .update_run_progress(&RunProgress {
                id: run_id,
                deleted_success: totals.deleted_success,
                deleted_failure: totals.deleted_failure,
                deleted_total: totals.deleted_success + totals.deleted_failure,
            })
            .await?;
        totals.items.push(RunItemOutcome {
            event_key: label.to_string(),
            deleted_success: success,
            deleted_failure: failure,
            deleted_total: total,
        });
        Ok(())
    }

    /// Batched delete loop for one table; a short batch signals exhaustion.
    async fn purge_table(
        &self,
        table: &str,
        cutoff: DateTime<Utc>,
        total: &mut i64,
    ) -> Result<()> {
        let batch_size = self.config.batch_size;
        loop {
            let deleted = self.db.delete_old_rows_batch(table, cutoff, batch_size).await?;
            *total += deleted;
            if deleted > 0 {
                info!(table, deleted, "purged batch of expired event rows");
            }
            if deleted < batch_size {
                break;
            }
        }
        Ok(())
    }

    /// Parent/child purge of the replay audit tables. Children are deleted
    /// before parents; one id batch is one unit of progress.
    async fn purge_replay_audit(
        &self,
        cutoff_date: NaiveDate,
        jobs_deleted: &mut i64,
        items_deleted: &mut i64,
    ) -> Result<()> {
        let batch_size = self.config.batch_size;
        loop {
            let job_ids = self.db.load_replay_job_ids(cutoff_date, batch_size).await?;
            if job_ids.is_empty() {
                break;
            }
            *items_deleted += self.db.delete_replay_items_by_job_ids(&job_ids).await?;
            *jobs_deleted += self.db.delete_replay_jobs_by_ids(&job_ids).await?;
            if (job_ids.len() as i64) < batch_size {
                break;
            }
        }
        Ok(())
    }

    /// Parent/child purge of the coordinator's own run ledger.
    async fn purge_run_ledger(
        &self,
        cutoff_date: NaiveDate,
        runs_deleted: &mut i64,
        items_deleted: &mut i64,
    ) -> Result<()> {
        let batch_size = self.config.batch_size;
        loop {
            let run_ids = self.db.load_housekeeping_run_ids(cutoff_date, batch_size).await?;
            if run_ids.is_empty() {
                break;
            }
            *items_deleted += self.db.delete_run_items_by_run_ids(&run_ids).await?;
            *runs_deleted += self.db.delete_runs_by_ids(&run_ids).await?;
            if (run_ids.len() as i64) < batch_size {
                break;
            }
        }
        Ok(())
    }

    async fn purge_daily_rows(&self, cutoff_date: NaiveDate, total: &mut i64) -> Result<()> {
        let batch_size = self.config.batch_size;
        loop {
            let deleted = self.db.delete_daily_batch(cutoff_date, batch_size).await?;
            *total += deleted;
            if deleted < batch_size {
                break;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Snapshot Refresh
    // ========================================================================

    /// Recompute the eligibility snapshot for a key and date. Count-only and
    /// lock-free; safe to run concurrently with purges and with itself.
    async fn refresh_snapshot(
        &self,
        job_type: JobType,
        event_key: &str,
        run_date: NaiveDate,
    ) -> Result<Snapshot> {
        let snapshot_at = Utc::now();
        let mut retention_days = self.config.retention_days;
        if job_type == JobType::Retention {
            let definition = self.registry.get_required(event_key)?;
            if let Some(days) = definition.retention_days {
                retention_days = days;
            }
        }
        let cutoff_date = run_date - Duration::days(retention_days as i64);
        let cutoff = midnight_utc(cutoff_date);
        let next_run_at = self.resolve_next_run_at(job_type, Some(event_key))?;

        let mut events = Vec::new();
        let (total_success, total_failure) = match job_type {
            JobType::Retention => {
                let definition = self.registry.get_required(event_key)?;
                let success = self.db.count_old_rows(&definition.success_table, cutoff).await?;
                let failure = self.db.count_old_rows(&definition.failure_table, cutoff).await?;
                events.push(PreviewEvent {
                    event_key: definition.key.clone(),
                    eligible_success: success,
                    eligible_failure: failure,
                    eligible_total: success + failure,
                    next_run_at,
                });
                (success, failure)
            }
            JobType::ReplayAudit => {
                let jobs = self.db.count_replay_jobs(cutoff_date).await?;
                let items = self.db.count_replay_items(cutoff_date).await?;
                events.push(PreviewEvent {
                    event_key: "replay_jobs".to_string(),
                    eligible_success: jobs,
                    eligible_failure: 0,
                    eligible_total: jobs,
                    next_run_at,
                });
                events.push(PreviewEvent {
                    event_key: "replay_items".to_string(),
                    eligible_success: items,
                    eligible_failure: 0,
                    eligible_total: items,
                    next_run_at,
                });
                (jobs, items)
            }
            JobType::HousekeepingAudit => {
                let runs = self.db.count_housekeeping_runs(cutoff_date).await?;
                let items = self.db.count_housekeeping_run_items(cutoff_date).await?;
                let daily = self.db.count_housekeeping_daily(cutoff_date).await?;
                events.push(PreviewEvent {
                    event_key: "housekeeping_runs".to_string(),
                    eligible_success: runs,
                    eligible_failure: 0,
                    eligible_total: runs,
                    next_run_at,
                });
                events.push(PreviewEvent {
                    event_key: "housekeeping_run_items".to_string(),
                    eligible_success: items,
                    eligible_failure: 0,
                    eligible_total: items,
                    next_run_at,
                });
                events.push(PreviewEvent {
                    event_key: "housekeeping_daily".to_string(),
                    eligible_success: daily,
                    eligible_failure: 0,
                    eligible_total: daily,
                    next_run_at,
                });
                (runs + daily, items)
            }
        };

        self.db
            .upsert_daily_snapshot(&DailySnapshotUpsert {
                job_type,
                event_key: event_key.to_string(),
                run_date,
                retention_days,
                cutoff_date,
                snapshot_at,
                eligible_success: total_success,
                eligible_failure: total_failure,
                eligible_total: total_success + total_failure,
            })
            .await?;

        Ok(Snapshot {
            event_key: event_key.to_string(),
            run_date,
            retention_days,
            cutoff_date,
            snapshot_at,
            eligible_success: total_success,
            eligible_failure: total_failure,
            eligible_total: total_success + total_failure,
            events,
        })
    }

    async fn refresh_snapshot_safely(&self, job_type: JobType, event_key: &str, run_date: NaiveDate) {
        if let Err(err) = self.refresh_snapshot(job_type, event_key, run_date).await {
            warn!(
                job_type = %job_type,
                event_key,
                %run_date,
                error = %err,
                "failed to refresh snapshot"
            );
        }
    }

    /// Warm the preview cache for today and tomorrow, across every key.
    pub async fn refresh_preview_cache(&self) {
        let today = today();
        let tomorrow = today + Duration::days(1);
        for run_date in [today, tomorrow] {
            for definition in self.registry.all() {
                self.refresh_snapshot_safely(JobType::Retention, &definition.key, run_date).await;
            }
            self.refresh_snapshot_safely(JobType::ReplayAudit, EVENT_KEY_AUDIT, run_date).await;
            self.refresh_snapshot_safely(JobType::HousekeepingAudit, EVENT_KEY_AUDIT, run_date).await;
        }
    }

    // ========================================================================
    // Query Surface
    // ========================================================================

    /// Preview what a run would delete. Prefers a usable cached snapshot
    /// unless `refresh` forces a recompute.
    pub async fn preview(
        &self,
        job_type: JobType,
        event_key: Option<&str>,
        refresh: bool,
    ) -> Result<Preview> {
        let run_date = today();
        let all = job_type == JobType::Retention && is_all_events(event_key);

        if !refresh {
            if all {
                if let Some(preview) = self.preview_all_retention_cached(run_date).await? {
                    return Ok(preview);
                }
            } else {
                let key = effective_key(job_type, event_key);
                if let Some(daily) = self.db.load_daily(job_type, key, run_date).await? {
                    return self.preview_from_daily(job_type, key, &daily);
                }
                if let Some(latest) = self.db.load_latest_daily(job_type, key).await? {
                    return self.preview_from_daily(job_type, key, &latest);
                }
            }
        }

        if all {
            return self.preview_all_retention(run_date).await;
        }

        let key = effective_key(job_type, event_key);
        let snapshot = self.refresh_snapshot(job_type, key, run_date).await?;
        let next_run_at = self.resolve_next_run_at(job_type, Some(key))?;
        Ok(Preview {
            cutoff_date: snapshot.cutoff_date,
            retention_days: snapshot.retention_days,
            snapshot_at: Some(snapshot.snapshot_at),
            eligible_success: snapshot.eligible_success,
            eligible_failure: snapshot.eligible_failure,
            eligible_total: snapshot.eligible_total,
            next_run_at,
            events: snapshot.events,
        })
    }

    fn preview_from_daily(
        &self,
        job_type: JobType,
        event_key: &str,
        daily: &DailyRow,
    ) -> Result<Preview> {
        let next_run_at = self.resolve_next_run_at(job_type, Some(event_key))?;
        Ok(Preview {
            cutoff_date: daily.cutoff_date,
            retention_days: daily.retention_days,
            snapshot_at: Some(daily.snapshot_at),
            eligible_success: daily.eligible_success,
            eligible_failure: daily.eligible_failure,
            eligible_total: daily.eligible_total,
            next_run_at,
            events: vec![PreviewEvent {
                event_key: daily.event_key.clone(),
                eligible_success: daily.eligible_success,
                eligible_failure: daily.eligible_failure,
                eligible_total: daily.eligible_total,
                next_run_at,
            }],
        })
    }

    /// Fresh ALL-events preview: recounts every registered event.
    async fn preview_all_retention(&self, run_date: NaiveDate) -> Result<Preview> {
        let snapshot_at = Utc::now();
        let retention_days = self.config.retention_days;
        let cutoff_date = run_date - Duration::days(retention_days as i64);
        let cutoff = midnight_utc(cutoff_date);
        let now = Utc::now();

        let mut events = Vec::with_capacity(self.registry.len());
        let mut total_success = 0;
        let mut total_failure = 0;
        for definition in self.registry.all() {
            let success = self.db.count_old_rows(&definition.success_table, cutoff).await?;
            let failure = self.db.count_old_rows(&definition.failure_table, cutoff).await?;
            let next_run_at = next_run_for(definition.retention_cron.as_deref(), &self.config.cron, now);
            events.push(PreviewEvent {
                event_key: definition.key.clone(),
                eligible_success: success,
                eligible_failure: failure,
                eligible_total: success + failure,
                next_run_at,
            });
            total_success += success;
            total_failure += failure;
        }

        let next_run_at = self.resolve_next_run_at(JobType::Retention, None)?;
        Ok(Preview {
            cutoff_date,
            retention_days,
            snapshot_at: Some(snapshot_at),
            eligible_success: total_success,
            eligible_failure: total_failure,
            eligible_total: total_success + total_failure,
            next_run_at,
            events,
        })
    }

    /// Cached ALL-events preview. Returns None unless every registered event
    /// has a usable snapshot, in which case the caller recomputes.
    async fn preview_all_retention_cached(&self, run_date: NaiveDate) -> Result<Option<Preview>> {
        let rows = self.db.load_daily_rows_for_date(JobType::Retention, run_date).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let by_event: HashMap<&str, &DailyRow> =
            rows.iter().map(|row| (row.event_key.as_str(), row)).collect();

        let retention_days = self.config.retention_days;
        let cutoff_date = run_date - Duration::days(retention_days as i64);
        let now = Utc::now();

        let mut snapshot_at: Option<DateTime<Utc>> = None;
        let mut events = Vec::with_capacity(self.registry.len());
        let mut total_success = 0;
        let mut total_failure = 0;
        for definition in self.registry.all() {
            let row = match by_event.get(definition.key.as_str()) {
                Some(row) => (*row).clone(),
                None => match self.db.load_latest_daily(JobType::Retention, &definition.key).await? {
                    Some(row) => row,
                    None => return Ok(None),
                },
            };
            if snapshot_at.is_none_or(|at| row.snapshot_at > at) {
                snapshot_at = Some(row.snapshot_at);
            }
            let next_run_at = next_run_for(definition.retention_cron.as_deref(), &self.config.cron, now);
            events.push(PreviewEvent {
                event_key: definition.key.clone(),
                eligible_success: row.eligible_success,
                eligible_failure: row.eligible_failure,
                eligible_total: row.eligible_total,
                next_run_at,
            });
            total_success += row.eligible_success;
            total_failure += row.eligible_failure;
        }

        let next_run_at = self.resolve_next_run_at(JobType::Retention, None)?;
        Ok(Some(Preview {
            cutoff_date,
            retention_days,
            snapshot_at,
            eligible_success: total_success,
            eligible_failure: total_failure,
            eligible_total: total_success + total_failure,
            next_run_at,
            events,
        }))
    }

    /// Latest attempt for a key and date, with its items.
    pub async fn status(
        &self,
        job_type: JobType,
        event_key: Option<&str>,
        date: Option<NaiveDate>,
    ) -> Result<Option<RunOutcome>> {
        let run_date = date.unwrap_or_else(today);
        if job_type == JobType::Retention && is_all_events(event_key) {
            return self.status_all_retention(run_date).await;
        }
        let key = effective_key(job_type, event_key);
        let Some(daily) = self.db.load_daily(job_type, key, run_date).await? else {
            return Ok(None);
        };
        if daily.last_run_id.is_none() {
            return Ok(None);
        }
        let runs = self.db.load_runs_for_date(job_type, key, run_date).await?;
        let Some(latest) = runs.last() else {
            return Ok(None);
        };
        let items = self.load_item_outcomes(latest.id).await?;
        Ok(Some(run_outcome_from_row(latest, items)))
    }

    /// ALL-events status rollup: latest attempt per event, combined with
    /// worst-of status precedence.
    async fn status_all_retention(&self, run_date: NaiveDate) -> Result<Option<RunOutcome>> {
        let runs = self.db.load_latest_runs_for_date(JobType::Retention, run_date).await?;
        if runs.is_empty() {
            return Ok(None);
        }

        let mut deleted_success = 0;
        let mut deleted_failure = 0;
        let mut started_at: Option<DateTime<Utc>> = None;
        let mut completed_at: Option<DateTime<Utc>> = None;
        let mut any_incomplete = false;
        let mut status = RunStatus::Completed;
        let mut trigger_type = runs[0].trigger_type.clone();
        let mut attempt = 0;
        let mut items = Vec::with_capacity(runs.len());

        for run in &runs {
            deleted_success += run.deleted_success;
            deleted_failure += run.deleted_failure;
            attempt = attempt.max(run.attempt);
            if started_at.is_none_or(|at| run.started_at < at) {
                started_at = Some(run.started_at);
            }
            match run.completed_at {
                None => any_incomplete = true,
                Some(at) => {
                    if completed_at.is_none_or(|current| at > current) {
                        completed_at = Some(at);
                    }
                }
            }
            if trigger_type != run.trigger_type {
                trigger_type = "MIXED".to_string();
            }
            if let Some(run_status) = RunStatus::parse(&run.status) {
                status = combine_status(status, run_status);
            }
            items.push(RunItemOutcome {
                event_key: run.event_key.clone(),
                deleted_success: run.deleted_success,
                deleted_failure: run.deleted_failure,
                deleted_total: run.deleted_total,
            });
        }

        let completed_at = if any_incomplete { None } else { completed_at };
        let duration_ms = match (started_at, completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };

        Ok(Some(RunOutcome {
            id: format!("ALL-{run_date}"),
            job_type: JobType::Retention.as_str().to_string(),
            event_key: EVENT_KEY_ALL.to_string(),
            trigger_type,
            run_date,
            attempt,
            status: status.as_str().to_string(),
            cutoff_date: runs[0].cutoff_date,
            started_at,
            completed_at,
            duration_ms,
            deleted_success,
            deleted_failure,
            deleted_total: deleted_success + deleted_failure,
            error_message: None,
            items,
        }))
    }

    /// Daily snapshot history; the ALL key rolls up per-date across events.
    pub async fn list_daily(
        &self,
        job_type: JobType,
        event_key: Option<&str>,
        limit: i64,
    ) -> Result<Vec<DailyRow>> {
        let limit = clamp_limit(limit);
        if job_type == JobType::Retention && is_all_events(event_key) {
            Ok(self.db.load_daily_summary(job_type, limit).await?)
        } else {
            let key = effective_key(job_type, event_key);
            Ok(self.db.load_daily_rows(job_type, key, limit).await?)
        }
    }

    /// Run history for a job type, newest first.
    pub async fn list_runs(&self, job_type: JobType, limit: i64) -> Result<Vec<RunHistoryEntry>> {
        let limit = clamp_limit(limit);
        let rows = self.db.load_run_history(job_type, limit).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let items = self.load_item_outcomes(row.id).await?;
            entries.push(RunHistoryEntry {
                run: run_outcome_from_history(&row, items),
                event_count: row.event_count,
                event_keys: row.event_keys.clone(),
            });
        }
        Ok(entries)
    }

    /// Every attempt for a key and date, in attempt order.
    pub async fn list_runs_for_date(
        &self,
        job_type: JobType,
        event_key: Option<&str>,
        date: Option<NaiveDate>,
    ) -> Result<Vec<RunOutcome>> {
        let run_date = date.unwrap_or_else(today);
        let key = effective_key(job_type, event_key);
        let rows = self.db.load_runs_for_date(job_type, key, run_date).await?;
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in &rows {
            let items = self.load_item_outcomes(row.id).await?;
            outcomes.push(run_outcome_from_row(row, items));
        }
        Ok(outcomes)
    }

    /// Per-(date, sub-target) summary pages.
    pub async fn list_run_summary(
        &self,
        job_type: JobType,
        event_key: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunSummaryRow>> {
        let limit = clamp_limit(limit);
        let offset = offset.max(0);
        let filter = match job_type {
            JobType::Retention if !is_all_events(event_key) => event_key,
            _ => None,
        };
        Ok(self.db.load_run_summary(job_type, filter, limit, offset).await?)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Build the synthetic SKIPPED outcome for a declined decision,
    /// referencing the attempt that holds or finished the day's work.
    async fn skipped_outcome(
        &self,
        job_type: JobType,
        daily: &DailyRow,
        snapshot: &Snapshot,
    ) -> Result<RunOutcome> {
        if daily.last_run_id.is_some() {
            let runs = self
                .db
                .load_runs_for_date(job_type, &daily.event_key, daily.run_date)
                .await?;
            if let Some(latest) = runs.last() {
                let items = self.load_item_outcomes(latest.id).await?;
                let mut outcome = run_outcome_from_row(latest, items);
                outcome.status = RunStatus::Skipped.as_str().to_string();
                return Ok(outcome);
            }
        }

        Ok(RunOutcome {
            id: daily
                .last_run_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| RunStatus::Skipped.as_str().to_string()),
            job_type: job_type.as_str().to_string(),
            event_key: daily.event_key.clone(),
            trigger_type: TriggerType::System.as_str().to_string(),
            run_date: snapshot.run_date,
            attempt: daily.last_attempt,
            status: RunStatus::Skipped.as_str().to_string(),
            cutoff_date: snapshot.cutoff_date,
            started_at: Some(snapshot.snapshot_at),
            completed_at: Some(snapshot.snapshot_at),
            duration_ms: Some(0),
            deleted_success: 0,
            deleted_failure: 0,
            deleted_total: 0,
            error_message: daily.last_error.clone(),
            items: Vec::new(),
        })
    }

    async fn load_item_outcomes(&self, run_id: Uuid) -> Result<Vec<RunItemOutcome>> {
        let rows = self.db.load_run_items(run_id).await?;
        Ok(rows
            .into_iter()
            .map(|row| RunItemOutcome {
                event_key: row.event_key,
                deleted_success: row.deleted_success,
                deleted_failure: row.deleted_failure,
                deleted_total: row.deleted_total,
            })
            .collect())
    }

    /// Next scheduled fire time for a key, via the cron evaluator. For the
    /// ALL key this is the earliest across all registered events.
    fn resolve_next_run_at(
        &self,
        job_type: JobType,
        event_key: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        match job_type {
            JobType::Retention => {
                if is_all_events(event_key) {
                    let mut earliest: Option<DateTime<Utc>> = None;
                    for definition in self.registry.all() {
                        let next =
                            next_run_for(definition.retention_cron.as_deref(), &self.config.cron, now);
                        if let Some(next) = next {
                            if earliest.is_none_or(|at| next < at) {
                                earliest = Some(next);
                            }
                        }
                    }
                    Ok(earliest.or_else(|| next_run_for(None, &self.config.cron, now)))
                } else {
                    let definition = self.registry.get_required(event_key.unwrap_or_default())?;
                    Ok(next_run_for(definition.retention_cron.as_deref(), &self.config.cron, now))
                }
            }
            JobType::ReplayAudit => Ok(next_run_for(None, &self.config.replay_audit_cron, now)),
            JobType::HousekeepingAudit => {
                Ok(next_run_for(None, &self.config.housekeeping_audit_cron, now))
            }
        }
    }
}

// ============================================================================
// Free Helpers
// ============================================================================

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Midnight UTC of a calendar date, used as the strict `<` delete boundary.
fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn is_all_events(event_key: Option<&str>) -> bool {
    match event_key {
        None => true,
        Some(key) => key.trim().is_empty() || key.eq_ignore_ascii_case(EVENT_KEY_ALL),
    }
}

fn effective_key<'a>(job_type: JobType, event_key: Option<&'a str>) -> &'a str {
    match job_type {
        JobType::Retention => event_key.unwrap_or(EVENT_KEY_ALL),
        JobType::ReplayAudit | JobType::HousekeepingAudit => EVENT_KEY_AUDIT,
    }
}

fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, MAX_PAGE_LIMIT)
}

/// Worst-of precedence for rollups: FAILED > RUNNING > COMPLETED.
fn combine_status(current: RunStatus, next: RunStatus) -> RunStatus {
    match (current, next) {
        (RunStatus::Failed, _) | (_, RunStatus::Failed) => RunStatus::Failed,
        (RunStatus::Running, _) | (_, RunStatus::Running) => RunStatus::Running,
        _ => current,
    }
}

/// Evaluate the effective cron for display, preferring a per-event override.
fn next_run_for(
    preferred: Option<&str>,
    fallback: &str,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let expr = match preferred {
        Some(cron) if !cron.trim().is_empty() => cron.trim(),
        _ => fallback.trim(),
    };
    if expr.is_empty() {
        return None;
    }
    match next_cron_run(expr, now) {
        Ok(next) => next,
        Err(err) => {
            warn!(cron = expr, error = %err, "invalid cron expression");
            None
        }
    }
}

fn synthetic_daily(job_type: JobType, snapshot: &Snapshot) -> DailyRow {
    DailyRow {
        job_type: job_type.as_str().to_string(),
        event_key: snapshot.event_key.clone(),
        run_date: snapshot.run_date,
        retention_days: snapshot.retention_days,
        cutoff_date: snapshot.cutoff_date,
        snapshot_at: snapshot.snapshot_at,
        eligible_success: snapshot.eligible_success,
        eligible_failure: snapshot.eligible_failure,
        eligible_total: snapshot.eligible_total,
        last_status: RunStatus::Ready.as_str().to_string(),
        last_run_id: None,
        last_attempt: 0,
        last_started_at: None,
        last_completed_at: None,
        last_error: None,
    }
}

fn run_outcome_from_row(row: &RunRow, items: Vec<RunItemOutcome>) -> RunOutcome {
    RunOutcome {
        id: row.id.to_string(),
        job_type: row.job_type.clone(),
        event_key: row.event_key.clone(),
        trigger_type: row.trigger_type.clone(),
        run_date: row.run_date,
        attempt: row.attempt,
        status: row.status.clone(),
        cutoff_date: row.cutoff_date,
        started_at: Some(row.started_at),
        completed_at: row.completed_at,
        duration_ms: row.duration_ms,
        deleted_success: row.deleted_success,
        deleted_failure: row.deleted_failure,
        deleted_total: row.deleted_total,
        error_message: row.error_message.clone(),
        items,
    }
}

fn run_outcome_from_history(row: &RunHistoryRow, items: Vec<RunItemOutcome>) -> RunOutcome {
    RunOutcome {
        id: row.id.to_string(),
        job_type: row.job_type.clone(),
        event_key: row.event_key.clone(),
        trigger_type: row.trigger_type.clone(),
        run_date: row.run_date,
        attempt: row.attempt,
        status: row.status.clone(),
        cutoff_date: row.cutoff_date,
        started_at: Some(row.started_at),
        completed_at: row.completed_at,
        duration_ms: row.duration_ms,
        deleted_success: row.deleted_success,
        deleted_failure: row.deleted_failure,
        deleted_total: row.deleted_total,
        error_message: row.error_message.clone(),
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_status_precedence() {
        assert_eq!(combine_status(RunStatus::Completed, RunStatus::Running), RunStatus::Running);
        assert_eq!(combine_status(RunStatus::Running, RunStatus::Failed), RunStatus::Failed);
        assert_eq!(combine_status(RunStatus::Failed, RunStatus::Completed), RunStatus::Failed);
        assert_eq!(combine_status(RunStatus::Failed, RunStatus::Running), RunStatus::Failed);
        assert_eq!(combine_status(RunStatus::Completed, RunStatus::Completed), RunStatus::Completed);
    }

    #[test]
    fn test_is_all_events() {
        assert!(is_all_events(None));
        assert!(is_all_events(Some("")));
        assert!(is_all_events(Some("  ")));
        assert!(is_all_events(Some("ALL")));
        assert!(is_all_events(Some("all")));
        assert!(!is_all_events(Some("payments.in")));
    }

    #[test]
    fn test_effective_key() {
        assert_eq!(effective_key(JobType::Retention, Some("payments.in")), "payments.in");
        assert_eq!(effective_key(JobType::ReplayAudit, Some("ignored")), EVENT_KEY_AUDIT);
        assert_eq!(effective_key(JobType::HousekeepingAudit, None), EVENT_KEY_AUDIT);
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(-5), 1);
        assert_eq!(clamp_limit(50), 50);
        assert_eq!(clamp_limit(10_000), MAX_PAGE_LIMIT);
    }

    #[test]
    fn test_midnight_utc_boundary() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        let cutoff = midnight_utc(date);
        assert_eq!(cutoff.to_rfc3339(), "2024-03-03T00:00:00+00:00");
    }

    #[test]
    fn test_next_run_for_prefers_override() {
        let now = Utc::now();
        let with_override = next_run_for(Some("0 0 4 * * *"), "0 0 2 * * *", now).unwrap();
        assert_eq!(with_override.format("%H:%M:%S").to_string(), "04:00:00");

        let fallback = next_run_for(None, "0 0 2 * * *", now).unwrap();
        assert_eq!(fallback.format("%H:%M:%S").to_string(), "02:00:00");

        // Blank override falls through to the default.
        let blank = next_run_for(Some("  "), "0 0 2 * * *", now).unwrap();
        assert_eq!(blank.format("%H:%M:%S").to_string(), "02:00:00");
    }

    #[test]
    fn test_next_run_for_invalid_cron_is_none() {
        let now = Utc::now();
        assert!(next_run_for(Some("not a cron"), "", now).is_none());
        assert!(next_run_for(None, "", now).is_none());
    }
}
