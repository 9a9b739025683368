//! Tests for the housekeeping run coordinator.
//!
//! These tests verify the decision state machine: mutual exclusion under
//! concurrent triggers, monotonic attempt numbering across retries,
//! skip-when-nothing-eligible, and the query surface over the run ledger.

use std::env;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serial_test::serial;
use sqlx::Row;

use scour::{
    Database, EventDefinition, EventRegistry, HousekeepingConfig, HousekeepingService, JobType,
    RunStatus, TriggerType,
};

const EVENT_KEY: &str = "payments.in";
const SUCCESS_TABLE: &str = "payments_in_success";
const FAILURE_TABLE: &str = "payments_in_failure";
const GUARDED_TABLE: &str = "payments_in_failure_guarded";

/// Helper to create a test database connection.
async fn setup_db() -> Option<Database> {
    let database_url = match env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping test: DATABASE_URL not set");
            return None;
        }
    };

    let db = Database::connect(&database_url).await.ok()?;
    prepare_tables(&db).await.ok()?;
    Some(db)
}

/// Create the event tables and wipe all state before each test.
async fn prepare_tables(db: &Database) -> Result<()> {
    for table in [SUCCESS_TABLE, FAILURE_TABLE, GUARDED_TABLE] {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                 id BIGSERIAL PRIMARY KEY,
                 event_datetime TIMESTAMPTZ NOT NULL,
                 payload TEXT
             )"
        ))
        .execute(db.pool())
        .await?;
    }
    sqlx::query("DROP TRIGGER IF EXISTS reject_deletes ON payments_in_failure_guarded")
        .execute(db.pool())
        .await?;
    sqlx::query(&format!(
        "TRUNCATE housekeeping_run_items, housekeeping_runs, housekeeping_daily, \
         replay_items, replay_jobs, {SUCCESS_TABLE}, {FAILURE_TABLE}, {GUARDED_TABLE} CASCADE"
    ))
    .execute(db.pool())
    .await?;
    Ok(())
}

/// Make every DELETE against the guarded table raise, so a retention run
/// fails after its success-table purge.
async fn arm_delete_guard(db: &Database) -> Result<()> {
    sqlx::query(
        "CREATE OR REPLACE FUNCTION reject_deletes() RETURNS trigger AS $$ \
         BEGIN RAISE EXCEPTION 'deletes rejected'; END $$ LANGUAGE plpgsql",
    )
    .execute(db.pool())
    .await?;
    sqlx::query(
        "CREATE TRIGGER reject_deletes BEFORE DELETE ON payments_in_failure_guarded \
         FOR EACH ROW EXECUTE FUNCTION reject_deletes()",
    )
    .execute(db.pool())
    .await?;
    Ok(())
}

async fn disarm_delete_guard(db: &Database) -> Result<()> {
    sqlx::query("DROP TRIGGER IF EXISTS reject_deletes ON payments_in_failure_guarded")
        .execute(db.pool())
        .await?;
    Ok(())
}

fn event(key: &str, success_table: &str, failure_table: &str) -> EventDefinition {
    EventDefinition {
        key: key.to_string(),
        name: key.to_string(),
        category: None,
        success_table: success_table.to_string(),
        failure_table: failure_table.to_string(),
        retention_days: None,
        retention_cron: None,
    }
}

fn test_config(batch_size: i64) -> HousekeepingConfig {
    HousekeepingConfig { batch_size, ..HousekeepingConfig::default() }
}

fn service_with(db: &Database, definitions: Vec<EventDefinition>, batch_size: i64) -> HousekeepingService {
    let registry = Arc::new(EventRegistry::new(definitions).expect("valid registry"));
    HousekeepingService::new(db.clone(), registry, test_config(batch_size))
}

fn default_service(db: &Database, batch_size: i64) -> HousekeepingService {
    service_with(db, vec![event(EVENT_KEY, SUCCESS_TABLE, FAILURE_TABLE)], batch_size)
}

async fn insert_event_rows(
    db: &Database,
    table: &str,
    count: i64,
    event_datetime: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO {table} (event_datetime, payload) \
         SELECT $1, 'row-' || g FROM generate_series(1, $2) g"
    ))
    .bind(event_datetime)
    .bind(count)
    .execute(db.pool())
    .await?;
    Ok(())
}

async fn count_table(db: &Database, table: &str) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(db.pool())
        .await?;
    Ok(count)
}

async fn count_runs(db: &Database) -> Result<i64> {
    Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM housekeeping_runs")
        .fetch_one(db.pool())
        .await?)
}

// =============================================================================
// Decision Tests
// =============================================================================

#[tokio::test]
#[serial]
async fn test_skip_when_nothing_eligible() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };
    let service = default_service(&db, 500);

    let outcome = service.run_retention(EVENT_KEY, TriggerType::Manual, None).await?;

    assert_eq!(outcome.status, RunStatus::Skipped.as_str());
    assert_eq!(count_runs(&db).await?, 0, "a skipped decision must not create a run record");

    // The refresh still materialized a READY snapshot with zero eligible rows.
    let row = sqlx::query(
        "SELECT last_status, eligible_total FROM housekeeping_daily \
         WHERE job_type = 'RETENTION' AND event_key = $1",
    )
    .bind(EVENT_KEY)
    .fetch_one(db.pool())
    .await?;
    let last_status: String = row.get("last_status");
    let eligible_total: i64 = row.get("eligible_total");
    assert_eq!(last_status, "READY");
    assert_eq!(eligible_total, 0);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_retention_scenario_three_batches() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };
    // retention_days = 7, runDate 2024-03-10 -> cutoff 2024-03-03
    let service = default_service(&db, 500);
    let run_date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();

    let old = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    insert_event_rows(&db, SUCCESS_TABLE, 1200, old).await?;

    let outcome = service
        .run_retention(EVENT_KEY, TriggerType::Manual, Some(run_date))
        .await?;

    assert_eq!(outcome.status, RunStatus::Completed.as_str());
    assert_eq!(outcome.cutoff_date, NaiveDate::from_ymd_opt(2024, 3, 3).unwrap());
    assert_eq!(outcome.attempt, 1);
    assert_eq!(outcome.deleted_success, 1200);
    assert_eq!(outcome.deleted_failure, 0);
    assert_eq!(outcome.deleted_total, 1200);
    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.items[0].event_key, EVENT_KEY);
    assert_eq!(outcome.items[0].deleted_success, 1200);

    assert_eq!(count_table(&db, SUCCESS_TABLE).await?, 0);
    assert_eq!(count_runs(&db).await?, 1);

    // Post-run snapshot refresh re-baselined eligibility to zero.
    let row = sqlx::query(
        "SELECT last_status, eligible_total FROM housekeeping_daily \
         WHERE job_type = 'RETENTION' AND event_key = $1 AND run_date = $2",
    )
    .bind(EVENT_KEY)
    .bind(run_date)
    .fetch_one(db.pool())
    .await?;
    let last_status: String = row.get("last_status");
    let eligible_total: i64 = row.get("eligible_total");
    assert_eq!(last_status, "COMPLETED");
    assert_eq!(eligible_total, 0);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_mutual_exclusion_concurrent_triggers() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };
    // Small batches over a large backlog keep the winner RUNNING long enough
    // for the loser to observe it.
    let service = Arc::new(default_service(&db, 100));
    let old = Utc::now() - Duration::days(30);
    insert_event_rows(&db, SUCCESS_TABLE, 5000, old).await?;

    let left = {
        let service = service.clone();
        tokio::spawn(async move { service.run_retention(EVENT_KEY, TriggerType::Manual, None).await })
    };
    let right = {
        let service = service.clone();
        tokio::spawn(async move { service.run_retention(EVENT_KEY, TriggerType::Manual, None).await })
    };

    let left = left.await??;
    let right = right.await??;

    let mut statuses = [left.status.as_str(), right.status.as_str()];
    statuses.sort();
    assert_eq!(
        statuses,
        ["COMPLETED", "SKIPPED"],
        "exactly one trigger wins, the other skips"
    );

    assert_eq!(count_runs(&db).await?, 1, "only the winner may create a run record");
    assert_eq!(count_table(&db, SUCCESS_TABLE).await?, 0);

    // The skipped outcome references the winner's run.
    let winner = if left.status == "COMPLETED" { &left } else { &right };
    let loser = if left.status == "COMPLETED" { &right } else { &left };
    assert_eq!(loser.id, winner.id);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_monotonic_attempts_and_idempotent_retry() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };
    let service = service_with(&db, vec![event(EVENT_KEY, SUCCESS_TABLE, GUARDED_TABLE)], 100);

    let old = Utc::now() - Duration::days(30);
    insert_event_rows(&db, SUCCESS_TABLE, 300, old).await?;
    insert_event_rows(&db, GUARDED_TABLE, 200, old).await?;
    arm_delete_guard(&db).await?;

    // Attempt 1: success table drains, the failure table purge raises.
    let err = service
        .run_retention(EVENT_KEY, TriggerType::Manual, None)
        .await
        .expect_err("guarded deletes must fail the run");
    assert!(err.to_string().contains("deletes rejected"));
    assert_eq!(count_table(&db, SUCCESS_TABLE).await?, 0);
    assert_eq!(count_table(&db, GUARDED_TABLE).await?, 200);

    // Attempt 2: still failing.
    service
        .run_retention(EVENT_KEY, TriggerType::Manual, None)
        .await
        .expect_err("still guarded");

    // Attempt 3: guard removed, the retry drains exactly the remainder.
    disarm_delete_guard(&db).await?;
    let outcome = service.run_retention(EVENT_KEY, TriggerType::Manual, None).await?;
    assert_eq!(outcome.status, RunStatus::Completed.as_str());
    assert_eq!(outcome.attempt, 3);
    assert_eq!(outcome.deleted_success, 0);
    assert_eq!(outcome.deleted_failure, 200);
    assert_eq!(count_table(&db, GUARDED_TABLE).await?, 0);

    // Attempts are exactly 1..3, no gaps or repeats, and each failed
    // attempt's item reflects only what it actually deleted.
    let rows = sqlx::query(
        "SELECT r.attempt, r.status, i.deleted_success, i.deleted_failure \
         FROM housekeeping_runs r \
         JOIN housekeeping_run_items i ON i.run_id = r.id \
         ORDER BY r.attempt",
    )
    .fetch_all(db.pool())
    .await?;
    assert_eq!(rows.len(), 3);

    let attempts: Vec<i32> = rows.iter().map(|row| row.get("attempt")).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let statuses: Vec<String> = rows.iter().map(|row| row.get("status")).collect();
    assert_eq!(statuses, vec!["FAILED", "FAILED", "COMPLETED"]);

    let item_success: Vec<i64> = rows.iter().map(|row| row.get("deleted_success")).collect();
    let item_failure: Vec<i64> = rows.iter().map(|row| row.get("deleted_failure")).collect();
    assert_eq!(item_success, vec![300, 0, 0]);
    assert_eq!(item_failure, vec![0, 0, 200]);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_failed_run_records_error_and_daily_state() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };
    let service = service_with(&db, vec![event(EVENT_KEY, SUCCESS_TABLE, GUARDED_TABLE)], 100);

    let old = Utc::now() - Duration::days(30);
    insert_event_rows(&db, GUARDED_TABLE, 50, old).await?;
    arm_delete_guard(&db).await?;

    service
        .run_retention(EVENT_KEY, TriggerType::Manual, None)
        .await
        .expect_err("guarded deletes must fail the run");

    let row = sqlx::query(
        "SELECT status, error_message FROM housekeeping_runs WHERE attempt = 1",
    )
    .fetch_one(db.pool())
    .await?;
    let status: String = row.get("status");
    let error_message: Option<String> = row.get("error_message");
    assert_eq!(status, "FAILED");
    assert!(error_message.unwrap_or_default().contains("deletes rejected"));

    let row = sqlx::query(
        "SELECT last_status, last_error FROM housekeeping_daily \
         WHERE job_type = 'RETENTION' AND event_key = $1",
    )
    .bind(EVENT_KEY)
    .fetch_one(db.pool())
    .await?;
    let last_status: String = row.get("last_status");
    let last_error: Option<String> = row.get("last_error");
    assert_eq!(last_status, "FAILED", "a FAILED snapshot is what allows the retry");
    assert!(last_error.unwrap_or_default().contains("deletes rejected"));

    Ok(())
}

// =============================================================================
// Query Surface Tests
// =============================================================================

#[tokio::test]
#[serial]
async fn test_status_and_listings_after_run() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };
    let service = default_service(&db, 500);
    let run_date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();

    let old = Utc.with_ymd_and_hms(2024, 2, 20, 8, 0, 0).unwrap();
    insert_event_rows(&db, SUCCESS_TABLE, 40, old).await?;
    insert_event_rows(&db, FAILURE_TABLE, 10, old).await?;

    let outcome = service
        .run_retention(EVENT_KEY, TriggerType::Manual, Some(run_date))
        .await?;
    assert_eq!(outcome.status, RunStatus::Completed.as_str());

    let status = service
        .status(JobType::Retention, Some(EVENT_KEY), Some(run_date))
        .await?
        .expect("status must exist after a run");
    assert_eq!(status.id, outcome.id);
    assert_eq!(status.status, RunStatus::Completed.as_str());
    assert_eq!(status.deleted_success, 40);
    assert_eq!(status.deleted_failure, 10);
    assert_eq!(status.items.len(), 1);

    let runs = service
        .list_runs_for_date(JobType::Retention, Some(EVENT_KEY), Some(run_date))
        .await?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].attempt, 1);

    let history = service.list_runs(JobType::Retention, 10).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event_count, 1);
    assert_eq!(history[0].event_keys.as_deref(), Some(EVENT_KEY));

    let daily = service.list_daily(JobType::Retention, Some(EVENT_KEY), 10).await?;
    assert!(!daily.is_empty());

    let summary = service
        .list_run_summary(JobType::Retention, Some(EVENT_KEY), 10, 0)
        .await?;
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].attempts, 1);
    assert_eq!(summary[0].deleted_total, 50);
    assert_eq!(summary[0].latest_status, "COMPLETED");

    // Status for a date with no runs is absent.
    let missing = service
        .status(JobType::Retention, Some(EVENT_KEY), Some(run_date + Duration::days(1)))
        .await?;
    assert!(missing.is_none());

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_snapshot_refresh_never_downgrades_status() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };
    let service = default_service(&db, 500);
    let run_date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();

    let old = Utc.with_ymd_and_hms(2024, 2, 20, 8, 0, 0).unwrap();
    insert_event_rows(&db, SUCCESS_TABLE, 5, old).await?;
    service.run_retention(EVENT_KEY, TriggerType::Manual, Some(run_date)).await?;

    // A forced preview recompute rewrites eligibility only.
    service.preview(JobType::Retention, Some(EVENT_KEY), true).await?;

    let row = sqlx::query(
        "SELECT last_status FROM housekeeping_daily \
         WHERE job_type = 'RETENTION' AND event_key = $1 AND run_date = $2",
    )
    .bind(EVENT_KEY)
    .bind(run_date)
    .fetch_one(db.pool())
    .await?;
    let last_status: String = row.get("last_status");
    assert_eq!(last_status, "COMPLETED");

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_run_now_fans_out_across_events() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };
    for table in ["orders_out_success", "orders_out_failure"] {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                 id BIGSERIAL PRIMARY KEY,
                 event_datetime TIMESTAMPTZ NOT NULL,
                 payload TEXT
             )"
        ))
        .execute(db.pool())
        .await?;
        sqlx::query(&format!("TRUNCATE {table}")).execute(db.pool()).await?;
    }

    let service = service_with(
        &db,
        vec![
            event(EVENT_KEY, SUCCESS_TABLE, FAILURE_TABLE),
            event("orders.out", "orders_out_success", "orders_out_failure"),
        ],
        500,
    );

    let old = Utc::now() - Duration::days(30);
    insert_event_rows(&db, SUCCESS_TABLE, 25, old).await?;

    let outcomes = service.run_now(JobType::Retention, None, None).await?;
    assert_eq!(outcomes.len(), 2);

    let payments = outcomes.iter().find(|o| o.event_key == EVENT_KEY).unwrap();
    let orders = outcomes.iter().find(|o| o.event_key == "orders.out").unwrap();
    assert_eq!(payments.status, RunStatus::Completed.as_str());
    assert_eq!(payments.deleted_success, 25);
    assert_eq!(orders.status, RunStatus::Skipped.as_str(), "nothing eligible for orders");

    // The ALL rollup sees the single completed run.
    let all = service
        .status(JobType::Retention, None, None)
        .await?
        .expect("rollup status present");
    assert_eq!(all.event_key, "ALL");
    assert_eq!(all.status, RunStatus::Completed.as_str());
    assert_eq!(all.deleted_success, 25);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_preview_uses_cached_snapshot() -> Result<()> {
    let Some(db) = setup_db().await else {
        return Ok(());
    };
    let service = default_service(&db, 500);

    let old = Utc::now() - Duration::days(30);
    insert_event_rows(&db, SUCCESS_TABLE, 12, old).await?;
    insert_event_rows(&db, FAILURE_TABLE, 3, old).await?;

    // First preview recomputes and persists the snapshot.
    let fresh = service.preview(JobType::Retention, Some(EVENT_KEY), false).await?;
    assert_eq!(fresh.eligible_success, 12);
    assert_eq!(fresh.eligible_failure, 3);
    assert_eq!(fresh.eligible_total, 15);
    assert!(fresh.next_run_at.is_some());

    // New arrivals do not disturb the cached numbers until a refresh.
    insert_event_rows(&db, SUCCESS_TABLE, 100, old).await?;
    let cached = service.preview(JobType::Retention, Some(EVENT_KEY), false).await?;
    assert_eq!(cached.eligible_total, 15);

    let refreshed = service.preview(JobType::Retention, Some(EVENT_KEY), true).await?;
    assert_eq!(refreshed.eligible_total, 115);

    Ok(())
}
