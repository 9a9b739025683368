//! Cron evaluation utilities.
//!
//! Expressions are six-field (`sec min hour day month weekday`), evaluated
//! in UTC. The coordinator has no cron logic of its own; everything goes
//! through `next_cron_run`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

/// Check that a cron expression parses.
pub fn validate_cron(expr: &str) -> Result<(), cron::error::Error> {
    Schedule::from_str(expr).map(|_| ())
}

/// Next trigger instant strictly after `after`, or None if the expression
/// never fires again.
pub fn next_cron_run(
    expr: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, cron::error::Error> {
    let schedule = Schedule::from_str(expr)?;
    Ok(schedule.after(&after).next())
}
