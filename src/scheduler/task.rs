//! Background tasks binding housekeeping jobs to their cron expressions.
//!
//! One tokio task per binding: it sleeps until the next cron fire, invokes
//! the coordinator, and swallows-and-logs any error so a failed tick never
//! takes the binding down or blocks the next day's trigger.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::HousekeepingConfig;
use crate::db::{JobType, TriggerType};
use crate::housekeeping::HousekeepingService;
use crate::registry::EventRegistry;

use super::utils::{next_cron_run, validate_cron};

/// What a scheduled tick should run.
#[derive(Debug, Clone)]
pub enum JobBinding {
    /// Retention purge for one event key.
    Retention(String),
    /// One of the audit purges.
    Audit(JobType),
    /// Snapshot refresh keeping previews warm.
    PreviewRefresh,
}

impl JobBinding {
    fn label(&self) -> String {
        match self {
            Self::Retention(key) => format!("retention:{key}"),
            Self::Audit(job_type) => job_type.as_str().to_lowercase(),
            Self::PreviewRefresh => "preview-refresh".to_string(),
        }
    }
}

/// Bind every configured job to its cron and spawn the loops.
///
/// A binding with a missing or invalid cron is logged and skipped; the
/// remaining bindings proceed. Returns the spawned handles so the caller
/// can abort them on shutdown.
pub fn spawn_scheduler(
    service: Arc<HousekeepingService>,
    registry: Arc<EventRegistry>,
    config: &HousekeepingConfig,
) -> Vec<JoinHandle<()>> {
    if !config.enabled {
        info!("housekeeping scheduler disabled by config");
        return Vec::new();
    }

    let mut handles = Vec::new();

    for definition in registry.all() {
        let cron = pick_cron(definition.retention_cron.as_deref(), Some(&config.cron));
        let Some(cron) = cron else {
            warn!(event_key = %definition.key, "no retention cron configured for event");
            continue;
        };
        if let Some(handle) = spawn_binding(
            service.clone(),
            JobBinding::Retention(definition.key.clone()),
            cron,
        ) {
            handles.push(handle);
        }
    }

    for (job_type, cron) in [
        (JobType::ReplayAudit, config.replay_audit_cron.as_str()),
        (JobType::HousekeepingAudit, config.housekeeping_audit_cron.as_str()),
    ] {
        let Some(cron) = pick_cron(Some(cron), None) else {
            warn!(job_type = %job_type, "no cron configured for audit job");
            continue;
        };
        if let Some(handle) = spawn_binding(service.clone(), JobBinding::Audit(job_type), cron) {
            handles.push(handle);
        }
    }

    match pick_cron(Some(&config.preview_cron), None) {
        Some(cron) => {
            if let Some(handle) = spawn_binding(service.clone(), JobBinding::PreviewRefresh, cron) {
                handles.push(handle);
            }
        }
        None => warn!("no cron configured for preview cache refresh"),
    }

    handles.push(spawn_warmup(service, config.warmup_delay_secs));

    handles
}

/// Spawn the cron loop for one binding, rejecting invalid expressions.
fn spawn_binding(
    service: Arc<HousekeepingService>,
    binding: JobBinding,
    cron: String,
) -> Option<JoinHandle<()>> {
    if let Err(err) = validate_cron(&cron) {
        warn!(job = %binding.label(), cron, error = %err, "invalid cron expression; binding skipped");
        return None;
    }
    info!(job = %binding.label(), cron, "scheduled housekeeping job");

    Some(tokio::spawn(async move {
        run_cron_loop(service, binding, cron).await;
    }))
}

async fn run_cron_loop(service: Arc<HousekeepingService>, binding: JobBinding, cron: String) {
    loop {
        let next = match next_cron_run(&cron, Utc::now()) {
            Ok(Some(next)) => next,
            Ok(None) => {
                warn!(job = %binding.label(), cron, "cron expression never fires again; stopping");
                return;
            }
            Err(err) => {
                warn!(job = %binding.label(), cron, error = %err, "cron evaluation failed; stopping");
                return;
            }
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        run_tick(&service, &binding).await;
    }
}

/// One scheduled invocation. Failures are recorded on the run ledger by the
/// coordinator; here they are only logged.
async fn run_tick(service: &HousekeepingService, binding: &JobBinding) {
    match binding {
        JobBinding::Retention(event_key) => {
            if let Err(err) = service
                .run_retention(event_key, TriggerType::Scheduled, None)
                .await
            {
                warn!(event_key = %event_key, error = %err, "scheduled retention run failed");
            }
        }
        JobBinding::Audit(job_type) => {
            if let Err(err) = service.run_audit(*job_type, TriggerType::Scheduled, None).await {
                warn!(job_type = %job_type, error = %err, "scheduled audit run failed");
            }
        }
        JobBinding::PreviewRefresh => {
            service.refresh_preview_cache().await;
        }
    }
}

/// One-shot preview warm-up shortly after startup.
fn spawn_warmup(service: Arc<HousekeepingService>, delay_secs: u64) -> JoinHandle<()> {
    info!(delay_secs, "scheduled preview cache warmup on startup");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(delay_secs)).await;
        service.refresh_preview_cache().await;
    })
}

/// Prefer the per-event cron, fall back to the default, reject blanks.
fn pick_cron(preferred: Option<&str>, fallback: Option<&str>) -> Option<String> {
    for candidate in [preferred, fallback].into_iter().flatten() {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    None
}
