//! Process-wide counters and the `/health` status document.

use crate::feed::rate_limit::QuotaSnapshot;
use crate::feed::retry::{classify_status, StatusClass};
use crate::feed::SharedProvider;
use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

// ── Provider statistics ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct ProviderNotes {
    reported_remaining: Option<u64>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

/// Call counters for one provider, updated by its HTTP transport.
#[derive(Debug, Default)]
pub struct ProviderStats {
    requests: AtomicU64,
    ok: AtomicU64,
    rate_limited: AtomicU64,
    server_errors: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
    timeouts: AtomicU64,
    transport_errors: AtomicU64,
    quota_exhausted: AtomicU64,
    notes: Mutex<ProviderNotes>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct ProviderStatsSnapshot {
    pub requests: u64,
    pub ok: u64,
    pub rate_limited: u64,
    pub server_errors: u64,
    pub rejected: u64,
    pub malformed: u64,
    pub timeouts: u64,
    pub transport_errors: u64,
    pub quota_exhausted: u64,
    /// Remaining calls as reported by the provider's own headers.
    pub reported_remaining: Option<u64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl ProviderStats {
    fn notes(&self) -> std::sync::MutexGuard<'_, ProviderNotes> {
        self.notes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_status(&self, status: u16) {
        match classify_status(status) {
            StatusClass::Success => bump(&self.ok),
            StatusClass::RateLimited => bump(&self.rate_limited),
            StatusClass::ServerError => bump(&self.server_errors),
            StatusClass::ClientError => {}
        }
    }

    pub fn record_rejection(&self, detail: &str) {
        bump(&self.rejected);
        let mut notes = self.notes();
        notes.last_error = Some(detail.to_string());
        notes.last_error_at = Some(Utc::now());
    }

    pub fn record_malformed(&self, count: u64) {
        self.malformed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        bump(&self.timeouts);
    }

    pub fn record_transport_error(&self) {
        bump(&self.transport_errors);
    }

    pub fn record_quota_exhausted(&self) {
        bump(&self.quota_exhausted);
    }

    pub fn set_reported_remaining(&self, remaining: u64) {
        self.notes().reported_remaining = Some(remaining);
    }

    pub fn snapshot(&self) -> ProviderStatsSnapshot {
        let notes = self.notes();
        ProviderStatsSnapshot {
            requests: read(&self.requests),
            ok: read(&self.ok),
            rate_limited: read(&self.rate_limited),
            server_errors: read(&self.server_errors),
            rejected: read(&self.rejected),
            malformed: read(&self.malformed),
            timeouts: read(&self.timeouts),
            transport_errors: read(&self.transport_errors),
            quota_exhausted: read(&self.quota_exhausted),
            reported_remaining: notes.reported_remaining,
            last_error: notes.last_error.clone(),
            last_error_at: notes.last_error_at,
        }
    }
}

// ── Pipeline counters ────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub fixtures_upserted: AtomicU64,
    pub fixtures_unresolved: AtomicU64,
    pub fixtures_stale_dropped: AtomicU64,
    pub transitions_rejected: AtomicU64,
    pub form_cache_hits: AtomicU64,
    pub form_cache_fills: AtomicU64,
    pub form_degraded: AtomicU64,
    pub predictions_made: AtomicU64,
    pub predictions_skipped: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_failed: AtomicU64,
    pub subscribers_muted: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct CountersSnapshot {
    pub fixtures_upserted: u64,
    pub fixtures_unresolved: u64,
    pub fixtures_stale_dropped: u64,
    pub transitions_rejected: u64,
    pub form_cache_hits: u64,
    pub form_cache_fills: u64,
    pub form_degraded: u64,
    pub predictions_made: u64,
    pub predictions_skipped: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub subscribers_muted: u64,
}

impl PipelineCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            fixtures_upserted: read(&self.fixtures_upserted),
            fixtures_unresolved: read(&self.fixtures_unresolved),
            fixtures_stale_dropped: read(&self.fixtures_stale_dropped),
            transitions_rejected: read(&self.transitions_rejected),
            form_cache_hits: read(&self.form_cache_hits),
            form_cache_fills: read(&self.form_cache_fills),
            form_degraded: read(&self.form_degraded),
            predictions_made: read(&self.predictions_made),
            predictions_skipped: read(&self.predictions_skipped),
            messages_sent: read(&self.messages_sent),
            messages_failed: read(&self.messages_failed),
            subscribers_muted: read(&self.subscribers_muted),
        }
    }
}

// ── Job status ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Ok,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct JobStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_outcome: Option<JobOutcome>,
    pub consecutive_failures: u32,
    pub runs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub stats: ProviderStatsSnapshot,
    pub quota: QuotaSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// "ok" when every job's last run succeeded, otherwise "degraded".
    pub status: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub jobs: BTreeMap<String, JobStatus>,
    pub counters: CountersSnapshot,
    pub providers: BTreeMap<String, ProviderHealth>,
}

/// Shared health registry. Cheap to clone behind an `Arc`.
pub struct Health {
    started_at: DateTime<Utc>,
    pub counters: PipelineCounters,
    providers: Mutex<BTreeMap<String, Arc<ProviderStats>>>,
    quota_sources: RwLock<Vec<SharedProvider>>,
    jobs: Mutex<BTreeMap<String, JobStatus>>,
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

impl Health {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            counters: PipelineCounters::default(),
            providers: Mutex::new(BTreeMap::new()),
            quota_sources: RwLock::new(Vec::new()),
            jobs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Stats handle for `name`, created on first use.
    pub fn provider(&self, name: &str) -> Arc<ProviderStats> {
        let mut providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        providers.entry(name.to_string()).or_default().clone()
    }

    /// Providers whose quota should appear in the status document.
    pub fn attach_providers(&self, providers: &[SharedProvider]) {
        let mut sources = self.quota_sources.write().unwrap_or_else(|e| e.into_inner());
        *sources = providers.to_vec();
    }

    pub fn record_job(&self, job: &str, outcome: JobOutcome) {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let entry = jobs.entry(job.to_string()).or_default();
        entry.last_run = Some(now);
        entry.last_outcome = Some(outcome);
        entry.runs += 1;
        match outcome {
            JobOutcome::Ok | JobOutcome::Partial => {
                entry.last_success = Some(now);
                entry.consecutive_failures = 0;
            }
            JobOutcome::Failed => entry.consecutive_failures += 1,
        }
    }

    pub fn job(&self, job: &str) -> Option<JobStatus> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(job).cloned()
    }

    pub fn status(&self) -> HealthStatus {
        let now = Utc::now();
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let degraded = jobs
            .values()
            .any(|j| j.last_outcome.is_some_and(|o| o != JobOutcome::Ok));

        let quotas: BTreeMap<String, QuotaSnapshot> = self
            .quota_sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|p| (p.name().to_string(), p.quota()))
            .collect();
        let providers = self
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, stats)| {
                let health = ProviderHealth {
                    stats: stats.snapshot(),
                    quota: quotas.get(name).cloned().unwrap_or_default(),
                };
                (name.clone(), health)
            })
            .collect();

        HealthStatus {
            status: if degraded { "degraded" } else { "ok" },
            started_at: self.started_at,
            uptime_seconds: (now - self.started_at).num_seconds(),
            jobs,
            counters: self.counters.snapshot(),
            providers,
        }
    }
}

// ── HTTP endpoint ────────────────────────────────────────────────────

async fn health_handler(State(health): State<Arc<Health>>) -> Json<HealthStatus> {
    Json(health.status())
}

pub fn router(health: Arc<Health>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(health)
}

/// Serve `/health` on `listen` until `shutdown` flips to true.
pub async fn serve(
    listen: &str,
    health: Arc<Health>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind health endpoint on {listen}"))?;
    tracing::info!(%listen, "health endpoint listening");
    axum::serve(listener, router(health))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("health endpoint failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[test]
    fn test_provider_stats_counts_by_class() {
        let stats = ProviderStats::default();
        stats.record_request();
        stats.record_status(200);
        stats.record_request();
        stats.record_status(429);
        stats.record_request();
        stats.record_status(502);
        stats.record_rejection("football-data: request rejected (403)");
        stats.set_reported_remaining(42);

        let snap = stats.snapshot();
        assert_eq!(snap.requests, 3);
        assert_eq!(snap.ok, 1);
        assert_eq!(snap.rate_limited, 1);
        assert_eq!(snap.server_errors, 1);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.reported_remaining, Some(42));
        assert!(snap.last_error.unwrap().contains("403"));
    }

    #[test]
    fn test_provider_handle_is_shared() {
        let health = Health::new();
        health.provider("api-football").record_request();
        health.provider("api-football").record_request();
        assert_eq!(health.provider("api-football").snapshot().requests, 2);
    }

    #[test]
    fn test_job_outcomes_drive_status() {
        let health = Health::new();
        health.record_job("ingest", JobOutcome::Ok);
        assert_eq!(health.status().status, "ok");

        health.record_job("predict", JobOutcome::Failed);
        health.record_job("predict", JobOutcome::Failed);
        let status = health.status();
        assert_eq!(status.status, "degraded");
        assert_eq!(status.jobs["predict"].consecutive_failures, 2);
        assert_eq!(status.jobs["predict"].last_success, None);

        health.record_job("predict", JobOutcome::Ok);
        let job = health.job("predict").unwrap();
        assert_eq!(job.consecutive_failures, 0);
        assert!(job.last_success.is_some());
        assert_eq!(job.runs, 3);
    }

    #[tokio::test]
    async fn test_health_route_returns_json() {
        let health = Arc::new(Health::new());
        PipelineCounters::add(&health.counters.messages_sent, 3);
        let response = router(health)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["counters"]["messages_sent"], 3);
    }
}
