//! Fixture ingestion: fetch, resolve, dedup, merge and upsert.

pub mod merge;
pub mod teams;

use crate::config::Config;
use crate::error::ProviderError;
use crate::feed::{Batch, SharedProvider};
use crate::health::{Health, PipelineCounters};
use crate::model::{FixtureStatus, RawFixture};
use crate::store::FixtureStore;
use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use merge::{apply_update, merge_group, ResolvedFixture, Upsert};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use teams::TeamResolver;

/// Scheduled fixtures may be this far past kickoff before they count as stale.
pub const SCHEDULED_GRACE_MINUTES: i64 = 15;

/// Days before `now` included in the fetch window.
const WINDOW_DAYS_BEHIND: i64 = 1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub calls: usize,
    pub failed_calls: usize,
    pub fetched: usize,
    pub malformed: usize,
    pub unresolved: usize,
    pub stale_dropped: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected_transitions: usize,
    /// Keys created or changed by this run.
    pub changed_keys: BTreeSet<String>,
    /// Some provider call failed; the data is partial.
    pub degraded: bool,
}

enum CallKind {
    Fixtures(String),
    Live,
}

struct CallResult {
    provider: String,
    precedence: i32,
    kind: CallKind,
    result: Result<Batch<RawFixture>, ProviderError>,
}

pub struct FixtureIngestor {
    providers: Vec<SharedProvider>,
    store: Arc<dyn FixtureStore>,
    health: Arc<Health>,
}

impl FixtureIngestor {
    pub fn new(providers: Vec<SharedProvider>, store: Arc<dyn FixtureStore>, health: Arc<Health>) -> Self {
        Self {
            providers,
            store,
            health,
        }
    }

    pub async fn run(&self, config: &Config, now: DateTime<Utc>) -> IngestReport {
        let date_from = (now - Duration::days(WINDOW_DAYS_BEHIND)).date_naive();
        let date_to = (now + Duration::days(config.window_days_ahead)).date_naive();
        let competitions: BTreeSet<&str> = config.competitions.iter().map(|c| c.id.as_str()).collect();

        let mut calls = Vec::new();
        for provider in &self.providers {
            for competition in &competitions {
                if !provider.supports_competition(competition) {
                    continue;
                }
                let provider = provider.clone();
                let competition = competition.to_string();
                calls.push(async move {
                    let result = provider
                        .list_fixtures(&competition, date_from, date_to, &[])
                        .await;
                    CallResult {
                        provider: provider.name().to_string(),
                        precedence: provider.precedence(),
                        kind: CallKind::Fixtures(competition),
                        result,
                    }
                });
            }
        }
        let fixture_calls = join_all(calls);
        let live_calls = join_all(self.providers.iter().map(|provider| async move {
            CallResult {
                provider: provider.name().to_string(),
                precedence: provider.precedence(),
                kind: CallKind::Live,
                result: provider.list_live().await,
            }
        }));
        let (fixture_results, live_results) = futures_util::join!(fixture_calls, live_calls);

        let mut report = IngestReport::default();
        let resolver = TeamResolver::new(&config.teams);
        // fixture_key -> provider -> sighting; live sightings land last and win.
        let mut groups: BTreeMap<String, BTreeMap<String, ResolvedFixture>> = BTreeMap::new();

        for call in fixture_results.into_iter().chain(live_results) {
            report.calls += 1;
            let batch = match call.result {
                Ok(batch) => batch,
                Err(e) => {
                    report.failed_calls += 1;
                    report.degraded = true;
                    log_call_failure(&call.provider, &call.kind, &e);
                    continue;
                }
            };
            report.malformed += batch.malformed;
            for raw in batch.items {
                if !competitions.contains(raw.competition_id.as_str()) {
                    continue;
                }
                report.fetched += 1;
                if raw.status == FixtureStatus::Scheduled
                    && raw.kickoff < now - Duration::minutes(SCHEDULED_GRACE_MINUTES)
                {
                    report.stale_dropped += 1;
                    tracing::debug!(
                        provider = %raw.provider,
                        fixture = %raw.provider_fixture_id,
                        kickoff = %raw.kickoff,
                        "dropping scheduled fixture already past kickoff"
                    );
                    continue;
                }
                let (Some(home_key), Some(away_key)) =
                    (resolver.resolve(&raw.home.name), resolver.resolve(&raw.away.name))
                else {
                    report.unresolved += 1;
                    tracing::warn!(
                        provider = %raw.provider,
                        home = %raw.home.name,
                        away = %raw.away.name,
                        "unresolvable team name, fixture dropped"
                    );
                    continue;
                };
                if home_key == away_key {
                    report.unresolved += 1;
                    tracing::warn!(
                        provider = %raw.provider,
                        team_key = %home_key,
                        "both sides resolve to the same team, fixture dropped"
                    );
                    continue;
                }
                let provider = raw.provider.clone();
                let resolved = ResolvedFixture::new(raw, call.precedence, home_key, away_key);
                groups
                    .entry(resolved.fixture_key.clone())
                    .or_default()
                    .insert(provider, resolved);
            }
        }

        for (key, sightings) in groups {
            let Some(merged) = merge_group(sightings.into_values().collect(), now) else {
                continue;
            };
            let existing = self.store.get(&key);
            match apply_update(existing.as_ref(), merged) {
                Upsert::Created(fixture) => {
                    report.created += 1;
                    report.changed_keys.insert(key);
                    self.store.upsert(fixture);
                }
                Upsert::Changed(fixture) => {
                    report.updated += 1;
                    report.changed_keys.insert(key);
                    self.store.upsert(fixture);
                }
                Upsert::Unchanged => report.unchanged += 1,
                Upsert::RejectedTransition { from, to } => {
                    report.rejected_transitions += 1;
                    tracing::warn!(
                        fixture_key = %key,
                        from = from.as_str(),
                        to = to.as_str(),
                        "rejected status transition"
                    );
                }
            }
        }

        let counters = &self.health.counters;
        PipelineCounters::add(&counters.fixtures_upserted, (report.created + report.updated) as u64);
        PipelineCounters::add(&counters.fixtures_unresolved, report.unresolved as u64);
        PipelineCounters::add(&counters.fixtures_stale_dropped, report.stale_dropped as u64);
        PipelineCounters::add(&counters.transitions_rejected, report.rejected_transitions as u64);

        tracing::info!(
            calls = report.calls,
            failed = report.failed_calls,
            fetched = report.fetched,
            created = report.created,
            updated = report.updated,
            unresolved = report.unresolved,
            degraded = report.degraded,
            "ingest run complete"
        );
        report
    }
}

fn log_call_failure(provider: &str, kind: &CallKind, e: &ProviderError) {
    let call = match kind {
        CallKind::Fixtures(competition) => competition.as_str(),
        CallKind::Live => "live",
    };
    if e.is_rejection() {
        tracing::error!(provider, call, error = %e, "provider rejected fixture request");
    } else {
        tracing::warn!(provider, call, error = %e, "provider skipped for this run");
    }
}
