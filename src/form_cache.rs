//! Team form cache with TTL and per-key single-flight refresh.

use crate::feed::SharedProvider;
use crate::health::{Health, PipelineCounters};
use crate::ingest::teams::{normalise_name, TeamResolver};
use crate::model::{FormEntry, MatchResult, TeamForm, TeamRef};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, Copy)]
pub struct FormSettings {
    pub ttl: Duration,
    pub window: usize,
}

impl FormSettings {
    pub fn new(ttl_seconds: u64, window: usize) -> Self {
        Self {
            ttl: Duration::seconds(ttl_seconds as i64),
            window,
        }
    }
}

pub struct FormCache {
    providers: Vec<SharedProvider>,
    resolver: TeamResolver,
    health: Arc<Health>,
    entries: RwLock<HashMap<String, TeamForm>>,
    fill_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FormCache {
    /// `providers` must already be sorted by precedence.
    pub fn new(providers: Vec<SharedProvider>, resolver: TeamResolver, health: Arc<Health>) -> Self {
        Self {
            providers,
            resolver,
            health,
            entries: RwLock::new(HashMap::new()),
            fill_locks: Mutex::new(HashMap::new()),
        }
    }

    fn fresh(&self, team_key: &str, settings: &FormSettings, now: DateTime<Utc>) -> Option<TeamForm> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(team_key)
            .filter(|f| !f.degraded && f.age(now) < settings.ttl)
            .cloned()
    }

    fn fill_lock(&self, team_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.fill_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(team_key.to_string()).or_default().clone()
    }

    /// Cached entry regardless of age.
    pub fn peek(&self, team_key: &str) -> Option<TeamForm> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(team_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Form for `team`, refreshing through the providers when missing or older
    /// than the TTL. Concurrent callers for the same team share one refresh.
    pub async fn get(&self, team: &TeamRef, settings: &FormSettings, now: DateTime<Utc>) -> TeamForm {
        let counters = &self.health.counters;
        if let Some(form) = self.fresh(&team.key, settings, now) {
            PipelineCounters::add(&counters.form_cache_hits, 1);
            return form;
        }

        let lock = self.fill_lock(&team.key);
        let form = {
            let _guard = lock.lock().await;
            self.refresh(team, settings, now).await
        };
        self.release_fill_lock(&team.key, lock);
        form
    }

    /// Drop the key's lock from the map once no other caller holds it.
    fn release_fill_lock(&self, team_key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.fill_locks.lock().unwrap_or_else(|e| e.into_inner());
        let idle = locks
            .get(team_key)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(team_key);
        }
    }

    /// Runs under the key's fill lock.
    async fn refresh(&self, team: &TeamRef, settings: &FormSettings, now: DateTime<Utc>) -> TeamForm {
        let counters = &self.health.counters;
        if let Some(form) = self.fresh(&team.key, settings, now) {
            PipelineCounters::add(&counters.form_cache_hits, 1);
            return form;
        }

        if let Some(form) = self.fetch(team, settings, now).await {
            PipelineCounters::add(&counters.form_cache_fills, 1);
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.insert(team.key.clone(), form.clone());
            return form;
        }

        PipelineCounters::add(&counters.form_degraded, 1);
        let mut fallback = self
            .peek(&team.key)
            .unwrap_or_else(|| TeamForm::neutral(&team.key, now));
        fallback.degraded = true;
        tracing::warn!(
            team_key = %team.key,
            sample_size = fallback.sample_size,
            "no provider could refresh team form, serving degraded entry"
        );
        fallback
    }

    /// Try providers in precedence order; first success wins.
    async fn fetch(&self, team: &TeamRef, settings: &FormSettings, now: DateTime<Utc>) -> Option<TeamForm> {
        for provider in &self.providers {
            let Some(team_id) = team.provider_id(provider.name()) else {
                continue;
            };
            match provider.list_recent_finished(team, settings.window).await {
                Ok(batch) => {
                    let entries = batch
                        .items
                        .iter()
                        .filter_map(|result| self.entry_for(result, team_id, &team.name))
                        .collect();
                    let form = TeamForm::from_entries(&team.key, entries, settings.window, now);
                    tracing::debug!(
                        team_key = %team.key,
                        provider = provider.name(),
                        sample_size = form.sample_size,
                        "team form refreshed"
                    );
                    return Some(form);
                }
                Err(e) => {
                    tracing::warn!(
                        team_key = %team.key,
                        provider = provider.name(),
                        error = %e,
                        "form refresh failed, trying next provider"
                    );
                }
            }
        }
        None
    }

    /// Side-aware view of one result. Matches the team by provider id, then
    /// by normalised name.
    fn entry_for(&self, result: &MatchResult, team_id: &str, team_name: &str) -> Option<FormEntry> {
        let name = normalise_name(team_name);
        let was_home = if result.home.id == team_id {
            true
        } else if result.away.id == team_id {
            false
        } else if normalise_name(&result.home.name) == name {
            true
        } else if normalise_name(&result.away.name) == name {
            false
        } else {
            return None;
        };
        let opponent = if was_home { &result.away } else { &result.home };
        let opponent_key = self
            .resolver
            .resolve(&opponent.name)
            .unwrap_or_else(|| normalise_name(&opponent.name));
        FormEntry::from_result(result, was_home, opponent_key)
    }
}
