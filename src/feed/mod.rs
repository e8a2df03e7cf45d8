pub mod api_football;
pub mod football_data;
pub mod http;
pub mod mapping;
pub mod rate_limit;
pub mod retry;

use crate::config::{Config, ProviderConfig, ProviderKind};
use crate::error::ProviderError;
use crate::health::ProviderStats;
use crate::model::{Fixture, FixtureStatus, MarketOdds, RawFixture, TeamRef};
use async_trait::async_trait;
use chrono::NaiveDate;
use rate_limit::QuotaSnapshot;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Records parsed from one provider response. Records that failed
/// validation are counted in `malformed` and left out of `items`.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub malformed: usize,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            malformed: 0,
        }
    }
}

impl<T> Batch<T> {
    pub fn extend(&mut self, other: Batch<T>) {
        self.items.extend(other.items);
        self.malformed += other.malformed;
    }
}

/// Uniform capability set over one upstream data provider.
///
/// Implementations own their quota state; everything else is stateless.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &str;

    /// Lower is preferred, both for merging and for fallback.
    fn precedence(&self) -> i32;

    fn supports_competition(&self, competition_id: &str) -> bool;

    async fn list_fixtures(
        &self,
        competition_id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
        statuses: &[FixtureStatus],
    ) -> Result<Batch<RawFixture>, ProviderError>;

    /// Most recent finished matches of `team`, newest first.
    async fn list_recent_finished(
        &self,
        team: &TeamRef,
        limit: usize,
    ) -> Result<Batch<RawFixture>, ProviderError>;

    async fn list_live(&self) -> Result<Batch<RawFixture>, ProviderError>;

    /// 1X2 odds for the fixture. `Ok(None)` when the provider has no market
    /// for it; providers without an odds endpoint return `Unsupported`.
    async fn get_market_odds(&self, _fixture: &Fixture) -> Result<Option<MarketOdds>, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: self.name().to_string(),
        })
    }

    fn quota(&self) -> QuotaSnapshot;
}

pub type SharedProvider = Arc<dyn ProviderClient>;

/// Build every configured provider, sorted by precedence. All providers share
/// one in-flight limit.
pub fn build_providers(
    config: &Config,
    stats: &crate::health::Health,
) -> anyhow::Result<Vec<SharedProvider>> {
    let in_flight = Arc::new(Semaphore::new(config.max_in_flight_requests));
    let mut out: Vec<SharedProvider> = Vec::new();
    for provider in config.providers_by_precedence() {
        let provider_stats = stats.provider(&provider.name);
        out.push(build_provider(config, provider, in_flight.clone(), provider_stats)?);
    }
    Ok(out)
}

fn build_provider(
    config: &Config,
    provider: &ProviderConfig,
    in_flight: Arc<Semaphore>,
    stats: Arc<ProviderStats>,
) -> anyhow::Result<SharedProvider> {
    let auth_value = crate::config::resolve_secret(&provider.auth_value)?;
    let transport = http::HttpTransport::new(provider, auth_value, in_flight, stats)?;
    let mapping = mapping::CompetitionMap::new(config, provider);
    Ok(match provider.kind {
        ProviderKind::FootballData => Arc::new(football_data::FootballData::new(
            transport,
            mapping,
            provider.precedence,
        )),
        ProviderKind::ApiFootball => Arc::new(api_football::ApiFootball::new(
            transport,
            mapping,
            provider.precedence,
            provider.season,
        )),
    })
}

/// Status filter shared by the adapters; empty means "everything".
pub(crate) fn status_allowed(statuses: &[FixtureStatus], status: FixtureStatus) -> bool {
    statuses.is_empty() || statuses.contains(&status)
}
