//! football-data.org v4 adapter.

use super::http::HttpTransport;
use super::mapping::{football_data_status, parse_kickoff, CompetitionMap};
use super::rate_limit::QuotaSnapshot;
use super::{status_allowed, Batch, ProviderClient};
use crate::error::ProviderError;
use crate::model::{FixtureStatus, RawFixture, RawTeam, Score, TeamRef};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

pub struct FootballData {
    transport: HttpTransport,
    competitions: CompetitionMap,
    precedence: i32,
}

impl FootballData {
    pub fn new(transport: HttpTransport, competitions: CompetitionMap, precedence: i32) -> Self {
        Self {
            transport,
            competitions,
            precedence,
        }
    }

    fn finish(&self, batch: Batch<RawFixture>) -> Batch<RawFixture> {
        if batch.malformed > 0 {
            tracing::warn!(
                provider = self.name(),
                malformed = batch.malformed,
                "dropped malformed match records"
            );
            self.transport.record_malformed(batch.malformed);
        }
        batch
    }
}

#[async_trait]
impl ProviderClient for FootballData {
    fn name(&self) -> &str {
        self.transport.provider()
    }

    fn precedence(&self) -> i32 {
        self.precedence
    }

    fn supports_competition(&self, competition_id: &str) -> bool {
        self.competitions.contains(competition_id)
    }

    async fn list_fixtures(
        &self,
        competition_id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
        statuses: &[FixtureStatus],
    ) -> Result<Batch<RawFixture>, ProviderError> {
        let entry = self
            .competitions
            .get(competition_id)
            .ok_or_else(|| ProviderError::UnknownCompetition {
                provider: self.name().to_string(),
                competition: competition_id.to_string(),
            })?;
        let path = format!("/competitions/{}/matches", entry.provider_id);
        let query = [
            ("dateFrom", date_from.format("%Y-%m-%d").to_string()),
            ("dateTo", date_to.format("%Y-%m-%d").to_string()),
        ];
        let list: MatchList = self.transport.get_json(&path, &query).await?;
        let mut batch = convert_matches(self.name(), list, &self.competitions);
        batch.items.retain(|f| status_allowed(statuses, f.status));
        // Everything under /competitions/{id} belongs to the requested competition.
        for fixture in &mut batch.items {
            fixture.competition_id = entry.internal_id.clone();
            if let Some(name) = &entry.name {
                fixture.competition_name = name.clone();
            }
        }
        Ok(self.finish(batch))
    }

    async fn list_recent_finished(
        &self,
        team: &TeamRef,
        limit: usize,
    ) -> Result<Batch<RawFixture>, ProviderError> {
        let team_id = team
            .provider_id(self.name())
            .ok_or_else(|| ProviderError::UnknownTeam {
                provider: self.name().to_string(),
                team_key: team.key.clone(),
            })?;
        let path = format!("/teams/{team_id}/matches");
        let query = [
            ("status", "FINISHED".to_string()),
            ("limit", limit.to_string()),
        ];
        let list: MatchList = self.transport.get_json(&path, &query).await?;
        let mut batch = convert_matches(self.name(), list, &self.competitions);
        batch
            .items
            .retain(|f| f.status == FixtureStatus::Finished && f.score.is_some());
        batch.items.sort_by(|a, b| b.kickoff.cmp(&a.kickoff));
        batch.items.truncate(limit);
        Ok(self.finish(batch))
    }

    async fn list_live(&self) -> Result<Batch<RawFixture>, ProviderError> {
        let query = [("status", "LIVE".to_string())];
        let list: MatchList = self.transport.get_json("/matches", &query).await?;
        let mut batch = convert_matches(self.name(), list, &self.competitions);
        batch
            .items
            .retain(|f| self.competitions.contains(&f.competition_id));
        Ok(self.finish(batch))
    }

    fn quota(&self) -> QuotaSnapshot {
        self.transport.quota()
    }
}

// ── Wire format ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct MatchList {
    #[serde(default)]
    matches: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FdMatch {
    id: u64,
    utc_date: String,
    status: String,
    competition: Option<FdCompetition>,
    area: Option<FdArea>,
    venue: Option<String>,
    home_team: FdTeam,
    away_team: FdTeam,
    score: Option<FdScore>,
}

#[derive(Deserialize)]
struct FdCompetition {
    code: Option<String>,
    id: Option<u64>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct FdArea {
    name: Option<String>,
}

#[derive(Deserialize)]
struct FdTeam {
    id: Option<u64>,
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FdScore {
    full_time: Option<FdGoals>,
}

#[derive(Deserialize)]
struct FdGoals {
    home: Option<u16>,
    away: Option<u16>,
}

/// Parse a `/matches` style response body.
pub fn parse_matches(
    provider: &str,
    json: &str,
    competitions: &CompetitionMap,
) -> anyhow::Result<Batch<RawFixture>> {
    let list: MatchList = serde_json::from_str(json)?;
    Ok(convert_matches(provider, list, competitions))
}

fn convert_matches(provider: &str, list: MatchList, competitions: &CompetitionMap) -> Batch<RawFixture> {
    let mut batch = Batch::default();
    for value in list.matches {
        let converted = serde_json::from_value::<FdMatch>(value)
            .ok()
            .and_then(|m| convert_match(provider, m, competitions));
        match converted {
            Some(fixture) => batch.items.push(fixture),
            None => batch.malformed += 1,
        }
    }
    batch
}

fn convert_match(provider: &str, m: FdMatch, competitions: &CompetitionMap) -> Option<RawFixture> {
    let kickoff = parse_kickoff(&m.utc_date)?;
    let status = football_data_status(&m.status)?;
    let home = convert_team(m.home_team)?;
    let away = convert_team(m.away_team)?;

    let comp = m.competition.as_ref();
    let code = comp.and_then(|c| c.code.clone());
    let numeric_id = comp.and_then(|c| c.id).map(|id| id.to_string());
    // Configs may map either the short code ("PL") or the numeric id ("2021").
    let entry = code
        .as_deref()
        .and_then(|c| competitions.from_provider(c))
        .or_else(|| numeric_id.as_deref().and_then(|id| competitions.from_provider(id)));
    let competition_id = entry
        .map(|e| e.internal_id.clone())
        .or(code)
        .or(numeric_id)
        .unwrap_or_default();
    let competition_name = entry
        .and_then(|e| e.name.clone())
        .or_else(|| comp.and_then(|c| c.name.clone()))
        .unwrap_or_else(|| competition_id.clone());
    let country = m
        .area
        .and_then(|a| a.name)
        .or_else(|| entry.map(|e| e.country.clone()))
        .filter(|c| !c.is_empty());

    let score = m
        .score
        .and_then(|s| s.full_time)
        .and_then(|g| Some(Score { home: g.home?, away: g.away? }));

    Some(RawFixture {
        provider: provider.to_string(),
        provider_fixture_id: m.id.to_string(),
        kickoff,
        competition_id,
        competition_name,
        country,
        home,
        away,
        venue: m.venue.filter(|v| !v.trim().is_empty()),
        status,
        score,
    })
}

fn convert_team(team: FdTeam) -> Option<RawTeam> {
    let name = team.name.filter(|n| !n.trim().is_empty())?;
    Some(RawTeam {
        id: team.id.map(|id| id.to_string()).unwrap_or_default(),
        name,
    })
}
