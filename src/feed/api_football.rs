//! API-Football v3 adapter. Also provides 1X2 market odds.

use super::http::HttpTransport;
use super::mapping::{api_football_status, parse_kickoff, CompetitionMap};
use super::rate_limit::QuotaSnapshot;
use super::{status_allowed, Batch, ProviderClient};
use crate::error::ProviderError;
use crate::model::{Fixture, FixtureStatus, MarketOdds, RawFixture, RawTeam, Score, TeamRef};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde::Deserialize;

/// Hard stop on paging so a misbehaving upstream cannot burn the quota.
const MAX_PAGES: u32 = 10;

pub struct ApiFootball {
    transport: HttpTransport,
    competitions: CompetitionMap,
    precedence: i32,
    season: Option<u16>,
}

impl ApiFootball {
    pub fn new(
        transport: HttpTransport,
        competitions: CompetitionMap,
        precedence: i32,
        season: Option<u16>,
    ) -> Self {
        Self {
            transport,
            competitions,
            precedence,
            season,
        }
    }

    /// Fetch every page of a fixtures query.
    async fn fetch_fixtures(&self, query: Vec<(&str, String)>) -> Result<Batch<RawFixture>, ProviderError> {
        let mut batch = Batch::default();
        let mut page = 1u32;
        loop {
            let mut q = query.clone();
            if page > 1 {
                q.push(("page", page.to_string()));
            }
            let envelope: Envelope = self.transport.get_json("/fixtures", &q).await?;
            check_errors(self.name(), &envelope)?;
            let total = envelope.paging.as_ref().map(|p| p.total).unwrap_or(1);
            batch.extend(convert_fixtures(self.name(), envelope.response, &self.competitions));
            if page >= total || page >= MAX_PAGES {
                break;
            }
            page += 1;
        }
        if batch.malformed > 0 {
            tracing::warn!(
                provider = self.name(),
                malformed = batch.malformed,
                "dropped malformed fixture records"
            );
            self.transport.record_malformed(batch.malformed);
        }
        Ok(batch)
    }
}

/// European leagues start in July/August; a season is named after its first year.
fn season_for(date: NaiveDate) -> u16 {
    let year = date.year() as u16;
    if date.month() >= 7 {
        year
    } else {
        year - 1
    }
}

#[async_trait]
impl ProviderClient for ApiFootball {
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
        let season = self.season.unwrap_or_else(|| season_for(date_from));
        let query = vec![
            ("league", entry.provider_id.clone()),
            ("season", season.to_string()),
            ("from", date_from.format("%Y-%m-%d").to_string()),
            ("to", date_to.format("%Y-%m-%d").to_string()),
        ];
        let mut batch = self.fetch_fixtures(query).await?;
        batch.items.retain(|f| status_allowed(statuses, f.status));
        Ok(batch)
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
        let query = vec![
            ("team", team_id.to_string()),
            ("last", limit.to_string()),
            ("status", "FT-AET-PEN".to_string()),
        ];
        let mut batch = self.fetch_fixtures(query).await?;
        batch
            .items
            .retain(|f| f.status == FixtureStatus::Finished && f.score.is_some());
        batch.items.sort_by(|a, b| b.kickoff.cmp(&a.kickoff));
        batch.items.truncate(limit);
        Ok(batch)
    }

    async fn list_live(&self) -> Result<Batch<RawFixture>, ProviderError> {
        let leagues: Vec<&str> = self
            .competitions
            .iter()
            .map(|e| e.provider_id.as_str())
            .collect();
        let live = if leagues.is_empty() {
            "all".to_string()
        } else {
            leagues.join("-")
        };
        let mut batch = self.fetch_fixtures(vec![("live", live)]).await?;
        batch
            .items
            .retain(|f| self.competitions.contains(&f.competition_id));
        Ok(batch)
    }

    async fn get_market_odds(&self, fixture: &Fixture) -> Result<Option<MarketOdds>, ProviderError> {
        let Some(fixture_id) = fixture.provider_fixture_ids.get(self.name()) else {
            return Ok(None);
        };
        let query = [("fixture", fixture_id.clone()), ("bet", "1".to_string())];
        let envelope: Envelope = self.transport.get_json("/odds", &query).await?;
        check_errors(self.name(), &envelope)?;
        Ok(convert_odds(self.name(), envelope.response))
    }

    fn quota(&self) -> QuotaSnapshot {
        self.transport.quota()
    }
}

// ── Wire format ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Envelope {
    /// `[]` when fine, an object of messages when not (still HTTP 200).
    #[serde(default)]
    errors: serde_json::Value,
    paging: Option<Paging>,
    #[serde(default)]
    response: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct Paging {
    total: u32,
}

#[derive(Deserialize)]
struct AfRecord {
    fixture: AfFixture,
    league: AfLeague,
    teams: AfTeams,
    goals: Option<AfGoals>,
}

#[derive(Deserialize)]
struct AfFixture {
    id: u64,
    date: String,
    venue: Option<AfVenue>,
    status: AfStatus,
}

#[derive(Deserialize)]
struct AfVenue {
    name: Option<String>,
}

#[derive(Deserialize)]
struct AfStatus {
    short: String,
}

#[derive(Deserialize)]
struct AfLeague {
    id: u64,
    name: Option<String>,
    country: Option<String>,
}

#[derive(Deserialize)]
struct AfTeams {
    home: AfTeam,
    away: AfTeam,
}

#[derive(Deserialize)]
struct AfTeam {
    id: Option<u64>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct AfGoals {
    home: Option<u16>,
    away: Option<u16>,
}

#[derive(Deserialize)]
struct AfOddsRecord {
    #[serde(default)]
    bookmakers: Vec<AfBookmaker>,
}

#[derive(Deserialize)]
struct AfBookmaker {
    name: String,
    #[serde(default)]
    bets: Vec<AfBet>,
}

#[derive(Deserialize)]
struct AfBet {
    #[serde(default)]
    values: Vec<AfOddValue>,
}

#[derive(Deserialize)]
struct AfOddValue {
    value: String,
    odd: String,
}

fn check_errors(provider: &str, envelope: &Envelope) -> Result<(), ProviderError> {
    let has_errors = match &envelope.errors {
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        _ => false,
    };
    if has_errors {
        tracing::error!(provider, errors = %envelope.errors, "provider reported request errors");
        return Err(ProviderError::Rejected {
            provider: provider.to_string(),
            status: 200,
            body: envelope.errors.to_string(),
        });
    }
    Ok(())
}

/// Parse a `/fixtures` response body. Error envelopes become `Rejected`.
pub fn parse_fixtures(
    provider: &str,
    json: &str,
    competitions: &CompetitionMap,
) -> anyhow::Result<Batch<RawFixture>> {
    let envelope: Envelope = serde_json::from_str(json)?;
    check_errors(provider, &envelope)?;
    Ok(convert_fixtures(provider, envelope.response, competitions))
}

/// Parse an `/odds?bet=1` response body.
pub fn parse_odds(provider: &str, json: &str) -> anyhow::Result<Option<MarketOdds>> {
    let envelope: Envelope = serde_json::from_str(json)?;
    check_errors(provider, &envelope)?;
    Ok(convert_odds(provider, envelope.response))
}

fn convert_fixtures(
    provider: &str,
    records: Vec<serde_json::Value>,
    competitions: &CompetitionMap,
) -> Batch<RawFixture> {
    let mut batch = Batch::default();
    for value in records {
        let converted = serde_json::from_value::<AfRecord>(value)
            .ok()
            .and_then(|r| convert_fixture(provider, r, competitions));
        match converted {
            Some(fixture) => batch.items.push(fixture),
            None => batch.malformed += 1,
        }
    }
    batch
}

fn convert_fixture(provider: &str, r: AfRecord, competitions: &CompetitionMap) -> Option<RawFixture> {
    let kickoff = parse_kickoff(&r.fixture.date)?;
    let status = api_football_status(&r.fixture.status.short)?;
    let home = convert_team(r.teams.home)?;
    let away = convert_team(r.teams.away)?;

    let league_id = r.league.id.to_string();
    let entry = competitions.from_provider(&league_id);
    let competition_id = entry.map(|e| e.internal_id.clone()).unwrap_or(league_id);
    let competition_name = entry
        .and_then(|e| e.name.clone())
        .or(r.league.name)
        .unwrap_or_else(|| competition_id.clone());
    let country = r
        .league
        .country
        .or_else(|| entry.map(|e| e.country.clone()))
        .filter(|c| !c.is_empty());

    let score = match status {
        FixtureStatus::Scheduled | FixtureStatus::Postponed | FixtureStatus::Cancelled => None,
        _ => r
            .goals
            .and_then(|g| Some(Score { home: g.home?, away: g.away? })),
    };

    Some(RawFixture {
        provider: provider.to_string(),
        provider_fixture_id: r.fixture.id.to_string(),
        kickoff,
        competition_id,
        competition_name,
        country,
        home,
        away,
        venue: r
            .fixture
            .venue
            .and_then(|v| v.name)
            .filter(|v| !v.trim().is_empty()),
        status,
        score,
    })
}

fn convert_team(team: AfTeam) -> Option<RawTeam> {
    let name = team.name.filter(|n| !n.trim().is_empty())?;
    Some(RawTeam {
        id: team.id.map(|id| id.to_string()).unwrap_or_default(),
        name,
    })
}

/// First bookmaker offering a complete, sane Home/Draw/Away market wins.
fn convert_odds(provider: &str, records: Vec<serde_json::Value>) -> Option<MarketOdds> {
    let record = records
        .into_iter()
        .find_map(|v| serde_json::from_value::<AfOddsRecord>(v).ok())?;
    record.bookmakers.into_iter().find_map(|bookmaker| {
        let values = bookmaker.bets.first().map(|b| &b.values)?;
        let price = |label: &str| -> Option<f64> {
            values
                .iter()
                .find(|v| v.value == label)
                .and_then(|v| v.odd.trim().parse::<f64>().ok())
                .filter(|o| o.is_finite() && *o > 1.0)
        };
        Some(MarketOdds {
            home: price("Home")?,
            draw: price("Draw")?,
            away: price("Away")?,
            source: format!("{provider}:{}", bookmaker.name),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::mapping::CompetitionEntry;
    use chrono::{TimeZone, Utc};

    fn competitions() -> CompetitionMap {
        let mut map = CompetitionMap::default();
        map.insert(CompetitionEntry {
            internal_id: "PL".into(),
            provider_id: "39".into(),
            name: Some("Premier League".into()),
            country: "England".into(),
        });
        map
    }

    const FIXTURES: &str = r#"{
        "get": "fixtures",
        "errors": [],
        "results": 3,
        "paging": {"current": 1, "total": 1},
        "response": [
            {
                "fixture": {
                    "id": 1208021,
                    "date": "2024-08-16T19:00:00+00:00",
                    "venue": {"id": 556, "name": "Old Trafford"},
                    "status": {"long": "Match Finished", "short": "FT"}
                },
                "league": {"id": 39, "name": "Premier League", "country": "England", "season": 2024},
                "teams": {"home": {"id": 33, "name": "Manchester United"}, "away": {"id": 36, "name": "Fulham"}},
                "goals": {"home": 1, "away": 0}
            },
            {
                "fixture": {
                    "id": 1208022,
                    "date": "2024-08-17T12:30:00+01:00",
                    "venue": {"id": null, "name": null},
                    "status": {"long": "Not Started", "short": "NS"}
                },
                "league": {"id": 39, "name": "Premier League", "country": "England", "season": 2024},
                "teams": {"home": {"id": 57, "name": "Ipswich"}, "away": {"id": 40, "name": "Liverpool"}},
                "goals": {"home": null, "away": null}
            },
            {
                "fixture": {"id": 1208023, "date": "2024-08-17T14:00:00+00:00", "status": {"short": "XYZ"}},
                "league": {"id": 39},
                "teams": {"home": {"id": 1, "name": "A"}, "away": {"id": 2, "name": "B"}}
            }
        ]
    }"#;

    #[test]
    fn test_parse_fixtures() {
        let batch = parse_fixtures("api-football", FIXTURES, &competitions()).unwrap();
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.malformed, 1);

        let first = &batch.items[0];
        assert_eq!(first.provider_fixture_id, "1208021");
        assert_eq!(first.competition_id, "PL");
        assert_eq!(first.home.id, "33");
        assert_eq!(first.away.name, "Fulham");
        assert_eq!(first.status, FixtureStatus::Finished);
        assert_eq!(first.score, Some(Score { home: 1, away: 0 }));
        assert_eq!(first.venue.as_deref(), Some("Old Trafford"));

        // +01:00 offset normalised to UTC
        let second = &batch.items[1];
        assert_eq!(second.kickoff, Utc.with_ymd_and_hms(2024, 8, 17, 11, 30, 0).unwrap());
        assert_eq!(second.status, FixtureStatus::Scheduled);
        assert_eq!(second.score, None);
        assert_eq!(second.venue, None);
    }

    #[test]
    fn test_error_envelope_is_rejected() {
        let json = r#"{"errors": {"token": "Error/Missing application key."}, "response": []}"#;
        let err = parse_fixtures("api-football", json, &competitions()).unwrap_err();
        let err = err.downcast::<ProviderError>().unwrap();
        assert!(matches!(err, ProviderError::Rejected { status: 200, .. }));
    }

    #[test]
    fn test_parse_odds_picks_complete_market() {
        let json = r#"{
            "errors": [],
            "response": [{
                "fixture": {"id": 1208021},
                "bookmakers": [
                    {"id": 1, "name": "Partial", "bets": [{"id": 1, "name": "Match Winner", "values": [
                        {"value": "Home", "odd": "1.90"}
                    ]}]},
                    {"id": 8, "name": "Bet365", "bets": [{"id": 1, "name": "Match Winner", "values": [
                        {"value": "Home", "odd": "1.85"},
                        {"value": "Draw", "odd": "3.60"},
                        {"value": "Away", "odd": "4.20"}
                    ]}]}
                ]
            }]
        }"#;
        let odds = parse_odds("api-football", json).unwrap().unwrap();
        assert_eq!(odds.home, 1.85);
        assert_eq!(odds.draw, 3.60);
        assert_eq!(odds.away, 4.20);
        assert_eq!(odds.source, "api-football:Bet365");
    }

    #[test]
    fn test_parse_odds_empty_response() {
        let json = r#"{"errors": [], "response": []}"#;
        assert_eq!(parse_odds("api-football", json).unwrap(), None);
    }

    #[test]
    fn test_season_for_date() {
        assert_eq!(season_for(NaiveDate::from_ymd_opt(2024, 8, 16).unwrap()), 2024);
        assert_eq!(season_for(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()), 2024);
    }
}
