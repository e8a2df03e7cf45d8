use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Normalized internal types shared by every pipeline stage (provider-agnostic).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixtureStatus {
    Scheduled,
    InProgress,
    Finished,
    Postponed,
    Cancelled,
}

impl FixtureStatus {
    /// Allowed lifecycle moves. Re-sighting the same status is always fine.
    pub fn can_transition_to(self, next: FixtureStatus) -> bool {
        use FixtureStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Scheduled, InProgress | Finished | Postponed | Cancelled) => true,
            (InProgress, Finished) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FixtureStatus::Scheduled => "SCHEDULED",
            FixtureStatus::InProgress => "IN_PROGRESS",
            FixtureStatus::Finished => "FINISHED",
            FixtureStatus::Postponed => "POSTPONED",
            FixtureStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub home: u16,
    pub away: u16,
}

/// Team as reported by a single provider, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTeam {
    pub id: String,
    pub name: String,
}

/// One fixture exactly as one provider reported it, already in UTC and
/// mapped to internal competition id and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFixture {
    pub provider: String,
    pub provider_fixture_id: String,
    pub kickoff: DateTime<Utc>,
    pub competition_id: String,
    pub competition_name: String,
    pub country: Option<String>,
    pub home: RawTeam,
    pub away: RawTeam,
    pub venue: Option<String>,
    pub status: FixtureStatus,
    pub score: Option<Score>,
}

/// A finished fixture as returned by `list_recent_finished`; carries a score.
pub type MatchResult = RawFixture;

/// A resolved team on one side of a fixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamRef {
    pub key: String,
    pub name: String,
    /// provider name -> provider-specific team id
    #[serde(default)]
    pub provider_ids: BTreeMap<String, String>,
}

impl TeamRef {
    pub fn provider_id(&self, provider: &str) -> Option<&str> {
        self.provider_ids.get(provider).map(String::as_str)
    }
}

/// Decimal 1X2 market prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOdds {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub fixture_key: String,
    /// Highest-precedence contributor.
    pub provider: String,
    pub provider_fixture_id: String,
    #[serde(default)]
    pub provider_fixture_ids: BTreeMap<String, String>,
    pub kickoff: DateTime<Utc>,
    pub competition_id: String,
    pub competition_name: String,
    pub country: String,
    pub home: TeamRef,
    pub away: TeamRef,
    pub venue: Option<String>,
    pub status: FixtureStatus,
    pub score: Option<Score>,
    pub source_providers: BTreeSet<String>,
    #[serde(default)]
    pub market_odds: Option<MarketOdds>,
    pub updated_at: DateTime<Utc>,
}

/// Stable cross-provider identity: competition, kickoff minute and both team keys.
pub fn fixture_key(
    competition_id: &str,
    kickoff: DateTime<Utc>,
    home_key: &str,
    away_key: &str,
) -> String {
    let minute = kickoff.timestamp().div_euclid(60);
    let mut hasher = Sha256::new();
    hasher.update(format!("{competition_id}|{minute}|{home_key}|{away_key}").as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// One finished match from the perspective of a single team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormEntry {
    pub opponent_key: String,
    pub was_home: bool,
    pub goals_for: u16,
    pub goals_against: u16,
    pub kickoff: DateTime<Utc>,
}

impl FormEntry {
    /// Build the team-side view of a finished match. Returns None when the
    /// match has no score.
    pub fn from_result(result: &MatchResult, was_home: bool, opponent_key: String) -> Option<Self> {
        let score = result.score?;
        let (goals_for, goals_against) = if was_home {
            (score.home, score.away)
        } else {
            (score.away, score.home)
        };
        Some(Self {
            opponent_key,
            was_home,
            goals_for,
            goals_against,
            kickoff: result.kickoff,
        })
    }
}

pub const DEFAULT_FORM_WINDOW: usize = 10;

const PRIOR_WIN_RATE: f64 = 0.33;
const PRIOR_DRAW_RATE: f64 = 0.33;
const PRIOR_GOALS: f64 = 1.2;

/// Rolling summary of a team's most recent finished matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamForm {
    pub team_key: String,
    /// Sorted by kickoff, most recent first.
    pub matches: Vec<FormEntry>,
    pub win_rate: f64,
    pub draw_rate: f64,
    pub loss_rate: f64,
    pub avg_gf: f64,
    pub avg_ga: f64,
    pub sample_size: usize,
    pub computed_at: DateTime<Utc>,
    /// Served from a stale entry or priors because every provider failed.
    #[serde(default)]
    pub degraded: bool,
}

impl TeamForm {
    /// Keep past entries only, newest first, at most `window`, then aggregate.
    pub fn from_entries(
        team_key: &str,
        mut entries: Vec<FormEntry>,
        window: usize,
        now: DateTime<Utc>,
    ) -> Self {
        entries.retain(|e| e.kickoff < now);
        entries.sort_by(|a, b| b.kickoff.cmp(&a.kickoff));
        entries.dedup_by(|a, b| a.kickoff == b.kickoff && a.opponent_key == b.opponent_key);
        entries.truncate(window);

        let mut form = Self {
            team_key: team_key.to_string(),
            matches: entries,
            win_rate: PRIOR_WIN_RATE,
            draw_rate: PRIOR_DRAW_RATE,
            loss_rate: 1.0 - PRIOR_WIN_RATE - PRIOR_DRAW_RATE,
            avg_gf: PRIOR_GOALS,
            avg_ga: PRIOR_GOALS,
            sample_size: 0,
            computed_at: now,
            degraded: false,
        };
        form.recompute();
        form
    }

    /// Empty form carrying the neutral priors.
    pub fn neutral(team_key: &str, now: DateTime<Utc>) -> Self {
        Self::from_entries(team_key, Vec::new(), DEFAULT_FORM_WINDOW, now)
    }

    fn recompute(&mut self) {
        let n = self.matches.len();
        self.sample_size = n;
        if n == 0 {
            self.win_rate = PRIOR_WIN_RATE;
            self.draw_rate = PRIOR_DRAW_RATE;
            self.loss_rate = 1.0 - PRIOR_WIN_RATE - PRIOR_DRAW_RATE;
            self.avg_gf = PRIOR_GOALS;
            self.avg_ga = PRIOR_GOALS;
            return;
        }
        let (mut wins, mut draws, mut losses) = (0usize, 0usize, 0usize);
        let (mut gf, mut ga) = (0u32, 0u32);
        for m in &self.matches {
            gf += m.goals_for as u32;
            ga += m.goals_against as u32;
            match m.goals_for.cmp(&m.goals_against) {
                std::cmp::Ordering::Greater => wins += 1,
                std::cmp::Ordering::Equal => draws += 1,
                std::cmp::Ordering::Less => losses += 1,
            }
        }
        let n = n as f64;
        self.win_rate = wins as f64 / n;
        self.draw_rate = draws as f64 / n;
        self.loss_rate = losses as f64 / n;
        self.avg_gf = gf as f64 / n;
        self.avg_ga = ga as f64 / n;
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.computed_at
    }

    /// Content hash of the match list, referenced by prediction records.
    pub fn snapshot_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.team_key.as_bytes());
        for m in &self.matches {
            hasher.update(
                format!(
                    "|{}|{}|{}|{}|{}",
                    m.kickoff.timestamp(),
                    m.opponent_key,
                    m.was_home,
                    m.goals_for,
                    m.goals_against
                )
                .as_bytes(),
            );
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Home,
    Draw,
    Away,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Home => "HOME",
            Outcome::Draw => "DRAW",
            Outcome::Away => "AWAY",
        }
    }
}

/// A value per 1X2 outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Triple<T> {
    pub home: T,
    pub draw: T,
    pub away: T,
}

impl<T: Copy> Triple<T> {
    pub fn get(&self, outcome: Outcome) -> T {
        match outcome {
            Outcome::Home => self.home,
            Outcome::Draw => self.draw,
            Outcome::Away => self.away,
        }
    }

    pub fn map<U>(&self, f: impl Fn(T) -> U) -> Triple<U> {
        Triple {
            home: f(self.home),
            draw: f(self.draw),
            away: f(self.away),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeValue {
    pub value: f64,
    pub is_value_bet: bool,
}

/// Immutable engine output for one fixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub fixture_key: String,
    pub engine_version: String,
    pub competition_id: String,
    pub competition_name: String,
    pub home_name: String,
    pub away_name: String,
    pub kickoff: DateTime<Utc>,
    pub probabilities: Triple<f64>,
    pub fair_odds: Triple<f64>,
    pub label: Outcome,
    pub confidence: f64,
    pub reliability: f64,
    pub market_odds: Option<MarketOdds>,
    pub values: Option<Triple<OutcomeValue>>,
    pub home_form_hash: String,
    pub away_form_hash: String,
    pub home_sample_size: usize,
    pub away_sample_size: usize,
    pub created_at: DateTime<Utc>,
}

impl PredictionRecord {
    pub fn has_value_bet(&self) -> bool {
        self.values
            .map(|v| v.home.is_value_bet || v.draw.is_value_bet || v.away.is_value_bet)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(gf: u16, ga: u16, days_ago: i64, now: DateTime<Utc>) -> FormEntry {
        FormEntry {
            opponent_key: format!("opp-{days_ago}"),
            was_home: days_ago % 2 == 0,
            goals_for: gf,
            goals_against: ga,
            kickoff: now - chrono::Duration::days(days_ago),
        }
    }

    #[test]
    fn test_fixture_key_ignores_seconds() {
        let a = Utc.with_ymd_and_hms(2025, 3, 1, 20, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 3, 1, 20, 0, 42).unwrap();
        assert_eq!(fixture_key("X", a, "team-a", "team-b"), fixture_key("X", b, "team-a", "team-b"));
        assert_ne!(fixture_key("X", a, "team-a", "team-b"), fixture_key("X", a, "team-b", "team-a"));
        assert_eq!(fixture_key("X", a, "team-a", "team-b").len(), 16);
    }

    #[test]
    fn test_status_transitions() {
        use FixtureStatus::*;
        assert!(Scheduled.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Finished));
        assert!(Scheduled.can_transition_to(Postponed));
        assert!(Scheduled.can_transition_to(Cancelled));
        assert!(!Finished.can_transition_to(Scheduled));
        assert!(!InProgress.can_transition_to(Postponed));
        assert!(!Cancelled.can_transition_to(InProgress));
        assert!(Finished.can_transition_to(Finished));
    }

    #[test]
    fn test_form_aggregates_and_order() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let entries = vec![
            entry(2, 0, 10, now),
            entry(1, 1, 3, now),
            entry(0, 3, 7, now),
            entry(3, 1, 1, now),
        ];
        let form = TeamForm::from_entries("t", entries, 10, now);
        assert_eq!(form.sample_size, 4);
        assert!((form.win_rate - 0.5).abs() < 1e-12);
        assert!((form.draw_rate - 0.25).abs() < 1e-12);
        assert!((form.loss_rate - 0.25).abs() < 1e-12);
        assert!((form.avg_gf - 1.5).abs() < 1e-12);
        assert!((form.avg_ga - 1.25).abs() < 1e-12);
        assert!(form.matches.windows(2).all(|w| w[0].kickoff >= w[1].kickoff));
    }

    #[test]
    fn test_form_drops_future_and_truncates() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut entries: Vec<_> = (1..=15).map(|d| entry(1, 0, d, now)).collect();
        entries.push(entry(5, 0, -2, now));
        let form = TeamForm::from_entries("t", entries, 10, now);
        assert_eq!(form.sample_size, 10);
        assert!(form.matches.iter().all(|m| m.kickoff < now));
        assert_eq!(form.matches[0].kickoff, now - chrono::Duration::days(1));
    }

    #[test]
    fn test_neutral_form_priors() {
        let now = Utc::now();
        let form = TeamForm::neutral("t", now);
        assert_eq!(form.sample_size, 0);
        assert_eq!(form.win_rate, 0.33);
        assert_eq!(form.draw_rate, 0.33);
        assert_eq!(form.avg_gf, 1.2);
        assert_eq!(form.avg_ga, 1.2);
    }

    #[test]
    fn test_form_entry_side_aware() {
        let now = Utc::now();
        let result = RawFixture {
            provider: "p".into(),
            provider_fixture_id: "1".into(),
            kickoff: now,
            competition_id: "X".into(),
            competition_name: "X".into(),
            country: None,
            home: RawTeam { id: "1".into(), name: "A".into() },
            away: RawTeam { id: "2".into(), name: "B".into() },
            venue: None,
            status: FixtureStatus::Finished,
            score: Some(Score { home: 3, away: 1 }),
        };
        let away_view = FormEntry::from_result(&result, false, "a".into()).unwrap();
        assert_eq!((away_view.goals_for, away_view.goals_against), (1, 3));
        let home_view = FormEntry::from_result(&result, true, "b".into()).unwrap();
        assert_eq!((home_view.goals_for, home_view.goals_against), (3, 1));
    }
}
