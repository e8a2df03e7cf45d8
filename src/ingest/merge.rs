use crate::model::{fixture_key, Fixture, RawFixture, TeamRef};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// A raw fixture whose teams have been resolved to internal keys.
#[derive(Debug, Clone)]
pub struct ResolvedFixture {
    pub raw: RawFixture,
    pub precedence: i32,
    pub home_key: String,
    pub away_key: String,
    pub fixture_key: String,
}

impl ResolvedFixture {
    pub fn new(raw: RawFixture, precedence: i32, home_key: String, away_key: String) -> Self {
        let key = fixture_key(&raw.competition_id, raw.kickoff, &home_key, &away_key);
        Self {
            raw,
            precedence,
            home_key,
            away_key,
            fixture_key: key,
        }
    }
}

fn team_ref(key: &str, sightings: &[&ResolvedFixture], home: bool) -> TeamRef {
    let mut provider_ids = BTreeMap::new();
    for s in sightings {
        let raw_team = if home { &s.raw.home } else { &s.raw.away };
        if !raw_team.id.is_empty() {
            provider_ids
                .entry(s.raw.provider.clone())
                .or_insert_with(|| raw_team.id.clone());
        }
    }
    let name = sightings
        .first()
        .map(|s| if home { &s.raw.home.name } else { &s.raw.away.name })
        .cloned()
        .unwrap_or_else(|| key.to_string());
    TeamRef {
        key: key.to_string(),
        name,
        provider_ids,
    }
}

/// Merge every sighting of one `fixture_key`. The lowest precedence value
/// wins each field; optional fields fall through to the next provider that
/// has them. Returns None for an empty group.
pub fn merge_group(mut group: Vec<ResolvedFixture>, now: DateTime<Utc>) -> Option<Fixture> {
    group.sort_by(|a, b| {
        a.precedence
            .cmp(&b.precedence)
            .then_with(|| a.raw.provider.cmp(&b.raw.provider))
            .then_with(|| a.raw.provider_fixture_id.cmp(&b.raw.provider_fixture_id))
    });
    let sightings: Vec<&ResolvedFixture> = group.iter().collect();
    let primary = *sightings.first()?;

    let mut provider_fixture_ids = BTreeMap::new();
    let mut source_providers = BTreeSet::new();
    for s in &sightings {
        provider_fixture_ids
            .entry(s.raw.provider.clone())
            .or_insert_with(|| s.raw.provider_fixture_id.clone());
        source_providers.insert(s.raw.provider.clone());
    }

    Some(Fixture {
        fixture_key: primary.fixture_key.clone(),
        provider: primary.raw.provider.clone(),
        provider_fixture_id: primary.raw.provider_fixture_id.clone(),
        provider_fixture_ids,
        kickoff: primary.raw.kickoff,
        competition_id: primary.raw.competition_id.clone(),
        competition_name: primary.raw.competition_name.clone(),
        country: sightings
            .iter()
            .find_map(|s| s.raw.country.clone())
            .unwrap_or_default(),
        home: team_ref(&primary.home_key, &sightings, true),
        away: team_ref(&primary.away_key, &sightings, false),
        venue: sightings.iter().find_map(|s| s.raw.venue.clone()),
        status: primary.raw.status,
        score: sightings.iter().find_map(|s| s.raw.score),
        source_providers,
        market_odds: None,
        updated_at: now,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    Created(Fixture),
    Changed(Fixture),
    Unchanged,
    /// The stored status may not move to the incoming one.
    RejectedTransition {
        from: crate::model::FixtureStatus,
        to: crate::model::FixtureStatus,
    },
}

fn same_content(a: &Fixture, b: &Fixture) -> bool {
    a.status == b.status
        && a.score == b.score
        && a.kickoff == b.kickoff
        && a.venue == b.venue
        && a.home == b.home
        && a.away == b.away
        && a.source_providers == b.source_providers
        && a.provider_fixture_ids == b.provider_fixture_ids
        && a.competition_name == b.competition_name
        && a.country == b.country
        && a.provider == b.provider
}

/// Combine a freshly merged fixture with what is already stored.
pub fn apply_update(existing: Option<&Fixture>, mut incoming: Fixture) -> Upsert {
    let Some(existing) = existing else {
        return Upsert::Created(incoming);
    };
    if !existing.status.can_transition_to(incoming.status) {
        return Upsert::RejectedTransition {
            from: existing.status,
            to: incoming.status,
        };
    }
    incoming
        .source_providers
        .extend(existing.source_providers.iter().cloned());
    for (provider, id) in &existing.provider_fixture_ids {
        incoming
            .provider_fixture_ids
            .entry(provider.clone())
            .or_insert_with(|| id.clone());
    }
    for (side_new, side_old) in [
        (&mut incoming.home, &existing.home),
        (&mut incoming.away, &existing.away),
    ] {
        for (provider, id) in &side_old.provider_ids {
            side_new
                .provider_ids
                .entry(provider.clone())
                .or_insert_with(|| id.clone());
        }
    }
    if incoming.score.is_none() {
        incoming.score = existing.score;
    }
    if incoming.venue.is_none() {
        incoming.venue = existing.venue.clone();
    }
    if incoming.market_odds.is_none() {
        incoming.market_odds = existing.market_odds.clone();
    }
    if same_content(existing, &incoming) {
        Upsert::Unchanged
    } else {
        Upsert::Changed(incoming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FixtureStatus, RawTeam, Score};
    use chrono::TimeZone;

    fn raw(provider: &str, id: &str, home: &str, away: &str) -> RawFixture {
        RawFixture {
            provider: provider.into(),
            provider_fixture_id: id.into(),
            kickoff: Utc.with_ymd_and_hms(2025, 3, 1, 20, 0, 0).unwrap(),
            competition_id: "X".into(),
            competition_name: "Competition X".into(),
            country: None,
            home: RawTeam { id: format!("{provider}-h"), name: home.into() },
            away: RawTeam { id: format!("{provider}-a"), name: away.into() },
            venue: None,
            status: FixtureStatus::Scheduled,
            score: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_precedence_wins_and_optional_fields_fall_through() {
        let mut p1 = raw("p1", "100", "Team A", "Team B");
        p1.venue = None;
        let mut p2 = raw("p2", "200", "Team A FC", "Team B FC");
        p2.venue = Some("Stadium".into());
        p2.country = Some("Xland".into());
        p2.competition_name = "Other Name".into();

        let group = vec![
            ResolvedFixture::new(p2, 1, "team-a".into(), "team-b".into()),
            ResolvedFixture::new(p1, 0, "team-a".into(), "team-b".into()),
        ];
        let merged = merge_group(group, now()).unwrap();
        assert_eq!(merged.provider, "p1");
        assert_eq!(merged.home.name, "Team A");
        assert_eq!(merged.competition_name, "Competition X");
        assert_eq!(merged.venue.as_deref(), Some("Stadium"));
        assert_eq!(merged.country, "Xland");
        assert_eq!(merged.source_providers.len(), 2);
        assert_eq!(merged.provider_fixture_ids["p2"], "200");
        assert_eq!(merged.home.provider_id("p2"), Some("p2-h"));
    }

    #[test]
    fn test_apply_update_transitions() {
        let base = merge_group(
            vec![ResolvedFixture::new(raw("p1", "1", "A", "B"), 0, "a".into(), "b".into())],
            now(),
        )
        .unwrap();
        assert!(matches!(apply_update(None, base.clone()), Upsert::Created(_)));
        assert_eq!(apply_update(Some(&base), base.clone()), Upsert::Unchanged);

        let mut live = base.clone();
        live.status = FixtureStatus::InProgress;
        live.score = Some(Score { home: 1, away: 0 });
        match apply_update(Some(&base), live.clone()) {
            Upsert::Changed(f) => assert_eq!(f.score, Some(Score { home: 1, away: 0 })),
            other => panic!("expected change, got {other:?}"),
        }

        let mut back = base.clone();
        back.status = FixtureStatus::Scheduled;
        assert_eq!(
            apply_update(Some(&live), back),
            Upsert::RejectedTransition {
                from: FixtureStatus::InProgress,
                to: FixtureStatus::Scheduled
            }
        );
    }

    #[test]
    fn test_update_keeps_earlier_contributors() {
        let both = merge_group(
            vec![
                ResolvedFixture::new(raw("p1", "1", "A", "B"), 0, "a".into(), "b".into()),
                ResolvedFixture::new(raw("p2", "2", "A", "B"), 1, "a".into(), "b".into()),
            ],
            now(),
        )
        .unwrap();
        let only_p2 = merge_group(
            vec![ResolvedFixture::new(raw("p2", "2", "A", "B"), 1, "a".into(), "b".into())],
            now(),
        )
        .unwrap();
        match apply_update(Some(&both), only_p2) {
            Upsert::Changed(f) => {
                assert!(f.source_providers.contains("p1"));
                assert_eq!(f.provider_fixture_ids["p1"], "1");
            }
            other => panic!("expected change, got {other:?}"),
        }
    }
}
