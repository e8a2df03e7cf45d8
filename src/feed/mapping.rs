use crate::config::{Config, ProviderConfig};
use crate::model::FixtureStatus;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Internal competition metadata as one provider sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompetitionEntry {
    pub internal_id: String,
    pub provider_id: String,
    pub name: Option<String>,
    pub country: String,
}

/// Bidirectional competition id table for one provider.
#[derive(Debug, Clone, Default)]
pub struct CompetitionMap {
    by_internal: BTreeMap<String, CompetitionEntry>,
    by_provider: BTreeMap<String, String>,
}

impl CompetitionMap {
    pub fn new(config: &Config, provider: &ProviderConfig) -> Self {
        let mut map = Self::default();
        for (internal, provider_id) in &provider.competition_ids {
            let comp = config.competition(internal);
            map.insert(CompetitionEntry {
                internal_id: internal.clone(),
                provider_id: provider_id.clone(),
                name: comp.and_then(|c| c.name.clone()),
                country: comp.map(|c| c.country.clone()).unwrap_or_default(),
            });
        }
        map
    }

    pub fn insert(&mut self, entry: CompetitionEntry) {
        self.by_provider
            .insert(entry.provider_id.clone(), entry.internal_id.clone());
        self.by_internal.insert(entry.internal_id.clone(), entry);
    }

    pub fn get(&self, internal_id: &str) -> Option<&CompetitionEntry> {
        self.by_internal.get(internal_id)
    }

    /// Reverse lookup from a provider id (or code) to the internal entry.
    pub fn from_provider(&self, provider_id: &str) -> Option<&CompetitionEntry> {
        self.by_provider
            .get(provider_id)
            .and_then(|internal| self.by_internal.get(internal))
    }

    pub fn contains(&self, internal_id: &str) -> bool {
        self.by_internal.contains_key(internal_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompetitionEntry> {
        self.by_internal.values()
    }
}

/// Provider timestamps are RFC 3339 with an explicit offset; normalise to UTC.
pub fn parse_kickoff(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// football-data.org v4 match status codes.
pub fn football_data_status(code: &str) -> Option<FixtureStatus> {
    match code {
        "SCHEDULED" | "TIMED" => Some(FixtureStatus::Scheduled),
        "IN_PLAY" | "PAUSED" | "LIVE" | "EXTRA_TIME" | "PENALTY_SHOOTOUT" => {
            Some(FixtureStatus::InProgress)
        }
        "FINISHED" | "AWARDED" => Some(FixtureStatus::Finished),
        "POSTPONED" | "SUSPENDED" => Some(FixtureStatus::Postponed),
        "CANCELLED" => Some(FixtureStatus::Cancelled),
        _ => None,
    }
}

/// API-Football v3 `fixture.status.short` codes.
pub fn api_football_status(code: &str) -> Option<FixtureStatus> {
    match code {
        "TBD" | "NS" => Some(FixtureStatus::Scheduled),
        "1H" | "HT" | "2H" | "ET" | "BT" | "P" | "LIVE" | "INT" | "SUSP" => {
            Some(FixtureStatus::InProgress)
        }
        "FT" | "AET" | "PEN" | "AWD" | "WO" => Some(FixtureStatus::Finished),
        "PST" => Some(FixtureStatus::Postponed),
        "CANC" | "ABD" => Some(FixtureStatus::Cancelled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_football_data_status_codes() {
        assert_eq!(football_data_status("TIMED"), Some(FixtureStatus::Scheduled));
        assert_eq!(football_data_status("PAUSED"), Some(FixtureStatus::InProgress));
        assert_eq!(football_data_status("AWARDED"), Some(FixtureStatus::Finished));
        assert_eq!(football_data_status("SUSPENDED"), Some(FixtureStatus::Postponed));
        assert_eq!(football_data_status("CANCELLED"), Some(FixtureStatus::Cancelled));
        assert_eq!(football_data_status("???"), None);
    }

    #[test]
    fn test_api_football_status_codes() {
        assert_eq!(api_football_status("NS"), Some(FixtureStatus::Scheduled));
        assert_eq!(api_football_status("HT"), Some(FixtureStatus::InProgress));
        assert_eq!(api_football_status("PEN"), Some(FixtureStatus::Finished));
        assert_eq!(api_football_status("PST"), Some(FixtureStatus::Postponed));
        assert_eq!(api_football_status("ABD"), Some(FixtureStatus::Cancelled));
        assert_eq!(api_football_status(""), None);
    }

    #[test]
    fn test_parse_kickoff_normalises_offset() {
        let a = parse_kickoff("2024-08-16T19:00:00Z").unwrap();
        let b = parse_kickoff("2024-08-16T16:00:00-03:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_kickoff("16/08/2024").is_none());
    }

    #[test]
    fn test_competition_map_round_trip() {
        let mut map = CompetitionMap::default();
        map.insert(CompetitionEntry {
            internal_id: "PL".into(),
            provider_id: "39".into(),
            name: Some("Premier League".into()),
            country: "England".into(),
        });
        assert_eq!(map.get("PL").unwrap().provider_id, "39");
        assert_eq!(map.from_provider("39").unwrap().internal_id, "PL");
        assert!(map.from_provider("71").is_none());
        assert!(map.contains("PL"));
    }
}
