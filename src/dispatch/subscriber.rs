use crate::config::SubscriberConfig;
use crate::model::PredictionRecord;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Start (in UTC) of the reset window containing `now`, for a subscriber whose
/// day boundary sits at local midnight `offset_minutes` east of UTC.
pub fn window_start(now: DateTime<Utc>, offset_minutes: i32) -> DateTime<Utc> {
    let offset = Duration::minutes(offset_minutes as i64);
    let local_midnight = (now + offset).date_naive().and_time(NaiveTime::MIN).and_utc();
    local_midnight - offset
}

/// Mutable delivery state of one subscriber. Only the dispatcher writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberState {
    pub handle: String,
    pub counter: u32,
    pub window_start: DateTime<Utc>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub delivered: BTreeSet<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub muted_until: Option<DateTime<Utc>>,
}

impl SubscriberState {
    pub fn new(handle: &str, now: DateTime<Utc>, offset_minutes: i32) -> Self {
        Self {
            handle: handle.to_string(),
            counter: 0,
            window_start: window_start(now, offset_minutes),
            last_sent_at: None,
            delivered: BTreeSet::new(),
            consecutive_failures: 0,
            muted_until: None,
        }
    }

    /// Reset counter and delivered set when `now` has crossed into a new
    /// window. Returns true on reset.
    pub fn roll_window(&mut self, now: DateTime<Utc>, offset_minutes: i32) -> bool {
        let current = window_start(now, offset_minutes);
        if current == self.window_start {
            return false;
        }
        self.window_start = current;
        self.counter = 0;
        self.delivered.clear();
        true
    }

    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        self.muted_until.is_some_and(|until| now < until)
    }

    /// Quota and spacing check, re-evaluated before every send.
    pub fn can_send(&self, config: &SubscriberConfig, now: DateTime<Utc>) -> bool {
        if self.counter >= config.max_per_day || self.is_muted(now) {
            return false;
        }
        match self.last_sent_at {
            Some(last) => (now - last).num_seconds() >= config.min_interval_seconds as i64,
            None => true,
        }
    }

    /// Per-record filter: confidence floor, competition allow-list (empty
    /// means every competition) and not yet delivered in this window.
    pub fn accepts(&self, config: &SubscriberConfig, record: &PredictionRecord) -> bool {
        record.confidence >= config.min_confidence
            && (config.allowed_competitions.is_empty()
                || config
                    .allowed_competitions
                    .iter()
                    .any(|c| c == &record.competition_id))
            && !self.delivered.contains(&record.fixture_key)
    }

    pub fn record_success(&mut self, fixture_key: &str, now: DateTime<Utc>) {
        self.counter += 1;
        self.last_sent_at = Some(now);
        self.delivered.insert(fixture_key.to_string());
        self.consecutive_failures = 0;
    }

    /// Count a failed send. Returns true when this failure triggers a mute.
    pub fn record_failure(&mut self, now: DateTime<Utc>, threshold: u32, mute: Duration) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= threshold.max(1) {
            self.muted_until = Some(now + mute);
            self.consecutive_failures = 0;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Outcome, Triple};
    use chrono::TimeZone;

    fn config() -> SubscriberConfig {
        SubscriberConfig {
            handle: "chat-1".into(),
            min_confidence: 0.4,
            allowed_competitions: vec!["PL".into()],
            max_per_day: 2,
            min_interval_seconds: 600,
            top_k: 5,
            utc_offset_minutes: 0,
        }
    }

    fn record(key: &str, competition: &str, confidence: f64) -> PredictionRecord {
        PredictionRecord {
            fixture_key: key.into(),
            engine_version: "test".into(),
            competition_id: competition.into(),
            competition_name: competition.into(),
            home_name: "Home".into(),
            away_name: "Away".into(),
            kickoff: Utc.with_ymd_and_hms(2025, 3, 1, 20, 0, 0).unwrap(),
            probabilities: Triple { home: 0.5, draw: 0.3, away: 0.2 },
            fair_odds: Triple { home: 2.0, draw: 3.33, away: 5.0 },
            label: Outcome::Home,
            confidence,
            reliability: 1.0,
            market_odds: None,
            values: None,
            home_form_hash: String::new(),
            away_form_hash: String::new(),
            home_sample_size: 10,
            away_sample_size: 10,
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_window_start_with_offset() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 22, 30, 0).unwrap();
        assert_eq!(window_start(now, 0), Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        // UTC+2: local time is already 00:30 on March 2nd.
        assert_eq!(window_start(now, 120), Utc.with_ymd_and_hms(2025, 3, 1, 22, 0, 0).unwrap());
        // UTC-3: local time is 19:30 on March 1st.
        assert_eq!(window_start(now, -180), Utc.with_ymd_and_hms(2025, 3, 1, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_filters() {
        let state = SubscriberState::new("chat-1", Utc::now(), 0);
        let cfg = config();
        assert!(state.accepts(&cfg, &record("a", "PL", 0.5)));
        assert!(!state.accepts(&cfg, &record("a", "PL", 0.3)));
        assert!(!state.accepts(&cfg, &record("a", "BSA", 0.9)));

        let mut open = cfg.clone();
        open.allowed_competitions.clear();
        assert!(state.accepts(&open, &record("a", "BSA", 0.9)));
    }

    #[test]
    fn test_quota_interval_and_reset() {
        let cfg = config();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let mut state = SubscriberState::new("chat-1", t0, 0);
        assert!(state.can_send(&cfg, t0));

        state.record_success("a", t0);
        assert!(!state.can_send(&cfg, t0 + Duration::seconds(599)));
        assert!(state.can_send(&cfg, t0 + Duration::seconds(600)));
        assert!(!state.accepts(&cfg, &record("a", "PL", 0.9)));

        state.record_success("b", t0 + Duration::seconds(600));
        assert_eq!(state.counter, 2);
        assert!(!state.can_send(&cfg, t0 + Duration::hours(2)));

        let next_day = Utc.with_ymd_and_hms(2025, 3, 2, 0, 5, 0).unwrap();
        assert!(!state.roll_window(t0 + Duration::hours(3), 0));
        assert!(state.roll_window(next_day, 0));
        assert_eq!(state.counter, 0);
        assert!(state.delivered.is_empty());
        assert!(state.can_send(&cfg, next_day));
    }

    #[test]
    fn test_mute_after_consecutive_failures() {
        let cfg = config();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let mut state = SubscriberState::new("chat-1", now, 0);
        for _ in 0..4 {
            assert!(!state.record_failure(now, 5, Duration::hours(1)));
        }
        assert!(state.record_failure(now, 5, Duration::hours(1)));
        assert!(state.is_muted(now + Duration::minutes(59)));
        assert!(!state.can_send(&cfg, now + Duration::minutes(59)));
        assert!(!state.is_muted(now + Duration::hours(1)));
        assert_eq!(state.counter, 0);
    }
}
