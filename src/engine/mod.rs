pub mod value;
pub mod win_prob;

use crate::config::Config;
use crate::error::EngineError;
use crate::model::{Fixture, PredictionRecord, TeamForm};
use chrono::{DateTime, Utc};
use win_prob::StrengthModel;

/// Bump whenever weights or formulas change.
pub const ENGINE_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub engine_version: String,
    pub home_advantage: f64,
    pub allow_neutral_priors: bool,
    pub value_threshold: f64,
}

impl EngineSettings {
    pub fn for_competition(config: &Config, competition_id: &str) -> Self {
        Self {
            engine_version: config.engine_version.clone(),
            home_advantage: config.home_advantage(competition_id),
            allow_neutral_priors: config.allow_neutral_priors,
            value_threshold: config.value_threshold,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            engine_version: ENGINE_VERSION.to_string(),
            home_advantage: crate::config::DEFAULT_HOME_ADVANTAGE,
            allow_neutral_priors: true,
            value_threshold: 0.05,
        }
    }
}

/// Predict one fixture. Pure: identical inputs give identical records.
///
/// With both forms empty the result is uniform with zero reliability, unless
/// neutral priors are disabled.
pub fn predict(
    fixture: &Fixture,
    home: &TeamForm,
    away: &TeamForm,
    settings: &EngineSettings,
    created_at: DateTime<Utc>,
) -> Result<PredictionRecord, EngineError> {
    let no_history = home.sample_size == 0 && away.sample_size == 0;
    if no_history && !settings.allow_neutral_priors {
        return Err(EngineError::NoFormData {
            fixture_key: fixture.fixture_key.clone(),
        });
    }

    let probabilities = if no_history {
        StrengthModel::uniform()
    } else {
        StrengthModel::probabilities(
            StrengthModel::strength(home),
            StrengthModel::strength(away),
            settings.home_advantage,
        )
    };
    let reliability = StrengthModel::reliability(home.sample_size, away.sample_size);
    let label = StrengthModel::label(&probabilities);
    let confidence = (probabilities.get(label) * reliability).clamp(0.0, 1.0);
    let values = fixture
        .market_odds
        .as_ref()
        .map(|m| value::market_value(&probabilities, m, settings.value_threshold));

    Ok(PredictionRecord {
        fixture_key: fixture.fixture_key.clone(),
        engine_version: settings.engine_version.clone(),
        competition_id: fixture.competition_id.clone(),
        competition_name: fixture.competition_name.clone(),
        home_name: fixture.home.name.clone(),
        away_name: fixture.away.name.clone(),
        kickoff: fixture.kickoff,
        fair_odds: value::fair_odds(&probabilities),
        probabilities,
        label,
        confidence,
        reliability,
        market_odds: fixture.market_odds.clone(),
        values,
        home_form_hash: home.snapshot_hash(),
        away_form_hash: away.snapshot_hash(),
        home_sample_size: home.sample_size,
        away_sample_size: away.sample_size,
        created_at,
    })
}
