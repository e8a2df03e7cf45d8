//! 1X2 outcome probabilities from team form.
//!
//! Converts each side's recent form into a scalar strength in [0.1, 0.9],
//! then turns the strength gap plus a home-advantage offset into clipped
//! raw outcome weights that are normalised to sum to one.
//!
//! Model:
//!   - `s = 0.40·win_rate + 0.10·draw_rate + 0.25·clip(avg_gf/3) + 0.25·clip(1 − avg_ga/3)`
//!   - `p̃_home = clip(s_home + ha − s_away + 0.5, 0.05, 0.85)`
//!   - `p̃_away = clip(s_away − s_home − ha + 0.5, 0.05, 0.85)`
//!   - `p̃_draw = max(0.05, 1 − p̃_home − p̃_away)`

use crate::model::{Outcome, TeamForm, Triple};

/// Unit struct -- all methods are stateless.
pub struct StrengthModel;

const W_WIN: f64 = 0.40;
const W_DRAW: f64 = 0.10;
const W_ATTACK: f64 = 0.25;
const W_DEFENCE: f64 = 0.25;
/// Goals per match treated as "maximal" attack / "worst" defence.
const GOAL_SCALE: f64 = 3.0;

const STRENGTH_MIN: f64 = 0.1;
const STRENGTH_MAX: f64 = 0.9;
const RAW_MIN: f64 = 0.05;
const RAW_MAX: f64 = 0.85;

/// Sample size at which a form counts as fully reliable.
const FULL_SAMPLE: usize = 10;

impl StrengthModel {
    /// Scalar strength of one side, clipped to [0.1, 0.9].
    pub fn strength(form: &TeamForm) -> f64 {
        let attack = (form.avg_gf / GOAL_SCALE).clamp(0.0, 1.0);
        let defence = (1.0 - form.avg_ga / GOAL_SCALE).clamp(0.0, 1.0);
        let s = W_WIN * form.win_rate
            + W_DRAW * form.draw_rate
            + W_ATTACK * attack
            + W_DEFENCE * defence;
        s.clamp(STRENGTH_MIN, STRENGTH_MAX)
    }

    /// Normalised outcome probabilities.
    pub fn probabilities(s_home: f64, s_away: f64, home_advantage: f64) -> Triple<f64> {
        let home = (s_home + home_advantage - s_away + 0.5).clamp(RAW_MIN, RAW_MAX);
        let away = (s_away - s_home - home_advantage + 0.5).clamp(RAW_MIN, RAW_MAX);
        let draw = (1.0 - home - away).max(RAW_MIN);
        let sum = home + draw + away;
        Triple {
            home: home / sum,
            draw: draw / sum,
            away: away / sum,
        }
    }

    /// Uniform distribution used when neither side has any history.
    pub fn uniform() -> Triple<f64> {
        Triple {
            home: 1.0 / 3.0,
            draw: 1.0 / 3.0,
            away: 1.0 / 3.0,
        }
    }

    /// Mean of both sides' sample adequacy, each capped at 10 matches.
    pub fn reliability(home_sample: usize, away_sample: usize) -> f64 {
        let side = |n: usize| n.min(FULL_SAMPLE) as f64 / FULL_SAMPLE as f64;
        (side(home_sample) + side(away_sample)) / 2.0
    }

    /// Argmax with tie-break HOME > AWAY > DRAW.
    pub fn label(p: &Triple<f64>) -> Outcome {
        let mut best = Outcome::Home;
        for candidate in [Outcome::Away, Outcome::Draw] {
            if p.get(candidate) > p.get(best) {
                best = candidate;
            }
        }
        best
    }
}
