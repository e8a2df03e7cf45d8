use crate::model::{MarketOdds, OutcomeValue, Triple};

/// Price returned for an outcome the model considers (numerically) impossible.
pub const FAIR_ODDS_CAP: f64 = 20.0;
const MIN_PROBABILITY: f64 = 1e-6;

/// Decimal fair odds, the inverse of each probability.
pub fn fair_odds(p: &Triple<f64>) -> Triple<f64> {
    p.map(|x| if x >= MIN_PROBABILITY { 1.0 / x } else { FAIR_ODDS_CAP })
}

/// `p · market − 1` per outcome; flagged when above `threshold`.
pub fn market_value(p: &Triple<f64>, market: &MarketOdds, threshold: f64) -> Triple<OutcomeValue> {
    let value = |prob: f64, price: f64| {
        let value = prob * price - 1.0;
        OutcomeValue {
            value,
            is_value_bet: value > threshold,
        }
    };
    Triple {
        home: value(p.home, market.home),
        draw: value(p.draw, market.draw),
        away: value(p.away, market.away),
    }
}

/// Probabilities implied by market prices with the bookmaker margin removed.
pub fn implied_probabilities(market: &MarketOdds) -> Triple<f64> {
    let raw = Triple {
        home: 1.0 / market.home,
        draw: 1.0 / market.draw,
        away: 1.0 / market.away,
    };
    let overround = raw.home + raw.draw + raw.away;
    raw.map(|x| x / overround)
}
