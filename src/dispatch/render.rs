//! Message template and length-limited splitting.

use crate::engine::value::implied_probabilities;
use crate::model::{Outcome, PredictionRecord};
use chrono::{Duration, FixedOffset, Offset, Utc};

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn pct(p: f64) -> String {
    format!("{:.1}%", p * 100.0)
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Home => "Home win",
        Outcome::Draw => "Draw",
        Outcome::Away => "Away win",
    }
}

fn flag(is_value: bool) -> &'static str {
    if is_value {
        "✅"
    } else {
        "❌"
    }
}

/// Render one prediction. Kickoff is shown in the subscriber's offset.
pub fn render(record: &PredictionRecord, utc_offset_minutes: i32) -> String {
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
        .unwrap_or_else(|| Utc.fix());
    let local = record.kickoff.with_timezone(&offset);
    let zone = if utc_offset_minutes == 0 {
        "UTC".to_string()
    } else {
        let d = Duration::minutes(utc_offset_minutes.abs() as i64);
        let sign = if utc_offset_minutes < 0 { '-' } else { '+' };
        format!("UTC{sign}{:02}:{:02}", d.num_hours(), d.num_minutes() % 60)
    };

    let p = &record.probabilities;
    let o = &record.fair_odds;
    let mut paragraphs = vec![
        format!(
            "⚽ <b>{} vs {}</b>\n🏆 {}\n🕒 {} {}",
            escape_html(&record.home_name),
            escape_html(&record.away_name),
            escape_html(&record.competition_name),
            local.format("%Y-%m-%d %H:%M"),
            zone
        ),
        format!(
            "{}: {} (fair {:.2})\n{}: {} (fair {:.2})\n{}: {} (fair {:.2})",
            outcome_label(Outcome::Home),
            pct(p.home),
            o.home,
            outcome_label(Outcome::Draw),
            pct(p.draw),
            o.draw,
            outcome_label(Outcome::Away),
            pct(p.away),
            o.away
        ),
        format!(
            "Pick: <b>{}</b>\nConfidence: {} (reliability {})",
            record.label.as_str(),
            pct(record.confidence),
            pct(record.reliability)
        ),
    ];

    if let (Some(market), Some(values)) = (&record.market_odds, &record.values) {
        let implied = implied_probabilities(market);
        paragraphs.push(format!(
            "Market {:.2} / {:.2} / {:.2} (implied {} / {} / {})\nValue: H {:+.2} {} | D {:+.2} {} | A {:+.2} {}",
            market.home,
            market.draw,
            market.away,
            pct(implied.home),
            pct(implied.draw),
            pct(implied.away),
            values.home.value,
            flag(values.home.is_value_bet),
            values.draw.value,
            flag(values.draw.is_value_bet),
            values.away.value,
            flag(values.away.is_value_bet)
        ));
    }

    paragraphs.join("\n\n")
}

/// Split `text` into chunks of at most `max_len` chars, breaking on blank
/// lines where possible. Order is preserved; no chunk is empty.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for paragraph in text.split("\n\n").filter(|p| !p.is_empty()) {
        let len = paragraph.chars().count();
        let joined_len = if current_len == 0 { len } else { current_len + 2 + len };
        if joined_len <= max_len {
            if current_len > 0 {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
            current_len = joined_len;
            continue;
        }
        if current_len > 0 {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if len <= max_len {
            current.push_str(paragraph);
            current_len = len;
        } else {
            let chars: Vec<char> = paragraph.chars().collect();
            for piece in chars.chunks(max_len) {
                chunks.push(piece.iter().collect());
            }
        }
    }
    if current_len > 0 {
        chunks.push(current);
    }
    chunks
}
