//! Per-provider request quota: a sliding 60-second window plus an optional
//! rolling 24-hour budget.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    DailyBudgetExhausted,
}

/// Point-in-time view of a limiter for the health document.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct QuotaSnapshot {
    pub requests_per_minute: u32,
    pub minute_remaining: u32,
    pub requests_per_day: Option<u32>,
    pub day_remaining: Option<u32>,
    /// Milliseconds until the next request may be issued (0 = now).
    pub next_available_ms: u64,
}

#[derive(Debug, Default)]
struct Window {
    minute: VecDeque<Instant>,
    day: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while self.minute.front().is_some_and(|&t| t + MINUTE <= now) {
            self.minute.pop_front();
        }
        while self.day.front().is_some_and(|&t| t + DAY <= now) {
            self.day.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    per_minute: u32,
    per_day: Option<u32>,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(per_minute: u32, per_day: Option<u32>) -> Self {
        Self {
            per_minute: per_minute.max(1),
            per_day,
            window: Mutex::new(Window::default()),
        }
    }

    /// Reserve one request slot, sleeping until the oldest request in the
    /// minute window ages out. Fails immediately when the daily budget is spent.
    pub async fn acquire(&self) -> Result<(), QuotaError> {
        while let Some(wake) = self.try_reserve()? {
            tokio::time::sleep_until(wake).await;
        }
        Ok(())
    }

    /// Reserve a slot if one is free now. `Ok(Some(wake))` means the minute
    /// window is full until `wake`; nothing was reserved.
    pub fn try_reserve(&self) -> Result<Option<Instant>, QuotaError> {
        let mut w = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        w.prune(now);
        if let Some(per_day) = self.per_day {
            if w.day.len() >= per_day as usize {
                return Err(QuotaError::DailyBudgetExhausted);
            }
        }
        if w.minute.len() < self.per_minute as usize {
            w.minute.push_back(now);
            w.day.push_back(now);
            return Ok(None);
        }
        Ok(Some(w.minute.front().map_or(now, |&oldest| oldest + MINUTE)))
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let now = Instant::now();
        let mut snap = QuotaSnapshot {
            requests_per_minute: self.per_minute,
            requests_per_day: self.per_day,
            ..QuotaSnapshot::default()
        };
        let mut w = self.window.lock().unwrap_or_else(|e| e.into_inner());
        w.prune(now);
        snap.minute_remaining = self.per_minute.saturating_sub(w.minute.len() as u32);
        snap.day_remaining = self
            .per_day
            .map(|d| d.saturating_sub(w.day.len() as u32));
        if snap.minute_remaining == 0 {
            if let Some(&oldest) = w.minute.front() {
                snap.next_available_ms = (oldest + MINUTE).saturating_duration_since(now).as_millis() as u64;
            }
        }
        snap
    }
}
