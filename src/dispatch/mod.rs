//! Per-subscriber filtering, ranking, rendering and delivery.

pub mod adapter;
pub mod render;
pub mod subscriber;

use crate::config::{Config, SubscriberConfig};
use crate::health::{Health, PipelineCounters};
use crate::model::PredictionRecord;
use adapter::SharedAdapter;
use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use subscriber::SubscriberState;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberReport {
    pub candidates: usize,
    pub sent: usize,
    pub failed: usize,
    pub muted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
    pub subscribers: BTreeMap<String, SubscriberReport>,
}

impl DispatchReport {
    pub fn degraded(&self) -> bool {
        self.failed > 0
    }
}

/// Confidence desc, reliability desc, kickoff asc, then key for a total order.
pub fn rank(a: &PredictionRecord, b: &PredictionRecord) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| b.reliability.total_cmp(&a.reliability))
        .then_with(|| a.kickoff.cmp(&b.kickoff))
        .then_with(|| a.fixture_key.cmp(&b.fixture_key))
}

pub struct Dispatcher {
    adapter: SharedAdapter,
    health: Arc<Health>,
    states: Mutex<HashMap<String, Arc<tokio::sync::Mutex<SubscriberState>>>>,
}

impl Dispatcher {
    pub fn new(adapter: SharedAdapter, health: Arc<Health>) -> Self {
        Self::with_states(adapter, health, Vec::new())
    }

    /// Resume from persisted subscriber state.
    pub fn with_states(adapter: SharedAdapter, health: Arc<Health>, states: Vec<SubscriberState>) -> Self {
        let states = states
            .into_iter()
            .map(|s| (s.handle.clone(), Arc::new(tokio::sync::Mutex::new(s))))
            .collect();
        Self {
            adapter,
            health,
            states: Mutex::new(states),
        }
    }

    fn state_for(&self, config: &SubscriberConfig, now: DateTime<Utc>) -> Arc<tokio::sync::Mutex<SubscriberState>> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .entry(config.handle.clone())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(SubscriberState::new(
                    &config.handle,
                    now,
                    config.utc_offset_minutes,
                )))
            })
            .clone()
    }

    /// Copy of every subscriber's state, ordered by handle.
    pub async fn states(&self) -> Vec<SubscriberState> {
        let handles: Vec<Arc<tokio::sync::Mutex<SubscriberState>>> = {
            let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            states.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.clone());
        }
        out.sort_by(|a, b| a.handle.cmp(&b.handle));
        out
    }

    /// Deliver `records` to every configured subscriber. Subscribers are
    /// processed concurrently; each one's state is held locked for its pass.
    pub async fn dispatch(&self, config: &Config, records: &[PredictionRecord], now: DateTime<Utc>) -> DispatchReport {
        let passes = config.subscribers.iter().map(|sub| async move {
            let state = self.state_for(sub, now);
            let mut state = state.lock().await;
            let report = self.dispatch_one(config, sub, &mut state, records, now).await;
            (sub.handle.clone(), report)
        });

        let mut report = DispatchReport::default();
        for (handle, sub_report) in join_all(passes).await {
            report.sent += sub_report.sent;
            report.failed += sub_report.failed;
            report.subscribers.insert(handle, sub_report);
        }
        tracing::info!(
            subscribers = report.subscribers.len(),
            sent = report.sent,
            failed = report.failed,
            "dispatch run complete"
        );
        report
    }

    async fn dispatch_one(
        &self,
        config: &Config,
        sub: &SubscriberConfig,
        state: &mut SubscriberState,
        records: &[PredictionRecord],
        now: DateTime<Utc>,
    ) -> SubscriberReport {
        let mut report = SubscriberReport::default();
        if state.roll_window(now, sub.utc_offset_minutes) {
            tracing::debug!(handle = %sub.handle, "subscriber window reset");
        }
        if state.is_muted(now) {
            report.muted = true;
            return report;
        }

        let mut candidates: Vec<&PredictionRecord> =
            records.iter().filter(|r| state.accepts(sub, r)).collect();
        candidates.sort_by(|a, b| rank(a, b));
        candidates.truncate(sub.top_k);
        report.candidates = candidates.len();

        let counters = &self.health.counters;
        let mute = Duration::seconds(config.dispatch_mute_seconds as i64);
        for record in candidates {
            if !state.can_send(sub, now) {
                break;
            }
            let text = render::render(record, sub.utc_offset_minutes);
            let outcome = match self.send_chunks(&sub.handle, &text).await {
                Ok(()) => Ok(()),
                // Resending would repeat the chunks already shown.
                Err(partial) if partial.delivered > 0 => {
                    tracing::warn!(
                        handle = %sub.handle,
                        fixture_key = %record.fixture_key,
                        chunks_sent = partial.delivered,
                        error = %partial.error,
                        "message partly delivered, marking as sent"
                    );
                    Ok(())
                }
                Err(partial) => Err(partial.error),
            };
            match outcome {
                Ok(()) => {
                    state.record_success(&record.fixture_key, now);
                    report.sent += 1;
                    PipelineCounters::add(&counters.messages_sent, 1);
                    tracing::info!(
                        handle = %sub.handle,
                        fixture_key = %record.fixture_key,
                        confidence = record.confidence,
                        "prediction delivered"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    PipelineCounters::add(&counters.messages_failed, 1);
                    if e.retryable {
                        tracing::warn!(handle = %sub.handle, fixture_key = %record.fixture_key, error = %e, "delivery failed, will retry next run");
                    } else {
                        tracing::error!(handle = %sub.handle, fixture_key = %record.fixture_key, error = %e, "delivery rejected");
                    }
                    if state.record_failure(now, config.dispatch_error_threshold, mute) {
                        report.muted = true;
                        PipelineCounters::add(&counters.subscribers_muted, 1);
                        tracing::warn!(
                            handle = %sub.handle,
                            until = ?state.muted_until,
                            "subscriber muted after consecutive delivery failures"
                        );
                        break;
                    }
                }
            }
        }
        report
    }

    async fn send_chunks(&self, handle: &str, text: &str) -> Result<(), PartialSend> {
        let chunks = render::split_message(text, self.adapter.max_message_len());
        for (delivered, chunk) in chunks.iter().enumerate() {
            if let Err(error) = self.adapter.send(handle, chunk).await {
                return Err(PartialSend { delivered, error });
            }
        }
        Ok(())
    }
}

/// A send that failed after `delivered` chunks went out.
struct PartialSend {
    delivered: usize,
    error: adapter::SendError,
}
