//! Per-campaign update coalescing.
//!
//! Bursts of campaign changes (hundreds of completion checks, pause/resume) are
//! folded into at most one realtime notification per campaign per window. Only
//! the latest snapshot is kept.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value as JsonValue, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span, warn};

use courier_core::{CampaignId, Clock, CompanyId};

use crate::ports::Notifier;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3);

/// Realtime event name for a company's campaign updates.
pub fn campaign_event(company_id: CompanyId) -> String {
    format!("company-{company_id}-campaign")
}

#[derive(Debug, Default)]
struct Slot {
    company_id: Option<CompanyId>,
    pending: Option<JsonValue>,
    last_flushed: Option<DateTime<Utc>>,
}

pub struct UpdateCoalescer {
    window: chrono::Duration,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    slots: Mutex<HashMap<CampaignId, Slot>>,
}

impl UpdateCoalescer {
    pub fn new(notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or_default(),
            clock,
            notifier,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<CampaignId, Slot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Buffer the latest snapshot of a campaign.
    pub fn push(&self, company_id: CompanyId, campaign_id: CampaignId, record: JsonValue) {
        let mut slots = self.slots();
        let slot = slots.entry(campaign_id).or_default();
        slot.company_id = Some(company_id);
        slot.pending = Some(record);
    }

    /// Emit every pending snapshot whose campaign has not been flushed within
    /// the window. Returns how many were emitted.
    pub async fn flush_due(&self) -> usize {
        let now = self.clock.now();
        let due = self.take(|slot| slot.last_flushed.is_none_or(|at| now - at >= self.window), now);
        self.emit_all(due).await
    }

    /// Emit everything pending regardless of the window (shutdown).
    pub async fn flush_now(&self) -> usize {
        let now = self.clock.now();
        let due = self.take(|_| true, now);
        self.emit_all(due).await
    }

    pub fn pending(&self) -> usize {
        self.slots().values().filter(|s| s.pending.is_some()).count()
    }

    fn take(&self, ready: impl Fn(&Slot) -> bool, now: DateTime<Utc>) -> Vec<(CompanyId, JsonValue)> {
        let mut slots = self.slots();
        let mut due = Vec::new();
        for slot in slots.values_mut() {
            if slot.pending.is_none() || !ready(slot) {
                continue;
            }
            if let (Some(company_id), Some(record)) = (slot.company_id, slot.pending.take()) {
                slot.last_flushed = Some(now);
                due.push((company_id, record));
            }
        }
        // Slots idle for a full window carry no state worth keeping.
        slots.retain(|_, slot| slot.pending.is_some() || slot.last_flushed.is_some_and(|at| now - at < self.window));
        due
    }

    async fn emit_all(&self, due: Vec<(CompanyId, JsonValue)>) -> usize {
        let count = due.len();
        for (company_id, record) in due {
            let event = campaign_event(company_id);
            let payload = json!({ "action": "update", "record": record });
            if let Err(e) = self.notifier.emit(&event, payload).await {
                warn!(event = %event, error = %e, "campaign update notification failed");
            }
        }
        count
    }

    /// Flush due updates on a fixed tick until cancelled, then flush the rest.
    pub fn spawn(self: Arc<Self>, tick: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            self.flush_due().await;
                        }
                    }
                }
                self.flush_now().await;
            }
            .instrument(info_span!("update-coalescer")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::CollectingNotifier;
    use courier_core::ManualClock;

    fn setup() -> (Arc<ManualClock>, Arc<CollectingNotifier>, UpdateCoalescer) {
        let clock = ManualClock::arc(Utc::now());
        let notifier = Arc::new(CollectingNotifier::default());
        let coalescer = UpdateCoalescer::new(notifier.clone(), clock.clone(), DEFAULT_WINDOW);
        (clock, notifier, coalescer)
    }

    #[tokio::test]
    async fn burst_collapses_into_one_emission_per_window() {
        let (clock, notifier, coalescer) = setup();
        let company = CompanyId::new();
        let campaign = CampaignId::new();

        for n in 0..10 {
            coalescer.push(company, campaign, json!({ "n": n }));
        }
        assert_eq!(coalescer.flush_due().await, 1);

        coalescer.push(company, campaign, json!({ "n": 10 }));
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(coalescer.flush_due().await, 0);

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(coalescer.flush_due().await, 1);

        let events = notifier.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, campaign_event(company));
        assert_eq!(events[0].1, json!({ "action": "update", "record": { "n": 9 } }));
        assert_eq!(events[1].1["record"]["n"], 10);
    }

    #[tokio::test]
    async fn campaigns_are_coalesced_independently() {
        let (_, notifier, coalescer) = setup();
        let company = CompanyId::new();
        coalescer.push(company, CampaignId::new(), json!(1));
        coalescer.push(company, CampaignId::new(), json!(2));
        assert_eq!(coalescer.flush_due().await, 2);
        assert_eq!(notifier.events().len(), 2);
    }

    #[tokio::test]
    async fn flush_now_ignores_the_window() {
        let (_, notifier, coalescer) = setup();
        let company = CompanyId::new();
        let campaign = CampaignId::new();
        coalescer.push(company, campaign, json!(1));
        coalescer.flush_due().await;
        coalescer.push(company, campaign, json!(2));

        assert_eq!(coalescer.flush_now().await, 1);
        assert_eq!(coalescer.pending(), 0);
        assert_eq!(notifier.events().len(), 2);
    }
}
