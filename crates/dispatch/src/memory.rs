//! In-memory implementations of every port.
//!
//! Intended for tests/dev. Each conditional update runs under one write lock,
//! which gives the same race semantics as the conditional SQL statements.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use courier_core::{CampaignId, CompanyId, ConnectionId, ContactId, ConversationId, Entity, ScheduleId, ShippingId};

use crate::error::{NotifyError, StoreError, TransportError};
use crate::model::{
    Campaign, CampaignSettings, CampaignShipping, CampaignStatus, Connection, Contact, NewShipping, Schedule,
    ScheduleStatus,
};
use crate::ports::{
    CampaignStore, ConnectionDirectory, ConversationRequest, ConversationStore, ExistsResult, MessagingTransport,
    Notifier, OutboundContent, ScheduleStore, SettingsStore,
};

#[derive(Debug, Default)]
struct Tables {
    campaigns: HashMap<CampaignId, Campaign>,
    contacts: HashMap<CampaignId, Vec<Contact>>,
    shippings: HashMap<ShippingId, CampaignShipping>,
    schedules: HashMap<ScheduleId, Schedule>,
    settings: HashMap<CompanyId, CampaignSettings>,
    connections: HashMap<ConnectionId, Connection>,
    conversations: HashMap<(CompanyId, ContactId, ConnectionId), ConversationId>,
}

/// One store backing all relational ports.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::database("read", "lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::database("write", "lock poisoned"))
    }

    pub fn add_campaign(&self, campaign: Campaign, contacts: Vec<Contact>) -> Result<(), StoreError> {
        campaign.validate()?;
        let mut tables = self.write()?;
        tables.contacts.insert(campaign.id, contacts);
        put(&mut tables.campaigns, campaign);
        Ok(())
    }

    pub fn add_schedule(&self, schedule: Schedule) -> Result<(), StoreError> {
        put(&mut self.write()?.schedules, schedule);
        Ok(())
    }

    pub fn add_connection(&self, connection: Connection) -> Result<(), StoreError> {
        self.write()?.connections.insert(connection.id, connection);
        Ok(())
    }

    pub fn set_settings(&self, company_id: CompanyId, settings: CampaignSettings) -> Result<(), StoreError> {
        self.write()?.settings.insert(company_id, settings);
        Ok(())
    }

    /// Shipping rows of a campaign.
    pub fn shippings(&self, campaign_id: CampaignId) -> Result<Vec<CampaignShipping>, StoreError> {
        Ok(self
            .read()?
            .shippings
            .values()
            .filter(|s| s.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    /// Every schedule row, oldest `send_at` first.
    pub fn schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let mut rows: Vec<_> = self.read()?.schedules.values().cloned().collect();
        rows.sort_by_key(|s| s.send_at);
        Ok(rows)
    }

    pub fn conversation_count(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.conversations.len())
    }

    fn update_shipping(
        &self,
        id: ShippingId,
        apply: impl FnOnce(&mut CampaignShipping) -> bool,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        Ok(tables.shippings.get_mut(&id).is_some_and(apply))
    }

    fn update_schedule(&self, id: ScheduleId, apply: impl FnOnce(&mut Schedule)) -> Result<(), StoreError> {
        if let Some(schedule) = self.write()?.schedules.get_mut(&id) {
            apply(schedule);
        }
        Ok(())
    }
}

#[async_trait]
impl CampaignStore for InMemoryStore {
    async fn due_campaigns(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Campaign>, StoreError> {
        let tables = self.read()?;
        let mut due: Vec<_> = tables
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Programada && c.scheduled_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|c| c.scheduled_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        Ok(self.read()?.campaigns.get(&id).cloned())
    }

    async fn contacts(&self, campaign_id: CampaignId) -> Result<Vec<Contact>, StoreError> {
        Ok(self.read()?.contacts.get(&campaign_id).cloned().unwrap_or_default())
    }

    async fn contact(&self, campaign_id: CampaignId, contact_id: ContactId) -> Result<Option<Contact>, StoreError> {
        Ok(self
            .read()?
            .contacts
            .get(&campaign_id)
            .and_then(|list| list.iter().find(|c| c.id == contact_id).cloned()))
    }

    async fn contact_count(&self, campaign_id: CampaignId) -> Result<u64, StoreError> {
        Ok(self.read()?.contacts.get(&campaign_id).map_or(0, |l| l.len() as u64))
    }

    async fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        let Some(campaign) = tables.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&campaign.status) {
            return Ok(false);
        }
        campaign.status = to;
        if completed_at.is_some() {
            campaign.completed_at = completed_at;
        }
        Ok(true)
    }

    async fn find_or_create_shipping(&self, new: NewShipping) -> Result<(CampaignShipping, bool), StoreError> {
        let mut tables = self.write()?;
        if let Some(existing) = tables
            .shippings
            .values()
            .find(|s| s.campaign_id == new.campaign_id && s.contact_id == new.contact_id)
        {
            return Ok((existing.clone(), false));
        }
        let row = new.into_shipping();
        put(&mut tables.shippings, row.clone());
        Ok((row, true))
    }

    async fn shipping(&self, id: ShippingId) -> Result<Option<CampaignShipping>, StoreError> {
        Ok(self.read()?.shippings.get(&id).cloned())
    }

    async fn set_shipping_job(&self, id: ShippingId, job_id: &str) -> Result<(), StoreError> {
        self.update_shipping(id, |row| {
            row.job_id = Some(job_id.to_string());
            true
        })?;
        Ok(())
    }

    async fn mark_delivered(&self, id: ShippingId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.update_shipping(id, |row| {
            if row.delivered_at.is_some() {
                return false;
            }
            row.delivered_at = Some(at);
            true
        })
    }

    async fn mark_confirmation_requested(&self, id: ShippingId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.update_shipping(id, |row| {
            if row.confirmation_requested_at.is_some() {
                return false;
            }
            row.confirmation_requested_at = Some(at);
            true
        })
    }

    async fn mark_confirmed(&self, id: ShippingId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.update_shipping(id, |row| {
            if row.confirmation_requested_at.is_none() || row.confirmed_at.is_some() {
                return false;
            }
            row.confirmed_at = Some(at);
            true
        })
    }

    async fn delivered_count(&self, campaign_id: CampaignId) -> Result<u64, StoreError> {
        Ok(self
            .read()?
            .shippings
            .values()
            .filter(|s| s.campaign_id == campaign_id && s.delivered_at.is_some())
            .count() as u64)
    }
}

#[async_trait]
impl ScheduleStore for InMemoryStore {
    async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>, StoreError> {
        let tables = self.read()?;
        let mut due: Vec<_> = tables
            .schedules
            .values()
            .filter(|s| s.status == ScheduleStatus::Pendente && s.sent_at.is_none() && s.send_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.send_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_schedules(&self, ids: &[ScheduleId]) -> Result<Vec<ScheduleId>, StoreError> {
        let mut tables = self.write()?;
        let mut claimed = Vec::new();
        for id in ids {
            if let Some(s) = tables.schedules.get_mut(id) {
                if s.status == ScheduleStatus::Pendente {
                    s.status = ScheduleStatus::Agendada;
                    claimed.push(*id);
                }
            }
        }
        Ok(claimed)
    }

    async fn schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, StoreError> {
        Ok(self.read()?.schedules.get(&id).cloned())
    }

    async fn set_schedule_status(&self, id: ScheduleId, status: ScheduleStatus) -> Result<(), StoreError> {
        self.update_schedule(id, |s| s.status = status)
    }

    async fn mark_sent(&self, id: ScheduleId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.update_schedule(id, |s| {
            s.status = ScheduleStatus::Enviada;
            s.sent_at = Some(at);
        })
    }

    async fn reschedule(&self, id: ScheduleId, send_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.update_schedule(id, |s| {
            s.status = ScheduleStatus::Pendente;
            s.send_at = send_at;
            s.sent_at = None;
        })
    }

    async fn insert_schedule(&self, schedule: Schedule) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if tables.schedules.contains_key(&schedule.id) {
            return Err(StoreError::Conflict(format!("schedule {} already exists", schedule.id)));
        }
        put(&mut tables.schedules, schedule);
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for InMemoryStore {
    async fn campaign_settings(&self, company_id: CompanyId) -> Result<CampaignSettings, StoreError> {
        Ok(self.read()?.settings.get(&company_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ConnectionDirectory for InMemoryStore {
    async fn connection(&self, id: ConnectionId) -> Result<Option<Connection>, StoreError> {
        Ok(self.read()?.connections.get(&id).cloned())
    }

    async fn default_connection(&self, company_id: CompanyId) -> Result<Option<Connection>, StoreError> {
        Ok(self
            .read()?
            .connections
            .values()
            .find(|c| c.company_id == company_id && c.is_default)
            .cloned())
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn open_or_reuse(&self, request: ConversationRequest) -> Result<ConversationId, StoreError> {
        let mut tables = self.write()?;
        let key = (request.company_id, request.contact_id, request.connection_id);
        Ok(*tables.conversations.entry(key).or_insert_with(ConversationId::new))
    }
}

fn put<E: Entity>(table: &mut HashMap<E::Id, E>, row: E) {
    table.insert(row.id(), row);
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// One send the transport accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub connection_id: ConnectionId,
    pub destination: String,
    pub content: OutboundContent,
}

/// Transport that records sends instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    missing: Mutex<HashSet<String>>,
    rejecting: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    checks: AtomicU64,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// `check_exists` reports this number as not on the network.
    pub fn mark_missing(&self, number: impl Into<String>) {
        guard(&self.missing).insert(number.into());
    }

    /// Sends to this destination are rejected.
    pub fn mark_rejecting(&self, destination: impl Into<String>) {
        guard(&self.rejecting).insert(destination.into());
    }

    /// Every call fails with [`TransportError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        guard(&self.sent).clone()
    }

    pub fn sent_to(&self, destination: &str) -> usize {
        guard(&self.sent).iter().filter(|m| m.destination == destination).count()
    }

    pub fn existence_checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), TransportError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("transport offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessagingTransport for RecordingTransport {
    async fn send(&self, connection: &Connection, destination: &str, content: &OutboundContent) -> Result<String, TransportError> {
        self.ensure_available()?;
        if guard(&self.rejecting).contains(destination) {
            return Err(TransportError::Rejected(format!("{destination} refused the message")));
        }
        let mut sent = guard(&self.sent);
        sent.push(SentMessage {
            connection_id: connection.id,
            destination: destination.to_string(),
            content: content.clone(),
        });
        Ok(format!("msg-{}", sent.len()))
    }

    async fn check_exists(&self, _connection: &Connection, number: &str) -> Result<ExistsResult, TransportError> {
        self.ensure_available()?;
        self.checks.fetch_add(1, Ordering::SeqCst);
        let exists = !guard(&self.missing).contains(number);
        Ok(ExistsResult {
            exists,
            normalized_id: exists.then(|| number.to_string()),
        })
    }
}

/// Notifier that keeps every emitted event.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    events: Mutex<Vec<(String, JsonValue)>>,
}

impl CollectingNotifier {
    pub fn events(&self) -> Vec<(String, JsonValue)> {
        guard(&self.events).clone()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn emit(&self, event: &str, payload: JsonValue) -> Result<(), NotifyError> {
        guard(&self.events).push((event.to_string(), payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_shipping(campaign_id: CampaignId, contact_id: ContactId) -> NewShipping {
        NewShipping {
            campaign_id,
            contact_id,
            number: "5511".into(),
            message: "hi".into(),
            confirmation_message: None,
            confirmation: false,
        }
    }

    #[tokio::test]
    async fn find_or_create_returns_the_existing_row() {
        let store = InMemoryStore::new();
        let (campaign, contact) = (CampaignId::new(), ContactId::new());

        let (first, created) = store.find_or_create_shipping(new_shipping(campaign, contact)).await.unwrap();
        assert!(created);
        let (second, created) = store.find_or_create_shipping(new_shipping(campaign, contact)).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn transition_applies_only_from_listed_states() {
        let store = InMemoryStore::new();
        let campaign = Campaign::new(CompanyId::new(), "c");
        let id = campaign.id;
        store.add_campaign(campaign, vec![]).unwrap();

        assert!(!store
            .transition_status(id, &[CampaignStatus::EmAndamento], CampaignStatus::Finalizada, None)
            .await
            .unwrap());
        assert!(store
            .transition_status(id, &[CampaignStatus::Programada], CampaignStatus::EmAndamento, None)
            .await
            .unwrap());
        assert_eq!(store.campaign(id).await.unwrap().unwrap().status, CampaignStatus::EmAndamento);
    }

    #[tokio::test]
    async fn claim_flips_only_pending_rows() {
        let store = InMemoryStore::new();
        let s = Schedule::new(CompanyId::new(), ContactId::new(), "1", "b", Utc::now());
        let id = s.id;
        store.add_schedule(s).unwrap();

        assert_eq!(store.claim_schedules(&[id]).await.unwrap(), vec![id]);
        assert!(store.claim_schedules(&[id]).await.unwrap().is_empty());
        assert_eq!(store.schedule(id).await.unwrap().unwrap().status, ScheduleStatus::Agendada);
    }

    #[tokio::test]
    async fn confirmation_needs_a_prior_request() {
        let store = InMemoryStore::new();
        let (row, _) = store
            .find_or_create_shipping(new_shipping(CampaignId::new(), ContactId::new()))
            .await
            .unwrap();
        assert!(!store.mark_confirmed(row.id, Utc::now()).await.unwrap());
        assert!(store.mark_confirmation_requested(row.id, Utc::now()).await.unwrap());
        assert!(store.mark_confirmed(row.id, Utc::now()).await.unwrap());
        assert!(!store.mark_confirmed(row.id, Utc::now()).await.unwrap());
    }
}
