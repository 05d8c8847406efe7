//! Domain records the pipelines read and mutate.

use std::time::Duration;

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{
    CampaignId, CompanyId, ConnectionId, ContactId, DomainError, DomainResult, Entity, ScheduleId, ShippingId, TagId,
    UserId,
};

/// Message variants a campaign may carry.
pub const MAX_VARIANTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Programada,
    EmAndamento,
    Pausada,
    Cancelada,
    Finalizada,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Programada => "PROGRAMADA",
            CampaignStatus::EmAndamento => "EM_ANDAMENTO",
            CampaignStatus::Pausada => "PAUSADA",
            CampaignStatus::Cancelada => "CANCELADA",
            CampaignStatus::Finalizada => "FINALIZADA",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        Ok(match s {
            "PROGRAMADA" => CampaignStatus::Programada,
            "EM_ANDAMENTO" => CampaignStatus::EmAndamento,
            "PAUSADA" => CampaignStatus::Pausada,
            "CANCELADA" => CampaignStatus::Cancelada,
            "FINALIZADA" => CampaignStatus::Finalizada,
            other => return Err(DomainError::validation(format!("unknown campaign status {other}"))),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Cancelada | CampaignStatus::Finalizada)
    }

    /// PROGRAMADA → EM_ANDAMENTO ⇄ PAUSADA → {FINALIZADA | CANCELADA}
    pub fn can_transition_to(&self, to: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, to),
            (Programada, EmAndamento)
                | (Programada, Cancelada)
                | (EmAndamento, Pausada)
                | (EmAndamento, Cancelada)
                | (EmAndamento, Finalizada)
                | (Pausada, EmAndamento)
                | (Pausada, Cancelada)
        )
    }

    pub fn transition(self, to: CampaignStatus) -> DomainResult<CampaignStatus> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(DomainError::invalid_transition(self, to))
        }
    }

    /// States `to` may be entered from.
    pub fn predecessors(to: CampaignStatus) -> Vec<CampaignStatus> {
        use CampaignStatus::*;
        [Programada, EmAndamento, Pausada, Cancelada, Finalizada]
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

/// A file sent alongside (or instead of) text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    pub url: String,
    pub file_name: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Pending,
    Open,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Pending => "pending",
            ConversationStatus::Open => "open",
            ConversationStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "pending" => Ok(ConversationStatus::Pending),
            "open" => Ok(ConversationStatus::Open),
            "closed" => Ok(ConversationStatus::Closed),
            other => Err(DomainError::validation(format!("unknown conversation status {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: CampaignId,
    pub company_id: CompanyId,
    pub name: String,
    pub status: CampaignStatus,
    /// Up to [`MAX_VARIANTS`] message variants; empty ones are ignored.
    pub messages: Vec<String>,
    /// Up to [`MAX_VARIANTS`] confirmation variants.
    pub confirmation_messages: Vec<String>,
    /// Ask the recipient to confirm before the main message goes out.
    pub confirmation: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub connection_id: Option<ConnectionId>,
    pub media: Option<MediaAttachment>,
    pub files: Vec<MediaAttachment>,
    pub open_ticket: bool,
    pub ticket_user_id: Option<UserId>,
    pub ticket_status: ConversationStatus,
}

impl Entity for Campaign {
    type Id = CampaignId;

    fn id(&self) -> CampaignId {
        self.id
    }
}

impl Campaign {
    pub fn new(company_id: CompanyId, name: impl Into<String>) -> Self {
        Self {
            id: CampaignId::new(),
            company_id,
            name: name.into(),
            status: CampaignStatus::Programada,
            messages: Vec::new(),
            confirmation_messages: Vec::new(),
            confirmation: false,
            scheduled_at: None,
            completed_at: None,
            connection_id: None,
            media: None,
            files: Vec::new(),
            open_ticket: false,
            ticket_user_id: None,
            ticket_status: ConversationStatus::default(),
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.messages.len() > MAX_VARIANTS || self.confirmation_messages.len() > MAX_VARIANTS {
            return Err(DomainError::validation(format!(
                "campaigns carry at most {MAX_VARIANTS} variants"
            )));
        }
        Ok(())
    }
}

/// A recipient on a campaign's contact list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub name: String,
    pub number: String,
    pub email: Option<String>,
    /// Text appended to every message this contact receives.
    pub custom_message: Option<String>,
}

impl Entity for Contact {
    type Id = ContactId;

    fn id(&self) -> ContactId {
        self.id
    }
}

impl Contact {
    pub fn new(name: impl Into<String>, number: impl Into<String>) -> Self {
        Self {
            id: ContactId::new(),
            name: name.into(),
            number: number.into(),
            email: None,
            custom_message: None,
        }
    }

    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }
}

/// Per-recipient delivery record; the unit of idempotency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignShipping {
    pub id: ShippingId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub number: String,
    pub message: String,
    pub confirmation_message: Option<String>,
    pub confirmation: bool,
    pub confirmation_requested_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Id of the dispatch job last enqueued for this row.
    pub job_id: Option<String>,
}

impl Entity for CampaignShipping {
    type Id = ShippingId;

    fn id(&self) -> ShippingId {
        self.id
    }
}

impl CampaignShipping {
    /// Nothing left for a dispatch to do.
    pub fn is_settled(&self) -> bool {
        self.delivered_at.is_some() || (self.confirmation_requested_at.is_some() && self.confirmed_at.is_none())
    }
}

/// Fields for creating a shipping row when none exists yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewShipping {
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub number: String,
    pub message: String,
    pub confirmation_message: Option<String>,
    pub confirmation: bool,
}

impl NewShipping {
    pub fn into_shipping(self) -> CampaignShipping {
        CampaignShipping {
            id: ShippingId::new(),
            campaign_id: self.campaign_id,
            contact_id: self.contact_id,
            number: self.number,
            message: self.message,
            confirmation_message: self.confirmation_message,
            confirmation: self.confirmation,
            confirmation_requested_at: None,
            confirmed_at: None,
            delivered_at: None,
            job_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Pendente,
    Agendada,
    Processando,
    Enviada,
    Erro,
    Cancelada,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pendente => "PENDENTE",
            ScheduleStatus::Agendada => "AGENDADA",
            ScheduleStatus::Processando => "PROCESSANDO",
            ScheduleStatus::Enviada => "ENVIADA",
            ScheduleStatus::Erro => "ERRO",
            ScheduleStatus::Cancelada => "CANCELADA",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        Ok(match s {
            "PENDENTE" => ScheduleStatus::Pendente,
            "AGENDADA" => ScheduleStatus::Agendada,
            "PROCESSANDO" => ScheduleStatus::Processando,
            "ENVIADA" => ScheduleStatus::Enviada,
            "ERRO" => ScheduleStatus::Erro,
            "CANCELADA" => ScheduleStatus::Cancelada,
            other => return Err(DomainError::validation(format!("unknown schedule status {other}"))),
        })
    }
}

/// Independent recurrence of a scheduled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceType {
    #[default]
    None,
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Quarterly,
    Semiannually,
    Yearly,
}

impl RecurrenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrenceType::None => "none",
            RecurrenceType::Daily => "daily",
            RecurrenceType::Weekly => "weekly",
            RecurrenceType::Biweekly => "biweekly",
            RecurrenceType::Monthly => "monthly",
            RecurrenceType::Quarterly => "quarterly",
            RecurrenceType::Semiannually => "semiannually",
            RecurrenceType::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        Ok(match s {
            "none" | "" => RecurrenceType::None,
            "daily" => RecurrenceType::Daily,
            "weekly" => RecurrenceType::Weekly,
            "biweekly" => RecurrenceType::Biweekly,
            "monthly" => RecurrenceType::Monthly,
            "quarterly" => RecurrenceType::Quarterly,
            "semiannually" => RecurrenceType::Semiannually,
            "yearly" => RecurrenceType::Yearly,
            other => return Err(DomainError::validation(format!("unknown recurrence {other}"))),
        })
    }

    /// The occurrence after `from`. Month-based steps clamp to the end of shorter months.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let days = |n: i64| from.checked_add_signed(chrono::Duration::days(n));
        let months = |n: u32| from.checked_add_months(Months::new(n));
        match self {
            RecurrenceType::None => None,
            RecurrenceType::Daily => days(1),
            RecurrenceType::Weekly => days(7),
            RecurrenceType::Biweekly => days(14),
            RecurrenceType::Monthly => months(1),
            RecurrenceType::Quarterly => months(3),
            RecurrenceType::Semiannually => months(6),
            RecurrenceType::Yearly => months(12),
        }
    }
}

/// Tag-linked recurrence: resend every `repeat_every_days` (0 = once).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagRecurrence {
    pub tag_id: TagId,
    pub repeat_every_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: ScheduleId,
    pub company_id: CompanyId,
    pub contact_id: ContactId,
    pub number: String,
    pub body: String,
    pub media: Option<MediaAttachment>,
    pub connection_id: Option<ConnectionId>,
    pub send_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub status: ScheduleStatus,
    pub recurrence: RecurrenceType,
    pub recurrence_end_date: Option<DateTime<Utc>>,
    pub tag_recurrence: Option<TagRecurrence>,
}

impl Entity for Schedule {
    type Id = ScheduleId;

    fn id(&self) -> ScheduleId {
        self.id
    }
}

impl Schedule {
    pub fn new(company_id: CompanyId, contact_id: ContactId, number: impl Into<String>, body: impl Into<String>, send_at: DateTime<Utc>) -> Self {
        Self {
            id: ScheduleId::new(),
            company_id,
            contact_id,
            number: number.into(),
            body: body.into(),
            media: None,
            connection_id: None,
            send_at,
            sent_at: None,
            status: ScheduleStatus::Pendente,
            recurrence: RecurrenceType::None,
            recurrence_end_date: None,
            tag_recurrence: None,
        }
    }

    /// Next independent occurrence, if it falls on or before the end date.
    pub fn next_occurrence(&self) -> Option<DateTime<Utc>> {
        let end = self.recurrence_end_date?;
        let next = self.recurrence.next_after(self.send_at)?;
        (next.date_naive() <= end.date_naive()).then_some(next)
    }

    /// The follow-up row for [`Self::next_occurrence`].
    pub fn next_row(&self) -> Option<Schedule> {
        let send_at = self.next_occurrence()?;
        Some(Schedule {
            id: ScheduleId::new(),
            send_at,
            sent_at: None,
            status: ScheduleStatus::Pendente,
            ..self.clone()
        })
    }
}

/// A free-form placeholder defined in company settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    pub value: String,
}

/// Per-company campaign pacing and placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSettings {
    pub message_interval: Duration,
    /// Contact index from which `greater_interval` is added; 0 disables it.
    pub longer_interval_after: u32,
    pub greater_interval: Duration,
    pub variables: Vec<Variable>,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            message_interval: Duration::from_secs(5),
            longer_interval_after: 0,
            greater_interval: Duration::ZERO,
            variables: Vec::new(),
        }
    }
}

/// A paired messaging session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub company_id: CompanyId,
    pub name: String,
    pub is_default: bool,
}
