//! Postgres-backed stores.
//!
//! Every conditional mutation is a single `UPDATE ... WHERE <guard>` so
//! concurrent jobs race on the row, not in application code.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Database` |
//! | Decode / ColumnDecode | N/A | `Corrupt` |
//! | Other | N/A | `Database` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use courier_core::{CampaignId, CompanyId, ConnectionId, ContactId, ConversationId, ScheduleId, ShippingId, TagId, UserId};

use crate::error::StoreError;
use crate::model::{
    Campaign, CampaignSettings, CampaignShipping, CampaignStatus, Connection, Contact, ConversationStatus,
    MediaAttachment, NewShipping, RecurrenceType, Schedule, ScheduleStatus, TagRecurrence, Variable,
};
use crate::ports::{
    CampaignStore, ConnectionDirectory, ConversationRequest, ConversationStore, ScheduleStore, SettingsStore,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Postgres implementation of every relational port.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::database("migrate", e.to_string()))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                StoreError::Conflict(format!("{operation}: {}", db_err.message()))
            } else {
                StoreError::database(operation, db_err.message())
            }
        }
        sqlx::Error::Decode(e) => StoreError::Corrupt(format!("{operation}: {e}")),
        sqlx::Error::ColumnDecode { index, source } => StoreError::Corrupt(format!("{operation}: column {index}: {source}")),
        sqlx::Error::PoolClosed => StoreError::database(operation, "connection pool closed"),
        other => StoreError::database(operation, other.to_string()),
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// Row decoding

fn campaign_from_row(row: &PgRow) -> Result<Campaign, StoreError> {
    let decode = |e| map_sqlx_error("decode campaign", e);
    let status: String = row.try_get("status").map_err(decode)?;
    let ticket_status: String = row.try_get("ticket_status").map_err(decode)?;
    let media: Option<Json<MediaAttachment>> = row.try_get("media").map_err(decode)?;
    Ok(Campaign {
        id: CampaignId::from_uuid(row.try_get("id").map_err(decode)?),
        company_id: CompanyId::from_uuid(row.try_get("company_id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        status: CampaignStatus::parse(&status)?,
        messages: row.try_get::<Json<Vec<String>>, _>("messages").map_err(decode)?.0,
        confirmation_messages: row
            .try_get::<Json<Vec<String>>, _>("confirmation_messages")
            .map_err(decode)?
            .0,
        confirmation: row.try_get("confirmation").map_err(decode)?,
        scheduled_at: row.try_get("scheduled_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        connection_id: row
            .try_get::<Option<Uuid>, _>("connection_id")
            .map_err(decode)?
            .map(ConnectionId::from_uuid),
        media: media.map(|m| m.0),
        files: row.try_get::<Json<Vec<MediaAttachment>>, _>("files").map_err(decode)?.0,
        open_ticket: row.try_get("open_ticket").map_err(decode)?,
        ticket_user_id: row
            .try_get::<Option<Uuid>, _>("ticket_user_id")
            .map_err(decode)?
            .map(UserId::from_uuid),
        ticket_status: ConversationStatus::parse(&ticket_status)?,
    })
}

fn contact_from_row(row: &PgRow) -> Result<Contact, StoreError> {
    let decode = |e| map_sqlx_error("decode contact", e);
    Ok(Contact {
        id: ContactId::from_uuid(row.try_get("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        number: row.try_get("number").map_err(decode)?,
        email: row.try_get("email").map_err(decode)?,
        custom_message: row.try_get("custom_message").map_err(decode)?,
    })
}

fn shipping_from_row(row: &PgRow) -> Result<CampaignShipping, StoreError> {
    let decode = |e| map_sqlx_error("decode shipping", e);
    Ok(CampaignShipping {
        id: ShippingId::from_uuid(row.try_get("id").map_err(decode)?),
        campaign_id: CampaignId::from_uuid(row.try_get("campaign_id").map_err(decode)?),
        contact_id: ContactId::from_uuid(row.try_get("contact_id").map_err(decode)?),
        number: row.try_get("number").map_err(decode)?,
        message: row.try_get("message").map_err(decode)?,
        confirmation_message: row.try_get("confirmation_message").map_err(decode)?,
        confirmation: row.try_get("confirmation").map_err(decode)?,
        confirmation_requested_at: row.try_get("confirmation_requested_at").map_err(decode)?,
        confirmed_at: row.try_get("confirmed_at").map_err(decode)?,
        delivered_at: row.try_get("delivered_at").map_err(decode)?,
        job_id: row.try_get("job_id").map_err(decode)?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<Schedule, StoreError> {
    let decode = |e| map_sqlx_error("decode schedule", e);
    let status: String = row.try_get("status").map_err(decode)?;
    let recurrence: String = row.try_get("recurrence").map_err(decode)?;
    let media: Option<Json<MediaAttachment>> = row.try_get("media").map_err(decode)?;
    let tag_id: Option<Uuid> = row.try_get("tag_id").map_err(decode)?;
    let repeat_every_days: Option<i32> = row.try_get("repeat_every_days").map_err(decode)?;
    Ok(Schedule {
        id: ScheduleId::from_uuid(row.try_get("id").map_err(decode)?),
        company_id: CompanyId::from_uuid(row.try_get("company_id").map_err(decode)?),
        contact_id: ContactId::from_uuid(row.try_get("contact_id").map_err(decode)?),
        number: row.try_get("number").map_err(decode)?,
        body: row.try_get("body").map_err(decode)?,
        media: media.map(|m| m.0),
        connection_id: row
            .try_get::<Option<Uuid>, _>("connection_id")
            .map_err(decode)?
            .map(ConnectionId::from_uuid),
        send_at: row.try_get("send_at").map_err(decode)?,
        sent_at: row.try_get("sent_at").map_err(decode)?,
        status: ScheduleStatus::parse(&status)?,
        recurrence: RecurrenceType::parse(&recurrence)?,
        recurrence_end_date: row.try_get("recurrence_end_date").map_err(decode)?,
        tag_recurrence: tag_id.map(|tag_id| TagRecurrence {
            tag_id: TagId::from_uuid(tag_id),
            repeat_every_days: repeat_every_days.unwrap_or(0).max(0) as u32,
        }),
    })
}

fn connection_from_row(row: &PgRow) -> Result<Connection, StoreError> {
    let decode = |e| map_sqlx_error("decode connection", e);
    Ok(Connection {
        id: ConnectionId::from_uuid(row.try_get("id").map_err(decode)?),
        company_id: CompanyId::from_uuid(row.try_get("company_id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        is_default: row.try_get("is_default").map_err(decode)?,
    })
}

const SHIPPING_COLUMNS: &str = "id, campaign_id, contact_id, number, message, confirmation_message, confirmation, \
     confirmation_requested_at, confirmed_at, delivered_at, job_id";

#[async_trait]
impl CampaignStore for PgStore {
    #[instrument(skip(self), err)]
    async fn due_campaigns(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Campaign>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'PROGRAMADA' AND scheduled_at <= $1
            ORDER BY scheduled_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("due_campaigns", e))?;
        rows.iter().map(campaign_from_row).collect()
    }

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        let row = sqlx::query("SELECT * FROM campaigns WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("campaign", e))?;
        row.as_ref().map(campaign_from_row).transpose()
    }

    async fn contacts(&self, campaign_id: CampaignId) -> Result<Vec<Contact>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, number, email, custom_message FROM campaign_contacts WHERE campaign_id = $1 ORDER BY position, id",
        )
        .bind(campaign_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("contacts", e))?;
        rows.iter().map(contact_from_row).collect()
    }

    async fn contact(&self, campaign_id: CampaignId, contact_id: ContactId) -> Result<Option<Contact>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, number, email, custom_message FROM campaign_contacts WHERE campaign_id = $1 AND id = $2",
        )
        .bind(campaign_id.as_uuid())
        .bind(contact_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("contact", e))?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn contact_count(&self, campaign_id: CampaignId) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM campaign_contacts WHERE campaign_id = $1")
            .bind(campaign_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("contact_count", e))?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self, from), fields(campaign_id = %id, to = to.as_str()), err)]
    async fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $3, completed_at = COALESCE($4, completed_at)
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id.as_uuid())
        .bind(&from)
        .bind(to.as_str())
        .bind(completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_status", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, new), fields(campaign_id = %new.campaign_id, contact_id = %new.contact_id), err)]
    async fn find_or_create_shipping(&self, new: NewShipping) -> Result<(CampaignShipping, bool), StoreError> {
        let candidate = new.into_shipping();
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO campaign_shippings ({SHIPPING_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, NULL, NULL, NULL)
            ON CONFLICT (campaign_id, contact_id) DO NOTHING
            RETURNING {SHIPPING_COLUMNS}
            "#
        ))
        .bind(candidate.id.as_uuid())
        .bind(candidate.campaign_id.as_uuid())
        .bind(candidate.contact_id.as_uuid())
        .bind(&candidate.number)
        .bind(&candidate.message)
        .bind(&candidate.confirmation_message)
        .bind(candidate.confirmation)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_or_create_shipping", e))?;

        if let Some(row) = inserted {
            return Ok((shipping_from_row(&row)?, true));
        }

        let existing = sqlx::query(&format!(
            "SELECT {SHIPPING_COLUMNS} FROM campaign_shippings WHERE campaign_id = $1 AND contact_id = $2"
        ))
        .bind(candidate.campaign_id.as_uuid())
        .bind(candidate.contact_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_or_create_shipping", e))?;
        Ok((shipping_from_row(&existing)?, false))
    }

    async fn shipping(&self, id: ShippingId) -> Result<Option<CampaignShipping>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SHIPPING_COLUMNS} FROM campaign_shippings WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("shipping", e))?;
        row.as_ref().map(shipping_from_row).transpose()
    }

    async fn set_shipping_job(&self, id: ShippingId, job_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE campaign_shippings SET job_id = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(job_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_shipping_job", e))?;
        Ok(())
    }

    async fn mark_delivered(&self, id: ShippingId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE campaign_shippings SET delivered_at = $2 WHERE id = $1 AND delivered_at IS NULL")
            .bind(id.as_uuid())
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_delivered", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_confirmation_requested(&self, id: ShippingId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE campaign_shippings SET confirmation_requested_at = $2 WHERE id = $1 AND confirmation_requested_at IS NULL",
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_confirmation_requested", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_confirmed(&self, id: ShippingId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_shippings SET confirmed_at = $2
            WHERE id = $1 AND confirmation_requested_at IS NOT NULL AND confirmed_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_confirmed", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn delivered_count(&self, campaign_id: CampaignId) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM campaign_shippings WHERE campaign_id = $1 AND delivered_at IS NOT NULL",
        )
        .bind(campaign_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delivered_count", e))?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl ScheduleStore for PgStore {
    #[instrument(skip(self), err)]
    async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM schedules
            WHERE sent_at IS NULL AND status = 'PENDENTE' AND send_at <= $1
            ORDER BY send_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("due_schedules", e))?;
        rows.iter().map(schedule_from_row).collect()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn claim_schedules(&self, ids: &[ScheduleId]) -> Result<Vec<ScheduleId>, StoreError> {
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let claimed: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE schedules SET status = 'AGENDADA' WHERE id = ANY($1) AND status = 'PENDENTE' RETURNING id",
        )
        .bind(&ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_schedules", e))?;
        Ok(claimed.into_iter().map(ScheduleId::from_uuid).collect())
    }

    async fn schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("schedule", e))?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn set_schedule_status(&self, id: ScheduleId, status: ScheduleStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE schedules SET status = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_schedule_status", e))?;
        Ok(())
    }

    async fn mark_sent(&self, id: ScheduleId, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE schedules SET status = 'ENVIADA', sent_at = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_sent", e))?;
        Ok(())
    }

    async fn reschedule(&self, id: ScheduleId, send_at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE schedules SET status = 'PENDENTE', send_at = $2, sent_at = NULL WHERE id = $1")
            .bind(id.as_uuid())
            .bind(send_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reschedule", e))?;
        Ok(())
    }

    async fn insert_schedule(&self, schedule: Schedule) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO schedules (
                id, company_id, contact_id, number, body, media, connection_id, send_at, sent_at,
                status, recurrence, recurrence_end_date, tag_id, repeat_every_days
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(schedule.id.as_uuid())
        .bind(schedule.company_id.as_uuid())
        .bind(schedule.contact_id.as_uuid())
        .bind(&schedule.number)
        .bind(&schedule.body)
        .bind(schedule.media.as_ref().map(Json))
        .bind(schedule.connection_id.map(Uuid::from))
        .bind(schedule.send_at)
        .bind(schedule.sent_at)
        .bind(schedule.status.as_str())
        .bind(schedule.recurrence.as_str())
        .bind(schedule.recurrence_end_date)
        .bind(schedule.tag_recurrence.map(|t| Uuid::from(t.tag_id)))
        .bind(schedule.tag_recurrence.map(|t| i32::try_from(t.repeat_every_days).unwrap_or(i32::MAX)))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_schedule", e))?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn campaign_settings(&self, company_id: CompanyId) -> Result<CampaignSettings, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT message_interval_ms, longer_interval_after, greater_interval_ms, variables
            FROM campaign_settings WHERE company_id = $1
            "#,
        )
        .bind(company_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("campaign_settings", e))?;

        let Some(row) = row else {
            return Ok(CampaignSettings::default());
        };
        let decode = |e| map_sqlx_error("decode campaign_settings", e);
        let interval: i64 = row.try_get("message_interval_ms").map_err(decode)?;
        let after: i32 = row.try_get("longer_interval_after").map_err(decode)?;
        let greater: i64 = row.try_get("greater_interval_ms").map_err(decode)?;
        let variables: Json<Vec<Variable>> = row.try_get("variables").map_err(decode)?;
        Ok(CampaignSettings {
            message_interval: Duration::from_millis(interval.max(0) as u64),
            longer_interval_after: after.max(0) as u32,
            greater_interval: Duration::from_millis(greater.max(0) as u64),
            variables: variables.0,
        })
    }
}

impl PgStore {
    /// Insert or replace a company's campaign settings.
    pub async fn save_campaign_settings(&self, company_id: CompanyId, settings: &CampaignSettings) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO campaign_settings (company_id, message_interval_ms, longer_interval_after, greater_interval_ms, variables)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (company_id) DO UPDATE SET
                message_interval_ms = EXCLUDED.message_interval_ms,
                longer_interval_after = EXCLUDED.longer_interval_after,
                greater_interval_ms = EXCLUDED.greater_interval_ms,
                variables = EXCLUDED.variables
            "#,
        )
        .bind(company_id.as_uuid())
        .bind(millis(settings.message_interval))
        .bind(i32::try_from(settings.longer_interval_after).unwrap_or(i32::MAX))
        .bind(millis(settings.greater_interval))
        .bind(Json(&settings.variables))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_campaign_settings", e))?;
        Ok(())
    }
}

#[async_trait]
impl ConnectionDirectory for PgStore {
    async fn connection(&self, id: ConnectionId) -> Result<Option<Connection>, StoreError> {
        let row = sqlx::query("SELECT id, company_id, name, is_default FROM connections WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("connection", e))?;
        row.as_ref().map(connection_from_row).transpose()
    }

    async fn default_connection(&self, company_id: CompanyId) -> Result<Option<Connection>, StoreError> {
        let row = sqlx::query(
            "SELECT id, company_id, name, is_default FROM connections WHERE company_id = $1 AND is_default LIMIT 1",
        )
        .bind(company_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("default_connection", e))?;
        row.as_ref().map(connection_from_row).transpose()
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    #[instrument(skip(self, request), fields(contact_id = %request.contact_id), err)]
    async fn open_or_reuse(&self, request: ConversationRequest) -> Result<ConversationId, StoreError> {
        let existing: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM conversations
            WHERE company_id = $1 AND contact_id = $2 AND connection_id = $3 AND status <> 'closed'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(request.company_id.as_uuid())
        .bind(request.contact_id.as_uuid())
        .bind(request.connection_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("open_or_reuse", e))?;

        if let Some(id) = existing {
            return Ok(ConversationId::from_uuid(id));
        }

        let id = ConversationId::new();
        sqlx::query(
            r#"
            INSERT INTO conversations (id, company_id, contact_id, connection_id, status, user_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id.as_uuid())
        .bind(request.company_id.as_uuid())
        .bind(request.contact_id.as_uuid())
        .bind(request.connection_id.as_uuid())
        .bind(request.status.as_str())
        .bind(request.user_id.map(Uuid::from))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("open_or_reuse", e))?;
        Ok(id)
    }
}
