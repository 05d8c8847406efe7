mod support;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as Days, Utc};

use courier_core::{ConnectionId, ContactId, ScheduleId, TagId};
use courier_dispatch::memory::InMemoryStore;
use courier_dispatch::setup::{self, Ports};
use courier_dispatch::{PipelineError, StoreError};
use courier_dispatch::model::{Connection, MediaAttachment, RecurrenceType, Schedule, ScheduleStatus, TagRecurrence};
use courier_dispatch::ports::{OutboundContent, ScheduleStore};
use courier_dispatch::schedule::{ScheduledMessageJob, SendMessage};
use courier_dispatch::SendOutcome;

use support::{Harness, harness};

fn schedule(h: &Harness, body: &str) -> Schedule {
    Schedule::new(h.company, ContactId::new(), "5511988887777", body, h.clock_now() - Days::minutes(5))
}

/// Take every queued `SendMessage` off the queue.
async fn take_sends(h: &Harness) -> Vec<SendMessage> {
    let queue = h.manager.queue::<ScheduledMessageJob>();
    let mut sends = Vec::new();
    for (record, job) in queue.pending(1_000).await.unwrap() {
        queue.remove(&record.id).await.unwrap();
        match job {
            ScheduledMessageJob::SendMessage(send) => sends.push(send),
        }
    }
    sends
}

async fn stored(h: &Harness, s: &Schedule) -> Schedule {
    h.store.schedule(s.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn overdue_schedule_is_claimed_and_sent() {
    let h = harness().await;
    let pipeline = h.services.schedules.clone();
    let s = schedule(&h, "lembrete");
    h.store.add_schedule(s.clone()).unwrap();

    assert_eq!(pipeline.verify_schedules().await.unwrap(), 1);
    assert_eq!(stored(&h, &s).await.status, ScheduleStatus::Agendada);

    let sends = take_sends(&h).await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].schedule_id, s.id);
    assert_eq!(
        pipeline.send_message(sends[0].clone()).await.unwrap(),
        SendOutcome::Sent { next: None }
    );

    let row = stored(&h, &s).await;
    assert_eq!(row.status, ScheduleStatus::Enviada);
    assert_eq!(row.sent_at, Some(h.clock_now()));
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].connection_id, h.connection.id);
    assert_eq!(sent[0].content, OutboundContent::Text("lembrete".into()));
}

#[tokio::test]
async fn future_schedules_are_left_alone() {
    let h = harness().await;
    let mut s = schedule(&h, "later");
    s.send_at = h.clock_now() + Days::hours(1);
    h.store.add_schedule(s.clone()).unwrap();

    assert_eq!(h.services.schedules.verify_schedules().await.unwrap(), 0);
    assert_eq!(stored(&h, &s).await.status, ScheduleStatus::Pendente);
}

#[tokio::test]
async fn sent_schedule_is_not_sent_again() {
    let h = harness().await;
    let pipeline = h.services.schedules.clone();
    let s = schedule(&h, "once");
    h.store.add_schedule(s.clone()).unwrap();
    pipeline.verify_schedules().await.unwrap();
    let send = take_sends(&h).await.remove(0);
    pipeline.send_message(send.clone()).await.unwrap();
    let before = stored(&h, &s).await;

    h.clock.advance(Days::seconds(60));
    assert_eq!(pipeline.send_message(send).await.unwrap(), SendOutcome::Skipped);
    assert_eq!(stored(&h, &s).await, before);
    assert_eq!(h.transport.sent().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sweeps_claim_each_row_once() {
    let h = harness().await;
    for i in 0..5 {
        h.store.add_schedule(schedule(&h, &format!("m{i}"))).unwrap();
    }

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..4 {
        let pipeline = h.services.schedules.clone();
        tasks.spawn(async move { pipeline.verify_schedules().await });
    }
    let mut claimed = 0;
    while let Some(result) = tasks.join_next().await {
        claimed += result.unwrap().unwrap();
    }
    assert_eq!(claimed, 5);
    assert_eq!(take_sends(&h).await.len(), 5);
}

#[tokio::test]
async fn weekly_recurrence_appends_rows_until_the_end_date() {
    let h = harness().await;
    let pipeline = h.services.schedules.clone();
    let mut s = schedule(&h, "semanal");
    s.send_at = h.clock_now();
    s.recurrence = RecurrenceType::Weekly;
    s.recurrence_end_date = Some(h.clock_now() + Days::days(21));
    h.store.add_schedule(s.clone()).unwrap();

    let mut outcomes = Vec::new();
    for week in 0..4 {
        h.clock.set(s.send_at + Days::days(7 * week));
        assert_eq!(pipeline.verify_schedules().await.unwrap(), 1);
        let send = take_sends(&h).await.remove(0);
        outcomes.push(pipeline.send_message(send).await.unwrap());
    }

    let expected: Vec<_> = [1, 2, 3]
        .into_iter()
        .map(|w| SendOutcome::Sent { next: Some(s.send_at + Days::days(7 * w)) })
        .chain([SendOutcome::Sent { next: None }])
        .collect();
    assert_eq!(outcomes, expected);

    let rows = h.store.schedules().unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.status == ScheduleStatus::Enviada));
    assert!(rows.iter().all(|r| r.recurrence == RecurrenceType::Weekly));
    assert_eq!(h.transport.sent().len(), 4);
}

#[tokio::test]
async fn one_shot_tag_message_is_sent_once() {
    let h = harness().await;
    let pipeline = h.services.schedules.clone();
    let mut s = schedule(&h, "tag");
    s.tag_recurrence = Some(TagRecurrence {
        tag_id: TagId::new(),
        repeat_every_days: 0,
    });
    h.store.add_schedule(s.clone()).unwrap();

    pipeline.verify_schedules().await.unwrap();
    let send = take_sends(&h).await.remove(0);
    assert_eq!(pipeline.send_message(send).await.unwrap(), SendOutcome::Sent { next: None });
    assert_eq!(stored(&h, &s).await.status, ScheduleStatus::Enviada);
    assert_eq!(h.store.schedules().unwrap().len(), 1);
}

#[tokio::test]
async fn repeating_tag_message_moves_its_own_row_forward() {
    let h = harness().await;
    let pipeline = h.services.schedules.clone();
    let mut s = schedule(&h, "tag");
    s.tag_recurrence = Some(TagRecurrence {
        tag_id: TagId::new(),
        repeat_every_days: 3,
    });
    h.store.add_schedule(s.clone()).unwrap();

    pipeline.verify_schedules().await.unwrap();
    let send = take_sends(&h).await.remove(0);
    let next = s.send_at + Days::days(3);
    assert_eq!(
        pipeline.send_message(send).await.unwrap(),
        SendOutcome::Rescheduled { send_at: next }
    );

    let row = stored(&h, &s).await;
    assert_eq!(row.status, ScheduleStatus::Pendente);
    assert_eq!(row.send_at, next);
    assert_eq!(row.sent_at, None);
    assert_eq!(h.store.schedules().unwrap().len(), 1);

    // Not due again until the clock reaches the new send time.
    assert_eq!(pipeline.verify_schedules().await.unwrap(), 0);
    h.clock.set(next);
    assert_eq!(pipeline.verify_schedules().await.unwrap(), 1);
}

#[tokio::test]
async fn media_is_sent_with_the_body_as_caption() {
    let h = harness().await;
    let pipeline = h.services.schedules.clone();
    let mut s = schedule(&h, "veja o anexo");
    s.media = Some(MediaAttachment {
        url: "https://cdn/boleto.pdf".into(),
        file_name: "boleto.pdf".into(),
        mime_type: Some("application/pdf".into()),
    });
    h.store.add_schedule(s.clone()).unwrap();

    pipeline.verify_schedules().await.unwrap();
    pipeline.send_message(take_sends(&h).await.remove(0)).await.unwrap();
    match &h.transport.sent()[0].content {
        OutboundContent::Media { attachment, caption } => {
            assert_eq!(attachment.file_name, "boleto.pdf");
            assert_eq!(caption.as_deref(), Some("veja o anexo"));
        }
        other => panic!("expected media, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_connection_marks_the_row_as_errored() {
    let h = harness().await;
    let pipeline = h.services.schedules.clone();
    let mut s = schedule(&h, "orphan");
    s.company_id = courier_core::CompanyId::new();
    h.store.add_schedule(s.clone()).unwrap();

    pipeline.verify_schedules().await.unwrap();
    let err = pipeline
        .send_message(take_sends(&h).await.remove(0))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoConnection(_)));
    assert_eq!(stored(&h, &s).await.status, ScheduleStatus::Erro);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn transport_failure_marks_the_row_as_errored() {
    let h = harness().await;
    let pipeline = h.services.schedules.clone();
    let s = schedule(&h, "x");
    h.store.add_schedule(s.clone()).unwrap();
    pipeline.verify_schedules().await.unwrap();

    h.transport.set_unavailable(true);
    let err = pipeline
        .send_message(take_sends(&h).await.remove(0))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Transport(_)));
    assert_eq!(stored(&h, &s).await.status, ScheduleStatus::Erro);
}

#[tokio::test]
async fn job_connection_wins_over_the_schedule_and_default() {
    let h = harness().await;
    let pipeline = h.services.schedules.clone();
    let other = Connection {
        id: ConnectionId::new(),
        company_id: h.company,
        name: "sales".into(),
        is_default: false,
    };
    h.store.add_connection(other.clone()).unwrap();

    let mut s = schedule(&h, "routed");
    s.connection_id = Some(other.id);
    h.store.add_schedule(s.clone()).unwrap();
    pipeline.verify_schedules().await.unwrap();
    let send = take_sends(&h).await.remove(0);
    assert_eq!(send.whatsapp_id, Some(other.id));
    pipeline.send_message(send).await.unwrap();
    assert_eq!(h.transport.sent()[0].connection_id, other.id);

    // An explicit job connection that no longer exists falls back to the default.
    let s2 = schedule(&h, "fallback");
    h.store.add_schedule(s2.clone()).unwrap();
    pipeline
        .send_message(SendMessage {
            schedule_id: s2.id,
            whatsapp_id: Some(ConnectionId::new()),
        })
        .await
        .unwrap();
    assert_eq!(h.transport.sent()[1].connection_id, h.connection.id);
}

/// Schedule store whose follow-up inserts always conflict.
struct ConflictingInserts(Arc<InMemoryStore>);

#[async_trait]
impl ScheduleStore for ConflictingInserts {
    async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>, StoreError> {
        self.0.due_schedules(now, limit).await
    }

    async fn claim_schedules(&self, ids: &[ScheduleId]) -> Result<Vec<ScheduleId>, StoreError> {
        self.0.claim_schedules(ids).await
    }

    async fn schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, StoreError> {
        self.0.schedule(id).await
    }

    async fn set_schedule_status(&self, id: ScheduleId, status: ScheduleStatus) -> Result<(), StoreError> {
        self.0.set_schedule_status(id, status).await
    }

    async fn mark_sent(&self, id: ScheduleId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.0.mark_sent(id, at).await
    }

    async fn reschedule(&self, id: ScheduleId, send_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.0.reschedule(id, send_at).await
    }

    async fn insert_schedule(&self, schedule: Schedule) -> Result<(), StoreError> {
        Err(StoreError::Conflict(format!("schedule {} already exists", schedule.id)))
    }
}

#[tokio::test]
async fn failure_after_the_send_never_sends_twice() {
    let h = harness().await;
    let services = setup::build(
        &h.manager,
        Ports {
            campaigns: h.store.clone(),
            schedules: Arc::new(ConflictingInserts(h.store.clone())),
            settings: h.store.clone(),
            connections: h.store.clone(),
            conversations: h.store.clone(),
            transport: h.transport.clone(),
            notifier: h.notifier.clone(),
            clock: h.clock.clone(),
        },
        support::test_config(),
    );
    let pipeline = services.schedules.clone();
    let mut s = schedule(&h, "diario");
    s.recurrence = RecurrenceType::Daily;
    s.recurrence_end_date = Some(h.clock_now() + Days::days(30));
    h.store.add_schedule(s.clone()).unwrap();

    assert_eq!(pipeline.verify_schedules().await.unwrap(), 1);
    let send = take_sends(&h).await.remove(0);
    assert_eq!(
        pipeline.send_message(send.clone()).await.unwrap(),
        SendOutcome::Sent { next: None }
    );
    let row = stored(&h, &s).await;
    assert_eq!(row.status, ScheduleStatus::Enviada);
    assert_eq!(row.sent_at, Some(h.clock_now()));

    // A redelivered job finds the row settled.
    h.clock.advance(Days::seconds(30));
    assert_eq!(pipeline.send_message(send).await.unwrap(), SendOutcome::Skipped);
    assert_eq!(h.transport.sent().len(), 1);
    assert_eq!(h.store.schedules().unwrap().len(), 1);
}

#[tokio::test]
async fn row_with_a_send_time_is_never_resent() {
    let h = harness().await;
    let pipeline = h.services.schedules.clone();
    let mut s = schedule(&h, "gravado");
    s.status = ScheduleStatus::Processando;
    s.sent_at = Some(h.clock_now() - Days::minutes(1));
    h.store.add_schedule(s.clone()).unwrap();

    let send = SendMessage {
        schedule_id: s.id,
        whatsapp_id: None,
    };
    assert_eq!(pipeline.send_message(send).await.unwrap(), SendOutcome::Skipped);
    assert!(h.transport.sent().is_empty());
    assert_eq!(stored(&h, &s).await.status, ScheduleStatus::Processando);
}
